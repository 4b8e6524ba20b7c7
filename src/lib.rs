//! Reconnecting duplex websocket session client built on kameo actors.
//!
//! A [`SessionClient`] owns one logical chat session across any number of
//! physical sockets. It fetches a bearer token before every attempt, keeps the
//! session id stable across reconnects, sends an application heartbeat while
//! open, and retries with capped exponential backoff until closed.

pub mod client;
pub mod core;
pub mod session;
pub mod testing;
pub mod transport;

pub use client::{SessionClient, StaticToken, TokenFuture, TokenProvider, connect_session};
pub use core::{
    ConfigError, Inbound, Outbound, SessionConfig, SessionError, SessionResult, SessionStats,
    SessionStatus,
};
pub use transport::{TungsteniteTransport, WsTransport};
