//! Session actor and its per-connection writer.

pub mod actor;
pub mod writer;

use crate::core::{Inbound, SessionStatus};

pub use actor::{SessionActor, SessionActorArgs, SessionCommand};
pub use writer::{SocketWriter, WriteFrame, WriterCounters, retire_writer, spawn_writer};

/// Inbound message subscriber.
pub type MessageCallback = Box<dyn Fn(&Inbound) + Send + Sync + 'static>;

/// Status subscriber. Receives the current status on registration.
pub type StatusCallback = Box<dyn Fn(SessionStatus) + Send + Sync + 'static>;
