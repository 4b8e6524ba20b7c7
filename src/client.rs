//! Public session handle.
//!
//! [`SessionClient`] is a cheap `Clone` handle. Commands travel over an
//! ordered channel to a forwarding task that feeds the session actor, so
//! `send`, `close` and the subscription calls never suspend and may be called
//! from inside subscriber callbacks. Dropping every handle stops the session.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use kameo::prelude::{Actor, ActorRef};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::{
    Inbound, Outbound, SessionConfig, SessionError, SessionResult, SessionStats, SessionStatus,
    generate_session_id,
};
use crate::session::{SessionActor, SessionActorArgs, SessionCommand};
use crate::transport::{TungsteniteTransport, WsTransport};

pub type TokenFuture = Pin<Box<dyn Future<Output = Option<String>> + Send>>;

/// Supplies the bearer token for each connection attempt.
///
/// Called before every attempt, including automatic reconnects. `None` (or an
/// empty string) fails the attempt with [`SessionError::AuthenticationFailed`]
/// and no retry is scheduled.
pub trait TokenProvider: Send + Sync + 'static {
    fn token(&self) -> TokenFuture;
}

impl<F, Fut> TokenProvider for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    fn token(&self) -> TokenFuture {
        Box::pin(self())
    }
}

/// Fixed token, mostly for tests and local development.
#[derive(Clone, Debug)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// A provider that never yields a token.
    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> TokenFuture {
        let token = self.0.clone();
        Box::pin(async move { token })
    }
}

#[derive(Clone)]
pub struct SessionClient {
    session_id: Arc<str>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionClient {
    /// Session over tokio-tungstenite. Must be called inside a tokio runtime.
    pub fn new(config: SessionConfig, token_provider: impl TokenProvider) -> SessionResult<Self> {
        Self::with_transport(config, token_provider, TungsteniteTransport::default())
    }

    pub fn with_transport<T: WsTransport>(
        config: SessionConfig,
        token_provider: impl TokenProvider,
        transport: T,
    ) -> SessionResult<Self> {
        config.validate()?;
        let session_id = generate_session_id();
        let actor = SessionActor::spawn(SessionActorArgs {
            config,
            session_id: session_id.clone(),
            transport,
            token_provider: Arc::new(token_provider),
        });

        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_commands(actor, rx, session_id.clone()));

        Ok(Self {
            session_id: session_id.into(),
            commands,
        })
    }

    /// Stable for the lifetime of this client, across reconnects.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Open the session, or join the attempt already in flight.
    pub async fn connect(&self) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Connect { reply: Some(reply) })?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Fire-and-forget. Dropped (and a connect triggered) when not open.
    pub fn send(&self, message: Outbound) {
        if let Err(err) = self.dispatch(SessionCommand::Send(message)) {
            warn!(session_id = %self.session_id, error = %err, "dropping outbound message");
        }
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&Inbound) + Send + Sync + 'static,
    {
        if let Err(err) = self.dispatch(SessionCommand::SubscribeMessages(Box::new(callback))) {
            warn!(session_id = %self.session_id, error = %err, "message subscription dropped");
        }
    }

    /// The callback first receives the current status, then every transition.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(SessionStatus) + Send + Sync + 'static,
    {
        if let Err(err) = self.dispatch(SessionCommand::SubscribeStatus(Box::new(callback))) {
            warn!(session_id = %self.session_id, error = %err, "status subscription dropped");
        }
    }

    /// Terminal. Idempotent.
    pub fn close(&self) {
        if self.dispatch(SessionCommand::Close).is_err() {
            debug!(session_id = %self.session_id, "session already stopped");
        }
    }

    pub async fn status(&self) -> SessionResult<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Status { reply })?;
        rx.await.map_err(|_| actor_gone())
    }

    pub async fn stats(&self) -> SessionResult<SessionStats> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Stats { reply })?;
        rx.await.map_err(|_| actor_gone())
    }

    fn dispatch(&self, command: SessionCommand) -> SessionResult<()> {
        self.commands.send(command).map_err(|_| actor_gone())
    }
}

/// Build a tokio-tungstenite session and wait for it to open.
pub async fn connect_session(
    config: SessionConfig,
    token_provider: impl TokenProvider,
) -> SessionResult<SessionClient> {
    let client = SessionClient::new(config, token_provider)?;
    client.connect().await?;
    Ok(client)
}

fn actor_gone() -> SessionError {
    SessionError::ActorError("session actor is not running".to_string())
}

async fn forward_commands<T: WsTransport>(
    actor: ActorRef<SessionActor<T>>,
    mut rx: mpsc::UnboundedReceiver<SessionCommand>,
    session_id: String,
) {
    while let Some(command) = rx.recv().await {
        if actor.tell(command).send().await.is_err() {
            warn!(session_id = %session_id, "session actor stopped; discarding commands");
            return;
        }
    }
    debug!(session_id = %session_id, "all session handles dropped; stopping");
    let _ = actor.stop_gracefully().await;
}
