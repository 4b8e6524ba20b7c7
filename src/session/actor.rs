//! Session actor.
//!
//! One actor owns the whole session: status, retry bookkeeping, the live
//! connection and both subscriber registries. Socket IO, token fetching and
//! timers run in spawned tasks that report back by message. Every report is
//! tagged with the connection generation it belongs to so that events from a
//! torn-down socket or a superseded timer are ignored.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use super::writer::{SocketWriter, WriteFrame, WriterCounters, retire_writer, spawn_writer};
use super::{MessageCallback, StatusCallback};
use crate::client::TokenProvider;
use crate::core::{
    DisconnectCause, ExponentialBackoff, Heartbeat, Outbound, SessionConfig, SessionError,
    SessionHealth, SessionResult, SessionStats, SessionStatus, WsFrame, decode_inbound,
    encode_outbound, redact_url,
};
use crate::transport::WsTransport;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};

/// Arguments passed when constructing a session actor.
pub struct SessionActorArgs<T: WsTransport> {
    pub config: SessionConfig,
    pub session_id: String,
    pub transport: T,
    pub token_provider: Arc<dyn TokenProvider>,
}

/// Commands issued through [`crate::client::SessionClient`].
pub enum SessionCommand {
    Connect {
        reply: Option<oneshot::Sender<SessionResult<()>>>,
    },
    Send(Outbound),
    SubscribeMessages(MessageCallback),
    SubscribeStatus(StatusCallback),
    Close,
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

/// Reports from the session's own background tasks.
pub(crate) enum SessionEvent {
    TokenMissing { generation: u64 },
    ConnectFailed { generation: u64, error: SessionError },
    Inbound { generation: u64, frame: WsFrame },
    Disconnected { generation: u64, cause: DisconnectCause },
    HeartbeatDue { generation: u64 },
    ReconnectDue { generation: u64 },
}

pub(crate) struct ConnectionEstablished<R, W> {
    pub generation: u64,
    pub reader: R,
    pub writer: W,
}

struct LiveConnection<W>
where
    W: futures_util::Sink<WsFrame, Error = SessionError> + Send + Sync + Unpin + 'static,
{
    generation: u64,
    writer: ActorRef<SocketWriter<W>>,
    shutdown_tx: watch::Sender<bool>,
    reader_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
}

pub struct SessionActor<T: WsTransport> {
    config: SessionConfig,
    session_id: String,
    transport: T,
    token_provider: Arc<dyn TokenProvider>,
    actor_ref: ActorRef<Self>,
    status: SessionStatus,
    reconnect: ExponentialBackoff,
    reconnect_exhausted: bool,
    manually_closed: bool,
    generation: u64,
    heartbeat: Heartbeat,
    health: SessionHealth,
    writer_counters: Arc<WriterCounters>,
    connection: Option<LiveConnection<T::Writer>>,
    connect_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    connect_waiters: Vec<oneshot::Sender<SessionResult<()>>>,
    message_subscribers: Vec<MessageCallback>,
    status_subscribers: Vec<StatusCallback>,
}

impl<T: WsTransport> Actor for SessionActor<T> {
    type Args = SessionActorArgs<T>;
    type Error = SessionError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let SessionActorArgs {
            config,
            session_id,
            transport,
            token_provider,
        } = args;

        let reconnect = ExponentialBackoff::new(
            config.base_delay,
            config.max_delay,
            config.max_reconnect_attempts,
        );
        let heartbeat = Heartbeat::new(config.heartbeat_interval);

        debug!(
            session_id = %session_id,
            url = %redact_url(&config.url),
            "session actor started"
        );

        Ok(Self {
            config,
            session_id,
            transport,
            token_provider,
            actor_ref,
            status: SessionStatus::Idle,
            reconnect,
            reconnect_exhausted: false,
            manually_closed: false,
            generation: 0,
            heartbeat,
            health: SessionHealth::new(),
            writer_counters: Arc::new(WriterCounters::default()),
            connection: None,
            connect_task: None,
            reconnect_task: None,
            connect_waiters: Vec::new(),
            message_subscribers: Vec::new(),
            status_subscribers: Vec::new(),
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> SessionResult<()> {
        self.cancel_timers();
        self.teardown_connection(!self.manually_closed);
        self.resolve_waiters(|| Err(SessionError::Closed));
        debug!(session_id = %self.session_id, "session actor stopped");
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "SessionActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

impl<T: WsTransport> KameoMessage<SessionCommand> for SessionActor<T> {
    type Reply = SessionResult<()>;

    async fn handle(
        &mut self,
        command: SessionCommand,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match command {
            SessionCommand::Connect { reply } => self.begin_connect(reply),
            SessionCommand::Send(message) => self.send_outbound(message),
            SessionCommand::SubscribeMessages(callback) => {
                self.message_subscribers.push(callback);
            }
            SessionCommand::SubscribeStatus(callback) => {
                let status = self.status;
                notify(|| callback(status));
                self.status_subscribers.push(callback);
            }
            SessionCommand::Close => self.close(),
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.status);
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
        Ok(())
    }
}

impl<T: WsTransport> KameoMessage<SessionEvent> for SessionActor<T> {
    type Reply = SessionResult<()>;

    async fn handle(
        &mut self,
        event: SessionEvent,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match event {
            SessionEvent::TokenMissing { generation } => self.on_token_missing(generation),
            SessionEvent::ConnectFailed { generation, error } => {
                self.on_connect_failed(generation, error)
            }
            SessionEvent::Inbound { generation, frame } => self.on_inbound(generation, frame),
            SessionEvent::Disconnected { generation, cause } => {
                self.on_disconnected(generation, cause)
            }
            SessionEvent::HeartbeatDue { generation } => self.on_heartbeat_due(generation),
            SessionEvent::ReconnectDue { generation } => {
                if generation != self.generation || self.manually_closed {
                    debug!(generation, "ignoring superseded reconnect timer");
                } else {
                    self.reconnect_task = None;
                    self.begin_connect(None);
                }
            }
        }
        Ok(())
    }
}

impl<T: WsTransport> KameoMessage<ConnectionEstablished<T::Reader, T::Writer>>
    for SessionActor<T>
{
    type Reply = SessionResult<()>;

    async fn handle(
        &mut self,
        msg: ConnectionEstablished<T::Reader, T::Writer>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.on_connection_established(msg);
        Ok(())
    }
}

impl<T: WsTransport> SessionActor<T> {
    fn set_status(&mut self, next: SessionStatus) {
        if self.status == next {
            return;
        }
        if !self.status.can_transition_to(next) {
            warn!(
                session_id = %self.session_id,
                from = %self.status,
                to = %next,
                "unexpected session status transition"
            );
        }
        debug!(session_id = %self.session_id, from = %self.status, to = %next, "session status");
        self.status = next;
        for callback in &self.status_subscribers {
            notify(|| callback(next));
        }
    }

    fn resolve_waiters(&mut self, result: impl Fn() -> SessionResult<()>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(result());
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
    }

    fn begin_connect(&mut self, reply: Option<oneshot::Sender<SessionResult<()>>>) {
        if self.manually_closed {
            if let Some(reply) = reply {
                let _ = reply.send(Err(SessionError::Closed));
            }
            return;
        }
        match self.status {
            SessionStatus::Open => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                return;
            }
            SessionStatus::Connecting => {
                self.connect_waiters.extend(reply);
                return;
            }
            _ => {}
        }

        self.connect_waiters.extend(reply);
        self.cancel_timers();
        self.reconnect_exhausted = false;
        self.generation += 1;
        let generation = self.generation;
        self.set_status(SessionStatus::Connecting);

        let provider = Arc::clone(&self.token_provider);
        let transport = self.transport.clone();
        let config = self.config.clone();
        let actor_ref = self.actor_ref.clone();
        let session_id = self.session_id.clone();

        self.connect_task = Some(tokio::spawn(async move {
            let token = provider.token().await.filter(|token| !token.is_empty());
            let Some(token) = token else {
                let _ = actor_ref
                    .tell(SessionEvent::TokenMissing { generation })
                    .send()
                    .await;
                return;
            };

            let url = config.endpoint_with_token(&token);
            info!(
                session_id = %session_id,
                url = %redact_url(&url),
                generation,
                "opening session socket"
            );
            match transport.connect(url.to_string(), config.transport).await {
                Ok((reader, writer)) => {
                    let _ = actor_ref
                        .tell(ConnectionEstablished {
                            generation,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(error) => {
                    let _ = actor_ref
                        .tell(SessionEvent::ConnectFailed { generation, error })
                        .send()
                        .await;
                }
            }
        }));
    }

    fn is_pending_attempt(&self, generation: u64) -> bool {
        generation == self.generation && self.status == SessionStatus::Connecting
    }

    fn is_live(&self, generation: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.generation == generation)
    }

    fn on_token_missing(&mut self, generation: u64) {
        if !self.is_pending_attempt(generation) {
            debug!(generation, "ignoring stale token result");
            return;
        }
        self.connect_task = None;
        warn!(
            session_id = %self.session_id,
            generation,
            "token provider returned no token; not retrying"
        );
        self.health.record_error("token provider returned no token");
        self.set_status(SessionStatus::Error);
        self.resolve_waiters(|| {
            Err(SessionError::AuthenticationFailed(
                "token provider returned no token".to_string(),
            ))
        });
    }

    fn on_connect_failed(&mut self, generation: u64, error: SessionError) {
        if !self.is_pending_attempt(generation) {
            debug!(generation, "ignoring stale connect failure");
            return;
        }
        self.connect_task = None;
        warn!(
            session_id = %self.session_id,
            generation,
            error = %error,
            "session connect failed"
        );
        self.health.record_error(&error.to_string());
        self.set_status(SessionStatus::Error);
        self.resolve_waiters(|| Err(error.clone()));
        self.set_status(SessionStatus::Closed);
        self.schedule_reconnect(&error.to_string());
    }

    fn on_connection_established(&mut self, msg: ConnectionEstablished<T::Reader, T::Writer>) {
        let ConnectionEstablished {
            generation,
            reader,
            writer,
        } = msg;

        if self.manually_closed || !self.is_pending_attempt(generation) {
            debug!(generation, "discarding socket from superseded attempt");
            return;
        }
        self.connect_task = None;

        self.reconnect.reset();
        self.reconnect_exhausted = false;
        self.health.record_open();
        self.heartbeat.reset();

        let (writer, write_failure) = spawn_writer(
            writer,
            generation,
            self.config.outbound_capacity,
            Arc::clone(&self.writer_counters),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reader_task =
            self.spawn_reader(reader, generation, shutdown_rx.clone(), write_failure);
        let heartbeat_task = self.start_heartbeat_loop(generation, shutdown_rx);

        self.connection = Some(LiveConnection {
            generation,
            writer,
            shutdown_tx,
            reader_task,
            heartbeat_task,
        });

        info!(
            session_id = %self.session_id,
            generation,
            opens = self.health.opens(),
            "session connection established"
        );
        self.set_status(SessionStatus::Open);
        self.resolve_waiters(|| Ok(()));
    }

    fn spawn_reader(
        &self,
        mut reader: T::Reader,
        generation: u64,
        mut shutdown_rx: watch::Receiver<bool>,
        mut write_failure: oneshot::Receiver<SessionError>,
    ) -> JoinHandle<()> {
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow_and_update() {
                            break;
                        }
                    }
                    Ok(err) = &mut write_failure => {
                        let _ = actor_ref
                            .tell(SessionEvent::Disconnected {
                                generation,
                                cause: DisconnectCause::WriteFailure { error: err.to_string() },
                            })
                            .send()
                            .await;
                        break;
                    }
                    frame = reader.next() => {
                        let event = match frame {
                            Some(Ok(WsFrame::Close(close))) => {
                                let (code, reason) = match close {
                                    Some(close) => (
                                        Some(close.code),
                                        String::from_utf8_lossy(close.reason.as_ref()).into_owned(),
                                    ),
                                    None => (None, String::new()),
                                };
                                SessionEvent::Disconnected {
                                    generation,
                                    cause: DisconnectCause::RemoteClosed { code, reason },
                                }
                            }
                            Some(Ok(frame)) => {
                                if actor_ref
                                    .tell(SessionEvent::Inbound { generation, frame })
                                    .send()
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                            Some(Err(err)) => SessionEvent::Disconnected {
                                generation,
                                cause: DisconnectCause::ReadFailure { error: err.to_string() },
                            },
                            None => SessionEvent::Disconnected {
                                generation,
                                cause: DisconnectCause::StreamEnded,
                            },
                        };
                        let _ = actor_ref.tell(event).send().await;
                        break;
                    }
                }
            }
        })
    }

    fn start_heartbeat_loop(
        &self,
        generation: u64,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if !self.heartbeat.is_enabled() {
            debug!(session_id = %self.session_id, "heartbeat disabled");
            return None;
        }
        let interval = self.heartbeat.interval();
        let actor_ref = self.actor_ref.clone();
        Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow_and_update() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if actor_ref
                            .tell(SessionEvent::HeartbeatDue { generation })
                            .send()
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }))
    }

    fn on_inbound(&mut self, generation: u64, frame: WsFrame) {
        if !self.is_live(generation) {
            debug!(generation, "dropping frame from closed socket");
            return;
        }
        let decoded = match &frame {
            WsFrame::Text(bytes) => decode_inbound(bytes.as_ref()),
            WsFrame::Binary(_) => Err(SessionError::Protocol(
                "binary frames are not part of the protocol".to_string(),
            )),
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_) => return,
        };
        self.health.record_inbound();
        match decoded {
            Ok(message) => {
                for callback in &self.message_subscribers {
                    notify(|| callback(&message));
                }
            }
            Err(err) => {
                self.health.record_malformed(&err.to_string());
                warn!(
                    session_id = %self.session_id,
                    generation,
                    error = %err,
                    "dropping malformed inbound frame"
                );
            }
        }
    }

    fn on_disconnected(&mut self, generation: u64, cause: DisconnectCause) {
        if !self.is_live(generation) {
            debug!(generation, cause = %cause, "ignoring disconnect from stale socket");
            return;
        }
        warn!(
            session_id = %self.session_id,
            generation,
            cause = %cause,
            "session socket closed"
        );
        self.health.record_error(&cause.to_string());
        self.teardown_connection(false);
        self.set_status(SessionStatus::Closed);
        self.schedule_reconnect(&cause.to_string());
    }

    fn on_heartbeat_due(&mut self, generation: u64) {
        if !self.is_live(generation) || !self.status.is_open() {
            return;
        }
        let beat = self.heartbeat.create_beat();
        debug!(session_id = %self.session_id, generation, "sending heartbeat");
        self.transmit(beat);
    }

    fn schedule_reconnect(&mut self, reason: &str) {
        if self.manually_closed {
            return;
        }
        let Some(delay) = self.reconnect.next_delay() else {
            self.reconnect_exhausted = true;
            warn!(
                session_id = %self.session_id,
                attempts = self.reconnect.attempts(),
                max_attempts = self.reconnect.max_attempts(),
                reason = %reason,
                "reconnect attempts exhausted; waiting for explicit connect"
            );
            return;
        };

        let attempt = self.reconnect.attempts();
        warn!(
            session_id = %self.session_id,
            url = %redact_url(&self.config.url),
            attempt,
            max_attempts = self.reconnect.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "session reconnect scheduled"
        );

        let generation = self.generation;
        let actor_ref = self.actor_ref.clone();
        if let Some(previous) = self.reconnect_task.take() {
            previous.abort();
        }
        self.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = actor_ref
                .tell(SessionEvent::ReconnectDue { generation })
                .send()
                .await;
        }));
    }

    fn send_outbound(&mut self, mut message: Outbound) {
        if !self.status.is_open() || self.connection.is_none() {
            self.health.record_outbound_dropped();
            if self.manually_closed {
                debug!(
                    session_id = %self.session_id,
                    action = message.action(),
                    "session closed; dropping outbound message"
                );
                return;
            }
            warn!(
                session_id = %self.session_id,
                action = message.action(),
                status = %self.status,
                "session not open; dropping outbound message and connecting"
            );
            self.begin_connect(None);
            return;
        }
        message.fill_session_id(&self.session_id);
        self.transmit(message);
    }

    fn transmit(&mut self, message: Outbound) {
        let Some(conn) = self.connection.as_ref() else {
            self.health.record_outbound_dropped();
            return;
        };
        let frame = match encode_outbound(&message) {
            Ok(frame) => frame,
            Err(err) => {
                error!(
                    session_id = %self.session_id,
                    action = message.action(),
                    error = %err,
                    "failed to encode outbound message"
                );
                self.health.record_error(&err.to_string());
                return;
            }
        };
        if conn.writer.tell(WriteFrame { frame }).try_send().is_err() {
            self.health.record_outbound_dropped();
            warn!(
                session_id = %self.session_id,
                action = message.action(),
                capacity = self.config.outbound_capacity,
                "outbound queue full or writer gone; dropping message"
            );
        }
    }

    fn close(&mut self) {
        if self.manually_closed {
            return;
        }
        self.manually_closed = true;
        // Invalidate every in-flight report.
        self.generation += 1;
        self.cancel_timers();
        self.teardown_connection(true);
        self.set_status(SessionStatus::Closed);
        self.resolve_waiters(|| Err(SessionError::Closed));
        info!(session_id = %self.session_id, "session closed");
    }

    fn teardown_connection(&mut self, send_close_frame: bool) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        self.health.record_disconnect();
        self.heartbeat.reset();
        let _ = conn.shutdown_tx.send(true);
        if let Some(task) = conn.heartbeat_task {
            task.abort();
        }
        conn.reader_task.abort();
        if send_close_frame
            && conn
                .writer
                .tell(WriteFrame {
                    frame: WsFrame::normal_close(),
                })
                .try_send()
                .is_err()
        {
            debug!(generation = conn.generation, "could not queue close frame");
        }
        retire_writer(conn.writer);
    }

    fn stats(&self) -> SessionStats {
        let mut stats = self.health.snapshot(
            &self.session_id,
            self.status,
            self.reconnect.attempts(),
            self.reconnect_exhausted,
            self.heartbeat.sent(),
        );
        stats.frames_out = self.writer_counters.written();
        stats.outbound_dropped = stats
            .outbound_dropped
            .saturating_add(self.writer_counters.dropped());
        stats.last_heartbeat = self.heartbeat.since_last();
        stats
    }
}

/// Run a subscriber callback, keeping the session alive if it panics.
fn notify(callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("session subscriber panicked");
    }
}
