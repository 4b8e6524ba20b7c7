use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use kameo::mailbox;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::{SessionError, SessionResult, WsFrame};

/// How long a stopping writer may take to flush before it is killed.
const WRITER_STOP_GRACE: Duration = Duration::from_secs(2);

/// Frames written to, or dropped before reaching, any socket of one session.
#[derive(Debug, Default)]
pub struct WriterCounters {
    written: AtomicU64,
    dropped: AtomicU64,
}

impl WriterCounters {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Owns the write half of one connection and serializes frames onto it.
///
/// The first failed write is reported once through `failure_tx` and the
/// writer goes dead: later frames are counted as dropped, never retried.
pub struct SocketWriter<W>
where
    W: Sink<WsFrame, Error = SessionError> + Send + Sync + Unpin + 'static,
{
    writer: W,
    generation: u64,
    failed: bool,
    failure_tx: Option<oneshot::Sender<SessionError>>,
    counters: Arc<WriterCounters>,
}

impl<W> SocketWriter<W>
where
    W: Sink<WsFrame, Error = SessionError> + Send + Sync + Unpin + 'static,
{
    pub fn new(
        writer: W,
        generation: u64,
        failure_tx: oneshot::Sender<SessionError>,
        counters: Arc<WriterCounters>,
    ) -> Self {
        Self {
            writer,
            generation,
            failed: false,
            failure_tx: Some(failure_tx),
            counters,
        }
    }

    fn drop_frame(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl<W> Actor for SocketWriter<W>
where
    W: Sink<WsFrame, Error = SessionError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = SessionError;

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "SocketWriter panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

pub struct WriteFrame {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriteFrame> for SocketWriter<W>
where
    W: Sink<WsFrame, Error = SessionError> + Send + Sync + Unpin + 'static,
{
    type Reply = SessionResult<()>;

    async fn handle(&mut self, msg: WriteFrame, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let closing = msg.frame.is_close();
        if self.failed {
            debug!(generation = self.generation, "writer failed earlier; dropping frame");
            if !closing {
                self.drop_frame();
            }
            return Ok(());
        }
        if let Err(err) = self.writer.send(msg.frame).await {
            warn!(generation = self.generation, error = %err, "websocket write failed");
            self.failed = true;
            if !closing {
                self.drop_frame();
            }
            if let Some(tx) = self.failure_tx.take() {
                let _ = tx.send(err);
            }
            return Ok(());
        }
        if closing {
            // Nothing may follow a close frame.
            self.failed = true;
            let _ = self.writer.close().await;
        } else {
            self.counters.written.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Spawn a writer whose mailbox holds at most `capacity` queued frames.
///
/// The returned receiver resolves with the first write error.
pub fn spawn_writer<W>(
    writer: W,
    generation: u64,
    capacity: usize,
    counters: Arc<WriterCounters>,
) -> (ActorRef<SocketWriter<W>>, oneshot::Receiver<SessionError>)
where
    W: Sink<WsFrame, Error = SessionError> + Send + Sync + Unpin + 'static,
{
    let (failure_tx, failure_rx) = oneshot::channel();
    let writer_ref = SocketWriter::spawn_with_mailbox(
        SocketWriter::new(writer, generation, failure_tx, counters),
        mailbox::bounded(capacity.max(1)),
    );
    (writer_ref, failure_rx)
}

/// Stop a writer in the background, letting queued frames drain.
///
/// A writer still blocked on its socket after the grace period is killed.
pub fn retire_writer<W>(writer: ActorRef<SocketWriter<W>>)
where
    W: Sink<WsFrame, Error = SessionError> + Send + Sync + Unpin + 'static,
{
    tokio::spawn(async move {
        let graceful = async {
            let _ = writer.stop_gracefully().await;
            writer.wait_for_shutdown().await;
        };
        if tokio::time::timeout(WRITER_STOP_GRACE, graceful).await.is_err() {
            warn!("socket writer did not stop in time; killing it");
            writer.kill();
        }
    });
}
