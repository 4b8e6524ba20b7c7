//! Reusable test utilities for driving a session without a real socket.
//!
//! [`MockTransport::channel_pair`] returns the transport to hand to
//! [`crate::client::SessionClient::with_transport`] and a [`MockServer`] that
//! accepts each connection the session opens. Every accepted
//! [`MockConnection`] lets a test read what the client wrote, push inbound
//! frames, close with a code, break the write half, or drop the socket
//! outright.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Sink;
use sonic_rs::Value;
use tokio::sync::mpsc;

use crate::core::{SessionError, TransportConfig, WsFrame};
use crate::transport::{WsTransport, WsTransportConnectFuture};

struct MockShared {
    accepted_tx: mpsc::UnboundedSender<MockConnection>,
    refusals: AtomicUsize,
    attempts: AtomicUsize,
}

/// A transport backed by in-memory channels.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    /// Build a transport + server control pair.
    pub fn channel_pair() -> (Self, MockServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: Arc::new(MockShared {
                    accepted_tx,
                    refusals: AtomicUsize::new(0),
                    attempts: AtomicUsize::new(0),
                }),
            },
            MockServer { accepted_rx },
        )
    }

    /// Fail the next `count` connection attempts as if the server were down.
    pub fn refuse_next(&self, count: usize) {
        self.shared.refusals.store(count, Ordering::SeqCst);
    }

    /// Connection attempts that reached the transport, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        url: String,
        _config: TransportConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = shared
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(SessionError::ConnectionFailed(
                    "mock: connection refused".to_string(),
                ));
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let writes_fail = Arc::new(AtomicBool::new(false));
            let writes_stall = Arc::new(AtomicBool::new(false));
            let connection = MockConnection {
                url,
                outbound_rx,
                inbound_tx: Some(inbound_tx),
                writes_fail: Arc::clone(&writes_fail),
                writes_stall: Arc::clone(&writes_stall),
            };
            shared.accepted_tx.send(connection).map_err(|_| {
                SessionError::ConnectionFailed("mock: server handle dropped".to_string())
            })?;
            Ok((
                MockReader { rx: inbound_rx },
                MockWriter {
                    outbound_tx,
                    writes_fail,
                    writes_stall,
                },
            ))
        })
    }
}

/// Error surface for operations on [`MockConnection`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The session is no longer reading from this connection.
    ChannelClosed,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock session channel is closed"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Server side of [`MockTransport`]; yields one [`MockConnection`] per accepted socket.
pub struct MockServer {
    accepted_rx: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockServer {
    pub async fn accept(&mut self) -> Option<MockConnection> {
        self.accepted_rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockConnection> {
        tokio::time::timeout(timeout, self.accepted_rx.recv())
            .await
            .unwrap_or_default()
    }
}

/// One accepted socket.
pub struct MockConnection {
    url: String,
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<Result<WsFrame, SessionError>>>,
    writes_fail: Arc<AtomicBool>,
    writes_stall: Arc<AtomicBool>,
}

impl MockConnection {
    /// Url the client dialled, token query included.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Receive a frame written by the client; `None` once the client released the socket.
    pub async fn recv_outbound(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Next text frame parsed as JSON, skipping control frames.
    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self.recv_outbound_timeout(remaining).await?;
            if let Some(text) = frame.as_text() {
                return sonic_rs::from_str(text).ok();
            }
        }
    }

    /// Push an inbound frame to the client.
    pub fn send_frame(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Ok(frame)).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), MockServerError> {
        self.send_frame(WsFrame::text(text))
    }

    /// Server-initiated close handshake with `code`.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<(), MockServerError> {
        let result = self.send_frame(WsFrame::close(code, reason));
        self.inbound_tx = None;
        result
    }

    /// Surface a read error on the client side.
    pub fn fail(&mut self, error: &str) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.take() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Err(SessionError::TransportError {
            context: "mock_read",
            error: error.to_string(),
        }))
        .map_err(|_| MockServerError::ChannelClosed)
    }

    /// Half-open socket: every later client write errors while reads stay up.
    pub fn fail_writes(&self) {
        self.writes_fail.store(true, Ordering::SeqCst);
    }

    /// Peer stops reading: client writes block forever.
    pub fn stall_writes(&self) {
        self.writes_stall.store(true, Ordering::SeqCst);
    }

    /// Abrupt drop: the client's read stream simply ends.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<Result<WsFrame, SessionError>>,
}

impl futures_util::Stream for MockReader {
    type Item = Result<WsFrame, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    outbound_tx: mpsc::UnboundedSender<WsFrame>,
    writes_fail: Arc<AtomicBool>,
    writes_stall: Arc<AtomicBool>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = SessionError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.writes_stall.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(SessionError::TransportError {
                context: "mock_transport_write",
                error: "broken pipe".to_string(),
            });
        }
        self.get_mut()
            .outbound_tx
            .send(item)
            .map_err(|_| SessionError::TransportError {
                context: "mock_transport_write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Collects values pushed from subscriber callbacks so tests can await them.
#[derive(Clone)]
pub struct Recorder<T> {
    tx: mpsc::UnboundedSender<T>,
}

/// Receiving half of a [`Recorder`].
pub struct Recording<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

pub fn recorder<T: Send + 'static>() -> (Recorder<T>, Recording<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Recorder { tx }, Recording { rx })
}

impl<T: Send + 'static> Recorder<T> {
    pub fn record(&self, value: T) {
        let _ = self.tx.send(value);
    }
}

impl<T> Recording<T> {
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Wait for `count` values, giving up at `timeout`.
    pub async fn take(&mut self, count: usize, timeout: Duration) -> Vec<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_timeout(remaining).await {
                Some(value) => out.push(value),
                None => break,
            }
        }
        out
    }

    /// Everything recorded so far, without waiting.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(value) = self.rx.try_recv() {
            out.push(value);
        }
        out
    }
}
