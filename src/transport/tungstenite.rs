use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream,
    connect_async_tls_with_config as tungstenite_connect_tls,
    tungstenite::{
        Message as TungsteniteMessage, Utf8Bytes,
        protocol::{CloseFrame as TungCloseFrame, WebSocketConfig},
    },
};

use crate::core::{SessionError, TransportConfig, WsCloseFrame, WsFrame};
use crate::transport::{WsTransport, WsTransportConnectFuture};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// rustls 0.23 needs a process-level crypto provider; ring is installed once.
/// If another provider is already installed the error is ignored.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn map_ws_error(context: &'static str, err: impl ToString) -> SessionError {
    SessionError::TransportError {
        context,
        error: err.to_string(),
    }
}

fn close_to_core(frame: Option<TungCloseFrame>) -> Option<WsCloseFrame> {
    frame.map(|f| WsCloseFrame {
        code: u16::from(f.code),
        reason: Bytes::from(f.reason),
    })
}

fn core_to_close(frame: WsCloseFrame) -> TungCloseFrame {
    TungCloseFrame {
        code: frame.code.into(),
        reason: Utf8Bytes::try_from(frame.reason).unwrap_or_else(|_| Utf8Bytes::from_static("")),
    }
}

fn msg_to_frame(msg: TungsteniteMessage) -> WsFrame {
    match msg {
        TungsteniteMessage::Text(text) => WsFrame::Text(Bytes::from(text)),
        TungsteniteMessage::Binary(bytes) => WsFrame::Binary(bytes),
        TungsteniteMessage::Ping(bytes) => WsFrame::Ping(bytes),
        TungsteniteMessage::Pong(bytes) => WsFrame::Pong(bytes),
        TungsteniteMessage::Close(frame) => WsFrame::Close(close_to_core(frame)),
        TungsteniteMessage::Frame(_) => WsFrame::Binary(Bytes::new()),
    }
}

fn frame_to_msg(frame: WsFrame) -> TungsteniteMessage {
    match frame {
        WsFrame::Text(bytes) => match Utf8Bytes::try_from(bytes.clone()) {
            Ok(text) => TungsteniteMessage::Text(text),
            Err(_) => TungsteniteMessage::Binary(bytes),
        },
        WsFrame::Binary(bytes) => TungsteniteMessage::Binary(bytes),
        WsFrame::Ping(bytes) => TungsteniteMessage::Ping(bytes),
        WsFrame::Pong(bytes) => TungsteniteMessage::Pong(bytes),
        WsFrame::Close(frame) => TungsteniteMessage::Close(frame.map(core_to_close)),
    }
}

fn socket_config(config: TransportConfig) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(config.max_message_bytes))
        .max_frame_size(Some(config.max_frame_bytes))
        .write_buffer_size(config.write_buffer_bytes)
        .max_write_buffer_size(config.max_write_buffer_bytes)
}

/// tokio-tungstenite transport for `ws://` and `wss://` endpoints.
#[derive(Clone, Default)]
pub struct TungsteniteTransport {
    connector: Option<Connector>,
}

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
        }
    }

    /// Use a caller-built rustls config for `wss://` endpoints.
    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }
}

pub struct TungsteniteReader {
    inner: futures_util::stream::SplitStream<Socket>,
}

impl Stream for TungsteniteReader {
    type Item = Result<WsFrame, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(msg_to_frame(msg)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(map_ws_error("read", err)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TungsteniteWriter {
    inner: futures_util::stream::SplitSink<Socket, TungsteniteMessage>,
}

impl Sink<WsFrame> for TungsteniteWriter {
    type Error = SessionError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|e| map_ws_error("write", e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(frame_to_msg(item))
            .map_err(|e| map_ws_error("write", e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| map_ws_error("write", e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| map_ws_error("write", e))
    }
}

impl WsTransport for TungsteniteTransport {
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter;

    fn connect(
        &self,
        url: String,
        config: TransportConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let connector = self.connector.clone();
        Box::pin(async move {
            install_rustls_crypto_provider();

            // Chat frames are small and latency-sensitive.
            let disable_nagle = true;
            let (stream, _response) = tungstenite_connect_tls(
                url,
                Some(socket_config(config)),
                disable_nagle,
                connector,
            )
            .await
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

            let (write, read) = stream.split();
            Ok((
                TungsteniteReader { inner: read },
                TungsteniteWriter { inner: write },
            ))
        })
    }
}
