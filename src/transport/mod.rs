use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{SessionError, TransportConfig, WsFrame};

pub mod tungstenite;

pub use tungstenite::{TungsteniteReader, TungsteniteTransport, TungsteniteWriter};

/// Future returned by [`WsTransport::connect`].
pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), SessionError>> + Send>>;

/// Socket seam for the session actor.
///
/// Each successful `connect` yields one physical connection split into a frame
/// stream and a frame sink. The session owns both halves exclusively and drops
/// them when the connection is torn down.
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, SessionError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = SessionError> + Send + Sync + Unpin + 'static;

    /// `url` already carries the `token` query parameter.
    fn connect(
        &self,
        url: String,
        config: TransportConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;
}
