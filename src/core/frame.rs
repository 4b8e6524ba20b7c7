use bytes::Bytes;

/// RFC 6455 normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Transport-neutral websocket frame type.
///
/// Transports convert their native frame representation into/from `WsFrame`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

impl WsFrame {
    #[inline]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Bytes::from(text.into()))
    }

    #[inline]
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close(Some(WsCloseFrame {
            code,
            reason: Bytes::from(reason.into()),
        }))
    }

    #[inline]
    pub fn normal_close() -> Self {
        Self::close(CLOSE_NORMAL, "client closed")
    }

    /// Text payload as `&str`, if this is a valid UTF-8 text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsFrame::Text(bytes) => std::str::from_utf8(bytes.as_ref()).ok(),
            _ => None,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, WsFrame::Close(_))
    }
}

/// Borrow the underlying bytes from frames without allocation.
#[inline]
pub fn frame_bytes(frame: &WsFrame) -> Option<&[u8]> {
    match frame {
        WsFrame::Text(bytes) => Some(bytes.as_ref()),
        WsFrame::Binary(bytes) => Some(bytes.as_ref()),
        WsFrame::Ping(bytes) => Some(bytes.as_ref()),
        WsFrame::Pong(bytes) => Some(bytes.as_ref()),
        WsFrame::Close(_) => None,
    }
}
