//! Close codes and reasons (RFC 6455 §7.4).
//!
//! The server reports every terminal condition as a `(code, message)` pair,
//! both in the close frame written to the peer and in the `close` event
//! emitted to the application.

use bytes::Bytes;

/// Status codes the server emits when a connection terminates.
///
/// This is a closed enumeration: every way a connection can end maps to
/// exactly one of these codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure, either from a peer close frame or a clean transport end.
    Normal,
    /// Invalid frame, reserved opcode, oversized control frame, or an
    /// unmasked client frame.
    UnacceptableData,
    /// Transport ended with an error flag, or the inbound-ping abort fired.
    Abnormal,
    /// Cumulative payload exceeded the configured maximum.
    MessageTooBig,
    /// The peer failed to answer a ping before its deadline.
    UnexpectedCondition,
}

impl CloseCode {
    /// The numeric status code on the wire.
    pub fn code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::UnacceptableData => 1003,
            CloseCode::Abnormal => 1006,
            CloseCode::MessageTooBig => 1009,
            CloseCode::UnexpectedCondition => 1011,
        }
    }

    /// The human-readable message paired with the code.
    pub fn message(self) -> &'static str {
        match self {
            CloseCode::Normal => "Close Normal",
            CloseCode::UnacceptableData => "Unacceptable Data Type",
            CloseCode::Abnormal => "Closed Abnormally",
            CloseCode::MessageTooBig => "Message Too Big",
            CloseCode::UnexpectedCondition => "Unexpected Condition",
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> Self {
        value.code()
    }
}

/// A terminal close outcome delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
}

impl CloseReason {
    pub fn new(code: CloseCode) -> Self {
        Self { code }
    }

    /// Numeric status code of this reason.
    pub fn code(&self) -> u16 {
        self.code.code()
    }

    /// Message text of this reason.
    pub fn message(&self) -> &'static str {
        self.code.message()
    }

    /// Serializes the reason into a close frame payload: a 16-bit
    /// big-endian status code followed by the UTF-8 message.
    pub fn to_payload(&self) -> Bytes {
        let message = self.code.message().as_bytes();
        let mut payload = Vec::with_capacity(2 + message.len());
        payload.extend_from_slice(&self.code.code().to_be_bytes());
        payload.extend_from_slice(message);
        payload.into()
    }
}

impl From<CloseCode> for CloseReason {
    fn from(code: CloseCode) -> Self {
        Self { code }
    }
}
