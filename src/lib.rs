//! # wshub
//!
//! A server-side, multi-client WebSocket hub implementing RFC 6455
//! (protocol versions 8 and 13). The hub admits HTTP Upgrade requests from
//! an embedding HTTP server, promotes qualifying connections into framed
//! bidirectional channels, and routes every inbound application message to
//! a topic derived from the request path.
//!
//! ## Overview
//!
//! - [`WebSocketServer`] is the facade: admission, configuration, topic
//!   listeners and the per-client operations.
//! - [`codec::FrameCodec`] and [`frame::Frame`] implement the wire
//!   protocol: streaming decode across arbitrary transport segmentation,
//!   mandatory client masking, minimal-width length encoding.
//! - Each accepted client runs on its own task holding the fragmentation
//!   state machine and liveness timers; the registry enforces the per-IP
//!   cap and keeps released ids reusable through a session cookie.
//!
//! ## Example
//!
//! ```no_run
//! use wshub::{Event, Options, Payload, WebSocketServer};
//!
//! # async fn example(mut req: hyper::Request<hyper::body::Incoming>, peer: std::net::SocketAddr) {
//! let server = WebSocketServer::new(Options::default());
//!
//! // Messages on /chat, plus the connection lifecycle.
//! server.on("/chat", |id, event| {
//!     if let Event::Message(Payload::Text(text)) = event {
//!         println!("{id}: {text}");
//!     }
//! });
//! server.on("close", |id, _| println!("{id} left"));
//!
//! // From the HTTP handler of an upgrade request:
//! let response = server.upgrade(&mut req, peer);
//! # drop(response);
//! # }
//! ```

pub mod close;
pub mod codec;
pub mod events;
pub mod frame;
pub mod options;
pub mod server;

mod connection;
mod handshake;
mod mask;
mod registry;
mod transport;

use thiserror::Error as ThisError;

pub use close::{CloseCode, CloseReason};
pub use connection::ReadyState;
pub use events::{Event, Payload};
pub use frame::{Frame, OpCode};
pub use handshake::{HttpResponse, SESSION_COOKIE};
pub use options::{AllowOrigin, Encoding, Options};
pub use server::WebSocketServer;
pub use transport::Transport;

/// A result type for hub operations, using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the hub.
///
/// Protocol violations terminate the offending connection with a close
/// code (1003 or 1009); they reach the application as `close` events, not
/// as values of this type. The variants below surface through the facade
/// and the admission path.
#[derive(ThisError, Debug)]
pub enum Error {
    /// A text or binary frame arrived while a fragmented message was
    /// still being assembled.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived with no fragmented message in
    /// progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// The frame carried a reserved opcode.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A client frame arrived unmasked; RFC 6455 requires clients to mask.
    #[error("Client frame is not masked")]
    UnmaskedFrame,

    /// RSV1/2/3 were set while strict reserved-bit handling is enabled.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame arrived with the FIN bit clear.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 payload bytes.
    #[error("Control frame payload too large")]
    ControlFrameTooLarge,

    /// A 64-bit payload length had its top 32 bits set; such payloads are
    /// not supported.
    #[error("Payload length exceeds the 32-bit range")]
    PayloadLengthOverflow,

    /// A message exceeded the configured `max_payload`, alone or
    /// cumulatively across fragments.
    #[error("Message too big")]
    MessageTooBig,

    /// Text could not be converted to payload bytes under the requested
    /// encoding.
    #[error("Invalid text payload for the requested encoding")]
    InvalidTextPayload,

    /// The client id is unknown or its transport is already destroyed.
    #[error("Client not found")]
    NotFound,

    /// Wraps I/O errors from the underlying transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps URL parsing failures.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
}
