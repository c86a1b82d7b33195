//! Per-client connection task.
//!
//! Every accepted client is owned by exactly one task which holds all of
//! its protocol state: the framed transport, the fragment assembler, the
//! liveness timers and the command mailbox. Serializing everything through
//! one task gives the state machine the single-threaded semantics the
//! protocol assumes; the facade talks to the task through [`Command`]
//! messages and observes it through the atomics in [`ClientShared`].

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Sleep};
use tokio_util::codec::Framed;
use url::Url;

use crate::close::{CloseCode, CloseReason};
use crate::codec::FrameCodec;
use crate::events::{Event, Payload, TOPIC_CLOSE, TOPIC_ERROR};
use crate::frame::{Frame, OpCode};
use crate::options::Encoding;
use crate::server::Core;
use crate::transport::{Meter, Transport};
use crate::Error;

/// Delay before answering the most recent inbound ping. Pings arriving
/// faster than this collapse into a single pong.
const PONG_COALESCE_DELAY: Duration = Duration::from_secs(3);

/// How long a peer may keep pinging without ever leaving a quiet window
/// before the server gives up on it.
const PING_FLOOD_ABORT: Duration = Duration::from_secs(9);

/// Transport lifecycle as observed through the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The handshake completed and frames flow.
    Open,
    /// A terminal condition occurred; the close frame is being written.
    Closing,
    /// The transport is destroyed.
    Closed,
}

impl ReadyState {
    fn as_u8(self) -> u8 {
        match self {
            ReadyState::Open => 1,
            ReadyState::Closing => 2,
            ReadyState::Closed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Instructions the facade sends into a connection task.
pub(crate) enum Command {
    /// Write a pre-built frame to the peer.
    Send(Frame),
    /// Send a ping carrying `token` and expect it echoed back, optionally
    /// within `deadline`.
    Ping {
        token: Bytes,
        deadline: Option<Duration>,
    },
    /// Gracefully close the connection; `ack` resolves once the client is
    /// out of the registry.
    Close { ack: oneshot::Sender<bool> },
    Pause,
    Resume,
    SetEncoding(Encoding),
    SetNoDelay(bool),
    SetKeepAlive(bool),
}

/// State shared between a connection task and the facade.
pub(crate) struct ClientShared {
    pub(crate) bytes_read: Arc<AtomicU64>,
    pub(crate) bytes_written: Arc<AtomicU64>,
    pub(crate) paused: AtomicBool,
    ready_state: AtomicU8,
}

impl ClientShared {
    pub(crate) fn new() -> Self {
        Self {
            bytes_read: Arc::new(AtomicU64::new(0)),
            bytes_written: Arc::new(AtomicU64::new(0)),
            paused: AtomicBool::new(false),
            ready_state: AtomicU8::new(ReadyState::Open.as_u8()),
        }
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready_state.load(Ordering::Acquire))
    }

    fn set_ready_state(&self, state: ReadyState) {
        self.ready_state.store(state.as_u8(), Ordering::Release);
    }
}

/// A registered client as seen from the registry and the facade.
#[derive(Clone)]
pub(crate) struct ClientHandle {
    pub(crate) id: String,
    pub(crate) addr: SocketAddr,
    pub(crate) url: Url,
    pub(crate) topic: String,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) shared: Arc<ClientShared>,
}

impl ClientHandle {
    #[cfg(test)]
    pub(crate) fn stub(id: &str, addr: SocketAddr) -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        Self {
            id: id.to_owned(),
            addr,
            url: Url::parse("ws://test/").expect("static url"),
            topic: "message".to_owned(),
            commands,
            shared: Arc::new(ClientShared::new()),
        }
    }
}

/// Reassembles fragmented messages (RFC 6455 §5.4).
///
/// Holds the opcode of the message being assembled and the accumulated
/// payload. The cumulative size is checked against the configured maximum
/// before any fragment is buffered.
#[derive(Default)]
struct Assembler {
    /// Opcode of the first fragment while a message is being assembled.
    fragment: Option<OpCode>,
    accumulated: BytesMut,
}

impl Assembler {
    /// Feeds one data frame through the fragmentation state machine.
    ///
    /// Returns the completed message as `(opcode, payload)` once a final
    /// frame lands, `None` while fragments are pending.
    fn on_frame(
        &mut self,
        frame: Frame,
        max_payload: usize,
    ) -> Result<Option<(OpCode, Bytes)>, Error> {
        let over_limit = |total: usize| max_payload > 0 && total > max_payload;

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(Error::InvalidFragment);
                }
                if over_limit(frame.payload.len()) {
                    return Err(Error::MessageTooBig);
                }

                if frame.fin {
                    Ok(Some((frame.opcode, frame.into_payload())))
                } else {
                    self.fragment = Some(frame.opcode);
                    self.accumulated.extend_from_slice(&frame.payload);
                    Ok(None)
                }
            }
            OpCode::Continuation => {
                let opcode = self.fragment.ok_or(Error::InvalidContinuationFrame)?;

                if over_limit(self.accumulated.len() + frame.payload.len()) {
                    return Err(Error::MessageTooBig);
                }
                self.accumulated.extend_from_slice(&frame.payload);

                if frame.fin {
                    let payload =
                        std::mem::replace(&mut self.accumulated, BytesMut::with_capacity(1024));
                    self.fragment = None;
                    Ok(Some((opcode, payload.freeze())))
                } else {
                    Ok(None)
                }
            }
            // Control frames never reach the assembler.
            _ => Err(Error::InvalidFragment),
        }
    }
}

/// How a connection task came to its end.
enum Exit {
    /// Terminal protocol outcome; a close frame with this code is written.
    Close(CloseCode),
    /// The transport failed; surfaced as an `error` event, no frame written.
    TransportError(String),
}

/// Maps a protocol error to the close code reported to both sides.
fn close_code_for(err: &Error) -> CloseCode {
    match err {
        Error::MessageTooBig => CloseCode::MessageTooBig,
        _ => CloseCode::UnacceptableData,
    }
}

/// Awaits an optional timer; never resolves while the slot is empty.
async fn armed(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

fn timer(duration: Duration) -> Option<Pin<Box<Sleep>>> {
    Some(Box::pin(sleep(duration)))
}

/// The task owning one client connection.
pub(crate) struct Connection<T: Transport> {
    id: String,
    topic: String,
    core: Arc<Core>,
    shared: Arc<ClientShared>,
    framed: Framed<Meter<T>, FrameCodec>,
    commands: mpsc::UnboundedReceiver<Command>,
    encoding: Encoding,
    assembler: Assembler,
    paused: bool,
    /// Token the next pong must echo to count as alive (set per ping).
    expected_pong: Option<Bytes>,
    /// Fires when the peer missed its pong deadline.
    pong_deadline: Option<Pin<Box<Sleep>>>,
    /// Fires when the coalesced answer to inbound pings is due.
    pong_emit: Option<Pin<Box<Sleep>>>,
    /// Payload of the most recent inbound ping, echoed on emit.
    pong_echo: Option<Bytes>,
    /// Fires when inbound pings never left a quiet window.
    ping_abort: Option<Pin<Box<Sleep>>>,
    close_ack: Option<oneshot::Sender<bool>>,
}

impl<T: Transport> Connection<T> {
    /// Builds the task state around an already-metered stream. The meter
    /// is created at admission so the handshake response bytes are counted
    /// too.
    pub(crate) fn new(
        core: Arc<Core>,
        handle: &ClientHandle,
        stream: Meter<T>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (max_payload, reject_reserved_bits, encoding) = {
            let options = core.options.lock().expect("options poisoned");
            (
                options.max_payload,
                options.reject_reserved_bits,
                options.encoding,
            )
        };

        let framed = Framed::new(stream, FrameCodec::new(max_payload, reject_reserved_bits));

        Self {
            id: handle.id.clone(),
            topic: handle.topic.clone(),
            core,
            shared: handle.shared.clone(),
            framed,
            commands,
            encoding,
            assembler: Assembler::default(),
            paused: false,
            expected_pong: None,
            pong_deadline: None,
            pong_emit: None,
            pong_echo: None,
            ping_abort: None,
            close_ack: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let exit = self.drive().await;
        self.finish(exit).await;
    }

    async fn drive(&mut self) -> Exit {
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        // Registry handle gone; treat as a server-side close.
                        return Exit::Close(CloseCode::Normal);
                    };
                    if let Some(exit) = self.on_command(cmd).await {
                        return exit;
                    }
                }

                _ = armed(&mut self.pong_deadline) => {
                    self.pong_deadline = None;
                    log::debug!("client {}: pong deadline expired", self.id);
                    return Exit::Close(CloseCode::UnexpectedCondition);
                }

                _ = armed(&mut self.pong_emit) => {
                    self.pong_emit = None;
                    self.ping_abort = None;
                    let echo = self.pong_echo.take().unwrap_or_default();
                    if let Err(err) = self.framed.send(Frame::pong(&*echo)).await {
                        return Exit::TransportError(err.to_string());
                    }
                }

                _ = armed(&mut self.ping_abort) => {
                    self.ping_abort = None;
                    self.pong_emit = None;
                    log::debug!("client {}: inbound ping flood", self.id);
                    return Exit::Close(CloseCode::Abnormal);
                }

                frame = self.framed.next(), if !self.paused => {
                    match frame {
                        None => return Exit::Close(CloseCode::Normal),
                        Some(Ok(frame)) => {
                            if let Some(exit) = self.on_frame(frame).await {
                                return exit;
                            }
                        }
                        Some(Err(Error::Io(err))) => {
                            return Exit::TransportError(err.to_string());
                        }
                        Some(Err(err)) => {
                            log::debug!("client {}: protocol violation: {err}", self.id);
                            return Exit::Close(close_code_for(&err));
                        }
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) -> Option<Exit> {
        match cmd {
            Command::Send(frame) => {
                if let Err(err) = self.framed.send(frame).await {
                    return Some(Exit::TransportError(err.to_string()));
                }
            }
            Command::Ping { token, deadline } => {
                self.expected_pong = Some(token.clone());
                if let Err(err) = self.framed.send(Frame::ping(&*token)).await {
                    return Some(Exit::TransportError(err.to_string()));
                }
                // The deadline from the first unanswered ping stands; a
                // matching pong clears it and the next ping arms it anew.
                if self.pong_deadline.is_none() {
                    self.pong_deadline = deadline.and_then(timer);
                }
            }
            Command::Close { ack } => {
                self.close_ack = Some(ack);
                return Some(Exit::Close(CloseCode::Normal));
            }
            Command::Pause => {
                self.paused = true;
                self.shared.paused.store(true, Ordering::Release);
            }
            Command::Resume => {
                self.paused = false;
                self.shared.paused.store(false, Ordering::Release);
            }
            Command::SetEncoding(encoding) => self.encoding = encoding,
            Command::SetNoDelay(enabled) => {
                let _ = self.framed.get_ref().get_ref().set_nodelay(enabled);
            }
            Command::SetKeepAlive(enabled) => {
                let _ = self.framed.get_ref().get_ref().set_keepalive(enabled);
            }
        }
        None
    }

    async fn on_frame(&mut self, frame: Frame) -> Option<Exit> {
        match frame.opcode {
            OpCode::Close => Some(Exit::Close(CloseCode::Normal)),
            OpCode::Ping => {
                // Coalesce: answer the latest ping only after a quiet
                // window, and give up on peers that never provide one.
                self.pong_echo = Some(frame.into_payload());
                self.pong_emit = timer(PONG_COALESCE_DELAY);
                if self.ping_abort.is_none() {
                    self.ping_abort = timer(PING_FLOOD_ABORT);
                }
                None
            }
            OpCode::Pong => {
                if self.expected_pong.as_deref() == Some(&frame.payload[..]) {
                    self.expected_pong = None;
                    self.pong_deadline = None;
                }
                None
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let max_payload = {
                    self.core.options.lock().expect("options poisoned").max_payload
                };
                match self.assembler.on_frame(frame, max_payload) {
                    Ok(Some((opcode, payload))) => {
                        let payload = match opcode {
                            OpCode::Text => Payload::Text(self.encoding.decode(&payload)),
                            _ => Payload::Binary(payload),
                        };
                        self.core
                            .emitter
                            .emit(&self.topic, &self.id, &Event::Message(payload));
                        None
                    }
                    Ok(None) => None,
                    Err(err) => {
                        log::debug!("client {}: {err}", self.id);
                        Some(Exit::Close(close_code_for(&err)))
                    }
                }
            }
        }
    }

    async fn finish(mut self, exit: Exit) {
        self.shared.set_ready_state(ReadyState::Closing);

        let reason = match &exit {
            Exit::Close(code) => CloseReason::new(*code),
            Exit::TransportError(_) => CloseReason::new(CloseCode::Abnormal),
        };

        if !matches!(exit, Exit::TransportError(_)) {
            let _ = self.framed.send(Frame::close(reason)).await;
        }
        let _ = self.framed.close().await;

        self.core.remove_client(&self.id);
        self.shared.set_ready_state(ReadyState::Closed);

        if let Exit::TransportError(message) = &exit {
            self.core
                .emitter
                .emit(TOPIC_ERROR, &self.id, &Event::Error(message.clone()));
        }
        self.core
            .emitter
            .emit(TOPIC_CLOSE, &self.id, &Event::Close(reason));

        if let Some(ack) = self.close_ack.take() {
            let _ = ack.send(true);
        }

        log::debug!(
            "client {} closed: {} {}",
            self.id,
            reason.code(),
            reason.message()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(opcode: OpCode, fin: bool, payload: &[u8]) -> Frame {
        Frame::new(fin, opcode, None, payload)
    }

    #[test]
    fn final_frame_passes_straight_through() {
        let mut assembler = Assembler::default();
        let out = assembler.on_frame(data(OpCode::Text, true, b"Hello"), 0).unwrap();
        assert_eq!(out, Some((OpCode::Text, Bytes::from_static(b"Hello"))));
    }

    #[test]
    fn fragments_concatenate_in_order() {
        let mut assembler = Assembler::default();

        assert_eq!(assembler.on_frame(data(OpCode::Text, false, b"A"), 0).unwrap(), None);
        assert_eq!(
            assembler.on_frame(data(OpCode::Continuation, false, b"B"), 0).unwrap(),
            None
        );
        let out = assembler
            .on_frame(data(OpCode::Continuation, true, b"C"), 0)
            .unwrap();
        assert_eq!(out, Some((OpCode::Text, Bytes::from_static(b"ABC"))));
    }

    #[test]
    fn binary_kind_follows_first_fragment() {
        let mut assembler = Assembler::default();
        assembler.on_frame(data(OpCode::Binary, false, &[1]), 0).unwrap();
        let out = assembler
            .on_frame(data(OpCode::Continuation, true, &[2]), 0)
            .unwrap();
        assert_eq!(out, Some((OpCode::Binary, Bytes::from_static(&[1, 2]))));
    }

    #[test]
    fn data_frame_while_assembling_is_a_violation() {
        let mut assembler = Assembler::default();
        assembler.on_frame(data(OpCode::Text, false, b"A"), 0).unwrap();

        for opcode in [OpCode::Text, OpCode::Binary] {
            let mut assembler = Assembler {
                fragment: Some(OpCode::Text),
                accumulated: BytesMut::from(&b"A"[..]),
            };
            assert!(matches!(
                assembler.on_frame(data(opcode, true, b"B"), 0),
                Err(Error::InvalidFragment)
            ));
        }
    }

    #[test]
    fn continuation_without_fragment_is_a_violation() {
        let mut assembler = Assembler::default();
        for fin in [false, true] {
            assert!(matches!(
                assembler.on_frame(data(OpCode::Continuation, fin, b"B"), 0),
                Err(Error::InvalidContinuationFrame)
            ));
        }
    }

    #[test]
    fn cumulative_payload_limit_is_enforced() {
        let mut assembler = Assembler::default();
        assert_eq!(
            assembler.on_frame(data(OpCode::Text, false, b"sixsix"), 10).unwrap(),
            None
        );
        assert!(matches!(
            assembler.on_frame(data(OpCode::Continuation, true, b"sixsix"), 10),
            Err(Error::MessageTooBig)
        ));
    }

    #[test]
    fn payload_at_the_limit_is_delivered() {
        let mut assembler = Assembler::default();
        assembler.on_frame(data(OpCode::Text, false, b"sixsix"), 10).unwrap();
        let out = assembler
            .on_frame(data(OpCode::Continuation, true, b"four"), 10)
            .unwrap();
        assert_eq!(out, Some((OpCode::Text, Bytes::from_static(b"sixsixfour"))));
    }

    #[test]
    fn oversized_single_frame_is_rejected() {
        let mut assembler = Assembler::default();
        assert!(matches!(
            assembler.on_frame(data(OpCode::Binary, true, &[0; 11]), 10),
            Err(Error::MessageTooBig)
        ));
    }

    #[test]
    fn zero_max_payload_disables_the_limit() {
        let mut assembler = Assembler::default();
        let out = assembler
            .on_frame(data(OpCode::Binary, true, &[0; 1024]), 0)
            .unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn ready_state_round_trip() {
        for state in [ReadyState::Open, ReadyState::Closing, ReadyState::Closed] {
            assert_eq!(ReadyState::from_u8(state.as_u8()), state);
        }
    }
}
