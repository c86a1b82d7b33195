//! The public facade of the hub.
//!
//! [`WebSocketServer`] admits upgrade requests from an embedding HTTP
//! server, keeps the client registry, dispatches the periodic liveness
//! pings, and exposes the per-client operations (`send`, `ping`, `close`,
//! transport inspectors). Application code observes connections through
//! topic listeners registered with [`WebSocketServer::on`].
//!
//! Two admission paths are provided:
//!
//! - [`WebSocketServer::handshake`] for servers that hand over the parsed
//!   request head together with the raw stream; the hub writes the HTTP
//!   response itself.
//! - [`WebSocketServer::upgrade`] for hyper servers; the hub returns the
//!   response for hyper to write and picks the stream up from
//!   [`hyper::upgrade`] once the protocol switch completes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use url::Url;

use crate::connection::{ClientHandle, ClientShared, Command, Connection, ReadyState};
use crate::events::{Emitter, Event, Payload, TOPIC_OPEN};
use crate::frame::Frame;
use crate::handshake::{self, Admission, HttpResponse, Rejection};
use crate::options::{AllowOrigin, Encoding, Options};
use crate::registry::Registry;
use crate::transport::{Meter, Transport};
use crate::{Error, Result};

/// Shared state behind the facade: the registry, the live configuration
/// and the listener table. Connection tasks hold an `Arc` to it; the
/// periodic ping task holds a `Weak` so it dies with the last owner.
pub(crate) struct Core {
    pub(crate) options: Mutex<Options>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) emitter: Emitter,
    /// Carries the current `ping_delay` to the periodic task. A watch
    /// channel keeps the latest value even when the task is mid-cycle, so
    /// a reschedule is never missed.
    ping_reschedule: watch::Sender<Duration>,
}

impl Core {
    /// Removes a client from the registry, recording its id for sticky
    /// reuse. Safe to call from any task; idempotent.
    pub(crate) fn remove_client(&self, id: &str) -> bool {
        let session_expires = self.options.lock().expect("options poisoned").session_expires;
        self.registry
            .lock()
            .expect("registry poisoned")
            .remove(id, session_expires)
            .is_some()
    }
}

/// Multi-client WebSocket hub.
///
/// Cloning is cheap and every clone drives the same hub.
///
/// # Example
///
/// ```no_run
/// use wshub::{Options, Payload, WebSocketServer};
///
/// # async fn example(mut req: hyper::Request<hyper::body::Incoming>, peer: std::net::SocketAddr) {
/// let server = WebSocketServer::new(Options::default());
///
/// server.on("/chat", |id, event| {
///     println!("{id}: {event:?}");
/// });
///
/// // Inside the HTTP handler for an upgrade request:
/// let response = server.upgrade(&mut req, peer);
/// # let _ = response;
/// # }
/// ```
#[derive(Clone)]
pub struct WebSocketServer {
    core: Arc<Core>,
}

impl WebSocketServer {
    /// Creates a hub and starts its periodic ping dispatcher.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn new(options: Options) -> Self {
        let (ping_reschedule, reschedule) = watch::channel(options.ping_delay);
        let core = Arc::new(Core {
            options: Mutex::new(options),
            registry: Mutex::new(Registry::new()),
            emitter: Emitter::new(),
            ping_reschedule,
        });
        spawn_ping_loop(&core, reschedule);
        Self { core }
    }

    /// Registers a listener for a topic: `open`, `close`, `error`, or a
    /// message topic (the request path, or `message` for the root path).
    pub fn on<F>(&self, topic: impl Into<String>, listener: F)
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.core.emitter.on(topic, listener);
    }

    // ==================== admission ====================

    /// Admits an upgrade request whose transport the hub drives directly.
    ///
    /// Validates the request, writes the HTTP response (101 on success, an
    /// error status otherwise) to `stream`, and on success registers the
    /// client and spawns its connection task.
    ///
    /// Returns the client id on acceptance and `None` on a rejection that
    /// was answered over the wire. I/O failures while answering surface as
    /// errors.
    pub async fn handshake<T, B>(
        &self,
        request: Request<B>,
        mut stream: T,
        peer: SocketAddr,
    ) -> Result<Option<String>>
    where
        T: Transport,
    {
        let policy = self.core.options.lock().expect("options poisoned").allow_origin.clone();

        let admitted = handshake::validate(&request, &policy)
            .and_then(|admission| self.admit(admission, peer));

        match admitted {
            Err(rejection) => {
                log::debug!("upgrade from {peer} rejected: {}", rejection.status());
                let response = handshake::rejection_response(rejection);
                stream
                    .write_all(handshake::serialize_response(&response).as_bytes())
                    .await?;
                let _ = stream.shutdown().await;
                Ok(None)
            }
            Ok((handle, commands, response)) => {
                let mut metered = Meter::new(
                    stream,
                    handle.shared.bytes_read.clone(),
                    handle.shared.bytes_written.clone(),
                );

                let raw = handshake::serialize_response(&response);
                if let Err(err) = metered.write_all(raw.as_bytes()).await {
                    self.core.remove_client(&handle.id);
                    return Err(err.into());
                }

                let id = handle.id.clone();
                log::debug!("client {id} open from {peer} on {}", handle.topic);
                self.core.emitter.emit(TOPIC_OPEN, &id, &Event::Open);

                let connection = Connection::new(self.core.clone(), &handle, metered, commands);
                tokio::spawn(connection.run());

                Ok(Some(id))
            }
        }
    }

    /// Admits an upgrade request arriving through a hyper server.
    ///
    /// Returns the response for hyper to write. On acceptance the client is
    /// already registered; its connection task starts once hyper completes
    /// the protocol switch.
    pub fn upgrade<B>(&self, request: &mut Request<B>, peer: SocketAddr) -> HttpResponse {
        let policy = self.core.options.lock().expect("options poisoned").allow_origin.clone();

        let admitted = handshake::validate(request, &policy)
            .and_then(|admission| self.admit(admission, peer));

        match admitted {
            Err(rejection) => {
                log::debug!("upgrade from {peer} rejected: {}", rejection.status());
                handshake::rejection_response(rejection)
            }
            Ok((handle, commands, response)) => {
                let core = self.core.clone();
                let on_upgrade = hyper::upgrade::on(request);

                tokio::spawn(async move {
                    match on_upgrade.await {
                        Ok(upgraded) => {
                            log::debug!("client {} open from {peer} on {}", handle.id, handle.topic);
                            core.emitter.emit(TOPIC_OPEN, &handle.id, &Event::Open);

                            let stream = Meter::new(
                                TokioIo::new(upgraded),
                                handle.shared.bytes_read.clone(),
                                handle.shared.bytes_written.clone(),
                            );
                            Connection::new(core.clone(), &handle, stream, commands)
                                .run()
                                .await;
                        }
                        Err(err) => {
                            log::warn!("client {} upgrade failed: {err}", handle.id);
                            core.remove_client(&handle.id);
                        }
                    }
                });

                response
            }
        }
    }

    /// Registers a validated upgrade: enforces the per-IP cap, allocates
    /// the client id and inserts the handle, all under one registry lock.
    fn admit(
        &self,
        admission: Admission,
        peer: SocketAddr,
    ) -> std::result::Result<
        (ClientHandle, mpsc::UnboundedReceiver<Command>, HttpResponse),
        Rejection,
    > {
        let (limit_by_ip, session_expires) = {
            let options = self.core.options.lock().expect("options poisoned");
            (options.limit_by_ip, options.session_expires)
        };

        let mut registry = self.core.registry.lock().expect("registry poisoned");

        if limit_by_ip > 0 && registry.count_by_ip(peer.ip()) >= limit_by_ip {
            return Err(Rejection::TooManyConnections);
        }

        let id = registry.allocate_id(admission.cookie_id.as_deref(), session_expires);
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = ClientHandle {
            id: id.clone(),
            addr: peer,
            url: admission.url,
            topic: admission.topic,
            commands,
            shared: Arc::new(ClientShared::new()),
        };
        registry.insert(handle.clone());

        let response = handshake::accept_response(&admission.accept, &id, session_expires);
        Ok((handle, receiver, response))
    }

    // ==================== per-client operations ====================

    fn handle(&self, id: &str) -> Result<ClientHandle> {
        self.core
            .registry
            .lock()
            .expect("registry poisoned")
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn command(&self, id: &str, command: Command) -> Result<()> {
        self.handle(id)?
            .commands
            .send(command)
            .map_err(|_| Error::NotFound)
    }

    /// Sends an application message: opcode 1 for text (UTF-8), opcode 2
    /// for binary.
    pub fn send(&self, id: &str, payload: impl Into<Payload>) -> Result<()> {
        let frame = match payload.into() {
            Payload::Text(text) => Frame::text(text.as_bytes()),
            Payload::Binary(bytes) => Frame::binary(&*bytes),
        };
        self.command(id, Command::Send(frame))
    }

    /// Sends a text message whose bytes are produced by `encoding`.
    pub fn send_encoded(&self, id: &str, text: &str, encoding: Encoding) -> Result<()> {
        let bytes = encoding.encode(text)?;
        self.command(id, Command::Send(Frame::text(&*bytes)))
    }

    /// Pings a client with its own id as the token. When `pong_timeout` is
    /// set (and non-zero), a missing echo within the window terminates the
    /// connection with 1011.
    pub fn ping(&self, id: &str, pong_timeout: Option<Duration>) -> Result<()> {
        let token = Bytes::copy_from_slice(id.as_bytes());
        let deadline = pong_timeout.filter(|timeout| !timeout.is_zero());
        self.command(id, Command::Ping { token, deadline })
    }

    /// Gracefully closes a client: close frame, transport shutdown,
    /// registry removal. Returns `true` once the client is removed,
    /// `false` when the connection task disappeared before acknowledging.
    pub async fn close(&self, id: &str) -> Result<bool> {
        let (ack, done) = oneshot::channel();
        self.command(id, Command::Close { ack })?;
        Ok(done.await.unwrap_or(false))
    }

    /// The parsed request URL the client connected with.
    pub fn url(&self, id: &str) -> Result<Url> {
        Ok(self.handle(id)?.url.clone())
    }

    /// The peer address of the client's transport.
    pub fn peer_addr(&self, id: &str) -> Result<SocketAddr> {
        Ok(self.handle(id)?.addr)
    }

    /// Raw bytes received on the client's transport.
    pub fn bytes_read(&self, id: &str) -> Result<u64> {
        Ok(self
            .handle(id)?
            .shared
            .bytes_read
            .load(std::sync::atomic::Ordering::Relaxed))
    }

    /// Raw bytes written to the client's transport.
    pub fn bytes_written(&self, id: &str) -> Result<u64> {
        Ok(self
            .handle(id)?
            .shared
            .bytes_written
            .load(std::sync::atomic::Ordering::Relaxed))
    }

    /// Whether inbound data delivery is paused.
    pub fn is_paused(&self, id: &str) -> Result<bool> {
        Ok(self
            .handle(id)?
            .shared
            .paused
            .load(std::sync::atomic::Ordering::Acquire))
    }

    /// Stops delivering inbound frames. Timers and outbound writes keep
    /// running; transport backpressure applies to the peer.
    pub fn pause(&self, id: &str) -> Result<()> {
        self.command(id, Command::Pause)
    }

    /// Resumes inbound frame delivery.
    pub fn resume(&self, id: &str) -> Result<()> {
        self.command(id, Command::Resume)
    }

    /// Lifecycle state of the client's transport.
    pub fn ready_state(&self, id: &str) -> Result<ReadyState> {
        Ok(self.handle(id)?.shared.ready_state())
    }

    /// Overrides the text decoding of inbound messages for one client.
    pub fn set_encoding(&self, id: &str, encoding: Encoding) -> Result<()> {
        self.command(id, Command::SetEncoding(encoding))
    }

    /// Proxies `TCP_NODELAY` to the client's transport.
    pub fn set_no_delay(&self, id: &str, enabled: bool) -> Result<()> {
        self.command(id, Command::SetNoDelay(enabled))
    }

    /// Proxies TCP keepalive to the client's transport.
    pub fn set_keep_alive(&self, id: &str, enabled: bool) -> Result<()> {
        self.command(id, Command::SetKeepAlive(enabled))
    }

    /// Ids of all connected clients.
    pub fn clients(&self) -> Vec<String> {
        self.core
            .registry
            .lock()
            .expect("registry poisoned")
            .handles()
            .into_iter()
            .map(|handle| handle.id)
            .collect()
    }

    // ==================== configuration ====================

    /// Snapshot of the current configuration.
    pub fn options(&self) -> Options {
        self.core.options.lock().expect("options poisoned").clone()
    }

    pub fn allow_origin(&self) -> AllowOrigin {
        self.core.options.lock().expect("options poisoned").allow_origin.clone()
    }

    pub fn set_allow_origin(&self, allow_origin: AllowOrigin) {
        self.core.options.lock().expect("options poisoned").allow_origin = allow_origin;
    }

    pub fn encoding(&self) -> Encoding {
        self.core.options.lock().expect("options poisoned").encoding
    }

    /// Sets the default text decoding. Unknown names passed through
    /// [`Encoding::from_name`] are ignored by the caller keeping the
    /// prior value; this setter takes the already-validated value.
    pub fn set_default_encoding(&self, encoding: Encoding) {
        self.core.options.lock().expect("options poisoned").encoding = encoding;
    }

    pub fn limit_by_ip(&self) -> usize {
        self.core.options.lock().expect("options poisoned").limit_by_ip
    }

    /// Sets the per-IP connection cap; zero disables it.
    pub fn set_limit_by_ip(&self, limit: usize) {
        self.core.options.lock().expect("options poisoned").limit_by_ip = limit;
    }

    pub fn max_payload(&self) -> usize {
        self.core.options.lock().expect("options poisoned").max_payload
    }

    /// Sets the message payload cap; zero disables it.
    pub fn set_max_payload(&self, max_payload: usize) {
        self.core.options.lock().expect("options poisoned").max_payload = max_payload;
    }

    pub fn ping_delay(&self) -> Duration {
        self.core.options.lock().expect("options poisoned").ping_delay
    }

    /// Sets the periodic ping interval and reschedules the dispatcher.
    /// Zero disables periodic pings.
    pub fn set_ping_delay(&self, ping_delay: Duration) {
        self.core.options.lock().expect("options poisoned").ping_delay = ping_delay;
        let _ = self.core.ping_reschedule.send(ping_delay);
    }

    pub fn pong_timeout(&self) -> Duration {
        self.core.options.lock().expect("options poisoned").pong_timeout
    }

    /// Sets the deadline for answering periodic pings; zero disables it.
    pub fn set_pong_timeout(&self, pong_timeout: Duration) {
        self.core.options.lock().expect("options poisoned").pong_timeout = pong_timeout;
    }

    pub fn session_expires(&self) -> Duration {
        self.core.options.lock().expect("options poisoned").session_expires
    }

    /// Sets how long released ids stay reusable; zero disables sticky
    /// identity.
    pub fn set_session_expires(&self, session_expires: Duration) {
        self.core.options.lock().expect("options poisoned").session_expires = session_expires;
    }

    pub fn reject_reserved_bits(&self) -> bool {
        self.core.options.lock().expect("options poisoned").reject_reserved_bits
    }

    /// Toggles strict RSV handling for newly admitted connections.
    pub fn set_reject_reserved_bits(&self, reject: bool) {
        self.core.options.lock().expect("options poisoned").reject_reserved_bits = reject;
    }
}

/// Periodic liveness dispatcher.
///
/// One task per hub. Every `ping_delay` it sends each client a ping with a
/// fresh random token and arms the per-client pong deadline. The task holds
/// only a weak reference plus the watch receiver, so it winds down when the
/// hub's sender closes; `borrow_and_update` picks up a `ping_delay` change
/// even when it lands while the task is between waits.
fn spawn_ping_loop(core: &Arc<Core>, mut reschedule: watch::Receiver<Duration>) {
    let weak: Weak<Core> = Arc::downgrade(core);

    tokio::spawn(async move {
        loop {
            let delay = *reschedule.borrow_and_update();

            if delay.is_zero() {
                // Periodic pings disabled; wait for the next reschedule.
                if reschedule.changed().await.is_err() {
                    return;
                }
                continue;
            }

            tokio::select! {
                changed = reschedule.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                _ = sleep(delay) => {}
            }

            let Some(core) = weak.upgrade() else { return };
            let pong_timeout = core.options.lock().expect("options poisoned").pong_timeout;
            let deadline = (!pong_timeout.is_zero()).then_some(pong_timeout);

            let handles = core.registry.lock().expect("registry poisoned").handles();
            log::trace!("pinging {} client(s)", handles.len());

            for handle in handles {
                let token: Bytes = format!("{:08x}", rand::random::<u32>()).into_bytes().into();
                let _ = handle.commands.send(Command::Ping {
                    token,
                    deadline,
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;
    use bytes::{Buf, BytesMut};
    use hyper::header;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_util::codec::Encoder;

    /// Drives the client side of a connection over an in-memory duplex
    /// pipe: masked frames out, unmasked server frames in.
    struct TestClient {
        stream: DuplexStream,
        buf: BytesMut,
    }

    impl TestClient {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                buf: BytesMut::new(),
            }
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        async fn send_frame(&mut self, fin: bool, opcode: OpCode, payload: &[u8]) {
            let mut frame = Frame::new(fin, opcode, Some(rand::random()), payload);
            frame.mask();

            let mut out = BytesMut::new();
            crate::codec::FrameCodec::new(0, false)
                .encode(frame, &mut out)
                .unwrap();
            self.send_raw(&out).await;
        }

        async fn read_http_response(&mut self) -> String {
            let mut response = Vec::new();
            let mut byte = [0u8; 1];
            while !response.ends_with(b"\r\n\r\n") {
                self.stream.read_exact(&mut byte).await.unwrap();
                response.push(byte[0]);
            }
            String::from_utf8(response).unwrap()
        }

        /// Reads the next unmasked server frame.
        async fn recv_frame(&mut self) -> (bool, u8, Bytes) {
            loop {
                if let Some(frame) = self.try_parse() {
                    return frame;
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "transport closed mid-frame");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        fn try_parse(&mut self) -> Option<(bool, u8, Bytes)> {
            if self.buf.len() < 2 {
                return None;
            }
            let fin = self.buf[0] & 0x80 != 0;
            let opcode = self.buf[0] & 0x0F;
            assert_eq!(self.buf[1] & 0x80, 0, "server frames must be unmasked");

            let (len, header) = match (self.buf[1] & 0x7F) as usize {
                126 => {
                    if self.buf.len() < 4 {
                        return None;
                    }
                    (
                        u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize,
                        4,
                    )
                }
                127 => {
                    if self.buf.len() < 10 {
                        return None;
                    }
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&self.buf[2..10]);
                    (u64::from_be_bytes(bytes) as usize, 10)
                }
                n => (n, 2),
            };

            if self.buf.len() < header + len {
                return None;
            }
            self.buf.advance(header);
            Some((fin, opcode, self.buf.split_to(len).freeze()))
        }

        /// Reads frames until a close frame arrives, returning its status
        /// code. Panics on application frames other than ping/pong.
        async fn recv_close(&mut self) -> u16 {
            loop {
                let (_, opcode, payload) = self.recv_frame().await;
                match opcode {
                    0x8 => {
                        return u16::from_be_bytes([payload[0], payload[1]]);
                    }
                    0x9 | 0xA => {}
                    other => panic!("unexpected frame 0x{other:x} while awaiting close"),
                }
            }
        }
    }

    fn upgrade_request(path: &str) -> Request<()> {
        Request::builder()
            .uri(path)
            .header(header::HOST, "x")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::ORIGIN, "http://x")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap()
    }

    async fn connect(
        server: &WebSocketServer,
        path: &str,
        peer: &str,
    ) -> (TestClient, String) {
        let (near, far) = tokio::io::duplex(1 << 20);
        let id = server
            .handshake(upgrade_request(path), far, peer.parse().unwrap())
            .await
            .unwrap()
            .expect("admitted");

        let mut client = TestClient::new(near);
        let response = client.read_http_response().await;
        assert!(response.starts_with("HTTP/1.1 101"));
        (client, id)
    }

    fn listen(
        server: &WebSocketServer,
        topic: &str,
    ) -> mpsc::UnboundedReceiver<(String, Event)> {
        let (tx, rx) = mpsc::unbounded_channel();
        server.on(topic, move |id, event| {
            let _ = tx.send((id.to_owned(), event.clone()));
        });
        rx
    }

    #[tokio::test]
    async fn handshake_scenario_matches_rfc_vector() {
        let server = WebSocketServer::new(Options::default());
        let mut opened = listen(&server, "open");

        let (near, far) = tokio::io::duplex(1 << 16);
        let id = server
            .handshake(upgrade_request("/chat"), far, "10.0.0.1:50000".parse().unwrap())
            .await
            .unwrap()
            .expect("admitted");

        let mut client = TestClient::new(near);
        let response = client.read_http_response().await;

        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains(&format!("set-cookie: jadsonlucena-websocket={id};")));

        let (open_id, event) = opened.recv().await.unwrap();
        assert_eq!(open_id, id);
        assert!(matches!(event, Event::Open));
        assert_eq!(server.clients(), vec![id]);
    }

    #[tokio::test]
    async fn small_text_echo_scenario() {
        let server = WebSocketServer::new(Options::default());
        let mut messages = listen(&server, "/chat");

        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;

        // Masked "Hello" straight from RFC 6455 §5.7.
        client
            .send_raw(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58])
            .await;

        let (from, event) = messages.recv().await.unwrap();
        assert_eq!(from, id);
        assert!(matches!(
            event,
            Event::Message(Payload::Text(text)) if text == "Hello"
        ));
    }

    #[tokio::test]
    async fn fragmented_message_reassembles() {
        let server = WebSocketServer::new(Options::default());
        let mut messages = listen(&server, "/chat");

        let (mut client, _) = connect(&server, "/chat", "10.0.0.1:50000").await;

        client.send_frame(false, OpCode::Text, b"A").await;
        client.send_frame(true, OpCode::Continuation, b"B").await;

        let (_, event) = messages.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::Message(Payload::Text(text)) if text == "AB"
        ));
    }

    #[tokio::test]
    async fn oversized_fragments_close_1009() {
        let server = WebSocketServer::new(Options::default().with_max_payload(10));
        let mut closed = listen(&server, "close");

        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;

        client.send_frame(false, OpCode::Text, b"sixsix").await;
        client.send_frame(true, OpCode::Continuation, b"sixsix").await;

        assert_eq!(client.recv_close().await, 1009);

        let (from, event) = closed.recv().await.unwrap();
        assert_eq!(from, id);
        assert!(matches!(
            event,
            Event::Close(reason) if reason.code() == 1009 && reason.message() == "Message Too Big"
        ));
        assert!(server.clients().is_empty());
    }

    #[tokio::test]
    async fn binary_messages_are_emitted_as_bytes() {
        let server = WebSocketServer::new(Options::default());
        let mut messages = listen(&server, "/chat");

        let (mut client, _) = connect(&server, "/chat", "10.0.0.1:50000").await;
        client.send_frame(true, OpCode::Binary, &[0xDE, 0xAD]).await;

        let (_, event) = messages.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::Message(Payload::Binary(bytes)) if bytes[..] == [0xDE, 0xAD]
        ));
    }

    #[tokio::test]
    async fn root_path_uses_message_topic() {
        let server = WebSocketServer::new(Options::default());
        let mut messages = listen(&server, "message");

        let (mut client, _) = connect(&server, "/", "10.0.0.1:50000").await;
        client.send_frame(true, OpCode::Text, b"hi").await;

        let (_, event) = messages.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::Message(Payload::Text(text)) if text == "hi"
        ));
    }

    #[tokio::test]
    async fn interleaved_data_frame_closes_1003() {
        let server = WebSocketServer::new(Options::default());
        let mut closed = listen(&server, "close");

        let (mut client, _) = connect(&server, "/chat", "10.0.0.1:50000").await;
        client.send_frame(false, OpCode::Text, b"A").await;
        client.send_frame(true, OpCode::Text, b"B").await;

        assert_eq!(client.recv_close().await, 1003);
        let (_, event) = closed.recv().await.unwrap();
        assert!(matches!(event, Event::Close(reason) if reason.code() == 1003));
    }

    #[tokio::test]
    async fn orphan_continuation_closes_1003() {
        let server = WebSocketServer::new(Options::default());
        let (mut client, _) = connect(&server, "/chat", "10.0.0.1:50000").await;

        client.send_frame(true, OpCode::Continuation, b"B").await;
        assert_eq!(client.recv_close().await, 1003);
    }

    #[tokio::test]
    async fn unmasked_frame_closes_1003() {
        let server = WebSocketServer::new(Options::default());
        let (mut client, _) = connect(&server, "/chat", "10.0.0.1:50000").await;

        // Unmasked "Hello".
        client.send_raw(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']).await;
        assert_eq!(client.recv_close().await, 1003);
    }

    #[tokio::test]
    async fn peer_close_frame_closes_1000() {
        let server = WebSocketServer::new(Options::default());
        let mut closed = listen(&server, "close");

        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;
        client.send_frame(true, OpCode::Close, &1000u16.to_be_bytes()).await;

        assert_eq!(client.recv_close().await, 1000);
        let (from, event) = closed.recv().await.unwrap();
        assert_eq!(from, id);
        assert!(matches!(
            event,
            Event::Close(reason) if reason.code() == 1000 && reason.message() == "Close Normal"
        ));
    }

    #[tokio::test]
    async fn transport_eof_closes_1000() {
        let server = WebSocketServer::new(Options::default());
        let mut closed = listen(&server, "close");

        let (client, _) = connect(&server, "/chat", "10.0.0.1:50000").await;
        drop(client);

        let (_, event) = closed.recv().await.unwrap();
        assert!(matches!(event, Event::Close(reason) if reason.code() == 1000));
        assert!(server.clients().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_closes_1011() {
        let server = WebSocketServer::new(
            Options::default()
                .with_ping_delay(Duration::from_millis(50))
                .with_pong_timeout(Duration::from_millis(200)),
        );
        let mut closed = listen(&server, "close");

        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;

        // The ping arrives, goes unanswered, and the deadline fires.
        let (_, opcode, _) = client.recv_frame().await;
        assert_eq!(opcode, 0x9);
        assert_eq!(client.recv_close().await, 1011);

        let (from, event) = closed.recv().await.unwrap();
        assert_eq!(from, id);
        assert!(matches!(
            event,
            Event::Close(reason) if reason.code() == 1011 && reason.message() == "Unexpected Condition"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_the_connection() {
        let server = WebSocketServer::new(
            Options::default()
                .with_ping_delay(Duration::from_millis(50))
                .with_pong_timeout(Duration::from_millis(200)),
        );

        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;

        for _ in 0..3 {
            let (_, opcode, token) = client.recv_frame().await;
            assert_eq!(opcode, 0x9);
            client.send_frame(true, OpCode::Pong, &token).await;
        }

        assert_eq!(server.clients(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_pong_does_not_clear_the_deadline() {
        let server = WebSocketServer::new(
            Options::default()
                .with_ping_delay(Duration::from_millis(50))
                .with_pong_timeout(Duration::from_millis(200)),
        );

        let (mut client, _) = connect(&server, "/chat", "10.0.0.1:50000").await;

        let (_, opcode, _) = client.recv_frame().await;
        assert_eq!(opcode, 0x9);
        client.send_frame(true, OpCode::Pong, b"wrong token").await;

        assert_eq!(client.recv_close().await, 1011);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_flood_closes_1006_with_coalesced_pongs() {
        let server = WebSocketServer::new(Options::default().with_ping_delay(Duration::ZERO));
        let mut closed = listen(&server, "close");

        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;

        // One ping per second, never leaving the 3 s quiet window: no pong
        // is ever emitted, and the 9 s abort fires.
        for _ in 0..9 {
            client.send_frame(true, OpCode::Ping, b"flood").await;
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert_eq!(client.recv_close().await, 1006);

        let (from, event) = closed.recv().await.unwrap();
        assert_eq!(from, id);
        assert!(matches!(
            event,
            Event::Close(reason) if reason.code() == 1006 && reason.message() == "Closed Abnormally"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn single_ping_gets_a_coalesced_pong() {
        let server = WebSocketServer::new(Options::default().with_ping_delay(Duration::ZERO));

        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;
        client.send_frame(true, OpCode::Ping, b"are you there").await;

        let (_, opcode, payload) = client.recv_frame().await;
        assert_eq!(opcode, 0xA);
        assert_eq!(&payload[..], b"are you there");

        // The abort timer was cleared; the client survives well past 9 s.
        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(server.clients(), vec![id]);
    }

    #[tokio::test]
    async fn per_ip_cap_rejects_with_429() {
        let server = WebSocketServer::new(Options::default().with_limit_by_ip(2));

        let (_c1, _) = connect(&server, "/", "10.0.0.1:50001").await;
        let (_c2, _) = connect(&server, "/", "10.0.0.1:50002").await;

        // Third connection from the same address is refused.
        let (near, far) = tokio::io::duplex(1 << 16);
        let outcome = server
            .handshake(upgrade_request("/"), far, "10.0.0.1:50003".parse().unwrap())
            .await
            .unwrap();
        assert!(outcome.is_none());

        let mut rejected = TestClient::new(near);
        let response = rejected.read_http_response().await;
        assert!(response.starts_with("HTTP/1.1 429 Too Many Requests"));

        // A different address is unaffected.
        let (_c3, _) = connect(&server, "/", "10.0.0.2:50001").await;
        assert_eq!(server.clients().len(), 3);
    }

    #[tokio::test]
    async fn sticky_cookie_restores_the_id() {
        let server = WebSocketServer::new(Options::default());

        let (first_client, first_id) = connect(&server, "/", "10.0.0.1:50000").await;
        assert!(server.close(&first_id).await.unwrap());
        drop(first_client);

        let (near, far) = tokio::io::duplex(1 << 16);
        let request = Request::builder()
            .uri("/")
            .header(header::HOST, "x")
            .header(header::UPGRADE, "websocket")
            .header(header::ORIGIN, "http://x")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(
                header::COOKIE,
                format!("jadsonlucena-websocket={first_id}"),
            )
            .body(())
            .unwrap();

        let second_id = server
            .handshake(request, far, "10.0.0.1:50001".parse().unwrap())
            .await
            .unwrap()
            .expect("admitted");
        let _ = near;

        assert_eq!(second_id, first_id);
    }

    #[tokio::test]
    async fn facade_send_and_close() {
        let server = WebSocketServer::new(Options::default());
        let mut closed = listen(&server, "close");

        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;

        server.send(&id, "howdy").unwrap();
        let (fin, opcode, payload) = client.recv_frame().await;
        assert!(fin);
        assert_eq!(opcode, 0x1);
        assert_eq!(&payload[..], b"howdy");

        server.send(&id, vec![1u8, 2, 3]).unwrap();
        let (_, opcode, payload) = client.recv_frame().await;
        assert_eq!(opcode, 0x2);
        assert_eq!(&payload[..], &[1, 2, 3]);

        server
            .send_encoded(&id, "deadbeef", Encoding::Hex)
            .unwrap();
        let (_, _, payload) = client.recv_frame().await;
        assert_eq!(&payload[..], &[0xDE, 0xAD, 0xBE, 0xEF]);

        assert!(server.close(&id).await.unwrap());
        assert_eq!(client.recv_close().await, 1000);
        let (_, event) = closed.recv().await.unwrap();
        assert!(matches!(event, Event::Close(reason) if reason.code() == 1000));

        assert!(matches!(server.send(&id, "gone"), Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn facade_ping_uses_the_client_id() {
        let server = WebSocketServer::new(Options::default());
        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;

        server.ping(&id, None).unwrap();
        let (_, opcode, payload) = client.recv_frame().await;
        assert_eq!(opcode, 0x9);
        assert_eq!(&payload[..], id.as_bytes());
    }

    #[tokio::test]
    async fn inspectors_track_the_transport() {
        let server = WebSocketServer::new(Options::default());
        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;

        assert_eq!(server.ready_state(&id).unwrap(), ReadyState::Open);
        assert_eq!(
            server.peer_addr(&id).unwrap(),
            "10.0.0.1:50000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(server.url(&id).unwrap().as_str(), "ws://x/chat");

        // The 101 response already went through the meter.
        assert!(server.bytes_written(&id).unwrap() > 0);

        client.send_frame(true, OpCode::Text, b"count me").await;
        let mut messages = listen(&server, "/chat");
        client.send_frame(true, OpCode::Text, b"count me too").await;
        messages.recv().await.unwrap();
        assert!(server.bytes_read(&id).unwrap() > 0);

        assert!(!server.is_paused(&id).unwrap());
        server.pause(&id).unwrap();
        // The pause command is processed by the connection task.
        while !server.is_paused(&id).unwrap() {
            tokio::task::yield_now().await;
        }
        server.resume(&id).unwrap();
        while server.is_paused(&id).unwrap() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn per_client_encoding_override() {
        let server = WebSocketServer::new(Options::default());
        let mut messages = listen(&server, "/chat");

        let (mut client, id) = connect(&server, "/chat", "10.0.0.1:50000").await;
        server.set_encoding(&id, Encoding::Hex).unwrap();
        // Let the connection task apply the override before the message.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        client.send_frame(true, OpCode::Text, &[0xDE, 0xAD]).await;
        let (_, event) = messages.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::Message(Payload::Text(text)) if text == "dead"
        ));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let server = WebSocketServer::new(Options::default());

        assert!(matches!(server.send("nobody", "hi"), Err(Error::NotFound)));
        assert!(matches!(server.ping("nobody", None), Err(Error::NotFound)));
        assert!(matches!(server.close("nobody").await, Err(Error::NotFound)));
        assert!(matches!(server.url("nobody"), Err(Error::NotFound)));
        assert!(matches!(server.peer_addr("nobody"), Err(Error::NotFound)));
        assert!(matches!(server.bytes_read("nobody"), Err(Error::NotFound)));
        assert!(matches!(server.bytes_written("nobody"), Err(Error::NotFound)));
        assert!(matches!(server.is_paused("nobody"), Err(Error::NotFound)));
        assert!(matches!(server.pause("nobody"), Err(Error::NotFound)));
        assert!(matches!(server.resume("nobody"), Err(Error::NotFound)));
        assert!(matches!(server.ready_state("nobody"), Err(Error::NotFound)));
        assert!(matches!(
            server.set_encoding("nobody", Encoding::Utf8),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            server.set_no_delay("nobody", true),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            server.set_keep_alive("nobody", true),
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn configuration_round_trip() {
        let server = WebSocketServer::new(Options::default());

        server.set_limit_by_ip(4);
        assert_eq!(server.limit_by_ip(), 4);

        server.set_max_payload(1024);
        assert_eq!(server.max_payload(), 1024);

        server.set_ping_delay(Duration::from_secs(1));
        assert_eq!(server.ping_delay(), Duration::from_secs(1));

        server.set_pong_timeout(Duration::ZERO);
        assert_eq!(server.pong_timeout(), Duration::ZERO);

        server.set_session_expires(Duration::from_secs(60));
        assert_eq!(server.session_expires(), Duration::from_secs(60));

        server.set_allow_origin(AllowOrigin::Any);
        assert_eq!(server.allow_origin(), AllowOrigin::Any);

        server.set_default_encoding(Encoding::Base64);
        assert_eq!(server.encoding(), Encoding::Base64);

        server.set_reject_reserved_bits(true);
        assert!(server.reject_reserved_bits());
    }

    #[tokio::test]
    async fn hyper_upgrade_path_registers_and_responds() {
        let server = WebSocketServer::new(Options::default());

        let mut request = upgrade_request("/chat");
        let response = server.upgrade(&mut request, "10.0.0.1:50000".parse().unwrap());

        assert_eq!(response.status(), hyper::StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(server.clients().len(), 1);

        // Without a real hyper connection behind the request, the protocol
        // switch fails and the client is unregistered again.
        while !server.clients().is_empty() {
            tokio::task::yield_now().await;
        }

        let mut request = upgrade_request("/chat");
        request.headers_mut().remove(header::ORIGIN);
        let response = server.upgrade(&mut request, "10.0.0.1:50000".parse().unwrap());
        assert_eq!(response.status(), hyper::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn rejections_answer_over_the_wire() {
        let server = WebSocketServer::new(Options::default());

        // Wrong version.
        let (near, far) = tokio::io::duplex(1 << 16);
        let request = Request::builder()
            .uri("/")
            .header(header::HOST, "x")
            .header(header::UPGRADE, "websocket")
            .header(header::ORIGIN, "http://x")
            .header(header::SEC_WEBSOCKET_VERSION, "7")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        let outcome = server
            .handshake(request, far, "10.0.0.1:50000".parse().unwrap())
            .await
            .unwrap();
        assert!(outcome.is_none());

        let response = TestClient::new(near).read_http_response().await;
        assert!(response.starts_with("HTTP/1.1 426 Upgrade Required"));
        assert!(response.contains("sec-websocket-version: 13, 8\r\n"));

        // Foreign origin under the default policy.
        let (near, far) = tokio::io::duplex(1 << 16);
        let request = Request::builder()
            .uri("/")
            .header(header::HOST, "x")
            .header(header::UPGRADE, "websocket")
            .header(header::ORIGIN, "http://evil")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        server
            .handshake(request, far, "10.0.0.1:50000".parse().unwrap())
            .await
            .unwrap();
        let response = TestClient::new(near).read_http_response().await;
        assert!(response.starts_with("HTTP/1.1 403 Forbidden"));

        assert!(server.clients().is_empty());
    }
}
