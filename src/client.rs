//! Client connection driver.
//!
//! [`WebSocket`] ties the pieces together: the handshake produces a raw
//! stream, the stream is split into a read loop task and a writer task, and
//! protocol events are delivered through the caller's [`EventHandlers`].
//!
//! The ready state advances monotonically through
//! `Connecting -> Open -> Closing -> Closed`; transitions race between the
//! read loop and callers of [`WebSocket::close`], so the state lives in an
//! atomic and each transition is a compare-and-swap.

use std::{
    future::Future,
    io::Cursor,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{StreamExt, future::BoxFuture};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    Result, WsError,
    assembly::{Message, MessageAssembler},
    close::CloseCode,
    codec::{Decoder, Encoder},
    frame::{Frame, OpCode},
    handshake::{self, Handshake},
    options::Options,
    queue::{Completion, OutboundQueue, spawn_writer},
};

/// Connection lifecycle state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// Handshake in flight.
    Connecting = 0,
    /// Open for traffic.
    Open = 1,
    /// Close initiated, awaiting completion.
    Closing = 2,
    /// Fully closed.
    Closed = 3,
}

impl From<u8> for ReadyState {
    fn from(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Shared connection state: the ready state, plus the close code and
/// reason a local `close_with` call sent, so the read loop can report them
/// once the peer tears the stream down.
struct ConnState {
    state: AtomicU8,
    local_close: Mutex<Option<CloseEvent>>,
}

impl ConnState {
    fn new(state: ReadyState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            local_close: Mutex::new(None),
        }
    }

    fn get(&self) -> ReadyState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set(&self, state: ReadyState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Moves from `from` to `to`, returning whether this caller won the
    /// transition.
    fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn record_local_close(&self, event: CloseEvent) {
        if let Ok(mut slot) = self.local_close.lock() {
            *slot = Some(event);
        }
    }

    fn take_local_close(&self) -> Option<CloseEvent> {
        self.local_close.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close status code, `CloseCode::Status` when the peer sent none.
    pub code: CloseCode,
    /// UTF-8 close reason, possibly empty.
    pub reason: String,
}

/// Delivered through the error handler when something goes wrong.
#[derive(Debug)]
pub enum ErrorEvent {
    /// The peer closed the connection.
    Closed(CloseEvent),
    /// The connection failed with a protocol or transport error.
    Failed(WsError),
}

type Handler<T> = Box<dyn FnMut(T) + Send>;

/// Callbacks invoked by the read loop as the connection progresses.
///
/// One handler per event category; registering a second handler for a
/// category replaces the first. All handlers run on the read loop task, so
/// a slow handler delays frame processing.
#[derive(Default)]
pub struct EventHandlers {
    on_open: Option<Handler<()>>,
    on_message: Option<Handler<Message>>,
    on_ping: Option<Handler<Bytes>>,
    on_pong: Option<Handler<Bytes>>,
    on_close: Option<Handler<CloseEvent>>,
    on_error: Option<Handler<ErrorEvent>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once when the connection reaches `Open`.
    pub fn on_open(mut self, f: impl FnMut(()) + Send + 'static) -> Self {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Called for every complete inbound message.
    pub fn on_message(mut self, f: impl FnMut(Message) + Send + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    /// Called when a ping arrives. The pong reply is sent regardless.
    pub fn on_ping(mut self, f: impl FnMut(Bytes) + Send + 'static) -> Self {
        self.on_ping = Some(Box::new(f));
        self
    }

    /// Called when a pong arrives.
    pub fn on_pong(mut self, f: impl FnMut(Bytes) + Send + 'static) -> Self {
        self.on_pong = Some(Box::new(f));
        self
    }

    /// Called exactly once when the connection closes, however it closes.
    pub fn on_close(mut self, f: impl FnMut(CloseEvent) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Called when the connection ends abnormally or the peer initiates
    /// closure.
    pub fn on_error(mut self, f: impl FnMut(ErrorEvent) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn emit_open(&mut self) {
        if let Some(f) = self.on_open.as_mut() {
            f(());
        }
    }

    fn emit_message(&mut self, msg: Message) {
        if let Some(f) = self.on_message.as_mut() {
            f(msg);
        }
    }

    fn emit_ping(&mut self, payload: Bytes) {
        if let Some(f) = self.on_ping.as_mut() {
            f(payload);
        }
    }

    fn emit_pong(&mut self, payload: Bytes) {
        if let Some(f) = self.on_pong.as_mut() {
            f(payload);
        }
    }

    fn emit_close(&mut self, event: CloseEvent) {
        if let Some(f) = self.on_close.as_mut() {
            f(event);
        }
    }

    fn emit_error(&mut self, event: ErrorEvent) {
        if let Some(f) = self.on_error.as_mut() {
            f(event);
        }
    }
}

/// Handle to a live WebSocket connection.
///
/// Cheap to clone; all clones share the same connection. Dropping every
/// handle does not close the connection, the read loop and writer task keep
/// it alive until closure.
#[derive(Clone)]
pub struct WebSocket {
    state: Arc<ConnState>,
    queue: OutboundQueue,
}

impl WebSocket {
    /// Starts connecting to `url`.
    ///
    /// Returns a builder that is itself a future; configure headers,
    /// options and handlers, then `.await` it.
    pub fn connect(url: impl Into<String>) -> WebSocketBuilder {
        WebSocketBuilder::new(url.into())
    }

    async fn connect_inner(
        url: String,
        headers: Vec<(String, String)>,
        options: Options,
        handlers: EventHandlers,
    ) -> Result<WebSocket> {
        let url = Url::parse(&url)?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name: HeaderName = name
                .parse()
                .map_err(|_| WsError::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(&value).map_err(|_| WsError::InvalidHeader(value))?;
            header_map.insert(name, value);
        }

        let handshake = handshake::connect(&url, header_map, &options).await?;
        Ok(Self::start(handshake, options, handlers))
    }

    /// Upgrades an already established stream into a connection.
    ///
    /// Runs the HTTP handshake over `io`; useful for tests and for callers
    /// that manage their own transport.
    pub async fn from_stream<S>(
        io: S,
        url: &Url,
        options: Options,
        handlers: EventHandlers,
    ) -> Result<WebSocket>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handshake = handshake::handshake_on(io, url, HeaderMap::new()).await?;
        Ok(Self::start(handshake, options, handlers))
    }

    fn start<S>(handshake: Handshake<S>, options: Options, mut handlers: EventHandlers) -> WebSocket
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Handshake {
            stream,
            read_buf,
            mask,
        } = handshake;

        let state = Arc::new(ConnState::new(ReadyState::Open));
        let (read_half, write_half) = tokio::io::split(stream);

        let queue = spawn_writer(FramedWrite::new(write_half, Encoder::new(mask)));

        // Bytes the handshake read past the response headers are the first
        // frames of the connection; serve them to the decoder before any
        // socket read.
        let read_half = Cursor::new(read_buf).chain(read_half);
        let reader = FramedRead::new(read_half, Decoder::new(options.max_payload_read));

        handlers.emit_open();

        let assembler = MessageAssembler::new(options.message_limit());
        tokio::spawn(read_loop(
            reader,
            state.clone(),
            queue.clone(),
            assembler,
            handlers,
        ));

        WebSocket { state, queue }
    }

    /// Current lifecycle state.
    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    /// Sends a message, waiting until it has been written and flushed.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.send_frame(message.into().into_frame()).await
    }

    /// Sends a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_frame(Frame::text(text.into())).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_frame(Frame::binary(data.into())).await
    }

    /// Sends a ping with the given payload.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_frame(Frame::ping(payload.into())).await
    }

    /// Sends a single frame. Fragmented messages can be built with
    /// [`Frame::with_fin`] and [`Frame::continuation`].
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.enqueue_frame(frame)?.wait().await
    }

    /// Queues a frame without waiting for it to hit the wire.
    ///
    /// The frame's position in the output is fixed by this call; the
    /// returned completion resolves once it is flushed.
    pub fn enqueue_frame(&self, frame: Frame) -> Result<Completion> {
        if self.state.get() == ReadyState::Closed {
            return Err(WsError::AlreadyClosed);
        }
        self.queue.enqueue(frame)
    }

    /// Closes with `CloseCode::Normal` and no reason.
    pub async fn close(&self) -> Result<()> {
        self.close_with(CloseCode::Normal, "").await
    }

    /// Initiates the closing handshake.
    ///
    /// The first caller to close wins; concurrent and repeated calls are
    /// no-ops returning `Ok`. Resolves once the close frame is on the wire.
    pub async fn close_with(&self, code: CloseCode, reason: &str) -> Result<()> {
        if self.state.get() == ReadyState::Closed {
            return Ok(());
        }
        if !self.state.transition(ReadyState::Open, ReadyState::Closing) {
            // Lost the race; the winner drives the handshake.
            return Ok(());
        }

        debug!(code = u16::from(code), "closing connection");
        self.state.record_local_close(CloseEvent {
            code,
            reason: reason.to_owned(),
        });
        let completion = self.queue.enqueue(Frame::close(code, reason));
        if let Ok(completion) = completion {
            // An error here means the socket already died; closure proceeds
            // either way.
            let _ = completion.wait().await;
        }
        self.state.set(ReadyState::Closed);
        self.queue.shutdown();
        Ok(())
    }
}

async fn read_loop<R>(
    mut reader: FramedRead<R, Decoder>,
    state: Arc<ConnState>,
    queue: OutboundQueue,
    mut assembler: MessageAssembler,
    mut handlers: EventHandlers,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(frame)) => {
                trace!(opcode = ?frame.opcode(), len = frame.payload().len(), "frame received");
                match frame.opcode() {
                    OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                        match assembler.push(frame) {
                            Ok(Some(message)) => handlers.emit_message(message),
                            Ok(None) => {}
                            Err(err) => {
                                abort(&state, &queue, &mut handlers, err);
                                break;
                            }
                        }
                    }
                    OpCode::Ping => {
                        let payload = frame.into_payload();
                        handlers.emit_ping(payload.clone());
                        // Reply queued behind any in-flight writes; the
                        // completion is irrelevant here.
                        if queue.enqueue(Frame::pong(payload)).is_err() {
                            debug!("pong dropped, writer gone");
                        }
                    }
                    OpCode::Pong => handlers.emit_pong(frame.into_payload()),
                    OpCode::Close => {
                        // A one-byte close payload cannot hold a status code.
                        if frame.payload().len() == 1 {
                            abort(&state, &queue, &mut handlers, WsError::InvalidCloseFrame);
                        } else {
                            handle_remote_close(&state, &queue, &mut handlers, frame).await;
                        }
                        break;
                    }
                }
            }
            Some(Err(err)) => {
                abort(&state, &queue, &mut handlers, err);
                break;
            }
            None => {
                // EOF. Expected after a locally driven close, abnormal
                // otherwise.
                if state.get() == ReadyState::Closed {
                    let event = state.take_local_close().unwrap_or(CloseEvent {
                        code: CloseCode::Normal,
                        reason: String::new(),
                    });
                    handlers.emit_close(event);
                } else {
                    abort(
                        &state,
                        &queue,
                        &mut handlers,
                        WsError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
                    );
                }
                break;
            }
        }
    }
}

/// Completes the closing handshake after the peer's Close frame.
async fn handle_remote_close(
    state: &ConnState,
    queue: &OutboundQueue,
    handlers: &mut EventHandlers,
    frame: Frame,
) {
    let event = parse_close_payload(&frame);

    // Echo only when the peer initiated; if we sent Close first this frame
    // is the acknowledgement.
    let was_open = state.transition(ReadyState::Open, ReadyState::Closing);
    if was_open {
        debug!(code = u16::from(event.code), "peer initiated close");
        if let Ok(completion) = queue.enqueue(Frame::close_raw(frame.into_payload())) {
            let _ = completion.wait().await;
        }
    }

    state.set(ReadyState::Closed);
    queue.shutdown();
    handlers.emit_close(event.clone());
    handlers.emit_error(ErrorEvent::Closed(event));
}

/// Marks the connection failed: surfaces the error, then an abnormal close.
fn abort(state: &ConnState, queue: &OutboundQueue, handlers: &mut EventHandlers, err: WsError) {
    if state.get() == ReadyState::Closed {
        return;
    }
    warn!("connection failed: {err}");
    state.set(ReadyState::Closed);
    queue.shutdown();
    handlers.emit_error(ErrorEvent::Failed(err));
    handlers.emit_close(CloseEvent {
        code: CloseCode::Abnormal,
        reason: String::new(),
    });
}

fn parse_close_payload(frame: &Frame) -> CloseEvent {
    let payload = frame.payload();
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]).into();
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        CloseEvent { code, reason }
    } else {
        // No status code present, per RFC 6455 Section 7.1.5.
        CloseEvent {
            code: CloseCode::Status,
            reason: String::new(),
        }
    }
}

struct BuilderOpts {
    url: String,
    headers: Vec<(String, String)>,
    options: Options,
    handlers: EventHandlers,
}

/// Future returned by [`WebSocket::connect`], with builder methods for
/// configuring the connection before awaiting it.
pub struct WebSocketBuilder {
    opts: Option<BuilderOpts>,
    future: Option<BoxFuture<'static, Result<WebSocket>>>,
}

impl WebSocketBuilder {
    fn new(url: String) -> Self {
        Self {
            opts: Some(BuilderOpts {
                url,
                headers: Vec::new(),
                options: Options::default(),
                handlers: EventHandlers::new(),
            }),
            future: None,
        }
    }

    fn opts(&mut self) -> &mut BuilderOpts {
        self.opts.as_mut().expect("builder polled to completion")
    }

    /// Adds a header to the handshake request, overriding any default of
    /// the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts().headers.push((name.into(), value.into()));
        self
    }

    /// Adds several handshake headers at once.
    pub fn with_headers(
        mut self,
        headers: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.opts().headers.extend(headers);
        self
    }

    /// Replaces the connection options.
    pub fn with_options(mut self, options: Options) -> Self {
        self.opts().options = options;
        self
    }

    /// Replaces the event handlers.
    pub fn with_handlers(mut self, handlers: EventHandlers) -> Self {
        self.opts().handlers = handlers;
        self
    }

    /// Registers the message handler.
    pub fn on_message(mut self, f: impl FnMut(Message) + Send + 'static) -> Self {
        self.opts().handlers.on_message = Some(Box::new(f));
        self
    }

    /// Registers the close handler.
    pub fn on_close(mut self, f: impl FnMut(CloseEvent) + Send + 'static) -> Self {
        self.opts().handlers.on_close = Some(Box::new(f));
        self
    }

    /// Registers the error handler.
    pub fn on_error(mut self, f: impl FnMut(ErrorEvent) + Send + 'static) -> Self {
        self.opts().handlers.on_error = Some(Box::new(f));
        self
    }
}

impl Future for WebSocketBuilder {
    type Output = Result<WebSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let fut = this.future.get_or_insert_with(|| {
            let opts = this.opts.take().expect("builder polled to completion");
            Box::pin(WebSocket::connect_inner(
                opts.url,
                opts.headers,
                opts.options,
                opts.handlers,
            ))
        });
        fut.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        sync::mpsc,
    };
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[derive(Debug, PartialEq)]
    enum Event {
        Open,
        Message(Message),
        Ping(Vec<u8>),
        Pong(Vec<u8>),
        Close(CloseEvent),
        ErrorClosed(CloseEvent),
        ErrorFailed,
    }

    fn recording_handlers() -> (EventHandlers, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = EventHandlers::new()
            .on_open({
                let tx = tx.clone();
                move |_| tx.send(Event::Open).unwrap()
            })
            .on_message({
                let tx = tx.clone();
                move |msg| tx.send(Event::Message(msg)).unwrap()
            })
            .on_ping({
                let tx = tx.clone();
                move |p| tx.send(Event::Ping(p.to_vec())).unwrap()
            })
            .on_pong({
                let tx = tx.clone();
                move |p| tx.send(Event::Pong(p.to_vec())).unwrap()
            })
            .on_close({
                let tx = tx.clone();
                move |ev| tx.send(Event::Close(ev)).unwrap()
            })
            .on_error(move |ev| {
                let event = match ev {
                    ErrorEvent::Closed(close) => Event::ErrorClosed(close),
                    ErrorEvent::Failed(_) => Event::ErrorFailed,
                };
                tx.send(event).unwrap()
            });
        (handlers, rx)
    }

    /// Accepts the upgrade on `server` and returns the raw stream plus the
    /// connected client.
    async fn connect_pair(
        handlers: EventHandlers,
    ) -> (WebSocket, DuplexStream) {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let url = Url::parse("ws://test.local/").unwrap();

        let server = tokio::spawn(accept_upgrade(server_io));
        let ws = WebSocket::from_stream(client_io, &url, Options::default(), handlers)
            .await
            .unwrap();
        (ws, server.await.unwrap())
    }

    async fn accept_upgrade(mut server: DuplexStream) -> DuplexStream {
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        let request = String::from_utf8(request).unwrap();
        let key = request
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("sec-websocket-key")
                    .then(|| value.trim().to_owned())
            })
            .unwrap();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            crate::handshake::accept_key(&key)
        );
        server.write_all(response.as_bytes()).await.unwrap();
        server
    }

    async fn server_send(server: &mut DuplexStream, frame: Frame) {
        let mut buf = bytes::BytesMut::new();
        frame.write_head(&mut buf);
        buf.extend_from_slice(frame.payload());
        server.write_all(&buf).await.unwrap();
    }

    async fn server_read_frame(server: DuplexStream) -> (Frame, DuplexStream) {
        let mut reader = FramedRead::new(server, Decoder::default());
        let frame = reader.next().await.unwrap().unwrap();
        (frame, reader.into_inner())
    }

    #[tokio::test]
    async fn test_open_and_messages() {
        let (handlers, mut events) = recording_handlers();
        let (ws, mut server) = connect_pair(handlers).await;
        assert_eq!(ws.ready_state(), ReadyState::Open);
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        server_send(&mut server, Frame::text("first")).await;
        server_send(&mut server, Frame::text("ab").with_fin(false)).await;
        server_send(&mut server, Frame::continuation("cd")).await;

        assert_eq!(
            events.recv().await.unwrap(),
            Event::Message(Message::Text("first".into()))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Message(Message::Text("abcd".into()))
        );
    }

    #[tokio::test]
    async fn test_send_reaches_server_in_order() {
        let (handlers, _events) = recording_handlers();
        let (ws, server) = connect_pair(handlers).await;

        ws.send_text("one").await.unwrap();
        ws.send_binary(vec![1, 2, 3]).await.unwrap();

        let mut reader = FramedRead::new(server, Decoder::default());
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload().as_ref(), b"one");
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.opcode(), OpCode::Binary);
        assert_eq!(frame.payload().as_ref(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (handlers, mut events) = recording_handlers();
        let (ws, mut server) = connect_pair(handlers).await;
        let _ = ws;
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        server_send(&mut server, Frame::ping("probe")).await;

        assert_eq!(events.recv().await.unwrap(), Event::Ping(b"probe".to_vec()));

        let (frame, _server) = server_read_frame(server).await;
        assert_eq!(frame.opcode(), OpCode::Pong);
        assert_eq!(frame.payload().as_ref(), b"probe");
    }

    #[tokio::test]
    async fn test_pong_notified() {
        let (handlers, mut events) = recording_handlers();
        let (ws, server) = connect_pair(handlers).await;
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        ws.ping("rtt").await.unwrap();
        let (frame, mut server) = server_read_frame(server).await;
        assert_eq!(frame.opcode(), OpCode::Ping);
        server_send(&mut server, Frame::pong(frame.into_payload())).await;

        assert_eq!(events.recv().await.unwrap(), Event::Pong(b"rtt".to_vec()));
    }

    #[tokio::test]
    async fn test_remote_close_echoed_and_notified() {
        let (handlers, mut events) = recording_handlers();
        let (ws, mut server) = connect_pair(handlers).await;
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        server_send(&mut server, Frame::close(CloseCode::Normal, "bye")).await;

        // The peer's payload is echoed back verbatim.
        let (frame, _server) = server_read_frame(server).await;
        assert_eq!(frame.opcode(), OpCode::Close);
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
        assert_eq!(frame.close_reason().unwrap(), Some("bye"));

        let expected = CloseEvent {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert_eq!(events.recv().await.unwrap(), Event::Close(expected.clone()));
        assert_eq!(events.recv().await.unwrap(), Event::ErrorClosed(expected));
        assert_eq!(ws.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_remote_close_without_code() {
        let (handlers, mut events) = recording_handlers();
        let (_ws, mut server) = connect_pair(handlers).await;
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        server_send(&mut server, Frame::close_raw(Vec::new())).await;

        match events.recv().await.unwrap() {
            Event::Close(event) => {
                assert_eq!(event.code, CloseCode::Status);
                assert!(event.reason.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_one_byte_close_payload_is_protocol_error() {
        let (handlers, mut events) = recording_handlers();
        let (ws, mut server) = connect_pair(handlers).await;
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        server_send(&mut server, Frame::close_raw(vec![0x03])).await;

        assert_eq!(events.recv().await.unwrap(), Event::ErrorFailed);
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Close(CloseEvent {
                code: CloseCode::Abnormal,
                reason: String::new(),
            })
        );
        assert_eq!(ws.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_local_close_is_idempotent() {
        let (handlers, mut events) = recording_handlers();
        let (ws, server) = connect_pair(handlers).await;
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        let ws2 = ws.clone();
        let (r1, r2) = tokio::join!(ws.close(), ws2.close());
        r1.unwrap();
        r2.unwrap();
        assert_eq!(ws.ready_state(), ReadyState::Closed);

        // Exactly one Close frame reaches the server.
        let (frame, server) = server_read_frame(server).await;
        assert_eq!(frame.opcode(), OpCode::Close);
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
        let mut reader = FramedRead::new(server, Decoder::default());
        assert!(reader.next().await.is_none());

        // Server acknowledges by closing; one close notification fires.
        drop(reader);
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Close(CloseEvent {
                code: CloseCode::Normal,
                reason: String::new(),
            })
        );
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_local_close_code_reported_on_eof() {
        let (handlers, mut events) = recording_handlers();
        let (ws, server) = connect_pair(handlers).await;
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        ws.close_with(CloseCode::Away, "moving").await.unwrap();

        let (frame, server) = server_read_frame(server).await;
        assert_eq!(frame.close_code(), Some(CloseCode::Away));
        drop(server);

        // The notification carries the code and reason we sent, not a
        // generic normal closure.
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Close(CloseEvent {
                code: CloseCode::Away,
                reason: "moving".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_unsupported_scheme_rejected() {
        match WebSocket::connect("ftp://example.com/").await {
            Err(WsError::UnsupportedScheme(scheme)) => assert_eq!(scheme, "ftp"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect accepted an ftp URL"),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (handlers, _events) = recording_handlers();
        let (ws, _server) = connect_pair(handlers).await;

        ws.close().await.unwrap();
        assert!(matches!(
            ws.send_text("late").await,
            Err(WsError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_protocol_error_aborts() {
        let (handlers, mut events) = recording_handlers();
        let (ws, mut server) = connect_pair(handlers).await;
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        // Reserved bits set without a negotiated extension.
        server.write_all(&[0xF1, 0x00]).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), Event::ErrorFailed);
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Close(CloseEvent {
                code: CloseCode::Abnormal,
                reason: String::new(),
            })
        );
        assert_eq!(ws.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_abrupt_eof_reports_abnormal_close() {
        let (handlers, mut events) = recording_handlers();
        let (ws, server) = connect_pair(handlers).await;
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        drop(server);

        assert_eq!(events.recv().await.unwrap(), Event::ErrorFailed);
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Close(CloseEvent {
                code: CloseCode::Abnormal,
                reason: String::new(),
            })
        );
        assert_eq!(ws.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_fragmented_send() {
        let (handlers, _events) = recording_handlers();
        let (ws, server) = connect_pair(handlers).await;

        ws.send_frame(Frame::text("Hello, ").with_fin(false))
            .await
            .unwrap();
        ws.send_frame(Frame::continuation("World!")).await.unwrap();

        let mut reader = FramedRead::new(server, Decoder::default());
        let mut asm = MessageAssembler::new(1024);
        let first = reader.next().await.unwrap().unwrap();
        assert!(asm.push(first).unwrap().is_none());
        let second = reader.next().await.unwrap().unwrap();
        let msg = asm.push(second).unwrap().unwrap();
        assert_eq!(msg, Message::Text("Hello, World!".into()));
    }

    #[tokio::test]
    async fn test_server_frames_before_first_read() {
        // A server may fire messages immediately after the 101; bytes hyper
        // buffered with the response must not be lost.
        let (client_io, mut server_io) = tokio::io::duplex(16 * 1024);
        let url = Url::parse("ws://test.local/").unwrap();

        let server = tokio::spawn(async move {
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                server_io.read_exact(&mut byte).await.unwrap();
                request.push(byte[0]);
            }
            let request = String::from_utf8(request).unwrap();
            let key = request
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.trim()
                        .eq_ignore_ascii_case("sec-websocket-key")
                        .then(|| value.trim().to_owned())
                })
                .unwrap();
            // Response and first frame written as one chunk.
            let mut payload = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                crate::handshake::accept_key(&key)
            )
            .into_bytes();
            let mut head = bytes::BytesMut::new();
            let frame = Frame::text("early");
            frame.write_head(&mut head);
            payload.extend_from_slice(&head);
            payload.extend_from_slice(frame.payload());
            server_io.write_all(&payload).await.unwrap();
            server_io
        });

        let (handlers, mut events) = recording_handlers();
        let _ws = WebSocket::from_stream(client_io, &url, Options::default(), handlers)
            .await
            .unwrap();
        let _server = server.await.unwrap();

        assert_eq!(events.recv().await.unwrap(), Event::Open);
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Message(Message::Text("early".into()))
        );
    }

    #[tokio::test]
    async fn test_writer_masks_outbound_frames() {
        let (handlers, _events) = recording_handlers();
        let (ws, mut server) = connect_pair(handlers).await;

        ws.send_text("masked").await.unwrap();

        let mut raw = vec![0u8; 2 + 4 + 6];
        server.read_exact(&mut raw).await.unwrap();
        // Mask bit set and the payload scrambled on the wire.
        assert_eq!(raw[1] & 0x80, 0x80);
        assert_ne!(&raw[6..], b"masked");

        let mask = [raw[2], raw[3], raw[4], raw[5]];
        let mut payload = raw[6..].to_vec();
        crate::mask::apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"masked");
    }

    #[tokio::test]
    async fn test_send_frame_via_sink_helper() {
        // FramedWrite with the encoder is usable standalone for callers
        // that bypass the queue in tests.
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(a, Encoder::new([9, 9, 9, 9]));
        writer.send(Frame::text("direct")).await.unwrap();

        let mut reader = FramedRead::new(b, Decoder::default());
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.payload().as_ref(), b"direct");
    }
}
