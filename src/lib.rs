//! Client-side WebSocket protocol engine for tokio.
//!
//! Implements [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455) from
//! the client role: the HTTP upgrade handshake, the frame codec with
//! mandatory client masking, reassembly of fragmented messages, a strictly
//! ordered outbound write queue, and the closing handshake. Inbound traffic
//! is delivered through per-category event callbacks rather than a stream,
//! so integrating with an existing event loop needs no polling glue.
//!
//! ```no_run
//! use finbit::{EventHandlers, Message, WebSocket};
//!
//! # async fn run() -> finbit::Result<()> {
//! let handlers = EventHandlers::new()
//!     .on_message(|msg| {
//!         if let Message::Text(text) = msg {
//!             println!("received: {text}");
//!         }
//!     })
//!     .on_close(|event| println!("closed: {} {}", u16::from(event.code), event.reason));
//!
//! let ws = WebSocket::connect("wss://stream.example.com/feed")
//!     .with_header("authorization", "Bearer secret")
//!     .with_handlers(handlers)
//!     .await?;
//!
//! ws.send_text(r#"{"subscribe":"trades"}"#).await?;
//! // ... later
//! ws.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod assembly;
pub mod close;
pub mod codec;
pub mod frame;
#[doc(hidden)]
pub mod mask;

mod client;
mod handshake;
mod options;
mod queue;
mod stream;

pub use assembly::{Message, MessageAssembler};
pub use client::{
    CloseEvent, ErrorEvent, EventHandlers, ReadyState, WebSocket, WebSocketBuilder,
};
pub use close::CloseCode;
pub use frame::{Frame, OpCode};
pub use options::{MAX_PAYLOAD_READ, Options};
pub use queue::Completion;
pub use stream::MaybeTlsStream;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, WsError>;

/// Everything that can go wrong on a connection.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// The URL scheme is not `ws`, `wss`, `http` or `https`, or the URL has
    /// no usable host.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The URL could not be parsed.
    #[error("invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// A caller-supplied header name or value is not valid HTTP.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The server answered the upgrade with a status other than 101.
    #[error("unexpected handshake status code: {0}")]
    InvalidStatusCode(u16),

    /// The 101 response is missing `Upgrade: websocket`.
    #[error("invalid or missing Upgrade header in handshake response")]
    InvalidUpgradeHeader,

    /// The 101 response is missing `Connection: upgrade`.
    #[error("invalid or missing Connection header in handshake response")]
    InvalidConnectionHeader,

    /// The server's `Sec-WebSocket-Accept` does not match the sent key.
    #[error("Sec-WebSocket-Accept mismatch")]
    InvalidAcceptKey,

    /// A frame used a reserved or unknown opcode.
    #[error("invalid opcode: {0:#x}")]
    InvalidOpCode(u8),

    /// A frame had RSV bits set without a negotiated extension.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Fragmentation rules were violated.
    #[error("invalid fragment")]
    InvalidFragment,

    /// A control frame arrived without its fin flag set.
    #[error("control frames must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 payload bytes.
    #[error("control frame payload exceeds 125 bytes")]
    PingFrameTooLarge,

    /// An inbound frame payload exceeded the configured ceiling.
    #[error("frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    /// A reassembled message exceeded the configured ceiling.
    #[error("message too large: {size} bytes (max {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    /// A text message or close reason was not valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUtf8,

    /// A close frame carried a one-byte payload.
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// An operation was attempted on a closed connection.
    #[error("connection already closed")]
    AlreadyClosed,

    /// Transport-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP-level failure during the handshake.
    #[error("http error: {0}")]
    Http(String),
}

impl WsError {
    /// Whether this error is a violation of the framing protocol, the kind
    /// a conforming endpoint would close with code 1002 over.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            WsError::InvalidOpCode(_)
                | WsError::ReservedBitsNotZero
                | WsError::InvalidFragment
                | WsError::ControlFrameFragmented
                | WsError::PingFrameTooLarge
                | WsError::FrameTooLarge { .. }
                | WsError::MessageTooLarge { .. }
                | WsError::InvalidUtf8
                | WsError::InvalidCloseFrame
        )
    }

    /// Whether this error came out of the opening handshake.
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            WsError::InvalidStatusCode(_)
                | WsError::InvalidUpgradeHeader
                | WsError::InvalidConnectionHeader
                | WsError::InvalidAcceptKey
        )
    }

    /// Whether this error is a transport failure rather than a protocol
    /// violation.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, WsError::Io(_) | WsError::Http(_))
    }

    /// Whether the operation failed because the connection is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, WsError::AlreadyClosed)
    }
}
