//! Connection tuning knobs.

/// Default ceiling for a single inbound frame payload, in bytes.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Configuration applied when establishing a connection.
///
/// ```
/// use finbit::Options;
///
/// let opts = Options::default()
///     .with_max_payload_read(256 * 1024)
///     .with_max_message_size(1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Largest inbound frame payload accepted before the connection fails
    /// with a protocol error.
    pub max_payload_read: usize,
    /// Largest reassembled message accepted. Defaults to twice
    /// `max_payload_read` when unset.
    pub max_message_size: Option<usize>,
    /// Whether to set `TCP_NODELAY` on the underlying socket.
    pub no_delay: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: MAX_PAYLOAD_READ,
            max_message_size: None,
            no_delay: true,
        }
    }
}

impl Options {
    /// Sets the per-frame inbound payload ceiling.
    pub fn with_max_payload_read(mut self, max: usize) -> Self {
        self.max_payload_read = max;
        self
    }

    /// Sets the reassembled message size ceiling.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = Some(max);
        self
    }

    /// Disables `TCP_NODELAY` on the socket.
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub(crate) fn message_limit(&self) -> usize {
        self.max_message_size
            .unwrap_or_else(|| self.max_payload_read.saturating_mul(2))
    }
}
