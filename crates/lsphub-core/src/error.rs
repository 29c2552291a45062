use thiserror::Error;

/// Error kinds surfaced at the boundary of the bridge core.
///
/// "Not ready" is intentionally absent: readiness gating produces a
/// structured status payload the caller can retry on, never an error.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// The underlying stream failed or closed. Fails all pending requests.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request deadline elapsed. Local to the caller; the client stays
    /// connected.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// JSON-RPC error reply from the language server.
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    /// Path outside the allowed root, malformed URI, or invalid escape.
    #[error("path error: {0}")]
    Path(String),

    /// Operation not implemented by the active transport.
    #[error("{0}")]
    NotSupported(String),
}

impl Error {
    pub fn not_supported_in_session(method: &str) -> Self {
        Error::NotSupported(format!("{method} not supported in session mode"))
    }

    /// True when the message indicates a connection-level failure rather
    /// than a per-request one. Per-request failures must not move a client
    /// out of Connected.
    pub fn is_connection_message(message: &str) -> bool {
        message.contains("connection is closed")
            || message.contains("already disconnected")
            || message.contains("EOF")
    }
}
