use serde_json::Value;
use thiserror::Error;

/// Driver error types
#[derive(Error, Debug)]
pub enum DriverError {
    /// Malformed option, wrong arity or unknown key
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Operating on a closed connection or a stale cursor
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A timed wait expired
    #[error("Operation timed out")]
    Timeout,

    /// Invariant violation inside the driver
    #[error("Driver internal error: {0}")]
    Internal(String),

    /// Protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server rejected the handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// RUNTIME_ERROR response from the server
    #[error("Runtime error: {msg}")]
    Runtime { msg: String, backtrace: Option<Value> },

    /// COMPILE_ERROR response from the server
    #[error("Compile error: {msg}")]
    Compile { msg: String, backtrace: Option<Value> },

    /// CLIENT_ERROR response from the server
    #[error("Client error: {msg}")]
    ClientError { msg: String, backtrace: Option<Value> },

    /// A whole-sequence consumer ran twice on the same cursor
    #[error("Cursor already consumed")]
    CursorConsumed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DriverError {
    /// True when the error came back from the server as a response frame.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            DriverError::Runtime { .. }
                | DriverError::Compile { .. }
                | DriverError::ClientError { .. }
        )
    }
}
