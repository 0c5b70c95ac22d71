use tokio_tungstenite::tungstenite;

/// Why a command sent over the session WebSocket did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("WebSocket not connected")]
    NotConnected,

    #[error("Command timed out: {command}")]
    Timeout { command: String },

    /// The connection dropped while the command was in flight.
    #[error("WebSocket disconnected")]
    Disconnected,

    /// The connection was closed on purpose.
    #[error("Connection closed")]
    Closed,

    /// The server answered with `{"type": "error"}`.
    #[error("{0}")]
    Server(String),

    #[error("failed to send command: {0}")]
    Transport(String),

    #[error("failed to encode command: {0}")]
    Encode(String),
}

/// Errors from talking to the backend over HTTP or opening a WebSocket.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("server is unavailable")]
    Unavailable,

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Other(err.into())
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::Other(err.into())
        }
    }
}
