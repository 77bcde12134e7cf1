use std::fmt;

/// Result type for polymarket-ws operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for polymarket-ws
#[derive(Debug)]
pub enum Error {
    /// WebSocket connection or transport error
    WebSocket(String),

    /// WebSocket connection closed by the remote end
    ConnectionClosed { code: u16, reason: String },

    /// JSON serialization failed
    Json(serde_json::Error),

    /// An inbound frame could not be decoded; carries the raw payload
    Decode {
        raw: String,
        source: serde_json::Error,
    },

    /// Decimal conversion error
    Decimal(rust_decimal::Error),

    /// Invalid configuration or caller misuse
    Config(String),

    /// Connect rate limiter failure
    RateLimiter(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WebSocket(msg) => write!(f, "WebSocket error: {}", msg),
            Error::ConnectionClosed { code, reason } => {
                write!(f, "WebSocket closed: code={}, reason={}", code, reason)
            }
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::Decode { raw, source } => {
                write!(f, "failed to decode frame {:?}: {}", raw, source)
            }
            Error::Decimal(e) => write!(f, "Decimal error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::RateLimiter(msg) => write!(f, "Rate limiter error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Json(e) => Some(e),
            Error::Decode { source, .. } => Some(source),
            Error::Decimal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<rust_decimal::Error> for Error {
    fn from(err: rust_decimal::Error) -> Self {
        Error::Decimal(err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(err.to_string())
    }
}
