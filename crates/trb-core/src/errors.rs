/// Core error type.
///
/// Adapter crates map their specific errors into this type so the core can
/// handle failures consistently (user-facing message vs redelivery).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("broker error: {0}")]
    Broker(String),

    /// Error reported by the platform through the call's result callback.
    #[error("platform error {code}: {message}")]
    Platform { code: i32, message: String },

    /// The account has no live client handle.
    #[error("no open session for {0}")]
    NoSession(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
