/// Errors raised by a [`SupportPlatform`](crate::SupportPlatform) implementation.
///
/// These never cross the bridge boundary; [`BackendBridge`](crate::BackendBridge)
/// folds them into a [`FailureReason`](crate::FailureReason).
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Network or TLS failure talking to the platform
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Credentials were refused
    #[error("unauthorized")]
    Unauthorized,
    /// The referenced channel/thread does not exist (or is invisible to us)
    #[error("not found")]
    NotFound,
    /// The platform refused the request (permissions, policy, rate limits)
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    /// The platform answered with something we could not parse
    #[error("invalid response: {0}")]
    Decode(String),
    /// Realtime gateway failure
    #[error("gateway error: {0}")]
    Gateway(String),
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        PlatformError::Decode(err.to_string())
    }
}
