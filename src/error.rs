use thiserror::Error;

/// Error taxonomy for the gateway. `UpstreamError` is deliberately absent:
/// transport failures are mapped to status codes inline in `forward.rs`
/// instead of being surfaced as a typed error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Config(String),
    #[error("Admin interface restricted")]
    AdminAccessDenied,
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
