use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("template collection failed: {message}")]
    Templates { message: String },
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn templates(message: impl Into<String>) -> Self {
        Self::Templates {
            message: message.into(),
        }
    }
}
