use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

const UNDESCRIBED_FAILURE: &str = "render failed without a message";

/// The single error kind a rendering capability raises: malformed input, a
/// missing root, or an internal fault of the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RenderFailure {
    message: String,
}

impl RenderFailure {
    /// Blank messages are replaced so a failure always carries readable text.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            UNDESCRIBED_FAILURE.to_string()
        } else {
            message
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Turns a document tree plus auxiliary data into an output string.
///
/// `files` is the JSON text of the path → content map; `json` is forwarded
/// exactly as the host supplied it.
#[async_trait]
pub trait RenderCapability: Send + Sync {
    async fn render(
        &self,
        root: &str,
        files: &str,
        json: &serde_json::Value,
    ) -> Result<String, RenderFailure>;
}

/// Errors raised while acquiring a rendering capability.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("renderer program `{}` not found", program.display())]
    ProgramNotFound { program: PathBuf },
    #[error("failed to prepare staging directory {}: {source}", path.display())]
    Staging { path: PathBuf, source: io::Error },
    #[error("failed to load rendering capability: {0}")]
    Other(String),
}

impl LoadError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Acquires the rendering capability, performing any one-time setup it needs.
#[async_trait]
pub trait CapabilityLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn RenderCapability>, LoadError>;
}

/// Loader that hands out a capability built ahead of time.
#[derive(Clone)]
pub struct PreloadedCapability {
    capability: Arc<dyn RenderCapability>,
}

impl PreloadedCapability {
    pub fn new(capability: Arc<dyn RenderCapability>) -> Self {
        Self { capability }
    }
}

#[async_trait]
impl CapabilityLoader for PreloadedCapability {
    async fn load(&self) -> Result<Arc<dyn RenderCapability>, LoadError> {
        Ok(Arc::clone(&self.capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_failure_messages_are_replaced() {
        assert_eq!(RenderFailure::new("   ").to_string(), UNDESCRIBED_FAILURE);
        assert_eq!(RenderFailure::new("bad root").to_string(), "bad root");
    }
}
