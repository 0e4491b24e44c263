use thiserror::Error;

use crate::{config::LoadError as ConfigLoadError, infra::error::InfraError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] ConfigLoadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("render failed: {0}")]
    Render(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into())
    }
}
