//! Shared message types for the platelet render worker.
//!
//! A host posts [`RenderRequest`] messages and receives [`RenderResponse`]
//! messages. On the wire every response is an object carrying an `ok` flag
//! and either a `result` or an `error` field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result text of the readiness message a freshly started worker posts.
pub const READY_RESULT: &str = "loaded!";

/// Render request posted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    /// Path of the entry document inside `files`.
    pub root: String,
    /// Document tree keyed by path.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Auxiliary data handed to the renderer untouched.
    #[serde(default)]
    pub json: serde_json::Value,
}

impl RenderRequest {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            files: BTreeMap::new(),
            json: serde_json::Value::Null,
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn with_json(mut self, json: serde_json::Value) -> Self {
        self.json = json;
        self
    }
}

/// Outcome of a single render, or the readiness notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireResponse", try_from = "WireResponse")]
pub enum RenderResponse {
    Success { result: String },
    Failure { error: String },
}

impl RenderResponse {
    pub fn success(result: impl Into<String>) -> Self {
        Self::Success {
            result: result.into(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    /// The message a worker posts once it starts accepting requests.
    pub fn ready() -> Self {
        Self::success(READY_RESULT)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn result(&self) -> Option<&str> {
        match self {
            Self::Success { result } => Some(result.as_str()),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error.as_str()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResponseShapeError {
    #[error("response with `ok: true` is missing `result`")]
    MissingResult,
    #[error("response with `ok: false` is missing `error`")]
    MissingError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResponse {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<RenderResponse> for WireResponse {
    fn from(response: RenderResponse) -> Self {
        match response {
            RenderResponse::Success { result } => Self {
                ok: true,
                result: Some(result),
                error: None,
            },
            RenderResponse::Failure { error } => Self {
                ok: false,
                result: None,
                error: Some(error),
            },
        }
    }
}

impl TryFrom<WireResponse> for RenderResponse {
    type Error = ResponseShapeError;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        if wire.ok {
            wire.result
                .map(|result| RenderResponse::Success { result })
                .ok_or(ResponseShapeError::MissingResult)
        } else {
            wire.error
                .map(|error| RenderResponse::Failure { error })
                .ok_or(ResponseShapeError::MissingError)
        }
    }
}
