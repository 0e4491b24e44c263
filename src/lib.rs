//! Background render worker for platelet templates.
//!
//! A host posts render requests; the worker loads the external rendering
//! capability once, renders each request in arrival order, and answers with
//! `{ok, result}` or `{ok, error}` messages.

pub mod application;
pub mod config;
pub mod infra;

pub use platelet_worker_protocol::{READY_RESULT, RenderRequest, RenderResponse};
