//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod process;
pub mod stdio;
pub mod telemetry;
pub mod templates;
