//! Application layer: the render worker and its error surface.

pub mod error;
pub mod render;
