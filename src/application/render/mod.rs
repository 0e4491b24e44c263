//! Render worker: the bridge between host messages and the rendering
//! capability.
//!
//! The capability itself is external and reached only through
//! [`RenderCapability`]; the worker loads it lazily through a
//! [`CapabilityLoader`], keeps it for its whole lifetime, and turns every
//! outcome into a [`RenderResponse`](platelet_worker_protocol::RenderResponse).

mod capability;
mod types;
mod worker;

pub use capability::{CapabilityState, RenderCapabilityCell};
pub use types::{
    CapabilityLoader, LoadError, PreloadedCapability, RenderCapability, RenderFailure,
};
pub use worker::{RenderWorker, SpawnedWorker, WorkerClosed, WorkerError, WorkerHandle};
