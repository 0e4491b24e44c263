use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};

use metrics::counter;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::types::{CapabilityLoader, LoadError, RenderCapability};

const METRIC_CAPABILITY_LOADS: &str = "platelet_worker_capability_loads_total";

/// Lifecycle of the capability held by a [`RenderCapabilityCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityState {
    Uninitialized,
    Loading,
    Ready,
}

impl CapabilityState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Loading,
            2 => Self::Ready,
            _ => Self::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Loading => 1,
            Self::Ready => 2,
        }
    }
}

/// Worker-lifetime holder for the rendering capability.
///
/// The capability is loaded on first use and shared by every later call.
/// Concurrent first callers wait on the same load. A failed load leaves the
/// cell empty so the next call tries again.
pub struct RenderCapabilityCell {
    loader: Arc<dyn CapabilityLoader>,
    capability: OnceCell<Arc<dyn RenderCapability>>,
    state: AtomicU8,
}

impl RenderCapabilityCell {
    pub fn new(loader: Arc<dyn CapabilityLoader>) -> Self {
        Self {
            loader,
            capability: OnceCell::new(),
            state: AtomicU8::new(CapabilityState::Uninitialized.as_u8()),
        }
    }

    pub fn state(&self) -> CapabilityState {
        CapabilityState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Access the capability, loading it if this is the first use.
    pub async fn get(&self) -> Result<Arc<dyn RenderCapability>, LoadError> {
        let capability = self
            .capability
            .get_or_try_init(|| self.load_once())
            .await?;
        Ok(Arc::clone(capability))
    }

    async fn load_once(&self) -> Result<Arc<dyn RenderCapability>, LoadError> {
        let started_at = Instant::now();
        let loading = LoadingGuard::enter(&self.state);

        match self.loader.load().await {
            Ok(capability) => {
                loading.complete();
                counter!(METRIC_CAPABILITY_LOADS, "result" => "ok").increment(1);
                info!(
                    target = "application::render::capability",
                    op = "capability::load",
                    result = "ok",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Rendering capability loaded"
                );
                Ok(capability)
            }
            Err(err) => {
                drop(loading);
                counter!(METRIC_CAPABILITY_LOADS, "result" => "error").increment(1);
                warn!(
                    target = "application::render::capability",
                    op = "capability::load",
                    result = "error",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %err,
                    "Rendering capability failed to load"
                );
                Err(err)
            }
        }
    }
}

/// Marks the cell as loading until dropped. Dropping without
/// [`LoadingGuard::complete`], including while unwinding out of a panicking
/// loader, puts the cell back to `Uninitialized`.
struct LoadingGuard<'a> {
    state: &'a AtomicU8,
    completed: bool,
}

impl<'a> LoadingGuard<'a> {
    fn enter(state: &'a AtomicU8) -> Self {
        state.store(CapabilityState::Loading.as_u8(), Ordering::Release);
        Self {
            state,
            completed: false,
        }
    }

    fn complete(mut self) {
        self.completed = true;
        self.state.store(CapabilityState::Ready.as_u8(), Ordering::Release);
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.state.store(CapabilityState::Uninitialized.as_u8(), Ordering::Release);
        }
    }
}

impl fmt::Debug for RenderCapabilityCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderCapabilityCell")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
