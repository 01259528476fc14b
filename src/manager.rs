//! Process-wide shared identity source.
//!
//! Connecting to the Workload API is comparatively expensive and every connection is an
//! extra stream the agent has to serve, so a process normally holds one source and shares
//! it between all TLS contexts. [`get_source`] creates that source lazily, exactly once,
//! even under concurrent first calls. A failed attempt is reported to its caller and the
//! next call tries again.
//!
//! [`reset`] tears the shared source down; the next [`get_source`] starts from scratch.
//! Contexts built from the shared source never close it themselves.

use crate::error::Result;
use crate::prelude::{info, warn};
use crate::source::IdentitySource;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use arc_swap::ArcSwap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

/// Creates an identity source on demand.
pub type SourceFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn IdentitySource>>> + Send + Sync>;

/// Observable lifecycle state of a managed source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    /// No attempt has been made since creation or the last reset.
    Uninitialized,
    /// An initialization attempt is in progress.
    Initializing,
    /// A source is available.
    Ready,
    /// The last attempt failed with this message. The next request retries.
    Failed(String),
}

enum Slot {
    Empty,
    Initializing,
    Ready(Arc<dyn IdentitySource>),
    Failed(String),
}

/// Owns one lazily created identity source.
pub struct IdentitySourceManager {
    factory: SourceFactory,
    slot: ArcSwap<Slot>,
    // Held across the factory await so that only one attempt runs at a time.
    init: Mutex<()>,
}

impl IdentitySourceManager {
    /// Creates a manager that builds its source with `factory`.
    pub fn with_factory<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Arc<dyn IdentitySource>>> + Send + 'static,
    {
        Self {
            factory: Arc::new(move || factory().boxed()),
            slot: ArcSwap::from_pointee(Slot::Empty),
            init: Mutex::new(()),
        }
    }

    /// Creates a manager that connects to the Workload API found via `SPIFFE_ENDPOINT_SOCKET`.
    pub fn workload_api() -> Self {
        Self::with_factory(default_source)
    }

    /// Returns the managed source, creating it if needed.
    ///
    /// Concurrent callers wait for a single in-flight attempt and share its outcome.
    ///
    /// # Errors
    ///
    /// Returns the factory's error, typically [`Error::Config`](crate::Error::Config) or
    /// [`Error::SourceUnavailable`](crate::Error::SourceUnavailable). The failure is not
    /// cached.
    pub async fn get_source(&self) -> Result<Arc<dyn IdentitySource>> {
        if let Slot::Ready(source) = &**self.slot.load() {
            return Ok(Arc::clone(source));
        }

        let _init = self.init.lock().await;
        if let Slot::Ready(source) = &**self.slot.load() {
            return Ok(Arc::clone(source));
        }

        let attempt = Attempt::start(&self.slot);
        match (self.factory)().await {
            Ok(source) => {
                info!("identity source initialized");
                attempt.finish(Slot::Ready(Arc::clone(&source)));
                Ok(source)
            }
            Err(e) => {
                warn!("identity source initialization failed: {e}");
                attempt.finish(Slot::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Returns the current lifecycle state without waiting.
    pub fn state(&self) -> SourceState {
        match &**self.slot.load() {
            Slot::Empty => SourceState::Uninitialized,
            Slot::Initializing => SourceState::Initializing,
            Slot::Ready(_) => SourceState::Ready,
            Slot::Failed(msg) => SourceState::Failed(msg.clone()),
        }
    }

    /// Closes the managed source, if any, and returns to the uninitialized state.
    ///
    /// Waits for an in-flight initialization to finish first.
    ///
    /// # Errors
    ///
    /// Returns the source's close error. The manager is reset regardless.
    pub async fn reset(&self) -> Result<()> {
        let _init = self.init.lock().await;
        let previous = self.slot.swap(Arc::new(Slot::Empty));
        match &*previous {
            Slot::Ready(source) => {
                info!("closing shared identity source");
                source.close()
            }
            Slot::Empty | Slot::Initializing | Slot::Failed(_) => Ok(()),
        }
    }
}

// Marks the slot as initializing for the lifetime of one factory call. An attempt dropped
// before `finish` (its caller was cancelled) puts the slot back to empty.
struct Attempt<'a> {
    slot: &'a ArcSwap<Slot>,
    marker: Arc<Slot>,
}

impl<'a> Attempt<'a> {
    fn start(slot: &'a ArcSwap<Slot>) -> Self {
        let marker = Arc::new(Slot::Initializing);
        slot.store(Arc::clone(&marker));
        Self { slot, marker }
    }

    fn finish(self, outcome: Slot) {
        self.slot.store(Arc::new(outcome));
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        let _ = self.slot.compare_and_swap(&self.marker, Arc::new(Slot::Empty));
    }
}

impl fmt::Debug for IdentitySourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentitySourceManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "workload-api")]
async fn default_source() -> Result<Arc<dyn IdentitySource>> {
    let source = crate::workload::WorkloadApiSource::connect().await?;
    Ok(Arc::new(source))
}

#[cfg(not(feature = "workload-api"))]
async fn default_source() -> Result<Arc<dyn IdentitySource>> {
    Err(crate::Error::Config(
        "no default identity source: the `workload-api` feature is disabled".into(),
    ))
}

/// The process-wide manager, backed by the Workload API.
pub fn global() -> &'static IdentitySourceManager {
    static GLOBAL: OnceLock<IdentitySourceManager> = OnceLock::new();
    GLOBAL.get_or_init(IdentitySourceManager::workload_api)
}

/// Returns the process-wide identity source, creating it on first use.
///
/// # Errors
///
/// - [`Error::Config`](crate::Error::Config) if `SPIFFE_ENDPOINT_SOCKET` is missing or invalid.
/// - [`Error::SourceUnavailable`](crate::Error::SourceUnavailable) if the Workload API cannot
///   be reached.
pub async fn get_source() -> Result<Arc<dyn IdentitySource>> {
    global().get_source().await
}

/// Closes the process-wide identity source. The next [`get_source`] reconnects.
///
/// # Errors
///
/// Returns the source's close error.
pub async fn reset() -> Result<()> {
    global().reset().await
}
