//! Identity sources.
//!
//! An [`IdentitySource`] hands out the current [`X509Identity`] and per trust domain
//! [`TrustBundle`] snapshots. Rotation happens inside the source. Handshake code only ever
//! reads the snapshot that is current at call time, so every read must be a cheap,
//! non-blocking, in-memory operation.

use crate::error::{Error, Result};
use crate::identity::{TrustBundle, X509Identity};
use crate::prelude::debug;
use arc_swap::{ArcSwap, ArcSwapOption};
use spiffe::TrustDomain;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A provider of rotating identity and trust bundle snapshots.
///
/// Implementations must replace snapshots atomically: a reader gets either the complete old
/// snapshot or the complete new one, never a chain from one and a key from the other.
pub trait IdentitySource: Send + Sync + 'static {
    /// Returns the current identity snapshot.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if no identity has been published yet.
    /// - [`Error::SourceUnavailable`] if the source is closed or broken.
    fn current_identity(&self) -> Result<Arc<X509Identity>>;

    /// Returns the current trust bundle for `trust_domain`, or `None` if the source has none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceUnavailable`] if the source is closed or broken.
    fn trust_bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Arc<TrustBundle>>>;

    /// Closes the source. Later reads fail with [`Error::SourceUnavailable`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceUnavailable`] if the source cannot be shut down cleanly.
    fn close(&self) -> Result<()>;
}

impl<S: IdentitySource + ?Sized> IdentitySource for Arc<S> {
    fn current_identity(&self) -> Result<Arc<X509Identity>> {
        (**self).current_identity()
    }

    fn trust_bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Arc<TrustBundle>>> {
        (**self).trust_bundle(trust_domain)
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// An in-memory [`IdentitySource`] fed by explicit publications.
///
/// Reads are lock-free loads of the current snapshot. Useful for identities that do not
/// come from the Workload API, for running several independent identities in one process,
/// and in tests.
#[derive(Debug, Default)]
pub struct SnapshotSource {
    identity: ArcSwapOption<X509Identity>,
    bundles: ArcSwap<HashMap<TrustDomain, Arc<TrustBundle>>>,
    closed: AtomicBool,
}

impl SnapshotSource {
    /// Creates an empty source. Reads of the identity fail with [`Error::NotReady`] until
    /// [`publish_identity`](Self::publish_identity) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source that is ready with `identity` and `bundles`.
    pub fn with_material(
        identity: X509Identity,
        bundles: impl IntoIterator<Item = TrustBundle>,
    ) -> Self {
        let source = Self::new();
        source.install_identity(Arc::new(identity));
        source.install_bundles(bundles);
        source
    }

    /// Replaces the current identity.
    ///
    /// Handshakes that already hold the previous snapshot keep using it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceUnavailable`] if the source is closed.
    pub fn publish_identity(&self, identity: X509Identity) -> Result<()> {
        self.ensure_open()?;
        debug!("publishing identity {}", identity.spiffe_id());
        self.install_identity(Arc::new(identity));
        Ok(())
    }

    /// Replaces the trust bundle of the bundle's trust domain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceUnavailable`] if the source is closed.
    pub fn publish_bundle(&self, bundle: TrustBundle) -> Result<()> {
        self.ensure_open()?;
        debug!("publishing trust bundle for {}", bundle.trust_domain());
        self.install_bundles([bundle]);
        Ok(())
    }

    /// Removes the trust bundle of `trust_domain`, returning it if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceUnavailable`] if the source is closed.
    pub fn remove_bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Arc<TrustBundle>>> {
        self.ensure_open()?;
        let previous = self.bundles.rcu(|bundles| {
            let mut bundles = HashMap::clone(bundles);
            bundles.remove(trust_domain);
            bundles
        });
        Ok(previous.get(trust_domain).cloned())
    }

    /// Returns `true` once [`close`](IdentitySource::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SourceUnavailable("identity source is closed".into()));
        }
        Ok(())
    }

    fn install_identity(&self, identity: Arc<X509Identity>) {
        self.identity.store(Some(identity));
    }

    fn install_bundles(&self, bundles: impl IntoIterator<Item = TrustBundle>) {
        let bundles: Vec<Arc<TrustBundle>> = bundles.into_iter().map(Arc::new).collect();
        self.bundles.rcu(|current| {
            let mut next = HashMap::clone(current);
            for bundle in &bundles {
                next.insert(bundle.trust_domain().clone(), Arc::clone(bundle));
            }
            next
        });
    }
}

impl IdentitySource for SnapshotSource {
    fn current_identity(&self) -> Result<Arc<X509Identity>> {
        self.ensure_open()?;
        self.identity
            .load_full()
            .ok_or_else(|| Error::NotReady("no identity has been published yet".into()))
    }

    fn trust_bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Arc<TrustBundle>>> {
        self.ensure_open()?;
        Ok(self.bundles.load().get(trust_domain).cloned())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
