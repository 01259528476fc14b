//! Peer authorization predicates over SPIFFE IDs.
//!
//! An [`Authorizer`] only ever sees identities whose chain already verified against the
//! trust bundle. [`AcceptPolicy`](crate::AcceptPolicy) is assembled from these values: an
//! [`Exact`] set for explicitly accepted IDs, [`Any`] for "any authenticated peer", and a
//! single-domain [`TrustDomains`] as the trust domain pin.

use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use spiffe::{SpiffeId, TrustDomain};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Decides whether an authenticated peer SPIFFE ID is allowed.
pub trait Authorizer: Send + Sync + 'static {
    /// Returns `true` if `peer` is authorized.
    fn authorize(&self, peer: &SpiffeId) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&SpiffeId) -> bool + Send + Sync + 'static,
{
    fn authorize(&self, peer: &SpiffeId) -> bool {
        self(peer)
    }
}

impl Authorizer for Arc<dyn Authorizer> {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        (**self).authorize(peer)
    }
}

impl Authorizer for Box<dyn Authorizer> {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        (**self).authorize(peer)
    }
}

/// Accepts every peer that got this far, i.e. every authenticated peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Any;

impl Authorizer for Any {
    fn authorize(&self, _peer: &SpiffeId) -> bool {
        true
    }
}

/// Accepts a fixed set of SPIFFE IDs.
#[derive(Debug, Clone, Default)]
pub struct Exact {
    allowed: Arc<BTreeSet<SpiffeId>>,
}

impl Exact {
    /// The accepted SPIFFE IDs.
    pub fn ids(&self) -> &BTreeSet<SpiffeId> {
        &self.allowed
    }

    /// Returns `true` if no ID is accepted.
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl FromIterator<SpiffeId> for Exact {
    fn from_iter<I: IntoIterator<Item = SpiffeId>>(ids: I) -> Self {
        Self {
            allowed: Arc::new(ids.into_iter().collect()),
        }
    }
}

impl Authorizer for Exact {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        self.allowed.contains(peer)
    }
}

/// Accepts SPIFFE IDs of a set of trust domains.
#[derive(Debug, Clone, Default)]
pub struct TrustDomains {
    allowed: Arc<BTreeSet<TrustDomain>>,
}

impl TrustDomains {
    /// The accepted trust domains.
    pub fn domains(&self) -> &BTreeSet<TrustDomain> {
        &self.allowed
    }
}

impl From<TrustDomain> for TrustDomains {
    fn from(trust_domain: TrustDomain) -> Self {
        Self {
            allowed: Arc::new(BTreeSet::from([trust_domain])),
        }
    }
}

impl FromIterator<TrustDomain> for TrustDomains {
    fn from_iter<I: IntoIterator<Item = TrustDomain>>(domains: I) -> Self {
        Self {
            allowed: Arc::new(domains.into_iter().collect()),
        }
    }
}

impl Authorizer for TrustDomains {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        self.allowed.contains(peer.trust_domain())
    }
}

/// An allow-list of SPIFFE IDs that can be replaced while contexts are in use.
///
/// Clones share the same list, so the handle kept by the application and the one
/// installed in a context observe the same updates. Every handshake reads the list as it
/// is at that moment.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    allowed: Arc<ArcSwap<BTreeSet<SpiffeId>>>,
}

impl AllowList {
    /// Creates an allow-list with an initial set of IDs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an entry is not a valid SPIFFE ID.
    pub fn new<I>(ids: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: TryInto<SpiffeId>,
        <I::Item as TryInto<SpiffeId>>::Error: std::fmt::Display,
    {
        Ok(Self {
            allowed: Arc::new(ArcSwap::from_pointee(parse_ids(ids)?)),
        })
    }

    /// Replaces the whole list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an entry is not a valid SPIFFE ID. The current list is
    /// left untouched in that case.
    pub fn replace<I>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: TryInto<SpiffeId>,
        <I::Item as TryInto<SpiffeId>>::Error: std::fmt::Display,
    {
        self.allowed.store(Arc::new(parse_ids(ids)?));
        Ok(())
    }

    /// A snapshot of the current list.
    pub fn snapshot(&self) -> Arc<BTreeSet<SpiffeId>> {
        self.allowed.load_full()
    }
}

impl Authorizer for AllowList {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        self.allowed.load().contains(peer)
    }
}

fn parse_ids<I>(ids: I) -> Result<BTreeSet<SpiffeId>>
where
    I: IntoIterator,
    I::Item: TryInto<SpiffeId>,
    <I::Item as TryInto<SpiffeId>>::Error: std::fmt::Display,
{
    ids.into_iter()
        .map(|id| {
            id.try_into()
                .map_err(|e| Error::Config(format!("invalid SPIFFE ID: {e}")))
        })
        .collect()
}

/// Returns an authorizer that accepts any authenticated SPIFFE ID.
pub fn any() -> Any {
    Any
}

/// Parses `ids` into an [`Exact`] authorizer.
///
/// ```rust
/// use spiffe_provider::authorizer;
///
/// let auth = authorizer::exact([
///     "spiffe://example.org/backend",
///     "spiffe://example.org/frontend",
/// ])?;
/// assert_eq!(auth.ids().len(), 2);
/// # Ok::<(), spiffe_provider::Error>(())
/// ```
///
/// # Errors
///
/// Returns [`Error::Config`] if an entry is not a valid SPIFFE ID.
pub fn exact<I>(ids: I) -> Result<Exact>
where
    I: IntoIterator,
    I::Item: TryInto<SpiffeId>,
    <I::Item as TryInto<SpiffeId>>::Error: std::fmt::Display,
{
    Ok(parse_ids(ids)?.into_iter().collect())
}

/// Parses `domains` into a [`TrustDomains`] authorizer.
///
/// # Errors
///
/// Returns [`Error::Config`] if an entry is not a valid trust domain.
pub fn trust_domains<I>(domains: I) -> Result<TrustDomains>
where
    I: IntoIterator,
    I::Item: TryInto<TrustDomain>,
    <I::Item as TryInto<TrustDomain>>::Error: std::fmt::Display,
{
    domains
        .into_iter()
        .map(|td| {
            td.try_into()
                .map_err(|e| Error::Config(format!("invalid trust domain: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SpiffeId {
        SpiffeId::new(s).unwrap()
    }

    #[test]
    fn exact_accepts_only_listed_ids() {
        let auth = exact(["spiffe://example.org/backend", "spiffe://example.org/api"]).unwrap();

        assert!(auth.authorize(&id("spiffe://example.org/backend")));
        assert!(auth.authorize(&id("spiffe://example.org/api")));
        assert!(!auth.authorize(&id("spiffe://example.org/attacker")));
        assert!(!auth.authorize(&id("spiffe://other.org/backend")));
        assert_eq!(auth.ids().len(), 2);
    }

    #[test]
    fn exact_rejects_invalid_ids_as_config_error() {
        let err = exact(["not-a-spiffe-id"]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_exact_authorizes_nothing() {
        let auth: Exact = std::iter::empty().collect();
        assert!(auth.is_empty());
        assert!(!auth.authorize(&id("spiffe://example.org/backend")));
    }

    #[test]
    fn trust_domains_match_on_domain_only() {
        let auth = trust_domains(["example.org", "partner.org"]).unwrap();

        assert!(auth.authorize(&id("spiffe://example.org/a")));
        assert!(auth.authorize(&id("spiffe://partner.org/b/c")));
        assert!(!auth.authorize(&id("spiffe://evil.org/a")));

        let single = TrustDomains::from(TrustDomain::new("example.org").unwrap());
        assert_eq!(single.domains().len(), 1);
        assert!(!single.authorize(&id("spiffe://partner.org/a")));
    }

    #[test]
    fn trust_domains_rejects_invalid_domain() {
        let err = trust_domains(["Invalid@Domain"]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn any_and_closures_authorize() {
        assert!(any().authorize(&id("spiffe://whatever.org/x")));

        let only_api = |peer: &SpiffeId| peer.path().starts_with("/api");
        assert!(only_api.authorize(&id("spiffe://example.org/api/v1")));
        assert!(!only_api.authorize(&id("spiffe://example.org/web")));

        let boxed: Box<dyn Authorizer> = Box::new(only_api);
        assert!(boxed.authorize(&id("spiffe://example.org/api")));
    }

    #[test]
    fn allow_list_updates_are_seen_by_clones() {
        let list = AllowList::new(["spiffe://example.org/a"]).unwrap();
        let installed: Arc<dyn Authorizer> = Arc::new(list.clone());

        assert!(installed.authorize(&id("spiffe://example.org/a")));
        assert!(!installed.authorize(&id("spiffe://example.org/b")));

        let before = list.snapshot();
        list.replace(["spiffe://example.org/b"]).unwrap();

        assert!(!installed.authorize(&id("spiffe://example.org/a")));
        assert!(installed.authorize(&id("spiffe://example.org/b")));
        assert!(before.contains(&id("spiffe://example.org/a")));
    }

    #[test]
    fn allow_list_keeps_old_entries_on_invalid_replace() {
        let list = AllowList::new(["spiffe://example.org/a"]).unwrap();

        assert!(list.replace(["bogus"]).is_err());
        assert!(list.authorize(&id("spiffe://example.org/a")));
    }
}
