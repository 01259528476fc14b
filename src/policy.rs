//! Peer acceptance policy.
//!
//! An [`AcceptPolicy`] combines acceptance mechanisms, each an [`Authorizer`], and an
//! optional trust domain pin:
//!
//! - an explicit set of accepted SPIFFE IDs ([`Exact`]),
//! - "accept any authenticated peer" ([`Any`]),
//! - any other predicate, such as a reloadable [`AllowList`](crate::authorizer::AllowList).
//!
//! The mechanisms are OR-ed: a peer accepted by any one of them is accepted. The trust
//! domain pin is AND-ed on top: when set, peers outside that trust domain are rejected no
//! matter what the mechanisms say. A policy that only carries a pin accepts every peer of
//! the pinned trust domain.
//!
//! A policy with neither a mechanism nor a pin rejects every peer. [`TlsContextBuilder`]
//! refuses to build such a policy.
//!
//! [`TlsContextBuilder`]: crate::TlsContextBuilder
//!
//! # Examples
//!
//! ```rust
//! use spiffe_provider::{AcceptPolicy, SpiffeId, TrustDomain};
//!
//! let backend = SpiffeId::new("spiffe://example.org/backend")?;
//! let policy = AcceptPolicy::default()
//!     .allow_ids([backend.clone()])
//!     .pin_trust_domain(TrustDomain::new("example.org")?);
//!
//! assert!(policy.evaluate(&backend).is_ok());
//! assert!(policy
//!     .evaluate(&SpiffeId::new("spiffe://example.org/attacker")?)
//!     .is_err());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::authorizer::{Any, Authorizer, Exact, TrustDomains};
use crate::error::{Error, Result};
use spiffe::{SpiffeId, TrustDomain};
use std::fmt;
use std::sync::Arc;

/// Decides whether an authenticated peer SPIFFE ID is accepted.
#[derive(Clone, Default)]
pub struct AcceptPolicy {
    mechanisms: Vec<Arc<dyn Authorizer>>,
    pin: Option<TrustDomains>,
}

impl AcceptPolicy {
    /// Accepts the given SPIFFE IDs, in addition to whatever is already accepted.
    ///
    /// An empty set does not count as an acceptance mechanism.
    #[must_use]
    pub fn allow_ids<I>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = SpiffeId>,
    {
        let exact: Exact = ids.into_iter().collect();
        if exact.is_empty() {
            return self;
        }
        self.allow_authorizer(exact)
    }

    /// Accepts any peer whose chain verifies against the trust bundle.
    #[must_use]
    pub fn allow_any_authenticated(self) -> Self {
        self.allow_authorizer(Any)
    }

    /// Accepts peers approved by `authorizer`, in addition to whatever is already accepted.
    #[must_use]
    pub fn allow_authorizer<A: Authorizer>(self, authorizer: A) -> Self {
        self.allow_shared_authorizer(Arc::new(authorizer))
    }

    /// Like [`allow_authorizer`](Self::allow_authorizer), for an authorizer that is already shared.
    #[must_use]
    pub fn allow_shared_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.mechanisms.push(authorizer);
        self
    }

    /// Restricts peers to `trust_domain`, replacing a previous pin.
    #[must_use]
    pub fn pin_trust_domain(mut self, trust_domain: TrustDomain) -> Self {
        self.pin = Some(TrustDomains::from(trust_domain));
        self
    }

    /// The pinned trust domain, if any.
    pub fn trust_domain(&self) -> Option<&TrustDomain> {
        self.pin.as_ref().and_then(|pin| pin.domains().first())
    }

    /// Returns `true` if at least one acceptance mechanism or a trust domain pin is set.
    pub fn is_configured(&self) -> bool {
        !self.mechanisms.is_empty() || self.pin.is_some()
    }

    /// Evaluates the policy for an already authenticated peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authorization`] carrying `peer` if the peer is not accepted.
    pub fn evaluate(&self, peer: &SpiffeId) -> Result<()> {
        if self.authorize(peer) {
            Ok(())
        } else {
            Err(Error::Authorization(peer.clone()))
        }
    }
}

impl Authorizer for AcceptPolicy {
    fn authorize(&self, peer: &SpiffeId) -> bool {
        match &self.pin {
            Some(pin) if !pin.authorize(peer) => false,
            Some(_) if self.mechanisms.is_empty() => true,
            _ => self.mechanisms.iter().any(|m| m.authorize(peer)),
        }
    }
}

impl fmt::Debug for AcceptPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptPolicy")
            .field("mechanisms", &self.mechanisms.len())
            .field("trust_domain", &self.trust_domain())
            .finish()
    }
}
