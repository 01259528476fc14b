//! Handshake-time supply of the local certificate chain and private key.

use crate::crypto;
use crate::error::Result;
use crate::identity::X509Identity;
use crate::prelude::{error, info};
use crate::source::IdentitySource;
use arc_swap::ArcSwapOption;
use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use std::fmt;
use std::sync::Arc;

/// Supplies the certificate chain and signing key to present in a handshake.
pub trait KeySupplier: Send + Sync {
    /// Returns the chain and key of the current identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`](crate::Error::NotReady) or
    /// [`Error::SourceUnavailable`](crate::Error::SourceUnavailable) if no identity can be
    /// supplied, and [`Error::MalformedIdentity`](crate::Error::MalformedIdentity) if the
    /// current private key cannot be used for signing.
    fn supply_certified_key(&self) -> Result<Arc<CertifiedKey>>;
}

/// Presents the current identity of an [`IdentitySource`] in every handshake.
///
/// The source is read on each call, never at construction, so a handshake always uses the
/// identity that is current when it starts. Chain and key always come from the same
/// snapshot. Issuer and signature scheme hints sent by the peer are ignored: there is a
/// single identity to offer.
///
/// Clones share the signing key cache.
#[derive(Clone)]
pub struct IdentityKeyProvider {
    source: Arc<dyn IdentitySource>,
    provider: Arc<CryptoProvider>,
    cache: Arc<ArcSwapOption<Loaded>>,
}

// A signing key loaded from a specific identity snapshot.
struct Loaded {
    identity: Arc<X509Identity>,
    certified_key: Arc<CertifiedKey>,
}

impl IdentityKeyProvider {
    /// Creates a provider backed by `source`.
    pub fn new(source: Arc<dyn IdentitySource>) -> Self {
        Self::with_provider(source, crypto::provider())
    }

    /// Creates a provider backed by the process-wide identity source.
    ///
    /// # Errors
    ///
    /// Returns the initialization error of the process-wide source, see
    /// [`manager::get_source`](crate::manager::get_source).
    pub async fn from_shared() -> Result<Self> {
        Ok(Self::new(crate::manager::get_source().await?))
    }

    pub(crate) fn with_provider(
        source: Arc<dyn IdentitySource>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            source,
            provider,
            cache: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// The backing identity source.
    pub fn source(&self) -> &Arc<dyn IdentitySource> {
        &self.source
    }

    /// The current identity snapshot.
    ///
    /// # Errors
    ///
    /// Propagates the source error ([`Error::NotReady`](crate::Error::NotReady) or
    /// [`Error::SourceUnavailable`](crate::Error::SourceUnavailable)).
    pub fn current_identity(&self) -> Result<Arc<X509Identity>> {
        self.source.current_identity()
    }

    /// Picks the identity for an incoming handshake. The requested server name is ignored.
    ///
    /// # Errors
    ///
    /// See [`KeySupplier::supply_certified_key`].
    pub fn choose_server_certificate(
        &self,
        _server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>> {
        self.supply_certified_key()
    }

    /// Picks the identity for an outgoing handshake. Acceptable issuers and signature schemes
    /// requested by the server are ignored.
    ///
    /// # Errors
    ///
    /// See [`KeySupplier::supply_certified_key`].
    pub fn choose_client_certificate(
        &self,
        _acceptable_issuers: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Result<Arc<CertifiedKey>> {
        self.supply_certified_key()
    }

    fn certified_key_for(&self, identity: Arc<X509Identity>) -> Result<Arc<CertifiedKey>> {
        let current = self.cache.load();
        if let Some(loaded) = &*current {
            if Arc::ptr_eq(&loaded.identity, &identity) {
                return Ok(Arc::clone(&loaded.certified_key));
            }
        }

        let certified_key = crypto::certified_key(&self.provider, &identity)?;
        if current.is_some() {
            info!("presenting rotated identity {}", identity.spiffe_id());
        } else {
            info!("presenting identity {}", identity.spiffe_id());
        }

        self.cache.store(Some(Arc::new(Loaded {
            identity,
            certified_key: Arc::clone(&certified_key),
        })));
        Ok(certified_key)
    }
}

impl KeySupplier for IdentityKeyProvider {
    fn supply_certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let identity = self.source.current_identity()?;
        self.certified_key_for(identity)
    }
}

impl ResolvesServerCert for IdentityKeyProvider {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.choose_server_certificate(client_hello.server_name())
            .inspect_err(|e| error!("no server certificate for handshake: {e}"))
            .ok()
    }
}

impl ResolvesClientCert for IdentityKeyProvider {
    fn resolve(
        &self,
        acceptable_issuers: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.choose_client_certificate(acceptable_issuers, sigschemes)
            .inspect_err(|e| error!("no client certificate for handshake: {e}"))
            .ok()
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl fmt::Debug for IdentityKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyProvider").finish_non_exhaustive()
    }
}
