//! Mutual TLS contexts assembled from declarative options.

use crate::authorizer::Authorizer;
use crate::error::{Error, Result};
use crate::key_provider::IdentityKeyProvider;
use crate::policy::AcceptPolicy;
use crate::source::IdentitySource;
use crate::validator::{IdentityTrustValidator, PeerRole};
use rustls::{ClientConfig, ServerConfig, SupportedProtocolVersion};
use spiffe::{SpiffeId, TrustDomain};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Options of a mutual TLS context.
///
/// At least one of `accepted_spiffe_ids` (non-empty), `accept_any_authenticated`,
/// `authorizer` or `trust_domain` must be set, otherwise [`TlsContextBuilder::build`] fails.
/// The acceptance mechanisms combine as described in [`AcceptPolicy`].
#[derive(Clone)]
pub struct TlsContextOptions {
    /// Source of the local identity and of the trust bundles.
    pub identity_source: Arc<dyn IdentitySource>,

    /// Peers accepted by exact SPIFFE ID.
    pub accepted_spiffe_ids: Option<BTreeSet<SpiffeId>>,

    /// Accept any peer whose chain verifies.
    pub accept_any_authenticated: bool,

    /// Only accept peers of this trust domain, regardless of the other settings.
    pub trust_domain: Option<TrustDomain>,

    /// Accept peers approved by this predicate.
    pub authorizer: Option<Arc<dyn Authorizer>>,

    /// ALPN protocols, in preference order. Empty disables ALPN.
    pub alpn_protocols: Vec<Vec<u8>>,

    /// Enabled TLS versions.
    pub protocol_versions: Vec<&'static SupportedProtocolVersion>,
}

impl TlsContextOptions {
    /// Options over `identity_source` with no acceptance mechanism, no ALPN and the
    /// default rustls protocol versions.
    pub fn new(identity_source: Arc<dyn IdentitySource>) -> Self {
        Self {
            identity_source,
            accepted_spiffe_ids: None,
            accept_any_authenticated: false,
            trust_domain: None,
            authorizer: None,
            alpn_protocols: Vec::new(),
            protocol_versions: rustls::DEFAULT_VERSIONS.to_vec(),
        }
    }

    /// Options over the process-wide identity source.
    ///
    /// # Errors
    ///
    /// Returns the initialization error of the process-wide source.
    pub async fn shared() -> Result<Self> {
        Ok(Self::new(crate::manager::get_source().await?))
    }

    /// The acceptance policy described by these options.
    pub fn accept_policy(&self) -> AcceptPolicy {
        let mut policy = AcceptPolicy::default();

        if let Some(ids) = &self.accepted_spiffe_ids {
            policy = policy.allow_ids(ids.iter().cloned());
        }
        if self.accept_any_authenticated {
            policy = policy.allow_any_authenticated();
        }
        if let Some(authorizer) = &self.authorizer {
            policy = policy.allow_shared_authorizer(Arc::clone(authorizer));
        }
        if let Some(td) = &self.trust_domain {
            policy = policy.pin_trust_domain(td.clone());
        }

        policy
    }
}

impl fmt::Debug for TlsContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContextOptions")
            .field("accepted_spiffe_ids", &self.accepted_spiffe_ids)
            .field("accept_any_authenticated", &self.accept_any_authenticated)
            .field("trust_domain", &self.trust_domain)
            .field("authorizer", &self.authorizer.as_ref().map(|_| "<authorizer>"))
            .field("alpn_protocols", &self.alpn_protocols)
            .field("protocol_versions", &self.protocol_versions)
            .finish_non_exhaustive()
    }
}

/// Builds [`TlsContext`]s from [`TlsContextOptions`].
///
/// Every [`build`](Self::build) returns a new, independent context. All contexts of one
/// builder share the options' identity source; none of them owns or closes it.
///
/// # Examples
///
/// ```rust
/// use spiffe_provider::{SnapshotSource, SpiffeId, TlsContextBuilder, TlsContextOptions};
/// use std::sync::Arc;
///
/// let mut options = TlsContextOptions::new(Arc::new(SnapshotSource::new()));
/// options.accepted_spiffe_ids = Some([SpiffeId::new("spiffe://example.org/backend")?].into());
///
/// let context = TlsContextBuilder::new(options).build()?;
/// let _server = context.server_config();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct TlsContextBuilder {
    options: TlsContextOptions,
}

impl TlsContextBuilder {
    /// Creates a builder over `options`.
    pub fn new(options: TlsContextOptions) -> Self {
        Self { options }
    }

    /// The options this builder uses.
    pub fn options(&self) -> &TlsContextOptions {
        &self.options
    }

    /// Builds a mutual TLS context.
    ///
    /// The server side requires a client certificate. Both sides present the source's
    /// current identity and validate the peer with the configured policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no acceptance mechanism is configured, no protocol
    /// version is enabled, or rustls rejects the protocol versions.
    pub fn build(&self) -> Result<TlsContext> {
        let policy = self.options.accept_policy();
        if !policy.is_configured() {
            return Err(Error::Config(
                "no peer acceptance configured: set accepted_spiffe_ids, \
                 accept_any_authenticated, authorizer or trust_domain"
                    .into(),
            ));
        }
        if self.options.protocol_versions.is_empty() {
            return Err(Error::Config("no TLS protocol version enabled".into()));
        }

        let provider = crate::crypto::provider();
        let source = Arc::clone(&self.options.identity_source);
        let key_provider =
            IdentityKeyProvider::with_provider(Arc::clone(&source), Arc::clone(&provider));

        let client_validator = IdentityTrustValidator::with_provider(
            Arc::clone(&source),
            policy.clone(),
            PeerRole::Client,
            Arc::clone(&provider),
        );
        let server_validator = IdentityTrustValidator::with_provider(
            Arc::clone(&source),
            policy.clone(),
            PeerRole::Server,
            Arc::clone(&provider),
        );

        let mut server = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&self.options.protocol_versions)
            .map_err(|e| Error::Config(format!("server protocol versions: {e}")))?
            .with_client_cert_verifier(Arc::new(client_validator))
            .with_cert_resolver(Arc::new(key_provider.clone()));
        server.alpn_protocols.clone_from(&self.options.alpn_protocols);

        let mut client = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&self.options.protocol_versions)
            .map_err(|e| Error::Config(format!("client protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(server_validator))
            .with_client_cert_resolver(Arc::new(key_provider.clone()));
        client.alpn_protocols.clone_from(&self.options.alpn_protocols);

        Ok(TlsContext {
            server: Arc::new(server),
            client: Arc::new(client),
            key_provider,
            policy,
            source,
        })
    }
}

/// A ready mutual TLS context: a server and a client configuration presenting the same
/// identity and enforcing the same acceptance policy.
#[derive(Clone)]
pub struct TlsContext {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
    key_provider: IdentityKeyProvider,
    policy: AcceptPolicy,
    source: Arc<dyn IdentitySource>,
}

impl TlsContext {
    /// Configuration for accepting connections. Client certificates are mandatory.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server)
    }

    /// Configuration for initiating connections.
    ///
    /// The server name passed to rustls is not verified; the server is authenticated by
    /// its SPIFFE ID.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client)
    }

    /// The key provider presenting the local identity.
    pub fn key_provider(&self) -> &IdentityKeyProvider {
        &self.key_provider
    }

    /// The policy peers are validated against.
    pub fn accept_policy(&self) -> &AcceptPolicy {
        &self.policy
    }

    /// The shared identity source.
    pub fn identity_source(&self) -> &Arc<dyn IdentitySource> {
        &self.source
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("policy", &self.policy)
            .field("alpn_protocols", &self.server.alpn_protocols)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SnapshotSource;

    fn options() -> TlsContextOptions {
        TlsContextOptions::new(Arc::new(SnapshotSource::new()))
    }

    fn backend() -> SpiffeId {
        SpiffeId::new("spiffe://example.org/backend").unwrap()
    }

    #[test]
    fn no_acceptance_mechanism_is_config_error() {
        let err = TlsContextBuilder::new(options()).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let mut empty_ids = options();
        empty_ids.accepted_spiffe_ids = Some(BTreeSet::new());
        let err = TlsContextBuilder::new(empty_ids).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn each_mechanism_alone_is_enough() {
        let mut ids = options();
        ids.accepted_spiffe_ids = Some([backend()].into());

        let mut any = options();
        any.accept_any_authenticated = true;

        let mut pinned = options();
        pinned.trust_domain = Some(TrustDomain::new("example.org").unwrap());

        let mut predicate = options();
        predicate.authorizer = Some(Arc::new(crate::authorizer::any()));

        for options in [ids, any, pinned, predicate] {
            assert!(TlsContextBuilder::new(options).build().is_ok());
        }
    }

    #[test]
    fn builds_are_independent_but_share_the_source() {
        let mut options = options();
        options.accepted_spiffe_ids = Some([backend()].into());
        let builder = TlsContextBuilder::new(options);

        let first = builder.build().unwrap();
        let second = builder.build().unwrap();

        assert!(Arc::ptr_eq(first.identity_source(), second.identity_source()));
        assert!(Arc::ptr_eq(first.identity_source(), &builder.options().identity_source));
        assert!(!Arc::ptr_eq(&first.server_config(), &second.server_config()));
        assert!(!Arc::ptr_eq(&first.client_config(), &second.client_config()));
    }

    #[test]
    fn options_flow_into_configs() {
        let mut options = options();
        options.accept_any_authenticated = true;
        options.alpn_protocols = vec![b"h2".to_vec()];
        options.protocol_versions = vec![&rustls::version::TLS13];

        let context = TlsContextBuilder::new(options).build().unwrap();
        assert_eq!(context.server_config().alpn_protocols, vec![b"h2".to_vec()]);
        assert_eq!(context.client_config().alpn_protocols, vec![b"h2".to_vec()]);
        assert!(context.accept_policy().is_configured());
    }

    #[test]
    fn no_protocol_version_is_config_error() {
        let mut options = options();
        options.accept_any_authenticated = true;
        options.protocol_versions.clear();

        assert!(matches!(
            TlsContextBuilder::new(options).build(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn policy_combines_options() {
        let mut options = options();
        options.accepted_spiffe_ids = Some([backend()].into());
        options.trust_domain = Some(TrustDomain::new("example.org").unwrap());

        let policy = options.accept_policy();
        assert!(policy.evaluate(&backend()).is_ok());
        assert!(policy
            .evaluate(&SpiffeId::new("spiffe://example.org/attacker").unwrap())
            .is_err());
    }
}
