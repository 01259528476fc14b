//! Peer certificate validation: SPIFFE ID extraction, chain verification against the trust
//! bundle of the peer's trust domain, then the acceptance policy.
//!
//! The three steps run in that order and fail with distinct error kinds:
//!
//! 1. [`Error::MalformedIdentity`]: the leaf does not carry exactly one valid SPIFFE ID.
//! 2. [`Error::ChainValidation`]: no trust bundle for the peer's trust domain, or the chain
//!    does not verify against it (signature, validity window, path constraints).
//! 3. [`Error::Authorization`]: the chain is valid but the SPIFFE ID is not accepted.
//!
//! The policy never sees an identity whose chain has not been verified.

use crate::error::{Error, MalformedIdentityReason, Result};
use crate::identity::{spiffe_id_from_certificate, TrustBundle};
use crate::policy::AcceptPolicy;
use crate::prelude::{debug, warn};
use crate::source::IdentitySource;
use arc_swap::ArcSwap;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use spiffe::{SpiffeId, TrustDomain};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Validates a peer certificate chain and returns the peer's SPIFFE ID.
pub trait PeerValidator: Send + Sync {
    /// Validates `chain` (leaf first) at time `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedIdentity`], [`Error::ChainValidation`] or
    /// [`Error::Authorization`], in that order of precedence. Source failures surface as
    /// [`Error::SourceUnavailable`].
    fn validate(&self, chain: &[CertificateDer<'_>], now: UnixTime) -> Result<SpiffeId>;
}

/// Which side of the handshake the validated peer is on.
///
/// This selects the certificate usage the chain must be valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The peer is a TLS client (we are the server).
    Client,
    /// The peer is a TLS server (we are the client).
    Server,
}

/// Trust validator backed by an [`IdentitySource`]'s trust bundles and an [`AcceptPolicy`].
///
/// Trust bundles are read from the source at handshake time, so bundle rotation is picked
/// up without rebuilding the validator.
#[derive(Clone)]
pub struct IdentityTrustValidator {
    source: Arc<dyn IdentitySource>,
    policy: AcceptPolicy,
    role: PeerRole,
    provider: Arc<CryptoProvider>,
    anchors: Arc<ArcSwap<HashMap<TrustDomain, Anchors>>>,
}

// Verification state derived from one trust bundle snapshot.
#[derive(Clone)]
struct Anchors {
    bundle: Arc<TrustBundle>,
    roots: Arc<RootCertStore>,
    client_verifier: Option<Arc<dyn ClientCertVerifier>>,
}

impl IdentityTrustValidator {
    /// Creates a validator for peers acting as `role`.
    pub fn new(source: Arc<dyn IdentitySource>, policy: AcceptPolicy, role: PeerRole) -> Self {
        Self::with_provider(source, policy, role, crate::crypto::provider())
    }

    /// Creates a validator for TLS client peers (server side of a handshake).
    pub fn for_clients(source: Arc<dyn IdentitySource>, policy: AcceptPolicy) -> Self {
        Self::new(source, policy, PeerRole::Client)
    }

    /// Creates a validator for TLS server peers (client side of a handshake).
    pub fn for_servers(source: Arc<dyn IdentitySource>, policy: AcceptPolicy) -> Self {
        Self::new(source, policy, PeerRole::Server)
    }

    pub(crate) fn with_provider(
        source: Arc<dyn IdentitySource>,
        policy: AcceptPolicy,
        role: PeerRole,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            source,
            policy,
            role,
            provider,
            anchors: Arc::new(ArcSwap::default()),
        }
    }

    /// The acceptance policy.
    pub fn policy(&self) -> &AcceptPolicy {
        &self.policy
    }

    /// The peer role this validator checks chains for.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Validates `chain` against the current time.
    ///
    /// # Errors
    ///
    /// See [`PeerValidator::validate`].
    pub fn validate_now(&self, chain: &[CertificateDer<'_>]) -> Result<SpiffeId> {
        self.validate(chain, UnixTime::now())
    }

    fn check(&self, chain: &[CertificateDer<'_>], now: UnixTime) -> Result<SpiffeId> {
        let (leaf, intermediates) = chain
            .split_first()
            .ok_or(MalformedIdentityReason::EmptyChain)?;

        let spiffe_id = spiffe_id_from_certificate(leaf)?;
        self.verify_chain(spiffe_id.trust_domain(), leaf, intermediates, now)?;
        self.policy.evaluate(&spiffe_id)?;

        Ok(spiffe_id)
    }

    fn verify_chain(
        &self,
        trust_domain: &TrustDomain,
        leaf: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<()> {
        let anchors = self.anchors_for(trust_domain)?;

        match self.role {
            PeerRole::Server => {
                let parsed = ParsedCertificate::try_from(leaf)
                    .map_err(|e| Error::ChainValidation(e.to_string()))?;
                rustls::client::verify_server_cert_signed_by_trust_anchor(
                    &parsed,
                    &anchors.roots,
                    intermediates,
                    now,
                    self.provider.signature_verification_algorithms.all,
                )
                .map_err(|e| Error::ChainValidation(e.to_string()))
            }
            PeerRole::Client => {
                let verifier = anchors.client_verifier.ok_or_else(|| {
                    Error::ChainValidation(format!("no client verifier for {trust_domain}"))
                })?;
                verifier
                    .verify_client_cert(leaf, intermediates, now)
                    .map(|_| ())
                    .map_err(|e| Error::ChainValidation(e.to_string()))
            }
        }
    }

    // Returns verification anchors for the current bundle of `trust_domain`, rebuilding them
    // only when the source has published a different bundle snapshot.
    fn anchors_for(&self, trust_domain: &TrustDomain) -> Result<Anchors> {
        let bundle = self.source.trust_bundle(trust_domain)?.ok_or_else(|| {
            debug!("no trust bundle for trust domain {trust_domain}");
            Error::ChainValidation(format!("no trust bundle for trust domain {trust_domain}"))
        })?;

        if let Some(cached) = self.anchors.load().get(trust_domain) {
            if Arc::ptr_eq(&cached.bundle, &bundle) {
                return Ok(cached.clone());
            }
        }

        let anchors = self.build_anchors(bundle)?;
        self.anchors.rcu(|cache| {
            let mut next = HashMap::clone(cache);
            next.insert(trust_domain.clone(), anchors.clone());
            next
        });
        Ok(anchors)
    }

    fn build_anchors(&self, bundle: Arc<TrustBundle>) -> Result<Anchors> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) =
            roots.add_parsable_certificates(bundle.authorities().iter().cloned());
        if ignored > 0 {
            warn!(
                "ignored {ignored} unparseable authorities in trust bundle for {}",
                bundle.trust_domain()
            );
        }
        if added == 0 {
            return Err(Error::ChainValidation(format!(
                "trust bundle for {} has no usable authorities",
                bundle.trust_domain()
            )));
        }
        let roots = Arc::new(roots);

        let client_verifier = match self.role {
            PeerRole::Client => Some(
                WebPkiClientVerifier::builder_with_provider(
                    Arc::clone(&roots),
                    Arc::clone(&self.provider),
                )
                .build()
                .map_err(|e| Error::ChainValidation(format!("{e:?}")))?,
            ),
            PeerRole::Server => None,
        };

        Ok(Anchors {
            bundle,
            roots,
            client_verifier,
        })
    }
}

impl PeerValidator for IdentityTrustValidator {
    fn validate(&self, chain: &[CertificateDer<'_>], now: UnixTime) -> Result<SpiffeId> {
        self.check(chain, now).inspect_err(|e| match e {
            Error::Authorization(id) => warn!("peer {id} rejected by accept policy"),
            other => warn!("peer certificate rejected: {other}"),
        })
    }
}

impl fmt::Debug for IdentityTrustValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityTrustValidator")
            .field("role", &self.role)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn with_leaf<'a>(
    end_entity: &CertificateDer<'a>,
    intermediates: &[CertificateDer<'a>],
) -> Vec<CertificateDer<'a>> {
    let mut chain = Vec::with_capacity(intermediates.len() + 1);
    chain.push(end_entity.clone());
    chain.extend_from_slice(intermediates);
    chain
}

impl ClientCertVerifier for IdentityTrustValidator {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // Peers are not selected by issuer.
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.validate(&with_leaf(end_entity, intermediates), now)
            .map_err(Error::into_rustls)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ServerCertVerifier for IdentityTrustValidator {
    // The server name is not checked: servers are authenticated by SPIFFE ID.
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.validate(&with_leaf(end_entity, intermediates), now)
            .map_err(Error::into_rustls)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
