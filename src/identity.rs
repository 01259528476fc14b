//! Identity and trust bundle snapshots.
//!
//! Both types are immutable. An identity source replaces a snapshot as a whole on
//! rotation and hands out `Arc`s, so a handshake that already holds a snapshot keeps
//! a consistent chain/key pair even if a newer one is published meanwhile.

use crate::error::{MalformedIdentityReason, Result};
use rustls::pki_types::CertificateDer;
use spiffe::{SpiffeId, TrustDomain};
use std::fmt;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::oid_registry;
use zeroize::Zeroizing;

const MAX_URI_SAN_ENTRIES: usize = 32;

/// An X.509-SVID snapshot: certificate chain (leaf first), PKCS#8 private key and the
/// SPIFFE ID carried by the leaf.
pub struct X509Identity {
    spiffe_id: SpiffeId,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Zeroizing<Vec<u8>>,
}

impl X509Identity {
    /// Creates an identity from a leaf-first chain and a PKCS#8 DER private key.
    ///
    /// The SPIFFE ID is read from the leaf's single URI SAN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedIdentity`](crate::Error::MalformedIdentity) if the chain is
    /// empty or the leaf does not carry exactly one valid SPIFFE ID.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key_pkcs8_der: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let leaf = cert_chain
            .first()
            .ok_or(MalformedIdentityReason::EmptyChain)?;
        let spiffe_id = spiffe_id_from_certificate(leaf)?;

        Ok(Self::from_parts(spiffe_id, cert_chain, private_key_pkcs8_der))
    }

    /// Assembles an identity whose SPIFFE ID was already extracted and validated.
    pub(crate) fn from_parts(
        spiffe_id: SpiffeId,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key_pkcs8_der: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            spiffe_id,
            cert_chain,
            private_key: Zeroizing::new(private_key_pkcs8_der.into()),
        }
    }

    /// The SPIFFE ID of this identity.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// The certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        // `new` and `from_parts` callers guarantee a non-empty chain.
        &self.cert_chain[0]
    }

    /// The private key as PKCS#8 DER.
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key
    }
}

impl fmt::Debug for X509Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Identity")
            .field("spiffe_id", &format_args!("{}", self.spiffe_id))
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// The trusted X.509 authorities of one trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    trust_domain: TrustDomain,
    authorities: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    /// Creates a bundle for `trust_domain` from DER-encoded authorities.
    pub fn new(trust_domain: TrustDomain, authorities: Vec<CertificateDer<'static>>) -> Self {
        Self {
            trust_domain,
            authorities,
        }
    }

    /// The trust domain this bundle belongs to.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The trusted authorities.
    pub fn authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }
}

/// Extracts the SPIFFE ID from a DER-encoded X.509 certificate.
///
/// The certificate must carry **exactly one** URI SAN, and it must be a valid SPIFFE ID.
/// Non-URI SAN entries (DNS names, IPs, ...) are ignored.
///
/// # Errors
///
/// Returns [`Error::MalformedIdentity`](crate::Error::MalformedIdentity) with:
/// - [`MalformedIdentityReason::UnparseableCertificate`] if the DER cannot be parsed,
/// - [`MalformedIdentityReason::MissingUriSan`] if there is no URI SAN,
/// - [`MalformedIdentityReason::MultipleUriSans`] if there is more than one,
/// - [`MalformedIdentityReason::TooManyUriSans`] above 32 URI SAN entries,
/// - [`MalformedIdentityReason::InvalidSpiffeId`] if the URI is not a SPIFFE ID.
pub fn spiffe_id_from_certificate(cert: &CertificateDer<'_>) -> Result<SpiffeId> {
    let (_, x509) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| MalformedIdentityReason::UnparseableCertificate(e.to_string()))?;

    let ext = x509
        .tbs_certificate
        .get_extension_unique(&oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME)
        .map_err(|e| MalformedIdentityReason::UnparseableCertificate(e.to_string()))?
        .ok_or(MalformedIdentityReason::MissingUriSan)?;

    let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() else {
        return Err(MalformedIdentityReason::UnparseableCertificate(
            "subject alternative name extension could not be decoded".into(),
        )
        .into());
    };

    let uris: Vec<&str> = san
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::URI(uri) => Some(*uri),
            _ => None,
        })
        .collect();

    match uris.as_slice() {
        [] => Err(MalformedIdentityReason::MissingUriSan.into()),
        [uri] => SpiffeId::new(uri)
            .map_err(|e| MalformedIdentityReason::InvalidSpiffeId(format!("{uri}: {e}")).into()),
        many if many.len() > MAX_URI_SAN_ENTRIES => Err(MalformedIdentityReason::TooManyUriSans {
            max: MAX_URI_SAN_ENTRIES,
        }
        .into()),
        many => Err(MalformedIdentityReason::MultipleUriSans(many.len()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::test_support::TestCa;

    fn reason(err: Error) -> MalformedIdentityReason {
        match err {
            Error::MalformedIdentity(reason) => reason,
            other => panic!("expected MalformedIdentity, got {other:?}"),
        }
    }

    #[test]
    fn extracts_single_spiffe_id() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&["spiffe://example.org/backend"]);

        let id = spiffe_id_from_certificate(&leaf).unwrap();
        assert_eq!(id.to_string(), "spiffe://example.org/backend");
        assert_eq!(id.trust_domain().to_string(), "example.org");
    }

    #[test]
    fn missing_uri_san_is_malformed() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&[]);

        let err = spiffe_id_from_certificate(&leaf).unwrap_err();
        assert_eq!(reason(err), MalformedIdentityReason::MissingUriSan);
    }

    #[test]
    fn dns_only_san_is_missing_uri_san() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue_with_dns("backend.example.org");

        let err = spiffe_id_from_certificate(&leaf).unwrap_err();
        assert_eq!(reason(err), MalformedIdentityReason::MissingUriSan);
    }

    #[test]
    fn multiple_uri_sans_are_malformed() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&["spiffe://example.org/a", "spiffe://example.org/b"]);

        let err = spiffe_id_from_certificate(&leaf).unwrap_err();
        assert_eq!(reason(err), MalformedIdentityReason::MultipleUriSans(2));
    }

    #[test]
    fn non_spiffe_uri_is_malformed() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&["https://example.org/backend"]);

        let err = spiffe_id_from_certificate(&leaf).unwrap_err();
        assert!(matches!(
            reason(err),
            MalformedIdentityReason::InvalidSpiffeId(_)
        ));
    }

    #[test]
    fn garbage_der_is_unparseable() {
        let err = spiffe_id_from_certificate(&CertificateDer::from(vec![0x30, 0x03, 0x01]))
            .unwrap_err();
        assert!(matches!(
            reason(err),
            MalformedIdentityReason::UnparseableCertificate(_)
        ));
    }

    #[test]
    fn identity_requires_a_chain() {
        let err = X509Identity::new(Vec::new(), vec![1, 2, 3]).unwrap_err();
        assert_eq!(reason(err), MalformedIdentityReason::EmptyChain);
    }

    #[test]
    fn identity_debug_redacts_key() {
        let ca = TestCa::new("example.org");
        let identity = ca.identity("spiffe://example.org/backend");

        let debug = format!("{identity:?}");
        assert!(debug.contains("spiffe://example.org/backend"));
        assert!(debug.contains("<redacted>"));
        assert_eq!(identity.leaf(), &identity.cert_chain()[0]);
    }
}
