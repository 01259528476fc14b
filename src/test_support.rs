//! Runtime-generated X.509-SVIDs for unit tests.

use crate::error::Result;
use crate::identity::{TrustBundle, X509Identity};
use crate::source::IdentitySource;
use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;
use spiffe::TrustDomain;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A throwaway SPIFFE CA for one trust domain.
pub(crate) struct TestCa {
    trust_domain: TrustDomain,
    params: CertificateParams,
    key: KeyPair,
    der: CertificateDer<'static>,
}

impl TestCa {
    pub(crate) fn new(trust_domain: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let params = ca_params(&format!("test CA {trust_domain}"), trust_domain);
        let der = params.self_signed(&key).unwrap().der().clone();

        Self {
            trust_domain: TrustDomain::new(trust_domain).unwrap(),
            params,
            key,
            der,
        }
    }

    /// An intermediate CA of the same trust domain, signed by this one.
    pub(crate) fn intermediate(&self) -> Self {
        let key = KeyPair::generate().unwrap();
        let params = ca_params(
            &format!("test intermediate CA {}", self.trust_domain),
            &self.trust_domain.to_string(),
        );
        let issuer = Issuer::from_params(&self.params, &self.key);
        let der = params.signed_by(&key, &issuer).unwrap().der().clone();

        Self {
            trust_domain: self.trust_domain.clone(),
            params,
            key,
            der,
        }
    }

    pub(crate) fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub(crate) fn der(&self) -> CertificateDer<'static> {
        self.der.clone()
    }

    pub(crate) fn bundle(&self) -> TrustBundle {
        TrustBundle::new(self.trust_domain.clone(), vec![self.der()])
    }

    /// Issues a leaf carrying `uris` as URI SANs. Returns the leaf and its PKCS#8 key.
    pub(crate) fn issue(&self, uris: &[&str]) -> (CertificateDer<'static>, Vec<u8>) {
        let sans = uris
            .iter()
            .map(|uri| SanType::URI(Ia5String::try_from(*uri).unwrap()))
            .collect();
        self.sign(leaf_params(sans))
    }

    pub(crate) fn issue_with_dns(&self, dns: &str) -> (CertificateDer<'static>, Vec<u8>) {
        self.sign(leaf_params(vec![SanType::DnsName(
            Ia5String::try_from(dns).unwrap(),
        )]))
    }

    pub(crate) fn issue_expired(&self, uri: &str) -> (CertificateDer<'static>, Vec<u8>) {
        let mut params = leaf_params(vec![SanType::URI(Ia5String::try_from(uri).unwrap())]);
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2021, 1, 1);
        self.sign(params)
    }

    pub(crate) fn identity(&self, uri: &str) -> X509Identity {
        let (leaf, key) = self.issue(&[uri]);
        X509Identity::new(vec![leaf], key).unwrap()
    }

    fn sign(&self, params: CertificateParams) -> (CertificateDer<'static>, Vec<u8>) {
        let key = KeyPair::generate().unwrap();
        let issuer = Issuer::from_params(&self.params, &self.key);
        let cert = params.signed_by(&key, &issuer).unwrap();
        (cert.der().clone(), key.serialize_der())
    }
}

fn ca_params(common_name: &str, trust_domain: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.subject_alt_names = vec![SanType::URI(
        Ia5String::try_from(format!("spiffe://{trust_domain}")).unwrap(),
    )];
    params
}

fn leaf_params(subject_alt_names: Vec<SanType>) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.subject_alt_names = subject_alt_names;
    params
}

/// Wraps a source and counts trust bundle lookups.
pub(crate) struct CountingSource {
    inner: Arc<dyn IdentitySource>,
    bundle_lookups: AtomicUsize,
}

impl CountingSource {
    pub(crate) fn new(inner: Arc<dyn IdentitySource>) -> Self {
        Self {
            inner,
            bundle_lookups: AtomicUsize::new(0),
        }
    }

    pub(crate) fn bundle_lookups(&self) -> usize {
        self.bundle_lookups.load(Ordering::SeqCst)
    }
}

impl IdentitySource for CountingSource {
    fn current_identity(&self) -> Result<Arc<X509Identity>> {
        self.inner.current_identity()
    }

    fn trust_bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Arc<TrustBundle>>> {
        self.bundle_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.trust_bundle(trust_domain)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
