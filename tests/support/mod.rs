//! Runtime-generated X.509-SVIDs for the integration tests.
//!
//! Same certificate profile as the crate's unit-test CA: a CA with the trust domain ID as
//! its URI SAN, and non-CA leaves usable for both TLS roles.

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;
use spiffe_provider::{TrustBundle, TrustDomain, X509Identity};

/// A throwaway SPIFFE CA for one trust domain.
pub struct TestCa {
    trust_domain: TrustDomain,
    params: CertificateParams,
    key: KeyPair,
    der: CertificateDer<'static>,
}

impl TestCa {
    pub fn new(trust_domain: &str) -> Self {
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

    pub fn bundle(&self) -> TrustBundle {
        TrustBundle::new(self.trust_domain.clone(), vec![self.der.clone()])
    }

    pub fn identity(&self, uri: &str) -> X509Identity {
        let params = leaf_params(vec![SanType::URI(Ia5String::try_from(uri).unwrap())]);
        let key = KeyPair::generate().unwrap();
        let issuer = Issuer::from_params(&self.params, &self.key);
        let leaf = params.signed_by(&key, &issuer).unwrap().der().clone();

        X509Identity::new(vec![leaf], key.serialize_der()).unwrap()
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
