use crate::error::{MalformedIdentityReason, Result};
use crate::identity::X509Identity;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::sync::{Arc, OnceLock};

/// Ensures a rustls crypto provider is installed as the process default.
///
/// Idempotent. If the application (or another crate) already installed a
/// provider, that one is kept.
pub(crate) fn ensure_crypto_provider_installed() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = crypto_provider().install_default();
    });
}

/// Returns the provider used for configs, verifiers and signing keys.
pub(crate) fn provider() -> Arc<CryptoProvider> {
    ensure_crypto_provider_installed();
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(crypto_provider()))
}

#[cfg(feature = "ring")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(feature = "aws-lc-rs")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

/// Builds a rustls `CertifiedKey` from a single identity snapshot.
///
/// Chain and key always come from the same snapshot.
///
/// ## Errors
///
/// Returns [`MalformedIdentityReason::UnusableKey`] if the provider cannot load the key.
pub(crate) fn certified_key(
    provider: &CryptoProvider,
    identity: &X509Identity,
) -> Result<Arc<CertifiedKey>> {
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        identity.private_key_der().to_vec(),
    ));

    let signing_key = provider
        .key_provider
        .load_private_key(key_der)
        .map_err(|e| MalformedIdentityReason::UnusableKey(e.to_string()))?;

    Ok(Arc::new(CertifiedKey::new(
        identity.cert_chain().to_vec(),
        signing_key,
    )))
}
