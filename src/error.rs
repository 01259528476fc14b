//! Error types for `spiffe-provider`.

use spiffe::SpiffeId;
use std::sync::Arc;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by `spiffe-provider`.
///
/// Setup-time failures are [`Error::Config`] and [`Error::SourceUnavailable`]. Handshake-time
/// failures abort only the connection attempt that produced them; the kinds keep a broken or
/// foreign certificate ([`Error::ChainValidation`]) apart from a correctly issued but
/// unauthorized peer ([`Error::Authorization`]).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or invalid configuration (no acceptance policy, bad endpoint address, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The identity source cannot be reached, failed to initialize, or has been closed.
    #[error("identity source unavailable: {0}")]
    SourceUnavailable(String),

    /// The identity source has not published the requested material yet.
    #[error("identity source is not ready: {0}")]
    NotReady(String),

    /// A certificate does not carry a single valid SPIFFE ID, or an identity snapshot is unusable.
    #[error("malformed identity: {0}")]
    MalformedIdentity(#[from] MalformedIdentityReason),

    /// Standard X.509 chain validation against the trust bundle failed.
    #[error("certificate chain validation failed: {0}")]
    ChainValidation(String),

    /// The peer is cryptographically valid but rejected by the accept policy.
    #[error("peer SPIFFE ID is not authorized: {0}")]
    Authorization(SpiffeId),
}

/// Why an identity was considered malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MalformedIdentityReason {
    /// The certificate chain is empty.
    #[error("certificate chain is empty")]
    EmptyChain,

    /// The leaf certificate could not be parsed as X.509.
    #[error("failed parsing leaf certificate: {0}")]
    UnparseableCertificate(String),

    /// The leaf certificate has no URI Subject Alternative Name.
    #[error("leaf certificate has no URI SAN")]
    MissingUriSan,

    /// The leaf certificate has more than one URI Subject Alternative Name.
    #[error("leaf certificate has {0} URI SANs, expected exactly one")]
    MultipleUriSans(usize),

    /// The certificate has too many URI SAN entries to inspect.
    #[error("leaf certificate has too many URI SAN entries (max {max})")]
    TooManyUriSans {
        /// Maximum number of URI SAN entries inspected before giving up.
        max: usize,
    },

    /// The URI SAN is not a valid SPIFFE ID.
    #[error("URI SAN is not a valid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// The private key of an identity snapshot cannot be loaded by the crypto provider.
    #[error("private key cannot be loaded: {0}")]
    UnusableKey(String),
}

impl Error {
    /// Wraps this error so it can cross the rustls verifier/resolver boundary.
    ///
    /// The original error can be recovered by downcasting the `rustls::OtherError` payload.
    pub(crate) fn into_rustls(self) -> rustls::Error {
        rustls::Error::Other(rustls::OtherError(Arc::new(self)))
    }
}
