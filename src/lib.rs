#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # spiffe-provider
//!
//! `spiffe-provider` turns a SPIFFE identity source into mutual TLS for [`rustls`].
//!
//! It is made of four cooperating parts:
//!
//! * [`IdentitySourceManager`] owns one lazily created, process-wide identity source
//!   (by default a [SPIFFE Workload API] connection found via `SPIFFE_ENDPOINT_SOCKET`).
//! * [`IdentityKeyProvider`] presents the current X.509-SVID and private key on every
//!   handshake, so rotations are picked up without rebuilding any configuration.
//! * [`IdentityTrustValidator`] verifies peer chains against the bundle of the peer's trust
//!   domain and then applies an [`AcceptPolicy`].
//! * [`TlsContextBuilder`] assembles both into ready [`rustls::ServerConfig`] and
//!   [`rustls::ClientConfig`] values from declarative [`TlsContextOptions`].
//!
//! Peer authorization always happens **after** cryptographic verification succeeds.
//!
//! ## Feature flags
//!
//! Exactly **one** `rustls` crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`
//!
//! Other features:
//!
//! * `workload-api` (default): [`WorkloadApiSource`] and the default source of the manager.
//! * `logging` (default) / `tracing`: diagnostics through `log` or `tracing`.
//!
//! [SPIFFE Workload API]: https://github.com/spiffe/spiffe/blob/main/standards/SPIFFE_Workload_API.md

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

pub mod authorizer;
pub mod manager;
pub mod peer;

mod crypto;
mod error;
mod identity;

mod observability;
mod prelude;

mod context;
mod key_provider;
mod policy;
mod source;
mod validator;

#[cfg(feature = "workload-api")]
mod workload;

#[cfg(test)]
mod test_support;

// Public re-exports
pub use authorizer::Authorizer;
pub use context::{TlsContext, TlsContextBuilder, TlsContextOptions};
pub use error::{Error, MalformedIdentityReason, Result};
pub use identity::{spiffe_id_from_certificate, TrustBundle, X509Identity};
pub use key_provider::{IdentityKeyProvider, KeySupplier};
pub use manager::{IdentitySourceManager, SourceState};
pub use policy::AcceptPolicy;
pub use source::{IdentitySource, SnapshotSource};
pub use spiffe::{SpiffeId, TrustDomain};
pub use validator::{IdentityTrustValidator, PeerRole, PeerValidator};

#[cfg(feature = "workload-api")]
pub use workload::WorkloadApiSource;
