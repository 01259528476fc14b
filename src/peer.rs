//! Peer SPIFFE ID lookup after a completed handshake.

use crate::error::{MalformedIdentityReason, Result};
use crate::identity::spiffe_id_from_certificate;
use rustls::pki_types::CertificateDer;
use rustls::CommonState;
use spiffe::SpiffeId;

/// Returns the SPIFFE ID of the leaf in a peer certificate chain.
///
/// Applies the same single URI SAN rule as handshake validation.
///
/// # Errors
///
/// Returns [`Error::MalformedIdentity`](crate::Error::MalformedIdentity) if there is no
/// certificate or the leaf does not carry exactly one valid SPIFFE ID.
pub fn peer_spiffe_id(certs: Option<&[CertificateDer<'_>]>) -> Result<SpiffeId> {
    let leaf = certs
        .and_then(|certs| certs.first())
        .ok_or(MalformedIdentityReason::EmptyChain)?;
    spiffe_id_from_certificate(leaf)
}

/// Returns the SPIFFE ID of the peer of a rustls connection.
///
/// Accepts a `rustls::ServerConnection` or `rustls::ClientConnection` (both dereference to
/// [`CommonState`]). Only meaningful once the handshake has completed.
///
/// # Errors
///
/// See [`peer_spiffe_id`].
pub fn connection_peer_id(connection: &CommonState) -> Result<SpiffeId> {
    peer_spiffe_id(connection.peer_certificates())
}
