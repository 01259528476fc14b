//! [`IdentitySource`] backed by the SPIFFE Workload API.

use crate::error::{Error, Result};
use crate::identity::{TrustBundle, X509Identity};
use crate::prelude::{debug, info};
use crate::source::IdentitySource;
use arc_swap::{ArcSwap, ArcSwapOption};
use rustls::pki_types::CertificateDer;
use spiffe::{
    BundleSource, SvidSource, TrustDomain, WorkloadApiClient, X509Bundle, X509Source,
    X509SourceBuilder, X509Svid,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const ENDPOINT_SOCKET_ENV: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Identity source that follows a Workload API [`X509Source`].
///
/// The `X509Source` keeps the SVID and bundles current in the background. This adapter
/// converts its snapshots, reusing the converted value while the underlying material is
/// unchanged so that downstream caches keyed on snapshot identity stay warm.
pub struct WorkloadApiSource {
    feed: Arc<dyn X509Feed>,
    identity: ArcSwapOption<X509Identity>,
    bundles: ArcSwap<HashMap<TrustDomain, Arc<TrustBundle>>>,
}

impl WorkloadApiSource {
    /// Connects to the Workload API advertised by `SPIFFE_ENDPOINT_SOCKET`.
    ///
    /// The address is validated with the same rules the Workload API client applies, then
    /// the first X.509 context is awaited.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `SPIFFE_ENDPOINT_SOCKET` is missing or invalid.
    /// - [`Error::SourceUnavailable`] if the Workload API cannot be reached.
    pub async fn connect() -> Result<Self> {
        Self::connect_to(spiffe::endpoint::get_default_socket_path()).await
    }

    async fn connect_to(address: Option<String>) -> Result<Self> {
        let address =
            address.ok_or_else(|| Error::Config(format!("{ENDPOINT_SOCKET_ENV} is not set")))?;
        spiffe::endpoint::validate_socket_path(&address)
            .map_err(|e| Error::Config(format!("{ENDPOINT_SOCKET_ENV}={address}: {e}")))?;

        debug!("connecting to Workload API at {address}");
        let client = WorkloadApiClient::new_from_path(&address)
            .await
            .map_err(|e| Error::SourceUnavailable(format!("{address}: {e}")))?;
        let source = X509SourceBuilder::new()
            .with_client(client)
            .build()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("{address}: {e}")))?;

        info!("connected to Workload API at {address}");
        Ok(Self::from_x509_source(source))
    }

    /// Wraps an already connected [`X509Source`].
    pub fn from_x509_source(source: Arc<X509Source>) -> Self {
        Self::from_feed(source)
    }

    fn from_feed(feed: Arc<dyn X509Feed>) -> Self {
        Self {
            feed,
            identity: ArcSwapOption::empty(),
            bundles: ArcSwap::default(),
        }
    }
}

impl IdentitySource for WorkloadApiSource {
    fn current_identity(&self) -> Result<Arc<X509Identity>> {
        let svid = self
            .feed
            .svid()?
            .ok_or_else(|| Error::NotReady("Workload API has not delivered an SVID yet".into()))?;

        if let Some(known) = &*self.identity.load() {
            if known.leaf().as_ref() == svid.leaf().as_ref() {
                return Ok(Arc::clone(known));
            }
        }

        let identity = Arc::new(convert_svid(&svid));
        self.identity.store(Some(Arc::clone(&identity)));
        Ok(identity)
    }

    fn trust_bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Arc<TrustBundle>>> {
        let Some(bundle) = self.feed.bundle(trust_domain)? else {
            return Ok(None);
        };

        if let Some(known) = self.bundles.load().get(trust_domain) {
            if same_authorities(known, &bundle) {
                return Ok(Some(Arc::clone(known)));
            }
        }

        let converted =
            Arc::new(TrustBundle::new(trust_domain.clone(), convert_authorities(&bundle)));
        self.bundles.rcu(|bundles| {
            let mut next = HashMap::clone(bundles);
            next.insert(trust_domain.clone(), Arc::clone(&converted));
            next
        });
        Ok(Some(converted))
    }

    fn close(&self) -> Result<()> {
        self.feed.close()
    }
}

impl fmt::Debug for WorkloadApiSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadApiSource").finish_non_exhaustive()
    }
}

fn convert_svid(svid: &X509Svid) -> X509Identity {
    let chain = svid
        .cert_chain()
        .iter()
        .map(|cert| CertificateDer::from(cert.as_ref().to_vec()))
        .collect();

    X509Identity::from_parts(
        svid.spiffe_id().clone(),
        chain,
        svid.private_key().as_ref().to_vec(),
    )
}

fn convert_authorities(bundle: &X509Bundle) -> Vec<CertificateDer<'static>> {
    bundle
        .authorities()
        .iter()
        .map(|cert| CertificateDer::from(cert.as_ref().to_vec()))
        .collect()
}

fn same_authorities(known: &TrustBundle, bundle: &X509Bundle) -> bool {
    let fresh = bundle.authorities();
    known.authorities().len() == fresh.len()
        && known
            .authorities()
            .iter()
            .zip(fresh)
            .all(|(a, b)| a.as_ref() == b.as_ref())
}

// Narrow view of `X509Source`, so the conversion logic can run against fixed material.
trait X509Feed: Send + Sync + 'static {
    fn svid(&self) -> Result<Option<X509Svid>>;
    fn bundle(&self, trust_domain: &TrustDomain) -> Result<Option<X509Bundle>>;
    fn close(&self) -> Result<()>;
}

impl X509Feed for X509Source {
    fn svid(&self) -> Result<Option<X509Svid>> {
        <X509Source as SvidSource>::get_svid(self)
            .map_err(|e| Error::SourceUnavailable(format!("fetching X.509-SVID: {e}")))
    }

    fn bundle(&self, trust_domain: &TrustDomain) -> Result<Option<X509Bundle>> {
        <X509Source as BundleSource>::get_bundle_for_trust_domain(self, trust_domain)
            .map_err(|e| Error::SourceUnavailable(format!("fetching X.509 bundle: {e}")))
    }

    fn close(&self) -> Result<()> {
        X509Source::close(self).map_err(|e| Error::SourceUnavailable(e.to_string()))
    }
}
