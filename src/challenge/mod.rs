//! DNS-01 challenge presentation.
//!
//! A [`ChallengePresenter`] is built per engine call. It routes each challenge to the DNS provider
//! responsible for the domain and, if that provider asks for it, waits until the TXT record can
//! be resolved before letting the CA validate it.

use std::{net::IpAddr, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::prelude::*;
use eyre::WrapErr as _;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tokio_util::sync::CancellationToken;

use crate::{
    client::Dns01Solver,
    config::secs,
    domain::{challenge_record_fqdn, normalize_domain},
    Result,
};

mod propagation;
mod zones;

pub use self::{
    propagation::{wait_for_txt, HickoryTxtResolver, TxtResolver},
    zones::{RootZone, RootZones},
};

/// Propagation pre-check settings of a DNS provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PrecheckConfig {
    pub enabled: bool,

    /// Servers queried in turn. Empty means the resolver's default upstreams.
    pub nameservers: Vec<SocketAddr>,

    #[serde(rename = "resolve-interval-secs", with = "secs")]
    pub resolve_interval: Duration,

    #[serde(rename = "resolve-timeout-secs", with = "secs")]
    pub resolve_timeout: Duration,
}

impl Default for PrecheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nameservers: Vec::new(),
            resolve_interval: Duration::from_secs(5),
            resolve_timeout: Duration::from_secs(120),
        }
    }
}

/// A DNS backend able to publish challenge records.
///
/// `domain` is always given without wildcard label and trailing dot. Setting a challenge record
/// adds a TXT value; a wildcard and its base domain share a record name and may be present at the
/// same time. Deleting removes every challenge value of the name.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn precheck_config(&self) -> PrecheckConfig;

    async fn set_record_acme_challenge(&self, domain: &str, value: &str) -> eyre::Result<()>;

    async fn delete_record_acme_challenge(&self, domain: &str) -> eyre::Result<()>;

    async fn set_record_a(&self, domain: &str, ttl: u32, ip: IpAddr) -> eyre::Result<()>;

    async fn delete_record_a(&self, domain: &str) -> eyre::Result<()>;
}

/// Finds the DNS provider responsible for a domain.
pub trait ProviderLookup: Send + Sync {
    /// Fails if no provider serves `domain` or if its zone does not permit `ca_id`.
    fn provider_for(&self, domain: &str, ca_id: &str) -> Result<Arc<dyn DnsProvider>>;
}

/// TXT value answering a DNS-01 challenge: `base64url(sha256(key_auth))`.
///
/// See [RFC 8555 §8.4](https://datatracker.ietf.org/doc/html/rfc8555#section-8.4).
pub fn challenge_value(key_auth: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth))
}

/// Presents DNS-01 challenges of one engine call.
pub struct ChallengePresenter {
    ca_id: String,
    providers: Arc<dyn ProviderLookup>,
    resolver: Arc<dyn TxtResolver>,
    cancel: CancellationToken,
}

impl ChallengePresenter {
    pub fn new(
        ca_id: impl Into<String>,
        providers: Arc<dyn ProviderLookup>,
        resolver: Arc<dyn TxtResolver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ca_id: ca_id.into(),
            providers,
            resolver,
            cancel,
        }
    }
}

#[async_trait]
impl Dns01Solver for ChallengePresenter {
    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> eyre::Result<()> {
        let provider = self.providers.provider_for(domain, &self.ca_id)?;
        let value = challenge_value(key_auth);

        log::info!(
            "presenting DNS-01 challenge for {domain} via {} (CA {})",
            provider.name(),
            self.ca_id
        );

        provider
            .set_record_acme_challenge(normalize_domain(domain), &value)
            .await
            .wrap_err_with(|| format!("set challenge record of {domain} via {}", provider.name()))?;

        let precheck = provider.precheck_config();

        if precheck.enabled {
            let record = challenge_record_fqdn(domain);
            wait_for_txt(&*self.resolver, &precheck, &record, &value, &self.cancel).await?;
        }

        Ok(())
    }

    async fn cleanup(&self, domain: &str, _token: &str, _key_auth: &str) -> eyre::Result<()> {
        let provider = self.providers.provider_for(domain, &self.ca_id)?;

        log::debug!("removing DNS-01 challenge of {domain} via {}", provider.name());

        provider
            .delete_record_acme_challenge(normalize_domain(domain))
            .await
            .wrap_err_with(|| {
                format!("delete challenge record of {domain} via {}", provider.name())
            })
    }
}
