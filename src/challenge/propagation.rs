use std::{collections::HashMap, net::SocketAddr};

use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::xfer::Protocol,
    Resolver, TokioResolver,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{challenge::PrecheckConfig, Error, Result};

/// Resolves TXT records, optionally at a specific name server.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// Returns the TXT values at `fqdn`. A name without TXT records yields an empty list.
    async fn lookup_txt(&self, nameserver: Option<SocketAddr>, fqdn: &str)
        -> eyre::Result<Vec<String>>;
}

/// [`TxtResolver`] backed by hickory, with caching disabled.
#[derive(Default)]
pub struct HickoryTxtResolver {
    resolvers: Mutex<HashMap<Option<SocketAddr>, TokioResolver>>,
}

impl HickoryTxtResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolver(&self, nameserver: Option<SocketAddr>) -> TokioResolver {
        self.resolvers
            .lock()
            .entry(nameserver)
            .or_insert_with(|| {
                let config = match nameserver {
                    None => ResolverConfig::default(),
                    Some(addr) => {
                        let mut config = ResolverConfig::new();
                        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
                        config
                    }
                };

                let mut opts = ResolverOpts::default();
                // stale answers would hide a freshly published record
                opts.cache_size = 0;

                Resolver::builder_with_config(config, TokioConnectionProvider::default())
                    .with_options(opts)
                    .build()
            })
            .clone()
    }
}

#[async_trait]
impl TxtResolver for HickoryTxtResolver {
    async fn lookup_txt(
        &self,
        nameserver: Option<SocketAddr>,
        fqdn: &str,
    ) -> eyre::Result<Vec<String>> {
        let resolver = self.resolver(nameserver);

        match resolver.txt_lookup(fqdn).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect()
                })
                .collect()),

            Err(err) if err.is_no_records_found() => Ok(Vec::new()),

            Err(err) => Err(eyre::Report::new(err)),
        }
    }
}

/// Polls until `expected` is among the TXT values of `fqdn`.
///
/// Configured name servers are queried round-robin, one per attempt. Lookup failures count as
/// "not yet visible".
pub async fn wait_for_txt(
    resolver: &dyn TxtResolver,
    config: &PrecheckConfig,
    fqdn: &str,
    expected: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = Instant::now();
    let deadline = start + config.resolve_timeout;
    let mut attempt = 0;

    log::debug!(
        "waiting up to {:?} for {fqdn} to propagate",
        config.resolve_timeout
    );

    loop {
        let nameserver = match config.nameservers.len() {
            0 => None,
            n => Some(config.nameservers[attempt % n]),
        };
        attempt += 1;

        let lookup = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = resolver.lookup_txt(nameserver, fqdn) => Some(res),
            _ = tokio::time::sleep_until(deadline) => None,
        };

        match lookup {
            Some(Ok(values)) if values.iter().any(|value| value == expected) => {
                log::debug!(
                    "{fqdn} visible after {attempt} lookups ({:?})",
                    start.elapsed()
                );
                return Ok(());
            }
            Some(Ok(_)) => log::trace!("{fqdn} not yet visible at {nameserver:?}"),
            Some(Err(err)) => log::warn!("TXT lookup of {fqdn} at {nameserver:?} failed: {err:#}"),
            None => log::warn!("TXT lookup of {fqdn} at {nameserver:?} did not answer in time"),
        }

        let elapsed = start.elapsed();
        if elapsed >= config.resolve_timeout {
            return Err(Error::PropagationTimeout {
                record: fqdn.to_owned(),
                elapsed,
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(config.resolve_interval) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}
