use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use der::{DecodePem as _, Encode as _};
use eyre::{eyre, WrapErr as _};
use serde::de::DeserializeOwned;
use time::format_description::well_known::Rfc3339;
use tokio::{sync::OnceCell, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{
    api, jws,
    req::{req_expect_header, req_get, req_handle_error},
    trans::{NoncePool, Transport},
    AccountKey, AcmeClient, Dns01Solver, OrderRequest, Registration, RevocationReason,
};
use crate::{account::Account, config::ClientConfig, config::ExternalAccountBinding, Error};

/// Entry point for accessing an ACME API.
#[derive(Debug)]
struct Directory {
    nonce_pool: Arc<NoncePool>,
    api_directory: api::Directory,
}

/// RFC 8555 client speaking to a single CA directory.
///
/// The directory is fetched on first use and cached for the lifetime of the client.
pub struct HttpAcmeClient {
    config: ClientConfig,
    http: reqwest::Client,
    directory: OnceCell<Directory>,
}

/// A presented challenge, remembered for cleanup.
struct Presented {
    domain: String,
    token: String,
    key_auth: String,
}

impl HttpAcmeClient {
    pub fn new(config: ClientConfig) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("build HTTP client")?;

        Ok(Self::with_http_client(config, http))
    }

    pub fn with_http_client(config: ClientConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            directory: OnceCell::new(),
        }
    }

    async fn directory(&self) -> eyre::Result<&Directory> {
        self.directory
            .get_or_try_init(|| async {
                let url = &self.config.directory_url;
                log::debug!("fetching ACME directory {url}");

                let res = req_handle_error(req_get(&self.http, url).await?).await?;
                let api_directory = res
                    .json::<api::Directory>()
                    .await
                    .wrap_err("parse ACME directory")?;

                Ok::<_, eyre::Report>(Directory {
                    nonce_pool: Arc::new(NoncePool::new(&api_directory.new_nonce)),
                    api_directory,
                })
            })
            .await
    }

    fn transport(&self, directory: &Directory, key: AccountKey) -> Transport {
        Transport::new(self.http.clone(), Arc::clone(&directory.nonce_pool), key)
    }

    /// Presents every pending DNS-01 challenge of the order, then asks the CA to validate them.
    ///
    /// Challenges are pushed onto `presented` before they are published so the caller can clean
    /// them up whatever happens here.
    async fn authorize(
        &self,
        transport: &Transport,
        api_order: &api::Order,
        solver: &dyn Dns01Solver,
        cancel: &CancellationToken,
        presented: &mut Vec<Presented>,
    ) -> eyre::Result<()> {
        let mut pending = Vec::new();

        for auth_url in &api_order.authorizations {
            let auth = post_as_get::<api::Authorization>(transport, auth_url).await?;

            if auth.status == api::AuthorizationStatus::Valid {
                log::debug!("{} is already authorized", auth.identifier);
                continue;
            }

            let challenge = auth
                .dns_challenge()
                .ok_or_else(|| eyre!("CA offers no dns-01 challenge for {}", auth.domain()))?
                .clone();

            let key_auth = jws::key_authorization(&challenge.token, transport.account_key())?;
            let domain = auth.domain();

            // a failed presentation may still have written the record
            presented.push(Presented {
                domain: domain.clone(),
                token: challenge.token.clone(),
                key_auth: key_auth.clone(),
            });

            solver.present(&domain, &challenge.token, &key_auth).await?;
            pending.push((auth_url.as_str(), challenge));
        }

        for (auth_url, challenge) in pending {
            if challenge.need_validate() {
                transport
                    .call_kid(&challenge.url, &api::EmptyObject)
                    .await
                    .wrap_err("respond to challenge")?;
            }

            let auth = self
                .poll(transport, auth_url, cancel, |auth: &api::Authorization| {
                    auth.status != api::AuthorizationStatus::Pending
                })
                .await?;

            if auth.status != api::AuthorizationStatus::Valid {
                let reason = match auth.challenge_error() {
                    Some(problem) => problem.to_string(),
                    None => format!("authorization is {:?}", auth.status),
                };

                return Err(eyre!("validation of {} failed: {reason}", auth.domain()));
            }

            log::debug!("{} authorized", auth.domain());
        }

        Ok(())
    }

    async fn finalize(
        &self,
        transport: &Transport,
        order_url: &str,
        order: &OrderRequest<'_>,
    ) -> eyre::Result<String> {
        let api_order = self
            .poll(transport, order_url, order.cancel, |order: &api::Order| {
                order.status != api::OrderStatus::Pending
            })
            .await?;

        if api_order.status != api::OrderStatus::Ready {
            return Err(order_failure(&api_order));
        }

        let csr = order.key.create_csr(order.domains)?;
        let csr_der = csr.to_der().context("encode CSR")?;

        // if the CSR is invalid, we will get a 4xx code back
        transport
            .call_kid(&api_order.finalize, &api::Finalize::from_der(&csr_der))
            .await
            .wrap_err("finalize order")?;

        let api_order = self
            .poll(transport, order_url, order.cancel, |order: &api::Order| {
                !matches!(
                    order.status,
                    api::OrderStatus::Ready | api::OrderStatus::Processing
                )
            })
            .await?;

        if api_order.status != api::OrderStatus::Valid {
            return Err(order_failure(&api_order));
        }

        let cert_url = api_order
            .certificate
            .ok_or_else(|| eyre!("valid order has no certificate URL"))?;

        transport
            .call_kid(&cert_url, &api::EmptyString)
            .await?
            .text()
            .await
            .wrap_err("download certificate")
    }

    /// Re-reads `url` until `done` holds, bounded by the configured poll timeout.
    async fn poll<T, F>(
        &self,
        transport: &Transport,
        url: &str,
        cancel: &CancellationToken,
        done: F,
    ) -> eyre::Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let deadline = Instant::now() + self.config.poll_timeout;

        loop {
            let resource = post_as_get::<T>(transport, url).await?;

            if done(&resource) {
                return Ok(resource);
            }

            if Instant::now() + self.config.poll_interval > deadline {
                return Err(eyre!(
                    "{url} did not change status within {:?}",
                    self.config.poll_timeout
                ));
            }

            sleep_or_cancel(self.config.poll_interval, cancel).await?;
        }
    }
}

async fn post_as_get<T: DeserializeOwned>(transport: &Transport, url: &str) -> eyre::Result<T> {
    transport
        .call_kid(url, &api::EmptyString)
        .await?
        .json::<T>()
        .await
        .wrap_err_with(|| format!("parse response of {url}"))
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> eyre::Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled.into()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

fn order_failure(order: &api::Order) -> eyre::Report {
    match &order.error {
        Some(problem) => eyre!("order is {:?}: {problem}", order.status),
        None => eyre!("order is {:?}", order.status),
    }
}

#[async_trait]
impl AcmeClient for HttpAcmeClient {
    async fn register(
        &self,
        key: &AccountKey,
        email: &str,
        eab: Option<&ExternalAccountBinding>,
    ) -> eyre::Result<Registration> {
        let directory = self.directory().await?;
        let new_account_url = &directory.api_directory.new_account;

        if eab.is_none() && directory.api_directory.external_account_required() {
            return Err(eyre!("CA requires an external account binding"));
        }

        let external_account_binding = eab
            .map(|eab| jws::external_account_binding(eab, key, new_account_url))
            .transpose()?;

        let contact = (!email.is_empty()).then(|| vec![format!("mailto:{email}")]);

        let acc = api::Account {
            contact,
            terms_of_service_agreed: Some(true),
            external_account_binding,
            ..Default::default()
        };

        let transport = self.transport(directory, key.clone());
        let res = transport
            .call_jwk(new_account_url, &acc)
            .await
            .wrap_err("register account")?;

        let kid = req_expect_header(&res, "location")?;
        log::debug!("Key ID is: {kid}");

        let body = res
            .json::<api::Account>()
            .await
            .wrap_err("parse account")?;

        Ok(Registration { uri: kid, body })
    }

    async fn obtain(
        &self,
        account: &Account,
        order: &OrderRequest<'_>,
        solver: &dyn Dns01Solver,
    ) -> eyre::Result<String> {
        let directory = self.directory().await?;
        let transport = self.transport(directory, account.key.clone());

        let not_after = order
            .not_after
            .map(|at| at.format(&Rfc3339))
            .transpose()
            .context("format notAfter")?;

        let new_order = api::NewOrder::new(order.domains, not_after);

        let res = transport
            .call_kid(&directory.api_directory.new_order, &new_order)
            .await
            .wrap_err("create order")?;
        let order_url = req_expect_header(&res, "location")?;
        let api_order = res.json::<api::Order>().await.wrap_err("parse order")?;

        log::debug!("created order {order_url} for {:?}", order.domains);

        let mut presented = Vec::new();
        let authorized = self
            .authorize(&transport, &api_order, solver, order.cancel, &mut presented)
            .await;

        for challenge in &presented {
            if let Err(err) = solver
                .cleanup(&challenge.domain, &challenge.token, &challenge.key_auth)
                .await
            {
                log::warn!(
                    "failed to clean up challenge record of {}: {err:#}",
                    challenge.domain
                );
            }
        }

        authorized?;

        self.finalize(&transport, &order_url, order).await
    }

    async fn revoke(
        &self,
        account: &Account,
        certificate_pem: &str,
        reason: RevocationReason,
    ) -> eyre::Result<()> {
        let directory = self.directory().await?;
        let transport = self.transport(directory, account.key.clone());

        let certificate = x509_cert::Certificate::from_pem(certificate_pem)
            .context("parse certificate to revoke")?
            .to_der()
            .context("encode certificate to revoke")?;

        transport
            .call_kid(
                &directory.api_directory.revoke_cert,
                &api::Revocation::new(&certificate, reason),
            )
            .await
            .wrap_err("revoke certificate")?;

        Ok(())
    }
}
