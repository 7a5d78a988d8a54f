//! Issue, renew and retire certificates of one CA.

use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    account::{AccountManager, UserScheme},
    cert,
    challenge::{ChallengePresenter, ProviderLookup, TxtResolver},
    client::{AcmeClient, OrderRequest, RevocationReason},
    config::EngineConfig,
    domain::{sanitize_domains, validate_domain, validate_key_name},
    key::CertKey,
    store::{
        AcmeUserStore, CertSession, CertStateStore, CertificateRecord, IssuedBy,
        IssuedCertificate, RenewalJob, Resource, PEM_CONTENT_TYPE,
    },
    Error, Result,
};

/// Request to make sure a certificate exists and is current.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Owner of the ACME account. Empty keeps the stored owner.
    pub acme_user: String,

    pub key_name: String,

    /// Empty keeps the stored domains.
    pub domains: Vec<String>,

    /// `None` keeps the stored attribution.
    pub issued_by: Option<IssuedBy>,

    /// Requested certificate lifetime. Zero keeps the stored selection.
    pub ttl: time::Duration,
}

impl UpdateRequest {
    pub fn new<I, S>(key_name: &str, acme_user: &str, domains: I, issued_by: IssuedBy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            acme_user: acme_user.to_owned(),
            key_name: key_name.to_owned(),
            domains: domains.into_iter().map(Into::into).collect(),
            issued_by: Some(issued_by),
            ttl: time::Duration::ZERO,
        }
    }

    /// Renews `key_name` with everything else taken from its record.
    pub fn renew(key_name: &str) -> Self {
        Self {
            key_name: key_name.to_owned(),
            ..Default::default()
        }
    }

    /// Derives the ACME user from `scheme` for a request made by `requester`.
    pub fn from_scheme<I, S>(
        scheme: &UserScheme,
        key_name: &str,
        requester: &str,
        domains: I,
        issued_by: IssuedBy,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            key_name,
            &scheme.acme_user(key_name, requester),
            domains,
            issued_by,
        )
    }

    pub fn with_ttl(mut self, ttl: time::Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Created,
    Renewed,
}

/// Result of a successful [`Engine::trigger_update`].
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub kind: UpdateKind,

    /// The record as committed to the store.
    pub record: CertificateRecord,
}

/// Certificate lifecycle of one CA.
///
/// Every call opens its own store sessions; an engine can be shared freely between tasks.
pub struct Engine {
    config: EngineConfig,
    client: Arc<dyn AcmeClient>,
    certs: Arc<dyn CertStateStore>,
    accounts: AccountManager,
    providers: Arc<dyn ProviderLookup>,
    resolver: Arc<dyn TxtResolver>,
    http: reqwest::Client,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        client: Arc<dyn AcmeClient>,
        certs: Arc<dyn CertStateStore>,
        users: Arc<dyn AcmeUserStore>,
        providers: Arc<dyn ProviderLookup>,
        resolver: Arc<dyn TxtResolver>,
    ) -> Self {
        let accounts = AccountManager::new(
            config.ca_id.clone(),
            users,
            Arc::clone(&client),
            config.external_account.clone(),
        );

        Self {
            config,
            client,
            certs,
            accounts,
            providers,
            resolver,
            http: reqwest::Client::new(),
        }
    }

    /// Replaces the HTTP client used to fetch root certificates.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ensures a current certificate exists for the requested key, issuing or renewing it.
    ///
    /// A record that is neither due for renewal nor forced by a change of domains or ACME user
    /// is left untouched and [`Error::NoRenewalDue`] is returned. On any failure after
    /// validation, nothing is written to the certificate store.
    pub async fn trigger_update(
        &self,
        req: UpdateRequest,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        let ca_id = &self.config.ca_id;
        let key_name = req.key_name.as_str();

        validate_key_name(key_name)?;

        for domain in &req.domains {
            validate_domain(domain)?;
        }
        let domains = sanitize_domains(&req.domains);

        let requested_ttl = if req.ttl.is_positive() {
            self.config.ttl.resolve(req.ttl)?
        } else {
            None
        };

        let session = self.certs.session().await?;
        let existing = session.get_by_id(key_name, ca_id).await?;
        let now = OffsetDateTime::now_utc();

        let plan = match existing {
            None => {
                let issued_by = match req.issued_by {
                    Some(issued_by) if !req.acme_user.is_empty() => issued_by,
                    _ => return Err(Error::KeyMustExist(key_name.to_owned())),
                };

                if domains.is_empty() {
                    return Err(Error::validation(
                        "domains",
                        "a new certificate needs at least one domain",
                    ));
                }

                log::info!("issuing new certificate {key_name} at {ca_id} for {domains:?}");

                Plan {
                    kind: UpdateKind::Created,
                    key: self.generate_key().await?,
                    domains,
                    acme_user: req.acme_user,
                    issued_by,
                    ttl_selected: requested_ttl.or(self.config.ttl.default),
                    previous: None,
                }
            }

            Some(record) => {
                let domains = if domains.is_empty() {
                    record.domains.clone()
                } else {
                    domains
                };

                let acme_user = if req.acme_user.is_empty() {
                    record.acme_user.clone()
                } else {
                    req.acme_user
                };

                let forced = domains != record.domains || acme_user != record.acme_user;

                if forced {
                    log::info!(
                        "renewing {key_name} at {ca_id} ahead of schedule: domains or ACME user changed"
                    );
                } else {
                    let renewal_date = self.renewal_date(&record);

                    if now < renewal_date && now < record.valid_end_time {
                        log::debug!("{key_name} at {ca_id} is not due before {renewal_date}");
                        return Err(Error::NoRenewalDue { renewal_date });
                    }

                    log::info!("renewing {key_name} at {ca_id}, due since {renewal_date}");
                }

                let key = if self.config.rotate_key_on_renewal {
                    self.generate_key().await?
                } else {
                    CertKey::from_pem(&record.private_key)
                        .map_err(|err| Error::external(format!("load key of {key_name}"), err))?
                };

                Plan {
                    kind: UpdateKind::Renewed,
                    key,
                    domains,
                    acme_user,
                    issued_by: req.issued_by.unwrap_or_else(|| record.issued_by.clone()),
                    ttl_selected: requested_ttl.or(record.ttl_selected),
                    previous: Some(record),
                }
            }
        };

        self.issue(&*session, key_name, plan, now, cancel).await
    }

    /// Runs the order described by `plan` and commits the result.
    async fn issue(
        &self,
        session: &dyn CertSession,
        key_name: &str,
        plan: Plan,
        now: OffsetDateTime,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        let ca_id = &self.config.ca_id;

        let account = self
            .accounts
            .init_user(&plan.acme_user, &plan.issued_by.email, false)
            .await?;

        let presenter = ChallengePresenter::new(
            ca_id.clone(),
            Arc::clone(&self.providers),
            Arc::clone(&self.resolver),
            cancel.clone(),
        );

        let order = OrderRequest {
            domains: &plan.domains,
            key: &plan.key,
            not_after: plan.ttl_selected.map(|ttl| now + ttl),
            cancel,
        };

        let chain = self
            .client
            .obtain(&account, &order, &presenter)
            .await
            .map_err(|err| Error::from_report(format!("obtain certificate {key_name}"), err))?;

        let (certificate, issuer) = cert::split_chain(&chain)
            .map_err(|err| Error::external("parse issued certificate chain", err))?;

        let issuer =
            cert::append_root_certificate(&self.http, &issuer, &self.config.root_cert_urls)
                .await?;

        let validity = cert::leaf_validity(&certificate)
            .map_err(|err| Error::external("read validity of issued certificate", err))?;

        let private_key = plan
            .key
            .to_pem()
            .map_err(|err| Error::external("encode certificate key", err))?;

        let mut record = CertificateRecord {
            key_name: key_name.to_owned(),
            ca_id: ca_id.clone(),
            private_key,
            domains: plan.domains,
            acme_user: plan.acme_user,
            issued_by: plan.issued_by,
            valid_start_time: validity.not_before,
            valid_end_time: validity.not_after,
            next_renewal_time: validity.not_after - self.config.renew_before_expiry(),
            renewed_time: None,
            claim_time: now,
            ttl_selected: plan.ttl_selected,
            version: 0,
        };

        let issued = IssuedCertificate {
            certificate,
            issuer,
        };

        record.version = match &plan.previous {
            None => session.put(&record, &issued).await?,
            Some(previous) => {
                record.claim_time = previous.claim_time;
                record.renewed_time = Some(now);
                session.update(&record, previous.version, &issued).await?
            }
        };

        log::info!(
            "certificate {key_name} at {ca_id} valid until {}, renewal scheduled for {}",
            record.valid_end_time,
            record.next_renewal_time
        );

        Ok(UpdateOutcome {
            kind: plan.kind,
            record,
        })
    }

    fn renewal_date(&self, record: &CertificateRecord) -> OffsetDateTime {
        if self.config.recalc_renewal_date {
            record.valid_end_time - self.config.renew_before_expiry()
        } else {
            record.next_renewal_time
        }
    }

    async fn generate_key(&self) -> Result<CertKey> {
        let algorithm = self.config.key_algorithm;

        tokio::task::spawn_blocking(move || CertKey::generate(algorithm))
            .await
            .map_err(|err| Error::external("generate certificate key", err.into()))?
            .map_err(|err| Error::external("generate certificate key", err))
    }

    /// Revokes the certificate of `key_name` at the CA and forgets it.
    ///
    /// The ACME account that ordered the certificate must still exist.
    pub async fn revoke(&self, key_name: &str, reason: RevocationReason) -> Result<()> {
        let ca_id = &self.config.ca_id;
        validate_key_name(key_name)?;

        let session = self.certs.session().await?;
        let record = load_record(&*session, key_name, ca_id).await?;
        let issued = session
            .get_certificate(key_name, ca_id)
            .await?
            .ok_or_else(|| Error::not_found("certificate", key_name))?;

        let account = self
            .accounts
            .init_user(&record.acme_user, &record.issued_by.email, true)
            .await?;

        self.client
            .revoke(&account, &issued.certificate, reason)
            .await
            .map_err(|err| Error::from_report(format!("revoke certificate {key_name}"), err))?;

        log::info!("revoked certificate {key_name} at {ca_id} ({reason:?})");

        session.delete(key_name, ca_id).await?;
        self.cleanup_user(&record.acme_user).await?;

        Ok(())
    }

    /// Forgets the certificate of `key_name` without revoking it.
    pub async fn delete(&self, key_name: &str) -> Result<()> {
        let ca_id = &self.config.ca_id;
        validate_key_name(key_name)?;

        let session = self.certs.session().await?;
        let record = load_record(&*session, key_name, ca_id).await?;

        session.delete(key_name, ca_id).await?;
        log::info!("deleted certificate {key_name} at {ca_id}");

        self.cleanup_user(&record.acme_user).await?;

        Ok(())
    }

    /// Returns a PEM artifact of `key_name` together with its content type.
    pub async fn get_resource(
        &self,
        key_name: &str,
        resource: Resource,
    ) -> Result<(String, &'static str)> {
        let ca_id = &self.config.ca_id;
        validate_key_name(key_name)?;

        let session = self.certs.session().await?;

        let content = match resource {
            Resource::PrivateKey => {
                let record = load_record(&*session, key_name, ca_id).await?;
                record.private_key.as_str().to_owned()
            }

            Resource::Certificate | Resource::Issuer | Resource::Fullchain => {
                let issued = session
                    .get_certificate(key_name, ca_id)
                    .await?
                    .ok_or_else(|| Error::not_found("certificate", key_name))?;

                match resource {
                    Resource::Certificate => issued.certificate,
                    Resource::Issuer => issued.issuer,
                    _ => cert::fullchain(&issued.certificate, &issued.issuer),
                }
            }
        };

        Ok((content, PEM_CONTENT_TYPE))
    }

    /// Certificates whose renewal date falls within `lookahead` from now, soonest first.
    ///
    /// The renewal date is the one [`trigger_update`](Self::trigger_update) judges by, so with
    /// [`recalc_renewal_date`](EngineConfig::recalc_renewal_date) set, stored renewal dates are
    /// ignored here too.
    pub async fn due_for_renewal(
        &self,
        lookahead: time::Duration,
        limit: usize,
    ) -> Result<Vec<RenewalJob>> {
        let session = self.certs.session().await?;
        let due_before = OffsetDateTime::now_utc() + lookahead;

        if !self.config.recalc_renewal_date {
            return Ok(session
                .list_due(&self.config.ca_id, due_before, limit)
                .await?);
        }

        let valid_end_before = due_before + self.config.renew_before_expiry();
        let expiring = session
            .list_expiring(&self.config.ca_id, valid_end_before, limit)
            .await?;

        Ok(expiring
            .iter()
            .map(|record| RenewalJob {
                key_name: record.key_name.clone(),
                next_renewal_time: self.renewal_date(record),
            })
            .collect())
    }

    /// Deletes the ACME account of `acme_user` once no certificate of this CA refers to it.
    ///
    /// Returns whether the account was deleted.
    pub async fn cleanup_user(&self, acme_user: &str) -> Result<bool> {
        let session = self.certs.session().await?;
        let remaining = session
            .count_by_acme_user(&self.config.ca_id, acme_user)
            .await?;

        if remaining > 0 {
            log::debug!("keeping ACME account of {acme_user}, still used by {remaining} certificates");
            return Ok(false);
        }

        self.accounts.delete_user(acme_user).await
    }
}

/// What [`Engine::issue`] orders and how it commits.
struct Plan {
    kind: UpdateKind,
    key: CertKey,
    domains: Vec<String>,
    acme_user: String,
    issued_by: IssuedBy,
    ttl_selected: Option<Duration>,

    /// The record being renewed, `None` when creating.
    previous: Option<CertificateRecord>,
}

async fn load_record(
    session: &dyn CertSession,
    key_name: &str,
    ca_id: &str,
) -> Result<CertificateRecord> {
    session
        .get_by_id(key_name, ca_id)
        .await?
        .ok_or_else(|| Error::not_found("certificate", key_name))
}
