//! Persistence contracts for certificates and ACME accounts.
//!
//! The engine never talks to a database directly. It opens a session per operation and relies on
//! the backend for two guarantees: [`CertSession::put`] fails when the key already exists, and
//! [`CertSession::update`] fails when the stored version moved on since it was read. Together they
//! make the store write the single commit point of an issuance.

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use zeroize::Zeroizing;

mod memory;

pub use self::memory::MemoryStore;

/// Content type of every PEM artifact served from the store.
pub const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

/// Who requested a certificate. The email doubles as the ACME registration contact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedBy {
    pub name: String,
    pub email: String,
}

impl IssuedBy {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Certificate state, keyed by `(key_name, ca_id)`.
#[derive(Clone)]
pub struct CertificateRecord {
    pub key_name: String,
    pub ca_id: String,

    /// PKCS#8 PEM of the certificate key.
    pub private_key: Zeroizing<String>,

    /// Ordered, the first entry being the certificate's common name.
    pub domains: Vec<String>,

    pub acme_user: String,
    pub issued_by: IssuedBy,

    pub valid_start_time: OffsetDateTime,
    pub valid_end_time: OffsetDateTime,
    pub next_renewal_time: OffsetDateTime,

    pub renewed_time: Option<OffsetDateTime>,
    pub claim_time: OffsetDateTime,

    pub ttl_selected: Option<Duration>,

    /// Maintained by the store; bumped on every write.
    pub version: u64,
}

impl CertificateRecord {
    pub fn id(&self) -> String {
        record_id(&self.key_name, &self.ca_id)
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("key_name", &self.key_name)
            .field("ca_id", &self.ca_id)
            .field("domains", &self.domains)
            .field("acme_user", &self.acme_user)
            .field("issued_by", &self.issued_by)
            .field("valid_end_time", &self.valid_end_time)
            .field("next_renewal_time", &self.next_renewal_time)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

pub(crate) fn record_id(key_name: &str, ca_id: &str) -> String {
    format!("{key_name}/{ca_id}")
}

/// PEM artifacts of an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate: String,

    /// Intermediates, plus a root when one was appended.
    pub issuer: String,
}

/// A certificate whose renewal date has been reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalJob {
    pub key_name: String,
    pub next_renewal_time: OffsetDateTime,
}

/// Downloadable artifacts of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    PrivateKey,
    Certificate,
    Issuer,
    Fullchain,
}

impl Resource {
    pub fn name(self) -> &'static str {
        match self {
            Resource::PrivateKey => "private_key",
            Resource::Certificate => "certificate",
            Resource::Issuer => "issuer",
            Resource::Fullchain => "fullchain",
        }
    }
}

impl FromStr for Resource {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private_key" => Ok(Resource::PrivateKey),
            "certificate" => Ok(Resource::Certificate),
            "issuer" => Ok(Resource::Issuer),
            "fullchain" => Ok(Resource::Fullchain),
            _ => Err(crate::Error::validation(
                "resource",
                format!("unknown resource {s:?}"),
            )),
        }
    }
}

/// ACME account material, keyed by `(user_id, ca_id)`.
#[derive(Clone)]
pub struct StoredAccount {
    pub user_id: String,
    pub ca_id: String,

    /// PKCS#8 PEM of the P-256 account key.
    pub private_key: Zeroizing<String>,

    /// JSON of the registration returned by the CA.
    pub registration: String,

    pub created: OffsetDateTime,
}

impl fmt::Debug for StoredAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredAccount")
            .field("user_id", &self.user_id)
            .field("ca_id", &self.ca_id)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} was modified concurrently")]
    VersionMismatch(String),

    #[error("storage backend failure")]
    Backend(#[source] eyre::Report),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CertStateStore: Send + Sync {
    async fn session(&self) -> StoreResult<Box<dyn CertSession>>;
}

#[async_trait]
pub trait CertSession: Send + Sync {
    async fn get_by_id(&self, key_name: &str, ca_id: &str)
        -> StoreResult<Option<CertificateRecord>>;

    /// Inserts a new record. Fails with [`StoreError::AlreadyExists`] if the key is taken.
    ///
    /// Returns the version assigned to the record.
    async fn put(&self, record: &CertificateRecord, issued: &IssuedCertificate)
        -> StoreResult<u64>;

    /// Replaces a record if its stored version still equals `expected_version`.
    ///
    /// Returns the new version.
    async fn update(
        &self,
        record: &CertificateRecord,
        expected_version: u64,
        issued: &IssuedCertificate,
    ) -> StoreResult<u64>;

    async fn delete(&self, key_name: &str, ca_id: &str) -> StoreResult<()>;

    async fn get_certificate(
        &self,
        key_name: &str,
        ca_id: &str,
    ) -> StoreResult<Option<IssuedCertificate>>;

    /// Records of `ca_id` whose `next_renewal_time` is at or before `due_before`, soonest first.
    async fn list_due(
        &self,
        ca_id: &str,
        due_before: OffsetDateTime,
        limit: usize,
    ) -> StoreResult<Vec<RenewalJob>>;

    /// Records of `ca_id` whose `valid_end_time` is at or before `valid_end_before`, soonest
    /// expiry first.
    async fn list_expiring(
        &self,
        ca_id: &str,
        valid_end_before: OffsetDateTime,
        limit: usize,
    ) -> StoreResult<Vec<CertificateRecord>>;

    async fn count_by_acme_user(&self, ca_id: &str, acme_user: &str) -> StoreResult<usize>;
}

#[async_trait]
pub trait AcmeUserStore: Send + Sync {
    async fn session(&self) -> StoreResult<Box<dyn AcmeUserSession>>;
}

#[async_trait]
pub trait AcmeUserSession: Send + Sync {
    async fn get_by_id(&self, user_id: &str, ca_id: &str) -> StoreResult<Option<StoredAccount>>;

    /// Fails with [`StoreError::AlreadyExists`] if the account is already stored.
    async fn put(&self, account: &StoredAccount) -> StoreResult<()>;

    async fn delete(&self, user_id: &str, ca_id: &str) -> StoreResult<()>;
}
