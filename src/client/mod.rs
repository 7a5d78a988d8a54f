//! ACME protocol client.
//!
//! The engine drives issuance through the [`AcmeClient`] trait and answers DNS-01 challenges
//! through a [`Dns01Solver`] it hands to the client. [`HttpAcmeClient`] is an RFC 8555
//! implementation restricted to what DNS-01 issuance needs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{account::Account, config::ExternalAccountBinding, key::CertKey};

pub mod api;
mod http;
mod jws;
mod key;
mod req;
mod trans;

pub use self::{http::HttpAcmeClient, key::AccountKey};

/// Account registration as returned by the CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Account URL, used as key ID of every signed request.
    pub uri: String,

    pub body: api::Account,
}

/// A certificate order.
pub struct OrderRequest<'a> {
    /// Names to certify, the first one becoming the common name.
    pub domains: &'a [String],

    /// Key the certificate is issued for.
    pub key: &'a CertKey,

    /// Requested end of validity. `None` lets the CA decide.
    pub not_after: Option<OffsetDateTime>,

    /// Aborts polling when fired.
    pub cancel: &'a CancellationToken,
}

/// Answers DNS-01 challenges on behalf of the client.
#[async_trait]
pub trait Dns01Solver: Send + Sync {
    /// Publishes the TXT record for `key_auth` and returns once it can be validated.
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> eyre::Result<()>;

    /// Removes the TXT record published by [`present`](Self::present).
    async fn cleanup(&self, domain: &str, token: &str, key_auth: &str) -> eyre::Result<()>;
}

#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Creates an account for `key` at the CA.
    async fn register(
        &self,
        key: &AccountKey,
        email: &str,
        eab: Option<&ExternalAccountBinding>,
    ) -> eyre::Result<Registration>;

    /// Runs an order to completion and returns the PEM chain, leaf certificate first.
    ///
    /// Every record presented through `solver` is cleaned up before returning, whether the order
    /// succeeded or not.
    async fn obtain(
        &self,
        account: &Account,
        order: &OrderRequest<'_>,
        solver: &dyn Dns01Solver,
    ) -> eyre::Result<String>;

    async fn revoke(
        &self,
        account: &Account,
        certificate_pem: &str,
        reason: RevocationReason,
    ) -> eyre::Result<()>;
}

/// Enumeration of reasons for revocation.
///
/// The reason codes are taken from [RFC 5280 §5.3.1].
///
/// [RFC 5280 §5.3.1]: https://tools.ietf.org/html/rfc5280#section-5.3.1
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RevocationReason {
    #[default]
    Unspecified = 0,
    KeyCompromise = 1,
    CACompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    // value 7 is not used
    RemoveFromCRL = 8,
    PrivilegeWithdrawn = 9,
    AACompromise = 10,
}

impl RevocationReason {
    /// The reasonCode to send, if any.
    ///
    /// > the reason code CRL entry extension SHOULD be absent instead of using the unspecified
    /// > (0) reasonCode value
    pub(crate) fn code(self) -> Option<u8> {
        match self {
            RevocationReason::Unspecified => None,
            reason => Some(reason as u8),
        }
    }
}
