use std::time::Duration;

use time::OffsetDateTime;

use crate::{client::api::Problem, store::StoreError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the engine and its collaborators.
///
/// [`Error::NoRenewalDue`] is not a fault. It is the engine refusing to re-issue a certificate
/// before its renewal date, and callers should treat it as "nothing to do".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed key name, domain, TTL or zone policy violation.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// No record exists and the request carried no ACME user or issuer to create one.
    #[error("key {0:?} must exist when no ACME user or issuer is given")]
    KeyMustExist(String),

    /// The certificate is not yet due for renewal.
    #[error("certificate is not due for renewal before {renewal_date}")]
    NoRenewalDue { renewal_date: OffsetDateTime },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A concurrent call created or renewed the same key first.
    #[error("concurrent modification of {0}")]
    Conflict(String),

    /// ACME server, DNS provider, HTTP or storage backend failure.
    #[error("{context}")]
    ExternalService {
        context: String,
        #[source]
        source: eyre::Report,
    },

    #[error("DNS propagation of {record} timed out after {elapsed:?}")]
    PropagationTimeout { record: String, elapsed: Duration },

    /// Root certificate URLs are configured but none could be fetched.
    #[error("could not fetch a root certificate from any of {urls:?}")]
    ChainIncomplete { urls: Vec<String> },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn external(context: impl Into<String>, source: eyre::Report) -> Self {
        Error::ExternalService {
            context: context.into(),
            source,
        }
    }

    /// Recovers a typed error raised below an [`eyre::Report`] boundary, wrapping anything else
    /// as an external service failure.
    pub(crate) fn from_report(context: impl Into<String>, report: eyre::Report) -> Self {
        match report.downcast::<Error>() {
            Ok(err) => err,
            Err(report) => Error::external(context, report),
        }
    }

    /// Returns true if the engine declined to renew a certificate that is not yet due.
    pub fn is_no_renewal_due(&self) -> bool {
        matches!(self, Error::NoRenewalDue { .. })
    }

    /// Returns true if the error was caused by the request rather than a failing dependency.
    ///
    /// An API layer maps these to 4xx responses and everything else to 5xx.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. }
                | Error::KeyMustExist(_)
                | Error::NoRenewalDue { .. }
                | Error::NotFound { .. }
                | Error::Conflict(_)
        )
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Error::not_found("record", id),
            StoreError::AlreadyExists(id) | StoreError::VersionMismatch(id) => Error::Conflict(id),
            StoreError::Backend(report) => Error::external("storage backend", report),
        }
    }
}

impl From<Problem> for eyre::Report {
    fn from(problem: Problem) -> eyre::Report {
        eyre::eyre!("{problem}")
    }
}
