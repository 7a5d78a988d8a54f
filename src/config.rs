//! Configuration structs.
//!
//! Everything the engine, client and scheduler need is passed in explicitly through these structs;
//! nothing is read from global state. Durations are written in seconds when serialized.

use std::time::Duration;

use serde::Deserialize;
use time::{macros::format_description, Time};

use crate::{account::UserScheme, key::KeyAlgorithm, Error, Result};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Per-CA engine policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Identifier of the certificate authority, second half of every record's key.
    pub ca_id: String,

    /// Renew this many days before the certificate's `notAfter`.
    pub days_renew_before_expiry: u32,

    /// Recompute the renewal date from the stored `valid_end_time` instead of trusting the
    /// stored `next_renewal_time`.
    ///
    /// With the flag unset an operator may move a certificate's renewal date in the database and
    /// the engine honors it. With the flag set, the date is always derived from the certificate
    /// itself and such overrides are ignored.
    pub recalc_renewal_date: bool,

    /// Algorithm used for newly generated certificate keys.
    pub key_algorithm: KeyAlgorithm,

    /// Generate a new certificate key on every renewal instead of reusing the stored one.
    pub rotate_key_on_renewal: bool,

    pub ttl: TtlPolicy,

    /// Where to fetch a root certificate when the CA's issuer chain stops short of one.
    pub root_cert_urls: Vec<String>,

    pub external_account: Option<ExternalAccountBinding>,

    pub user_scheme: UserScheme,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ca_id: "letsencrypt".to_owned(),
            days_renew_before_expiry: 30,
            recalc_renewal_date: false,
            key_algorithm: KeyAlgorithm::default(),
            rotate_key_on_renewal: false,
            ttl: TtlPolicy::default(),
            root_cert_urls: Vec::new(),
            external_account: None,
            user_scheme: UserScheme::default(),
        }
    }
}

impl EngineConfig {
    pub fn renew_before_expiry(&self) -> time::Duration {
        time::Duration::days(i64::from(self.days_renew_before_expiry))
    }
}

/// Bounds on the certificate lifetime a caller may request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TtlPolicy {
    #[serde(rename = "min-secs", with = "opt_secs")]
    pub min: Option<Duration>,

    #[serde(rename = "max-secs", with = "opt_secs")]
    pub max: Option<Duration>,

    /// Lifetime used when the caller does not ask for one. `None` lets the CA decide.
    #[serde(rename = "default-secs", with = "opt_secs")]
    pub default: Option<Duration>,
}

impl TtlPolicy {
    /// Resolves a requested lifetime against the policy.
    ///
    /// Zero or negative requests fall back to the policy default. Requests outside `[min, max]`
    /// are rejected rather than clamped.
    pub fn resolve(&self, requested: time::Duration) -> Result<Option<Duration>> {
        if !requested.is_positive() {
            return Ok(self.default);
        }

        let requested = Duration::try_from(requested)
            .map_err(|err| Error::validation("ttl", err.to_string()))?;

        if let Some(min) = self.min.filter(|min| requested < *min) {
            return Err(Error::validation(
                "ttl",
                format!("{requested:?} is shorter than the minimum of {min:?}"),
            ));
        }

        if let Some(max) = self.max.filter(|max| requested > *max) {
            return Err(Error::validation(
                "ttl",
                format!("{requested:?} is longer than the maximum of {max:?}"),
            ));
        }

        Ok(Some(requested))
    }
}

/// Pre-shared credentials binding a new ACME account to an account at the CA operator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExternalAccountBinding {
    pub key_id: String,

    /// Base64url-encoded HMAC key as handed out by the CA.
    pub hmac_key: String,
}

/// Settings of the HTTP ACME client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientConfig {
    pub directory_url: String,

    #[serde(rename = "poll-interval-secs", with = "secs")]
    pub poll_interval: Duration,

    /// Upper bound on waiting for an authorization or order to change status.
    #[serde(rename = "poll-timeout-secs", with = "secs")]
    pub poll_timeout: Duration,

    #[serde(rename = "request-timeout-secs", with = "secs")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            directory_url: LETSENCRYPT_URL.to_owned(),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings of the daily renewal scheduler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Wall-clock time of day (UTC, `HH:MM`) at which the daily run starts.
    pub start_time: String,

    /// Window over which the day's jobs are spread.
    #[serde(rename = "max-duration-secs", with = "secs")]
    pub max_duration: Duration,

    /// Maximum number of renewals started per day.
    pub limit_per_day: usize,

    /// Also pick up certificates whose renewal date falls within this many days.
    pub lookahead_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            start_time: "03:00".to_owned(),
            max_duration: Duration::from_secs(6 * 3600),
            limit_per_day: 100,
            lookahead_days: 0,
        }
    }
}

impl SchedulerConfig {
    /// Parses [`start_time`](Self::start_time).
    pub fn start_time(&self) -> Result<Time> {
        Time::parse(&self.start_time, format_description!("[hour]:[minute]")).map_err(|err| {
            Error::validation("start time", format!("{:?} is not HH:MM: {err}", self.start_time))
        })
    }

    pub fn lookahead(&self) -> time::Duration {
        time::Duration::days(i64::from(self.lookahead_days))
    }
}

pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_secs)
    }
}

pub(crate) mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(de)?.map(Duration::from_secs))
    }
}
