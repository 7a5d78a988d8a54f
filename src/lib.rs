//! Issuing and renewing certificates from ACME (Automatic Certificate Management Environment)
//! providers such as [Let's Encrypt](https://letsencrypt.org/), proving domain control with
//! [DNS-01 challenges](https://datatracker.ietf.org/doc/html/rfc8555#section-8.4).
//!
//! # Usage
//!
//! An [`Engine`] manages the certificates of one CA. It is assembled from collaborators:
//!
//! - a certificate store and an ACME account store (see [`store`]; [`MemoryStore`] implements
//!   both);
//! - an [`AcmeClient`], usually [`HttpAcmeClient`];
//! - a [`ProviderLookup`] mapping domains to [`DnsProvider`]s, e.g. [`RootZones`];
//! - a [`TxtResolver`] for propagation checks, usually [`HickoryTxtResolver`].
//!
//! [`Engine::trigger_update`] then issues a certificate for a new key and renews an existing one
//! once its renewal date is reached. Calling it earlier is refused with
//! [`Error::NoRenewalDue`], which callers should treat as "nothing to do".
//!
//! A [`Scheduler`] fed by [`RenewalJobs`] runs the renewals of all due certificates once a day.
//!
//! # Renewal Date
//!
//! A certificate is renewed [`days_renew_before_expiry`] days before it expires. The date is
//! stored with the certificate and may be moved by an operator; with [`recalc_renewal_date`] set
//! it is instead always derived from the certificate's expiry.
//!
//! Changing the domains or the ACME user of a certificate renews it immediately.
//!
//! # Rate Limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being abused.
//! The scheduler spreads a day's renewals over [`max_duration`] for this reason; keep it generous.
//!
//! ## Use Staging For Development!
//!
//! Especially take care to use the Let's Encrypt staging environment for development where the rate
//! limits are more relaxed. See [`ClientConfig::directory_url`].
//!
//! [`days_renew_before_expiry`]: EngineConfig::days_renew_before_expiry
//! [`recalc_renewal_date`]: EngineConfig::recalc_renewal_date
//! [`max_duration`]: SchedulerConfig::max_duration
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod account;
mod engine;
mod error;
mod scheduler;

pub mod cert;
pub mod challenge;
pub mod client;
pub mod config;
pub mod domain;
pub mod key;
pub mod store;

#[cfg(test)]
mod test;

pub use crate::{
    account::{Account, AccountManager, UserScheme},
    challenge::{
        ChallengePresenter, DnsProvider, HickoryTxtResolver, PrecheckConfig, ProviderLookup,
        RootZones, TxtResolver,
    },
    client::{AcmeClient, Dns01Solver, HttpAcmeClient, RevocationReason},
    config::{ClientConfig, EngineConfig, ExternalAccountBinding, SchedulerConfig, TtlPolicy},
    engine::{Engine, UpdateKind, UpdateOutcome, UpdateRequest},
    error::{Error, Result},
    key::{CertKey, KeyAlgorithm},
    scheduler::{until_next_start, JobSource, RenewalJobs, RunSummary, Scheduler},
    store::{CertificateRecord, IssuedBy, MemoryStore, Resource},
};
