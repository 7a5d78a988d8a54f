//! ACME account resolution.
//!
//! An account goes from unregistered to registered exactly once. After that its key and
//! registration are only ever read back from the store.

use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::{
    client::{AccountKey, AcmeClient, Registration},
    config::ExternalAccountBinding,
    store::{AcmeUserStore, StoreError, StoredAccount},
    Error, Result,
};

/// How requests are mapped onto ACME accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UserScheme {
    /// One account per certificate key.
    #[default]
    PerKey,

    /// One account per requesting user.
    PerUser,

    /// A single account shared by every certificate.
    Singleton { user: String },
}

impl UserScheme {
    /// The ACME user owning `key_name` when requested by `requester`.
    pub fn acme_user(&self, key_name: &str, requester: &str) -> String {
        match self {
            UserScheme::PerKey => key_name.to_owned(),
            UserScheme::PerUser => requester.to_owned(),
            UserScheme::Singleton { user } => user.clone(),
        }
    }
}

/// A registered ACME account.
#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: String,

    /// Carries the account URL as key ID.
    pub key: AccountKey,

    pub registration: Registration,
}

impl Account {
    fn new(user_id: &str, key: AccountKey, registration: Registration) -> Self {
        Account {
            user_id: user_id.to_owned(),
            key: key.with_key_id(&registration.uri),
            registration,
        }
    }

    fn from_stored(stored: &StoredAccount) -> eyre::Result<Self> {
        let key = AccountKey::from_pem(&stored.private_key)?;
        let registration = serde_json::from_str::<Registration>(&stored.registration)?;
        Ok(Account::new(&stored.user_id, key, registration))
    }
}

/// Loads ACME accounts of one CA, registering them on first use.
pub struct AccountManager {
    ca_id: String,
    users: Arc<dyn AcmeUserStore>,
    client: Arc<dyn AcmeClient>,
    external_account: Option<ExternalAccountBinding>,
}

impl AccountManager {
    pub fn new(
        ca_id: impl Into<String>,
        users: Arc<dyn AcmeUserStore>,
        client: Arc<dyn AcmeClient>,
        external_account: Option<ExternalAccountBinding>,
    ) -> Self {
        Self {
            ca_id: ca_id.into(),
            users,
            client,
            external_account,
        }
    }

    /// Returns the account of `acme_user`, registering it with `email` as contact if it does not
    /// exist yet.
    ///
    /// Revocation needs an existing account: with `for_revocation` set, a missing account is
    /// [`Error::NotFound`] instead of a registration.
    pub async fn init_user(
        &self,
        acme_user: &str,
        email: &str,
        for_revocation: bool,
    ) -> Result<Account> {
        let session = self.users.session().await?;

        if let Some(stored) = session.get_by_id(acme_user, &self.ca_id).await? {
            log::debug!("using existing ACME account of {acme_user} at {}", self.ca_id);
            return Account::from_stored(&stored)
                .map_err(|err| Error::external(format!("load ACME account of {acme_user}"), err));
        }

        if for_revocation {
            return Err(Error::not_found("ACME account", acme_user));
        }

        log::info!("registering ACME account for {acme_user} at {}", self.ca_id);

        let key = AccountKey::generate();
        let registration = self
            .client
            .register(&key, email, self.external_account.as_ref())
            .await
            .map_err(|err| Error::external(format!("register ACME account of {acme_user}"), err))?;

        let stored = StoredAccount {
            user_id: acme_user.to_owned(),
            ca_id: self.ca_id.clone(),
            private_key: key
                .to_pem()
                .map_err(|err| Error::external("encode account key", err))?,
            registration: serde_json::to_string(&registration)
                .map_err(|err| Error::external("encode registration", err.into()))?,
            created: OffsetDateTime::now_utc(),
        };

        match session.put(&stored).await {
            Ok(()) => Ok(Account::new(acme_user, key, registration)),

            // a concurrent call registered the same user first; use the stored account
            Err(StoreError::AlreadyExists(_)) => {
                log::debug!("ACME account of {acme_user} was registered concurrently");
                let stored = session
                    .get_by_id(acme_user, &self.ca_id)
                    .await?
                    .ok_or_else(|| Error::not_found("ACME account", acme_user))?;
                Account::from_stored(&stored).map_err(|err| {
                    Error::external(format!("load ACME account of {acme_user}"), err)
                })
            }

            Err(err) => Err(err.into()),
        }
    }

    /// Removes the stored account of `acme_user`. Returns false if there was none.
    pub async fn delete_user(&self, acme_user: &str) -> Result<bool> {
        let session = self.users.session().await?;

        match session.delete(acme_user, &self.ca_id).await {
            Ok(()) => {
                log::info!("deleted ACME account of {acme_user} at {}", self.ca_id);
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
