use eyre::{eyre, WrapErr as _};
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use zeroize::Zeroizing;

/// ECDSA P-256 key of an ACME account.
///
/// Signs every request to the CA. The key ID is the account URL handed out at registration and
/// is only known afterwards.
#[derive(Clone)]
pub struct AccountKey {
    signing_key: p256::ecdsa::SigningKey,

    /// Set once we contacted the ACME API to figure out the key ID.
    key_id: Option<String>,
}

impl AccountKey {
    pub fn generate() -> AccountKey {
        Self::from_key(crate::key::create_p256_key())
    }

    pub fn from_pem(pem: &str) -> eyre::Result<AccountKey> {
        let signing_key = ecdsa::SigningKey::<p256::NistP256>::from_pkcs8_pem(pem)
            .context("read account key PEM")?;
        Ok(Self::from_key(signing_key))
    }

    fn from_key(signing_key: p256::ecdsa::SigningKey) -> AccountKey {
        AccountKey {
            signing_key,
            key_id: None,
        }
    }

    pub fn to_pem(&self) -> eyre::Result<Zeroizing<String>> {
        self.signing_key
            .to_pkcs8_pem(pem::LineEnding::LF)
            .context("encode account key")
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }

    pub(crate) fn key_id(&self) -> eyre::Result<&str> {
        self.key_id
            .as_deref()
            .ok_or_else(|| eyre!("account key has no key ID; register the account first"))
    }

    pub(crate) fn with_key_id(mut self, kid: impl Into<String>) -> Self {
        self.key_id = Some(kid.into());
        self
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
