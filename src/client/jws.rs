//! See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use eyre::{eyre, WrapErr as _};
use hmac::{Hmac, Mac as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{client::key::AccountKey, config::ExternalAccountBinding};

/// JWS Protected Header as defined in [RFC 8555 §6.2].
///
/// newAccount requests carry the account's public key in `jwk`. Every later request carries the
/// account URL in `kid` instead.
///
/// [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtectedHeader {
    alg: String,

    /// Replay protection, see [RFC 8555 §6.5].
    ///
    /// Absent only in the inner JWS of an external account binding.
    ///
    /// [RFC 8555 §6.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.5
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,

    url: String,

    /// Mutually exclusive with `kid` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    /// Mutually exclusive with `jwk` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce: Some(nonce),
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce: Some(nonce),
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }

    fn new_eab(key_id: &str, url: &str) -> Self {
        JwsProtectedHeader {
            alg: "HS256".to_owned(),
            url: url.to_owned(),
            kid: Some(key_id.to_owned()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

impl TryFrom<&AccountKey> for Jwk {
    type Error = eyre::Error;

    fn try_from(key: &AccountKey) -> eyre::Result<Self> {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        let x = point.x().ok_or_else(|| eyre!("public key has no x coordinate"))?;
        let y = point.y().ok_or_else(|| eyre!("public key has no y coordinate"))?;

        Ok(Jwk {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        })
    }
}

/// Required members of the JWK in lexical order, as hashed for the thumbprint (RFC 7638).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct JwkThumb {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(a: &Jwk) -> Self {
        JwkThumb {
            crv: a.crv.clone(),
            kty: a.kty.clone(),
            x: a.x.clone(),
            y: a.y.clone(),
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

impl FlattenedJsonJws {
    pub(crate) fn new(protected: String, payload: String, signature: String) -> Self {
        FlattenedJsonJws {
            protected,
            payload,
            signature,
        }
    }
}

/// Key authorization of a challenge token: `token || '.' || base64url(thumbprint(accountKey))`.
///
/// See [RFC 8555 §8.1](https://datatracker.ietf.org/doc/html/rfc8555#section-8.1).
pub(crate) fn key_authorization(token: &str, key: &AccountKey) -> eyre::Result<String> {
    let jwk = Jwk::try_from(key)?;
    let jwk_thumb = JwkThumb::from(&jwk);
    let jwk_json = serde_json::to_string(&jwk_thumb)?;

    let digest = BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(jwk_json));

    Ok(format!("{token}.{digest}"))
}

/// Builds the `externalAccountBinding` member of a newAccount request.
///
/// The account's public key is signed with the CA-issued HMAC key so the CA can tie the new
/// account to an existing customer. See
/// [RFC 8555 §7.3.4](https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.4).
pub(crate) fn external_account_binding(
    eab: &ExternalAccountBinding,
    key: &AccountKey,
    new_account_url: &str,
) -> eyre::Result<serde_json::Value> {
    let hmac_key = BASE64_URL_SAFE_NO_PAD
        .decode(eab.hmac_key.trim_end_matches('='))
        .context("decode EAB HMAC key")?;

    let protected = {
        let header = JwsProtectedHeader::new_eab(&eab.key_id, new_account_url);
        BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(&header)?)
    };

    let payload = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(&Jwk::try_from(key)?)?);

    let mut mac = Hmac::<Sha256>::new_from_slice(&hmac_key)
        .map_err(|_| eyre!("invalid EAB HMAC key length"))?;
    mac.update(format!("{protected}.{payload}").as_bytes());
    let signature = BASE64_URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(serde_json::to_value(FlattenedJsonJws::new(
        protected, payload, signature,
    ))?)
}
