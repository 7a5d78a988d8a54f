use std::{collections::VecDeque, sync::Arc};

use base64::prelude::*;
use ecdsa::signature::Signer as _;
use eyre::{eyre, WrapErr as _};
use parking_lot::Mutex;
use serde::Serialize;

use crate::client::{
    jws::{FlattenedJsonJws, Jwk, JwsProtectedHeader},
    key::AccountKey,
    req::{req_expect_header, req_handle_error, req_head, req_post},
};

/// Give up on a request after this many rejected nonces in a row.
const MAX_NONCE_RETRIES: usize = 5;

/// Nonces kept around for reuse.
const NONCE_POOL_SIZE: usize = 10;

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against newAccount url
/// 3. `AccountKey::with_key_id` from the returned `Location` header.
/// 4. `call_kid()` for all calls after that.
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    http: reqwest::Client,
    account_key: AccountKey,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub(crate) fn new(
        http: reqwest::Client,
        nonce_pool: Arc<NoncePool>,
        account_key: AccountKey,
    ) -> Self {
        Transport {
            http,
            account_key,
            nonce_pool,
        }
    }

    /// The key used in the transport
    pub(crate) fn account_key(&self) -> &AccountKey {
        &self.account_key
    }

    /// Make call using the full JWS.
    ///
    /// Only needed for the newAccount request.
    pub(crate) async fn call_jwk<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        fn jws_with_jwk<T: Serialize + ?Sized>(
            url: &str,
            nonce: String,
            key: &AccountKey,
            payload: &T,
        ) -> eyre::Result<String> {
            let jwk = Jwk::try_from(key)?;
            let protected = JwsProtectedHeader::new_jwk(jwk, url, nonce);
            jws_with(protected, key, payload)
        }

        self.do_call(url, body, jws_with_jwk).await
    }

    /// Make call using the key ID.
    pub(crate) async fn call_kid<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        fn jws_with_kid<T: Serialize + ?Sized>(
            url: &str,
            nonce: String,
            key: &AccountKey,
            payload: &T,
        ) -> eyre::Result<String> {
            let protected = JwsProtectedHeader::new_kid(key.key_id()?, url, nonce);
            jws_with(protected, key, payload)
        }

        self.do_call(url, body, jws_with_kid).await
    }

    async fn do_call<T, F>(
        &self,
        url: &str,
        body: &T,
        make_body: F,
    ) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
        F: Fn(&str, String, &AccountKey, &T) -> eyre::Result<String>,
    {
        let mut attempt = 0;

        // The ACME API may at any point invalidate all nonces. If we detect such an
        // error, we retry with a fresh nonce.
        loop {
            attempt += 1;

            // Either get a new nonce, or reuse one from a previous request.
            let nonce = self.nonce_pool.get_nonce(&self.http).await?;

            let signed = make_body(url, nonce, &self.account_key, body)?;

            log::debug!("Call endpoint: {url}");

            let response = req_post(&self.http, url, signed).await?;

            // Regardless of the request being a success or not, there might be a nonce in the
            // response.
            self.nonce_pool.extract_nonce(&response);

            match req_handle_error(response).await {
                Ok(response) => return Ok(response),

                Err(problem)
                    if (problem.is_bad_nonce() || problem.is_jws_verification_error())
                        && attempt < MAX_NONCE_RETRIES =>
                {
                    log::debug!("Retrying {url} on: {problem}");
                }

                Err(problem) => return Err(eyre::Report::from(problem)).wrap_err(url.to_owned()),
            }
        }
    }
}

/// Shared pool of nonces.
#[derive(Default, Debug)]
pub(crate) struct NoncePool {
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub(crate) fn new(nonce_url: &str) -> Self {
        NoncePool {
            nonce_url: nonce_url.to_owned(),
            ..Default::default()
        }
    }

    fn extract_nonce(&self, res: &reqwest::Response) {
        let Some(nonce) = res
            .headers()
            .get("replay-nonce")
            .and_then(|value| value.to_str().ok())
            .filter(|nonce| is_valid_nonce(nonce))
        else {
            return;
        };

        log::trace!("Extracting new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce.to_owned());

        if pool.len() > NONCE_POOL_SIZE {
            pool.pop_front();
        }
    }

    async fn get_nonce(&self, http: &reqwest::Client) -> eyre::Result<String> {
        {
            let mut pool = self.pool.lock();

            if let Some(nonce) = pool.pop_front() {
                log::trace!("Use previous nonce");
                return Ok(nonce);
            }
        }

        log::debug!("Request new nonce");
        let res = req_head(http, &self.nonce_url).await?;

        let nonce = req_expect_header(&res, "replay-nonce")?;

        if !is_valid_nonce(&nonce) {
            return Err(eyre!("server sent malformed nonce {nonce:?}"));
        }

        Ok(nonce)
    }
}

/// Nonces must be base64url without padding, see
/// [RFC 8555 §6.5.1](https://datatracker.ietf.org/doc/html/rfc8555#section-6.5.1).
fn is_valid_nonce(nonce: &str) -> bool {
    !nonce.is_empty()
        && nonce
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Construct JWS with protected header according to [RFC 7515 §5.1].
///
/// [RFC 7515 §5.1]: https://datatracker.ietf.org/doc/html/rfc7515#section-5.1
fn jws_with<T: Serialize + ?Sized>(
    protected: JwsProtectedHeader,
    key: &AccountKey,
    payload: &T,
) -> eyre::Result<String> {
    let header = {
        let pro_json = serde_json::to_string(&protected)?;
        BASE64_URL_SAFE_NO_PAD.encode(pro_json)
    };

    let payload = {
        let payload_json = serde_json::to_string(payload)?;

        // POST-as-GET sends an empty payload, which must not be encoded again
        if payload_json == "\"\"" {
            String::new()
        } else {
            BASE64_URL_SAFE_NO_PAD.encode(payload_json)
        }
    };

    let to_sign = format!("{header}.{payload}");
    let signature: p256::ecdsa::Signature = key
        .signing_key()
        .try_sign(to_sign.as_bytes())
        .context("sign JWS")?;

    let signature = BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes());

    let jws = FlattenedJsonJws::new(header, payload, signature);

    Ok(serde_json::to_string(&jws)?)
}
