use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::client::RevocationReason;

/// Certificate revocation request.
///
/// See [RFC 8555 §7.6](https://datatracker.ietf.org/doc/html/rfc8555#section-7.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    /// The certificate to be revoked, base64url-encoded DER.
    pub certificate: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<u8>,
}

impl Revocation {
    pub(crate) fn new(certificate_der: &[u8], reason: RevocationReason) -> Self {
        Self {
            certificate: BASE64_URL_SAFE_NO_PAD.encode(certificate_der),
            reason: reason.code(),
        }
    }
}
