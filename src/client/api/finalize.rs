use base64::prelude::*;
use serde::{Deserialize, Serialize};

/// Finalize request carrying the signed CSR.
///
/// See [RFC 8555 §7.4](https://datatracker.ietf.org/doc/html/rfc8555#section-7.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalize {
    /// CSR in base64url-encoded DER (not PEM).
    pub csr: String,
}

impl Finalize {
    pub(crate) fn from_der(csr_der: &[u8]) -> Self {
        Self {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
        }
    }
}
