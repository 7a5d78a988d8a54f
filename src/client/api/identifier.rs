use std::fmt;

use serde::{Deserialize, Serialize};

/// Subject of an order or authorization. Only `dns` identifiers are ever requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub(crate) fn dns(domain: &str) -> Self {
        Self {
            kind: "dns".to_owned(),
            value: domain.to_owned(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}
