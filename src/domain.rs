//! Key name and domain name syntax.

use crate::{Error, Result};

/// Record name prefix of DNS-01 challenges.
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

const MAX_KEY_NAME_LEN: usize = 255;
const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Checks a key name against `[A-Za-z0-9._-]{1,255}`.
pub fn validate_key_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_KEY_NAME_LEN {
        return Err(Error::validation(
            "key name",
            format!("length must be between 1 and {MAX_KEY_NAME_LEN}"),
        ));
    }

    match name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        Some(c) => Err(Error::validation(
            "key name",
            format!("{name:?} contains forbidden character {c:?}"),
        )),
        None => Ok(()),
    }
}

/// Checks that `domain` is a fully qualified domain name, optionally a wildcard.
///
/// A single trailing dot is accepted. The wildcard label `*` may only appear as the first label.
pub fn validate_domain(domain: &str) -> Result<()> {
    let invalid = |reason: &str| Error::validation("domain", format!("{domain:?}: {reason}"));

    let name = domain.strip_suffix('.').unwrap_or(domain);
    let name = name.strip_prefix("*.").unwrap_or(name);

    if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
        return Err(invalid("length must be between 1 and 253"));
    }

    let mut labels = 0;

    for label in name.split('.') {
        labels += 1;

        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid("labels must be between 1 and 63 characters"));
        }

        if label == "*" {
            return Err(invalid("wildcard is only allowed as the first label"));
        }

        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("labels may only contain letters, digits and hyphens"));
        }

        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels may not start or end with a hyphen"));
        }
    }

    if labels < 2 {
        return Err(invalid("must have at least two labels"));
    }

    Ok(())
}

/// Strips trailing dots, keeping the order of the list.
pub fn sanitize_domains<I, S>(domains: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    domains
        .into_iter()
        .map(|domain| domain.as_ref().trim_end_matches('.').to_owned())
        .collect()
}

/// Returns the domain without its wildcard label.
///
/// DNS-01 challenges for `*.example.com` are answered at `example.com`.
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// Builds the absolute name of the challenge TXT record, e.g. `_acme-challenge.example.com.`.
pub fn challenge_record_fqdn(domain: &str) -> String {
    let domain = normalize_domain(domain).trim_end_matches('.');
    format!("{ACME_CHALLENGE_LABEL}.{domain}.")
}
