use std::sync::Arc;

use crate::{
    challenge::{DnsProvider, ProviderLookup},
    domain::normalize_domain,
    Error, Result,
};

/// A DNS zone served by one provider.
#[derive(Clone)]
pub struct RootZone {
    pub name: String,
    pub provider: Arc<dyn DnsProvider>,

    /// CAs allowed to issue for names in this zone. Empty allows every CA.
    pub allowed_cas: Vec<String>,
}

impl RootZone {
    fn contains(&self, domain: &str) -> bool {
        domain == self.name
            || domain
                .strip_suffix(&self.name)
                .is_some_and(|prefix| prefix.ends_with('.'))
    }
}

/// Maps domains to providers by the most specific enclosing zone.
#[derive(Clone, Default)]
pub struct RootZones {
    zones: Vec<RootZone>,
}

impl RootZones {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zone(
        mut self,
        name: &str,
        provider: Arc<dyn DnsProvider>,
        allowed_cas: Vec<String>,
    ) -> Self {
        self.zones.push(RootZone {
            name: name.trim_end_matches('.').to_ascii_lowercase(),
            provider,
            allowed_cas,
        });
        self
    }

    pub fn find(&self, domain: &str) -> Option<&RootZone> {
        let domain = normalize_domain(domain)
            .trim_end_matches('.')
            .to_ascii_lowercase();

        self.zones
            .iter()
            .filter(|zone| zone.contains(&domain))
            .max_by_key(|zone| zone.name.len())
    }
}

impl ProviderLookup for RootZones {
    fn provider_for(&self, domain: &str, ca_id: &str) -> Result<Arc<dyn DnsProvider>> {
        let zone = self
            .find(domain)
            .ok_or_else(|| Error::not_found("DNS zone", domain))?;

        if !zone.allowed_cas.is_empty() && !zone.allowed_cas.iter().any(|ca| ca == ca_id) {
            return Err(Error::validation(
                "CA",
                format!("{ca_id} may not issue certificates in zone {}", zone.name),
            ));
        }

        Ok(Arc::clone(&zone.provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::FakeDns;

    fn zones() -> RootZones {
        let dns = FakeDns::default();
        RootZones::new()
            .with_zone("example.com", Arc::new(dns.provider("outer")), Vec::new())
            .with_zone(
                "internal.example.com.",
                Arc::new(dns.provider("inner")),
                vec!["private-ca".to_owned()],
            )
    }

    #[test]
    fn longest_suffix_wins() {
        let zones = zones();

        assert_eq!(zones.find("example.com").unwrap().name, "example.com");
        assert_eq!(zones.find("*.example.com").unwrap().name, "example.com");
        assert_eq!(zones.find("WWW.Example.com.").unwrap().name, "example.com");
        assert_eq!(
            zones.find("host.internal.example.com").unwrap().name,
            "internal.example.com"
        );
        assert!(zones.find("badexample.com").is_none());
        assert!(zones.find("example.org").is_none());
    }

    #[test]
    fn provider_respects_allowed_cas() {
        let zones = zones();

        let provider = zones.provider_for("www.example.com", "letsencrypt").unwrap();
        assert_eq!(provider.name(), "outer");

        let provider = zones
            .provider_for("db.internal.example.com", "private-ca")
            .unwrap();
        assert_eq!(provider.name(), "inner");

        let err = zones
            .provider_for("db.internal.example.com", "letsencrypt")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation { field: "CA", .. }));

        let err = zones.provider_for("example.net", "letsencrypt").err().unwrap();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
