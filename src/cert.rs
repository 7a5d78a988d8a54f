//! Issued certificate parsing and chain handling.

use der::{Decode as _, DecodePem as _, EncodePem as _};
use eyre::{eyre, WrapErr as _};
use time::OffsetDateTime;
use x509_cert::Certificate;

use crate::{Error, Result};

/// Validity window of a leaf certificate, as stated by the certificate itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

/// Reads `notBefore` and `notAfter` of the first certificate in `pem`.
pub fn leaf_validity(pem: &str) -> eyre::Result<Validity> {
    let chain = Certificate::load_pem_chain(pem.as_bytes()).context("parse certificate PEM")?;
    let leaf = chain.first().ok_or_else(|| eyre!("no certificates in chain"))?;

    let validity = &leaf.tbs_certificate.validity;

    Ok(Validity {
        not_before: OffsetDateTime::UNIX_EPOCH + validity.not_before.to_unix_duration(),
        not_after: OffsetDateTime::UNIX_EPOCH + validity.not_after.to_unix_duration(),
    })
}

/// Splits a PEM chain as downloaded from the CA into the leaf certificate and the issuer chain.
///
/// The CA sends the end-entity certificate first.
pub fn split_chain(pem: &str) -> eyre::Result<(String, String)> {
    let chain = Certificate::load_pem_chain(pem.as_bytes()).context("parse certificate chain")?;

    let mut certs = chain
        .iter()
        .map(|cert| cert.to_pem(pem::LineEnding::LF))
        .collect::<Result<Vec<_>, _>>()
        .context("encode certificate")?
        .into_iter();

    let certificate = certs
        .next()
        .ok_or_else(|| eyre!("no certificates in chain"))?;

    Ok((certificate, certs.collect::<String>()))
}

/// Concatenates a certificate and its issuer chain.
pub fn fullchain(certificate: &str, issuer: &str) -> String {
    format!("{certificate}\n{issuer}")
}

fn is_self_signed(cert: &Certificate) -> bool {
    cert.tbs_certificate.issuer == cert.tbs_certificate.subject
}

/// Completes `issuer` with a root certificate fetched from the first working URL in `urls`.
///
/// The chain is returned unchanged when no URLs are configured or when it already ends in a
/// self-signed certificate. Responses may be PEM or DER; the appended root is always PEM.
pub async fn append_root_certificate(
    http: &reqwest::Client,
    issuer: &str,
    urls: &[String],
) -> Result<String> {
    if urls.is_empty() {
        return Ok(issuer.to_owned());
    }

    if !issuer.trim().is_empty() {
        let chain = Certificate::load_pem_chain(issuer.as_bytes())
            .map_err(|err| Error::external("parse issuer chain", err.into()))?;

        if chain.iter().any(is_self_signed) {
            log::debug!("issuer chain already contains a root certificate");
            return Ok(issuer.to_owned());
        }
    }

    for url in urls {
        match fetch_root_certificate(http, url).await {
            Ok(root) => {
                log::debug!("appending root certificate from {url}");
                return Ok(format!("{issuer}\n{root}"));
            }
            Err(err) => log::warn!("failed to fetch root certificate from {url}: {err:#}"),
        }
    }

    Err(Error::ChainIncomplete {
        urls: urls.to_vec(),
    })
}

async fn fetch_root_certificate(http: &reqwest::Client, url: &str) -> eyre::Result<String> {
    let body = http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    let is_pem = std::str::from_utf8(&body).is_ok_and(|text| text.contains("-----BEGIN"));

    let cert = if is_pem {
        Certificate::from_pem(&body).context("parse PEM root certificate")?
    } else {
        Certificate::from_der(&body).context("parse DER root certificate")?
    };

    cert.to_pem(pem::LineEnding::LF)
        .context("encode root certificate")
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::test::{self, TestCa};

    fn whole_seconds(at: OffsetDateTime) -> OffsetDateTime {
        at.replace_nanosecond(0).unwrap()
    }

    #[test]
    fn validity_comes_from_the_leaf() {
        let ca = TestCa::new();
        let not_before = whole_seconds(OffsetDateTime::now_utc() - Duration::days(1));
        let not_after = not_before + Duration::days(90);

        let chain = ca.issue(&["example.com".to_owned()], not_before, not_after);

        let validity = leaf_validity(&chain).unwrap();
        assert_eq!(validity.not_before, not_before);
        assert_eq!(validity.not_after, not_after);
    }

    #[test]
    fn split_chain_separates_leaf_and_issuer() {
        let ca = TestCa::new();
        let now = whole_seconds(OffsetDateTime::now_utc());
        let chain = ca.issue(&["example.com".to_owned()], now, now + Duration::days(30));

        let (certificate, issuer) = split_chain(&chain).unwrap();
        assert_eq!(
            Certificate::load_pem_chain(certificate.as_bytes()).unwrap().len(),
            1
        );
        assert_eq!(
            Certificate::load_pem_chain(issuer.as_bytes()).unwrap().len(),
            1
        );
        assert_eq!(leaf_validity(&certificate).unwrap().not_before, now);

        let full = fullchain(&certificate, &issuer);
        assert_eq!(full, format!("{certificate}\n{issuer}"));
        assert!(split_chain("garbage").is_err());
    }

    #[tokio::test]
    async fn root_is_appended_from_first_working_url() {
        let server = test::with_directory_server();
        let http = reqwest::Client::new();
        let issuer = server.ca.intermediate_pem();

        let urls = vec![
            format!("{}/missing.pem", server.url),
            format!("{}/root.pem", server.url),
        ];
        let chain = append_root_certificate(&http, &issuer, &urls).await.unwrap();
        assert_eq!(chain, format!("{issuer}\n{}", server.ca.root_pem()));

        let urls = vec![format!("{}/root.der", server.url)];
        let chain = append_root_certificate(&http, &issuer, &urls).await.unwrap();
        let certs = Certificate::load_pem_chain(chain.as_bytes()).unwrap();
        assert_eq!(certs.len(), 2);
        assert!(is_self_signed(&certs[1]));
    }

    #[tokio::test]
    async fn root_appending_edge_cases() {
        let server = test::with_directory_server();
        let http = reqwest::Client::new();
        let issuer = server.ca.intermediate_pem();

        let unchanged = append_root_certificate(&http, &issuer, &[]).await.unwrap();
        assert_eq!(unchanged, issuer);

        let with_root = format!("{issuer}{}", server.ca.root_pem());
        let urls = vec![format!("{}/root.pem", server.url)];
        let unchanged = append_root_certificate(&http, &with_root, &urls)
            .await
            .unwrap();
        assert_eq!(unchanged, with_root);

        let urls = vec![
            format!("{}/missing.pem", server.url),
            format!("{}/also-missing.pem", server.url),
        ];
        let err = append_root_certificate(&http, &issuer, &urls)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChainIncomplete { urls: failed } if failed == urls));
    }
}
