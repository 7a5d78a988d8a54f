//! Certificate private keys and certificate signing requests.

use der::asn1::Ia5String;
use eyre::{eyre, WrapErr as _};
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use serde::Deserialize;
use x509_cert::{
    builder::{Builder as _, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    request::CertReq,
};
use zeroize::Zeroizing;

const RSA_BITS: usize = 2048;

/// Algorithm of newly generated certificate keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// 2048-bit RSA, accepted by every public CA.
    #[default]
    Rsa2048,

    EcdsaP256,
}

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Private key of a certificate, owned by its record.
#[derive(Clone)]
pub enum CertKey {
    Rsa(rsa::RsaPrivateKey),
    P256(p256::ecdsa::SigningKey),
}

impl CertKey {
    pub fn generate(algorithm: KeyAlgorithm) -> eyre::Result<Self> {
        match algorithm {
            KeyAlgorithm::Rsa2048 => {
                let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
                    .context("generate RSA key")?;
                Ok(CertKey::Rsa(key))
            }
            KeyAlgorithm::EcdsaP256 => Ok(CertKey::P256(create_p256_key())),
        }
    }

    /// Reads a PKCS#8 RSA or P-256 key, or a PKCS#1 `RSA PRIVATE KEY`.
    pub fn from_pem(pem: &str) -> eyre::Result<Self> {
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(CertKey::Rsa(key));
        }

        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            return Ok(CertKey::P256(key));
        }

        rsa::RsaPrivateKey::from_pkcs1_pem(pem)
            .map(CertKey::Rsa)
            .map_err(|_| eyre!("unsupported or malformed private key PEM"))
    }

    /// The private key in PKCS#8 PEM format.
    pub fn to_pem(&self) -> eyre::Result<Zeroizing<String>> {
        let pem = match self {
            CertKey::Rsa(key) => key.to_pkcs8_pem(pem::LineEnding::LF),
            CertKey::P256(key) => key.to_pkcs8_pem(pem::LineEnding::LF),
        };

        pem.context("encode private key")
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            CertKey::Rsa(_) => KeyAlgorithm::Rsa2048,
            CertKey::P256(_) => KeyAlgorithm::EcdsaP256,
        }
    }

    /// Creates a CSR with `domains` and signs it with this key.
    ///
    /// The first item of `domains` is picked for the CSR's Common Name (CN). All domains are added
    /// to a Subject Alternative Name (SAN) extension.
    pub(crate) fn create_csr(&self, domains: &[String]) -> eyre::Result<CertReq> {
        let primary_domain = domains
            .first()
            .ok_or_else(|| eyre!("CSR needs at least one domain"))?;

        let subject = format!("CN={primary_domain}")
            .parse::<Name>()
            .context("CSR subject")?;

        let san = SubjectAltName(
            domains
                .iter()
                .map(|domain| Ia5String::new(domain).map(GeneralName::DnsName))
                .collect::<Result<_, _>>()
                .context("CSR subject alternative names")?,
        );

        match self {
            CertKey::Rsa(key) => {
                let signer = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(key.clone());
                let mut csr = CsrBuilder::new(subject, &signer).context("CSR builder")?;
                csr.add_extension(&san).context("add SAN extension")?;
                csr.build::<rsa::pkcs1v15::Signature>()
                    .context("build csr")
            }
            CertKey::P256(signer) => {
                let mut csr = CsrBuilder::new(subject, signer).context("CSR builder")?;
                csr.add_extension(&san).context("add SAN extension")?;
                csr.build::<p256::ecdsa::DerSignature>()
                    .context("build csr")
            }
        }
    }
}

impl std::fmt::Debug for CertKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CertKey").field(&self.algorithm()).finish()
    }
}
