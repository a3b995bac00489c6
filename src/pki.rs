use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::config::{CertSubject, CsrParams};
use crate::secrets::{self, DFSP_CA_KEY, SecretStore};
use crate::types::{CaChain, CsrBundle, JwsKeyPair, ServerCertBundle, ServerCertificates};

const PEM_CERT_END: &str = "-----END CERTIFICATE-----";
const SERVER_CERT_VALIDITY_DAYS: i64 = 825;

/// Certificate and key operations performed on behalf of the DFSP.
#[async_trait]
pub trait Pki: Send + Sync {
    /// Mints a self-signed CA and keeps it as the DFSP CA.
    async fn create_ca(&self, subject: &CertSubject) -> Result<CaChain>;
    /// Replaces the DFSP CA with an externally issued chain and its signing key.
    async fn set_dfsp_ca_cert_chain(&self, chain: &CaChain, private_key: &str) -> Result<()>;
    async fn get_ca(&self) -> Result<Option<CaChain>>;
    async fn create_csr(&self, params: &CsrParams) -> Result<CsrBundle>;
    /// Issues a server certificate signed by the DFSP CA for a fresh key.
    async fn create_dfsp_server_cert(&self, params: &CsrParams) -> Result<ServerCertBundle>;
    /// Signs a hub-submitted CSR with the DFSP CA and returns the certificate PEM.
    async fn sign_hub_csr(&self, csr: &str) -> Result<String>;
    async fn create_jws(&self) -> Result<JwsKeyPair>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCa {
    #[serde(flatten)]
    chain: CaChain,
    private_key: String,
}

impl StoredCa {
    /// The certificate whose key signs: the first intermediate when present, else the root.
    fn signing_cert(&self) -> &str {
        self.chain
            .intermediate_chain
            .as_deref()
            .and_then(first_pem_certificate)
            .unwrap_or(&self.chain.root_certificate)
    }

    fn issuer(&self) -> Result<Issuer<'static, KeyPair>> {
        let key = KeyPair::from_pem(&self.private_key).context("Invalid DFSP CA private key")?;
        Issuer::from_ca_cert_pem(self.signing_cert(), key).context("Invalid DFSP CA certificate")
    }
}

/// `Pki` that generates keys locally with `rcgen` and keeps the CA key in a `SecretStore`.
pub struct LocalPki {
    store: Arc<dyn SecretStore>,
}

impl LocalPki {
    #[must_use]
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    async fn stored_ca(&self) -> Result<Option<StoredCa>> {
        secrets::load(self.store.as_ref(), DFSP_CA_KEY).await
    }

    async fn require_ca(&self) -> Result<StoredCa> {
        self.stored_ca()
            .await?
            .ok_or_else(|| anyhow::anyhow!("DFSP CA is not initialized"))
    }
}

#[async_trait]
impl Pki for LocalPki {
    async fn create_ca(&self, subject: &CertSubject) -> Result<CaChain> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(subject);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().context("Failed to generate CA key")?;
        let cert = params
            .self_signed(&key)
            .context("Failed to self-sign CA certificate")?;

        let stored = StoredCa {
            chain: CaChain {
                root_certificate: cert.pem(),
                intermediate_chain: None,
            },
            private_key: key.serialize_pem(),
        };
        secrets::save(self.store.as_ref(), DFSP_CA_KEY, &stored).await?;
        info!("Created DFSP CA (CN={})", subject.common_name);
        Ok(stored.chain)
    }

    async fn set_dfsp_ca_cert_chain(&self, chain: &CaChain, private_key: &str) -> Result<()> {
        let stored = StoredCa {
            chain: chain.clone(),
            private_key: private_key.to_string(),
        };
        stored.issuer()?;
        secrets::save(self.store.as_ref(), DFSP_CA_KEY, &stored).await
    }

    async fn get_ca(&self) -> Result<Option<CaChain>> {
        Ok(self.stored_ca().await?.map(|stored| stored.chain))
    }

    async fn create_csr(&self, params: &CsrParams) -> Result<CsrBundle> {
        let mut request = certificate_params(params)?;
        request.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let key = KeyPair::generate().context("Failed to generate CSR key")?;
        let csr = request
            .serialize_request(&key)
            .context("Failed to build CSR")?
            .pem()
            .context("Failed to encode CSR")?;
        Ok(CsrBundle {
            csr,
            private_key: key.serialize_pem(),
        })
    }

    async fn create_dfsp_server_cert(&self, params: &CsrParams) -> Result<ServerCertBundle> {
        let ca = self.require_ca().await?;
        let issuer = ca.issuer()?;

        let mut request = certificate_params(params)?;
        request.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        request.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        let now = OffsetDateTime::now_utc();
        request.not_before = now;
        request.not_after = now + time::Duration::days(SERVER_CERT_VALIDITY_DAYS);

        let key = KeyPair::generate().context("Failed to generate server key")?;
        let cert = request
            .signed_by(&key, &issuer)
            .context("Failed to sign server certificate")?;

        Ok(ServerCertBundle {
            certificates: ServerCertificates {
                root_certificate: ca.chain.root_certificate,
                intermediate_chain: ca.chain.intermediate_chain,
                server_certificate: cert.pem(),
            },
            private_key: key.serialize_pem(),
        })
    }

    async fn sign_hub_csr(&self, csr: &str) -> Result<String> {
        let ca = self.require_ca().await?;
        let issuer = ca.issuer()?;
        let request =
            CertificateSigningRequestParams::from_pem(csr).context("Invalid hub CSR")?;
        let cert = request
            .signed_by(&issuer)
            .context("Failed to sign hub CSR")?;
        Ok(cert.pem())
    }

    async fn create_jws(&self) -> Result<JwsKeyPair> {
        let key = KeyPair::generate().context("Failed to generate JWS key")?;
        Ok(JwsKeyPair {
            public_key: key.public_key_pem(),
            private_key: key.serialize_pem(),
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        })
    }
}

fn certificate_params(params: &CsrParams) -> Result<CertificateParams> {
    let mut request =
        CertificateParams::new(params.hosts.clone()).context("Invalid subject alternative name")?;
    request.distinguished_name = distinguished_name(&params.subject);
    Ok(request)
}

fn distinguished_name(subject: &CertSubject) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, subject.common_name.clone());
    let optional = [
        (DnType::OrganizationName, &subject.organization),
        (DnType::OrganizationalUnitName, &subject.organizational_unit),
        (DnType::CountryName, &subject.country),
        (DnType::StateOrProvinceName, &subject.state),
        (DnType::LocalityName, &subject.locality),
    ];
    for (kind, value) in optional {
        if let Some(value) = value {
            name.push(kind, value.clone());
        }
    }
    name
}

fn first_pem_certificate(chain: &str) -> Option<&str> {
    let end = chain.find(PEM_CERT_END)? + PEM_CERT_END.len();
    let block = chain[..end].trim();
    (!block.is_empty()).then_some(block)
}

#[cfg(test)]
mod tests {
    use x509_parser::pem::parse_x509_pem;

    use super::*;
    use crate::secrets::MemorySecretStore;

    fn local_pki() -> LocalPki {
        LocalPki::new(Arc::new(MemorySecretStore::new()))
    }

    fn subject(common_name: &str) -> CertSubject {
        CertSubject {
            common_name: common_name.to_string(),
            organization: Some("Pink Bank".to_string()),
            ..CertSubject::default()
        }
    }

    fn parse_names(pem: &str) -> (String, String) {
        let (_, pem) = parse_x509_pem(pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        (cert.subject().to_string(), cert.issuer().to_string())
    }

    #[tokio::test]
    async fn test_create_ca_is_stored_and_self_signed() {
        let pki = local_pki();

        let chain = pki.create_ca(&subject("DFSP CA")).await.unwrap();

        assert_eq!(pki.get_ca().await.unwrap(), Some(chain.clone()));
        let (subject, issuer) = parse_names(&chain.root_certificate);
        assert!(subject.contains("CN=DFSP CA"));
        assert_eq!(subject, issuer);
    }

    #[tokio::test]
    async fn test_server_cert_is_signed_by_dfsp_ca() {
        let pki = local_pki();
        pki.create_ca(&subject("DFSP CA")).await.unwrap();
        let params = CsrParams {
            subject: subject("dfsp.local"),
            hosts: vec!["dfsp.local".to_string(), "10.0.0.5".to_string()],
        };

        let bundle = pki.create_dfsp_server_cert(&params).await.unwrap();

        let (subject, issuer) = parse_names(&bundle.certificates.server_certificate);
        assert!(subject.contains("CN=dfsp.local"));
        assert!(issuer.contains("CN=DFSP CA"));
        assert!(bundle.private_key.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn test_server_cert_requires_ca() {
        let pki = local_pki();
        let err = pki
            .create_dfsp_server_cert(&CsrParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("DFSP CA is not initialized"));
    }

    #[tokio::test]
    async fn test_sign_hub_csr_uses_dfsp_ca() {
        let pki = local_pki();
        pki.create_ca(&subject("DFSP CA")).await.unwrap();
        let csr = pki
            .create_csr(&CsrParams {
                subject: subject("hub-client"),
                hosts: Vec::new(),
            })
            .await
            .unwrap();

        let certificate = pki.sign_hub_csr(&csr.csr).await.unwrap();

        let (subject, issuer) = parse_names(&certificate);
        assert!(subject.contains("CN=hub-client"));
        assert!(issuer.contains("CN=DFSP CA"));
    }

    #[tokio::test]
    async fn test_set_external_ca_rejects_bad_key() {
        let pki = local_pki();
        let chain = CaChain {
            root_certificate: "not a certificate".to_string(),
            intermediate_chain: None,
        };
        assert!(
            pki.set_dfsp_ca_cert_chain(&chain, "not a key")
                .await
                .is_err()
        );
        assert!(pki.get_ca().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_external_ca_signs_with_intermediate() {
        let root_pki = local_pki();
        let root = root_pki.create_ca(&subject("Root CA")).await.unwrap();
        let intermediate_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&subject("Issuing CA"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let stored: StoredCa = secrets::load(root_pki.store.as_ref(), DFSP_CA_KEY)
            .await
            .unwrap()
            .unwrap();
        let intermediate = params
            .signed_by(&intermediate_key, &stored.issuer().unwrap())
            .unwrap();

        let pki = local_pki();
        let chain = CaChain {
            root_certificate: root.root_certificate,
            intermediate_chain: Some(intermediate.pem()),
        };
        pki.set_dfsp_ca_cert_chain(&chain, &intermediate_key.serialize_pem())
            .await
            .unwrap();
        let bundle = pki
            .create_dfsp_server_cert(&CsrParams {
                subject: subject("dfsp.local"),
                hosts: vec!["dfsp.local".to_string()],
            })
            .await
            .unwrap();

        let (_, issuer) = parse_names(&bundle.certificates.server_certificate);
        assert!(issuer.contains("CN=Issuing CA"));
        assert_eq!(bundle.certificates.intermediate_chain, chain.intermediate_chain);
    }

    #[tokio::test]
    async fn test_create_jws_returns_pem_pair() {
        let pki = local_pki();
        let jws = pki.create_jws().await.unwrap();
        assert!(jws.public_key.contains("BEGIN PUBLIC KEY"));
        assert!(jws.private_key.contains("PRIVATE KEY"));
        assert!(jws.created_at > 0);
    }

    #[test]
    fn test_first_pem_certificate_takes_leading_block() {
        let chain = "-----BEGIN CERTIFICATE-----\nA\n-----END CERTIFICATE-----\n-----BEGIN CERTIFICATE-----\nB\n-----END CERTIFICATE-----\n";
        assert_eq!(
            first_pem_certificate(chain),
            Some("-----BEGIN CERTIFICATE-----\nA\n-----END CERTIFICATE-----")
        );
        assert_eq!(first_pem_certificate("garbage"), None);
    }
}
