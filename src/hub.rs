use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::types::{
    CaChain, ClientEnrollment, EndpointDeclaration, EndpointRecord, HubCertRequest, JwsEntry,
    ServerCertificates,
};

/// Calls against the central hub registry made on behalf of one DFSP.
#[async_trait]
pub trait HubApi: Send + Sync {
    async fn get_hub_ca(&self) -> Result<Option<CaChain>>;
    async fn upload_dfsp_ca(&self, ca: &CaChain) -> Result<()>;
    /// Latest outbound enrollment, if this DFSP ever submitted a CSR.
    async fn get_client_certificate(&self) -> Result<Option<ClientEnrollment>>;
    async fn upload_csr(&self, csr: &str) -> Result<()>;
    async fn upload_server_certificates(&self, certificates: &ServerCertificates) -> Result<()>;
    /// Hub client-certificate requests that still wait for this DFSP's signature.
    async fn get_unprocessed_certs(&self) -> Result<Vec<HubCertRequest>>;
    async fn upload_signed_hub_certificate(&self, id: u64, certificate: &str) -> Result<()>;
    async fn get_all_jws_certificates(&self) -> Result<Vec<JwsEntry>>;
    async fn upload_dfsp_jws(&self, public_key: &str, created_at: i64) -> Result<()>;
    async fn upload_external_dfsp_jws(&self, entry: &JwsEntry) -> Result<()>;
    async fn find_all_endpoints(&self) -> Result<Vec<EndpointRecord>>;
    async fn create_endpoint(&self, declaration: &EndpointDeclaration) -> Result<()>;
    async fn update_endpoint(&self, id: u64, declaration: &EndpointDeclaration) -> Result<()>;
    async fn delete_endpoint(&self, id: u64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HubClient {
    base_url: String,
    dfsp_id: String,
    client: Client,
    auth_token: Option<String>,
}

impl HubClient {
    /// Creates a hub client for `dfsp_id`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        dfsp_id: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build hub HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            dfsp_id: dfsp_id.to_string(),
            client,
            auth_token,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn dfsp_path(&self, path: &str) -> String {
        format!("dfsps/{}/{path}", self.dfsp_id)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, self.endpoint(path));
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Hub resource not found: {path}"))
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .with_context(|| format!("Hub request failed: GET {path}"))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response
            .text()
            .await
            .context("Failed to read hub response body")?;
        if !status.is_success() {
            anyhow::bail!("Hub API error ({status}) on GET {path}: {text}");
        }
        serde_json::from_str(&text)
            .map(Some)
            .with_context(|| format!("Failed to parse hub response: GET {path}"))
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<()> {
        let response = self
            .request(method.clone(), path)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Hub request failed: {method} {path}"))?;
        Self::check_status(response, &method, path).await
    }

    async fn check_status(response: reqwest::Response, method: &Method, path: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("Hub API error ({status}) on {method} {path}: {text}");
    }
}

#[async_trait]
impl HubApi for HubClient {
    async fn get_hub_ca(&self) -> Result<Option<CaChain>> {
        self.get_optional("hub/ca").await
    }

    async fn upload_dfsp_ca(&self, ca: &CaChain) -> Result<()> {
        self.send_json(Method::POST, &self.dfsp_path("ca"), ca).await
    }

    async fn get_client_certificate(&self) -> Result<Option<ClientEnrollment>> {
        let enrollments: Vec<ClientEnrollment> = self
            .get_optional(&self.dfsp_path("enrollments/outbound"))
            .await?
            .unwrap_or_default();
        Ok(enrollments.into_iter().max_by_key(|enrollment| enrollment.id))
    }

    async fn upload_csr(&self, csr: &str) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct CsrRequest<'a> {
            client_csr: &'a str,
        }
        self.send_json(
            Method::POST,
            &self.dfsp_path("enrollments/outbound/csr"),
            &CsrRequest { client_csr: csr },
        )
        .await
    }

    async fn upload_server_certificates(&self, certificates: &ServerCertificates) -> Result<()> {
        self.send_json(Method::POST, &self.dfsp_path("servercerts"), certificates)
            .await
    }

    async fn get_unprocessed_certs(&self) -> Result<Vec<HubCertRequest>> {
        let requests: Vec<HubCertRequest> = self
            .get_optional(&self.dfsp_path("enrollments/inbound"))
            .await?
            .unwrap_or_default();
        Ok(requests
            .into_iter()
            .filter(|request| request.certificate.is_none())
            .collect())
    }

    async fn upload_signed_hub_certificate(&self, id: u64, certificate: &str) -> Result<()> {
        #[derive(Serialize)]
        struct CertificateRequest<'a> {
            certificate: &'a str,
        }
        self.send_json(
            Method::POST,
            &self.dfsp_path(&format!("enrollments/inbound/{id}/certificate")),
            &CertificateRequest { certificate },
        )
        .await
    }

    async fn get_all_jws_certificates(&self) -> Result<Vec<JwsEntry>> {
        self.get_json("dfsps/jwscerts").await
    }

    async fn upload_dfsp_jws(&self, public_key: &str, created_at: i64) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct JwsRequest<'a> {
            public_key: &'a str,
            created_at: i64,
        }
        self.send_json(
            Method::POST,
            &self.dfsp_path("jwscerts"),
            &JwsRequest {
                public_key,
                created_at,
            },
        )
        .await
    }

    async fn upload_external_dfsp_jws(&self, entry: &JwsEntry) -> Result<()> {
        self.send_json(Method::POST, "external-dfsps/jwscerts", entry)
            .await
    }

    async fn find_all_endpoints(&self) -> Result<Vec<EndpointRecord>> {
        Ok(self
            .get_optional(&self.dfsp_path("endpoints"))
            .await?
            .unwrap_or_default())
    }

    async fn create_endpoint(&self, declaration: &EndpointDeclaration) -> Result<()> {
        self.send_json(Method::POST, &self.dfsp_path("endpoints"), declaration)
            .await
    }

    async fn update_endpoint(&self, id: u64, declaration: &EndpointDeclaration) -> Result<()> {
        self.send_json(
            Method::PUT,
            &self.dfsp_path(&format!("endpoints/{id}")),
            declaration,
        )
        .await
    }

    async fn delete_endpoint(&self, id: u64) -> Result<()> {
        let path = self.dfsp_path(&format!("endpoints/{id}"));
        let response = self
            .request(Method::DELETE, &path)
            .send()
            .await
            .with_context(|| format!("Hub request failed: DELETE {path}"))?;
        Self::check_status(response, &Method::DELETE, &path).await
    }
}
