use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Health statuses of a server that is reachable even if standby, sealed or uninitialized.
const REACHABLE: [StatusCode; 4] = [
    StatusCode::OK,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::NOT_IMPLEMENTED,
];

/// Minimal `OpenBao` HTTP client: health, `AppRole` login and KV v2 secrets.
#[derive(Debug, Clone)]
pub struct OpenBaoClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct AuthEnvelope {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    role_id: &'a str,
    secret_id: &'a str,
}

/// Token issued by an `AppRole` login together with its lease in seconds.
#[derive(Debug, Clone)]
pub struct LoginToken {
    pub token: String,
    pub lease_duration_secs: u64,
}

impl OpenBaoClient {
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build OpenBao HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: None,
        })
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Succeeds when the server answers at all, sealed or not.
    ///
    /// # Errors
    /// Returns error if the server cannot be reached or reports an unexpected status.
    pub async fn health_check(&self) -> Result<()> {
        let status = self
            .client
            .get(self.endpoint("sys/health"))
            .send()
            .await
            .context("OpenBao health check failed")?
            .status();
        if REACHABLE.contains(&status) {
            Ok(())
        } else {
            anyhow::bail!("OpenBao health check failed with status: {status}")
        }
    }

    /// # Errors
    /// Returns error if the login is rejected or the response is malformed.
    pub async fn login_approle(&self, role_id: &str, secret_id: &str) -> Result<LoginToken> {
        let path = "auth/approle/login";
        let request = self
            .client
            .post(self.endpoint(path))
            .json(&LoginRequest { role_id, secret_id });
        let response = Self::send(request, path)
            .await?
            .context("OpenBao AppRole endpoint not found")?;
        let envelope: AuthEnvelope = response
            .json()
            .await
            .context("OpenBao AppRole login response parse failed")?;
        Ok(LoginToken {
            token: envelope.auth.client_token,
            lease_duration_secs: envelope.auth.lease_duration,
        })
    }

    /// Reads the latest version of a KV v2 secret; `None` when the path does not exist.
    ///
    /// # Errors
    /// Returns error if no token is set or the request fails.
    pub async fn read_kv(&self, mount: &str, path: &str) -> Result<Option<Value>> {
        let path = format!("{mount}/data/{path}");
        let Some(response) = Self::send(self.authed(Method::GET, &path)?, &path).await? else {
            return Ok(None);
        };
        let envelope: Envelope<Envelope<Value>> = response
            .json()
            .await
            .with_context(|| format!("OpenBao response parse failed: {path}"))?;
        Ok(Some(envelope.data.data))
    }

    /// # Errors
    /// Returns error if no token is set or the write is rejected.
    pub async fn write_kv(&self, mount: &str, path: &str, data: Value) -> Result<()> {
        let path = format!("{mount}/data/{path}");
        let request = self
            .authed(Method::POST, &path)?
            .json(&json!({ "data": data }));
        Self::send(request, &path)
            .await?
            .with_context(|| format!("OpenBao mount not found: {mount}"))?;
        Ok(())
    }

    /// Deletes every version and the metadata of a KV v2 secret.
    ///
    /// # Errors
    /// Returns error if no token is set or the delete is rejected.
    pub async fn delete_kv(&self, mount: &str, path: &str) -> Result<()> {
        let path = format!("{mount}/metadata/{path}");
        Self::send(self.authed(Method::DELETE, &path)?, &path).await?;
        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    fn authed(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("OpenBao token is not set"))?;
        Ok(self
            .client
            .request(method, self.endpoint(path))
            .header(TOKEN_HEADER, token))
    }

    /// `None` on 404; any other non-success status is an error carrying the body.
    async fn send(request: RequestBuilder, path: &str) -> Result<Option<Response>> {
        let response = request
            .send()
            .await
            .with_context(|| format!("OpenBao request failed: {path}"))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenBao API error ({status}): {text}");
        }
        Ok(Some(response))
    }
}
