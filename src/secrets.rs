use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::openbao::OpenBaoClient;

pub const DFSP_CA_KEY: &str = "dfsp-ca";
pub const DFSP_CLIENT_KEY: &str = "dfsp-client-key";
pub const DFSP_SERVER_CERT_KEY: &str = "dfsp-server-cert";
pub const DFSP_JWS_KEY: &str = "dfsp-jws";

/// Named-secret storage used for private keys and the persisted orchestrator state.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set_secret(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn delete_secret(&self, key: &str) -> Result<()>;
}

/// Reads a secret and deserializes it into `T`.
///
/// # Errors
/// Returns an error if the store fails or the stored value has another shape.
pub async fn load<T: DeserializeOwned>(store: &dyn SecretStore, key: &str) -> Result<Option<T>> {
    match store.get_secret(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .with_context(|| format!("Failed to decode secret '{key}'")),
        None => Ok(None),
    }
}

/// Serializes `value` and stores it under `key`.
///
/// # Errors
/// Returns an error if serialization or the store write fails.
pub async fn save<T: Serialize>(store: &dyn SecretStore, key: &str, value: &T) -> Result<()> {
    let value =
        serde_json::to_value(value).with_context(|| format!("Failed to encode secret '{key}'"))?;
    store.set_secret(key, value).await
}

/// `SecretStore` backed by an `OpenBao` KV v2 mount.
pub struct OpenBaoSecretStore {
    client: RwLock<OpenBaoClient>,
    mount: String,
    prefix: String,
}

impl OpenBaoSecretStore {
    #[must_use]
    pub fn new(client: OpenBaoClient, mount: &str, prefix: &str) -> Self {
        Self {
            client: RwLock::new(client),
            mount: mount.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn path(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }

    /// Logs in with `AppRole` credentials and installs the issued token.
    ///
    /// # Errors
    /// Returns an error if the login request fails.
    pub async fn login(&self, role_id: &str, secret_id: &str) -> Result<()> {
        let login = self.client.read().await.login_approle(role_id, secret_id).await?;
        debug!(
            "OpenBao AppRole login succeeded (lease_duration={}s)",
            login.lease_duration_secs
        );
        self.client.write().await.set_token(login.token);
        Ok(())
    }

    /// Re-logs in on a fixed interval until shutdown so the token never expires.
    pub fn spawn_token_refresh(
        self: &Arc<Self>,
        role_id: String,
        secret_id: String,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            info!("OpenBao token refresh enabled. interval={interval:?}");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("OpenBao token refresh stopped.");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {
                        if let Err(err) = store.login(&role_id, &secret_id).await {
                            error!("OpenBao token refresh failed: {err:#}");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SecretStore for OpenBaoSecretStore {
    async fn get_secret(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path(key);
        self.client.read().await.read_kv(&self.mount, &path).await
    }

    async fn set_secret(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let path = self.path(key);
        self.client
            .read()
            .await
            .write_kv(&self.mount, &path, value)
            .await
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        self.client.read().await.delete_kv(&self.mount, &path).await
    }
}

/// Process-local `SecretStore`; contents are lost on exit.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.secrets.read().await.get(key).cloned())
    }

    async fn set_secret(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.secrets.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        self.secrets.write().await.remove(key);
        Ok(())
    }
}
