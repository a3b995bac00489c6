use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as Frame;
use tracing::{debug, info, warn};

use super::message::{self, Message, Msg, Verb};
use crate::fs_util;
use crate::orchestrator::{ConnectorConfig, TlsSection};
use crate::types::JwsEntry;

/// Connector-side consumer of the control channel.
#[async_trait]
pub trait ConfigApplier: Send + Sync {
    async fn apply_configuration(&self, config: &ConnectorConfig) -> Result<()>;
    async fn apply_peer_jws(&self, keys: &BTreeMap<String, JwsEntry>) -> Result<()>;
}

/// Writes pushed configuration below one directory:
///
/// - `inbound/` and `outbound/`: `ca.pem`, `cert.pem`, `key.pem`
/// - `jws/signing.key` and `jws/peer_keys.json`
/// - `peer_jws.json`: the last `PEER_JWS` notification
pub struct FileApplier {
    root: PathBuf,
}

impl FileApplier {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn write_section(&self, name: &str, section: Option<&TlsSection>) -> Result<()> {
        let Some(section) = section else {
            return Ok(());
        };
        let dir = self.root.join(name);
        let creds = &section.tls.creds;
        if let Some(ca) = &creds.ca {
            fs_util::write_public(&dir.join("ca.pem"), ca).await?;
        }
        if let Some(cert) = &creds.cert {
            fs_util::write_public(&dir.join("cert.pem"), cert).await?;
        }
        if let Some(key) = &creds.key {
            fs_util::write_private(&dir.join("key.pem"), key).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigApplier for FileApplier {
    async fn apply_configuration(&self, config: &ConnectorConfig) -> Result<()> {
        self.write_section("inbound", config.inbound.as_ref()).await?;
        self.write_section("outbound", config.outbound.as_ref()).await?;
        if let Some(key) = &config.jws_signing_key {
            fs_util::write_private(&self.root.join("jws").join("signing.key"), key).await?;
        }
        if let Some(keys) = &config.peer_jws_keys {
            let encoded =
                serde_json::to_string_pretty(keys).context("Failed to encode peer JWS keys")?;
            fs_util::write_public(&self.root.join("jws").join("peer_keys.json"), &encoded)
                .await?;
        }
        info!("Applied connector configuration to {}", self.root.display());
        Ok(())
    }

    async fn apply_peer_jws(&self, keys: &BTreeMap<String, JwsEntry>) -> Result<()> {
        let encoded = serde_json::to_string_pretty(keys).context("Failed to encode peer JWS")?;
        fs_util::write_public(&self.root.join("peer_jws.json"), &encoded).await?;
        debug!("Stored {} peer JWS key(s)", keys.len());
        Ok(())
    }
}

/// Tracks the configuration received on one connection.
#[derive(Default)]
struct Session {
    current: Option<Value>,
}

impl Session {
    /// Applies one frame; returns a request to send back when the session lost track of
    /// the configuration.
    async fn on_message(
        &mut self,
        message: Message,
        applier: &dyn ConfigApplier,
    ) -> Result<Option<Message>> {
        match (message.msg, message.verb) {
            (Msg::Configuration, Verb::Notify) => {
                let config: ConnectorConfig = serde_json::from_value(message.data.clone())
                    .context("Invalid configuration notification")?;
                self.current = Some(message.data);
                applier.apply_configuration(&config).await?;
            }
            (Msg::Configuration, Verb::Patch) => {
                let Some(current) = self.current.as_mut() else {
                    debug!("Patch without a base configuration, re-reading");
                    return Ok(Some(Message::read(Msg::Configuration)));
                };
                let patch: json_patch::Patch = serde_json::from_value(message.data)
                    .context("Invalid configuration patch")?;
                if let Err(err) = json_patch::patch(current, &patch) {
                    warn!("Cannot apply configuration patch, re-reading: {err}");
                    self.current = None;
                    return Ok(Some(Message::read(Msg::Configuration)));
                }
                let config: ConnectorConfig = serde_json::from_value(current.clone())
                    .context("Patched configuration is invalid")?;
                applier.apply_configuration(&config).await?;
            }
            (Msg::PeerJws, Verb::Notify) => {
                let keys: BTreeMap<String, JwsEntry> = serde_json::from_value(message.data)
                    .context("Invalid peer JWS notification")?;
                applier.apply_peer_jws(&keys).await?;
            }
            (Msg::Error, _) => warn!("Control server reported {}", message.data),
            (msg, verb) => debug!("Ignoring {verb:?} {msg:?}"),
        }
        Ok(None)
    }
}

/// Connects to the control server and applies pushes until the connection ends.
///
/// # Errors
/// Returns an error when the connection fails or closes, or an update cannot be applied.
pub async fn run_session(url: &str, applier: &dyn ConfigApplier) -> Result<()> {
    let (socket, _) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to control server {url}"))?;
    info!("Connected to control server {url}");
    let (mut sink, mut stream) = socket.split();

    let read = Message::read(Msg::Configuration)
        .to_text()
        .context("Failed to encode read request")?;
    sink.send(Frame::Text(read))
        .await
        .context("Failed to request configuration")?;

    let mut session = Session::default();
    while let Some(frame) = stream.next().await {
        let text = match frame.context("Control connection failed")? {
            Frame::Text(text) => text,
            Frame::Close(_) => break,
            _ => continue,
        };
        let message = match message::parse(&text) {
            Ok(message) => message,
            Err(rejection) => {
                warn!("Ignoring control frame: {}", rejection.error);
                continue;
            }
        };
        if let Some(request) = session.on_message(message, applier).await? {
            let text = request.to_text().context("Failed to encode read request")?;
            sink.send(Frame::Text(text))
                .await
                .context("Failed to request configuration")?;
        }
    }
    anyhow::bail!("Control connection closed")
}
