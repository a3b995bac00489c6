use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::context::OrchestratorContext;
use super::events::Event;

/// Configuration assembled for the connector; every part is optional until produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(
        rename = "peerJWSKeys",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub peer_jws_keys: Option<BTreeMap<String, String>>,
    #[serde(
        rename = "jwsSigningKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub jws_signing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<TlsSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<TlsSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSection {
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub creds: TlsCreds,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsCreds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl TlsCreds {
    fn merge(&mut self, partial: TlsCreds) {
        if partial.ca.is_some() {
            self.ca = partial.ca;
        }
        if partial.cert.is_some() {
            self.cert = partial.cert;
        }
        if partial.key.is_some() {
            self.key = partial.key;
        }
    }
}

impl TlsSection {
    fn with_creds(creds: TlsCreds) -> Self {
        Self {
            tls: TlsConfig { creds },
        }
    }
}

impl ConnectorConfig {
    #[must_use]
    pub fn outbound_ca(ca: String) -> Self {
        Self {
            outbound: Some(TlsSection::with_creds(TlsCreds {
                ca: Some(ca),
                ..TlsCreds::default()
            })),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn outbound_client(cert: String, key: String) -> Self {
        Self {
            outbound: Some(TlsSection::with_creds(TlsCreds {
                ca: None,
                cert: Some(cert),
                key: Some(key),
            })),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn inbound(ca: String, cert: String, key: String) -> Self {
        Self {
            inbound: Some(TlsSection::with_creds(TlsCreds {
                ca: Some(ca),
                cert: Some(cert),
                key: Some(key),
            })),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn peer_jws_keys(keys: BTreeMap<String, String>) -> Self {
        Self {
            peer_jws_keys: Some(keys),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn jws_signing_key(key: String) -> Self {
        Self {
            jws_signing_key: Some(key),
            ..Self::default()
        }
    }

    /// Deep-merges `partial`; leaves present in `partial` win and `peerJWSKeys` is replaced
    /// as a whole.
    pub fn merge(&mut self, partial: ConnectorConfig) {
        if partial.peer_jws_keys.is_some() {
            self.peer_jws_keys = partial.peer_jws_keys;
        }
        if partial.jws_signing_key.is_some() {
            self.jws_signing_key = partial.jws_signing_key;
        }
        merge_section(&mut self.inbound, partial.inbound);
        merge_section(&mut self.outbound, partial.outbound);
    }
}

fn merge_section(current: &mut Option<TlsSection>, partial: Option<TlsSection>) {
    if let Some(partial) = partial {
        current
            .get_or_insert_with(TlsSection::default)
            .tls
            .creds
            .merge(partial.tls.creds);
    }
}

/// Applies configuration events; returns true when the full configuration must be pushed.
pub fn apply(ctx: &mut OrchestratorContext, event: &Event) -> bool {
    match event {
        Event::UpdateConnectorConfig { config } => {
            ctx.connector_config.merge(config.clone());
            true
        }
        Event::RequestConnectorConfig => true,
        _ => false,
    }
}
