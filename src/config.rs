use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer, Serialize};

mod defaults;
mod validation;

const DEFAULT_CONFIG_PATH: &str = "connector-manager.toml";
const ENV_PREFIX: &str = "CONNMGR";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub dfsp_id: String,
    pub hub: HubSettings,
    pub openbao: OpenBaoSettings,
    pub control: ControlSettings,
    pub refresh: RefreshSettings,
    pub retry: RetrySettings,
    #[serde(default)]
    pub endpoint: EndpointSettings,
    pub dfsp_ca: CertSubject,
    pub server_csr: CsrParams,
    pub client_csr: CsrParams,
    pub state: StateSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubSettings {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenBaoSettings {
    pub url: String,
    pub kv_mount: String,
    pub key_prefix: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
    #[serde(default)]
    pub secret_id: Option<String>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub token_refresh: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlSettings {
    pub listen_addr: String,
}

/// Poll intervals of the workflows that re-check the hub on their own.
#[derive(Debug, Deserialize, Clone)]
pub struct RefreshSettings {
    #[serde(deserialize_with = "deserialize_duration")]
    pub hub_ca: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub dfsp_ca: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub dfsp_client_cert: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub hub_client_cert: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub peer_jws: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct EndpointSettings {
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub ip_allow_list: Vec<IpEntry>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpEntry {
    pub address: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct CertSubject {
    pub common_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct CsrParams {
    pub subject: CertSubject,
    /// DNS names or IP addresses placed in the subject alternative names.
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateSettings {
    pub secret_key: String,
}

impl Settings {
    /// Creates a new `Settings` instance.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails (e.g. invalid format).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = defaults::apply_defaults(Config::builder())?;

        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        s = s.add_source(File::from(path).required(false));

        // e.g. CONNMGR__HUB__URL, CONNMGR__DFSP_ID
        s = s.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .ignore_empty(true),
        );

        s.build()?.try_deserialize()
    }

    /// Merges CLI arguments into the settings, overriding values if present.
    pub fn merge_with_args(&mut self, args: &crate::Args) {
        if let Some(dfsp_id) = &args.dfsp_id {
            dfsp_id.clone_into(&mut self.dfsp_id);
        }
        if let Some(hub_url) = &args.hub_url {
            hub_url.clone_into(&mut self.hub.url);
        }
        if let Some(listen_addr) = &args.listen_addr {
            listen_addr.clone_into(&mut self.control.listen_addr);
        }
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        validation::validate_settings(self)
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    humantime::parse_duration(value.trim()).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_settings_defaults() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.dfsp_id, "dfsp");
        assert_eq!(settings.hub.url, "http://localhost:3001/api");
        assert_eq!(settings.control.listen_addr, "0.0.0.0:4003");
        assert_eq!(settings.retry.interval, Duration::from_secs(60));
        assert_eq!(settings.retry.max_retries, None);
        assert_eq!(settings.refresh.hub_ca, Duration::from_secs(60));
        assert_eq!(settings.openbao.kv_mount, "secret");
        assert_eq!(settings.state.secret_key, "orchestrator-state");
        assert!(settings.endpoint.callback_url.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_settings_file_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            dfsp_id = "pinkbank"
            [hub]
            url = "https://hub.example/api"
            [refresh]
            hub_ca = "5m"
            [retry]
            interval = "10s"
            max_retries = 4
            [endpoint]
            callback_url = "https://pinkbank.example/callback"
            [[endpoint.ip_allow_list]]
            address = "10.0.0.0/24"
            ports = ["443"]
        "#
        )
        .unwrap();
        file.flush().unwrap();

        let settings = Settings::new(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(settings.dfsp_id, "pinkbank");
        assert_eq!(settings.hub.url, "https://hub.example/api");
        assert_eq!(settings.refresh.hub_ca, Duration::from_secs(300));
        assert_eq!(settings.retry.interval, Duration::from_secs(10));
        assert_eq!(settings.retry.max_retries, Some(4));
        assert_eq!(
            settings.endpoint.callback_url.as_deref(),
            Some("https://pinkbank.example/callback")
        );
        assert_eq!(settings.endpoint.ip_allow_list[0].ports, vec!["443"]);
    }

    #[test]
    fn test_merge_with_args() {
        let mut settings = Settings::new(None).unwrap();
        let args = crate::Args {
            config: None,
            dfsp_id: Some("cli-dfsp".to_string()),
            hub_url: None,
            listen_addr: Some("127.0.0.1:9000".to_string()),
        };

        settings.merge_with_args(&args);

        assert_eq!(settings.dfsp_id, "cli-dfsp");
        assert_eq!(settings.control.listen_addr, "127.0.0.1:9000");
        assert_eq!(settings.hub.url, "http://localhost:3001/api");
    }

    #[test]
    fn test_validate_rejects_empty_dfsp_id() {
        let mut settings = Settings::new(None).unwrap();
        settings.dfsp_id = "  ".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("dfsp_id"));
    }

    #[test]
    fn test_validate_rejects_zero_retry_interval() {
        let mut settings = Settings::new(None).unwrap();
        settings.retry.interval = Duration::ZERO;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("retry.interval"));
    }
}
