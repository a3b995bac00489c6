use config::{ConfigBuilder, ConfigError, builder::DefaultState};

const DEFAULT_DFSP_ID: &str = "dfsp";
const DEFAULT_HUB_URL: &str = "http://localhost:3001/api";
const DEFAULT_HUB_TIMEOUT_SECS: u64 = 30;
const DEFAULT_OPENBAO_URL: &str = "http://localhost:8200";
const DEFAULT_KV_MOUNT: &str = "secret";
const DEFAULT_KEY_PREFIX: &str = "connector-manager";
const DEFAULT_TOKEN_REFRESH: &str = "30m";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4003";
const DEFAULT_REFRESH_INTERVAL: &str = "60s";
const DEFAULT_RETRY_INTERVAL: &str = "60s";
const DEFAULT_CA_COMMON_NAME: &str = "DFSP CA";
const DEFAULT_SERVER_COMMON_NAME: &str = "dfsp.local";
const DEFAULT_CLIENT_COMMON_NAME: &str = "dfsp-client";
const DEFAULT_STATE_SECRET_KEY: &str = "orchestrator-state";

pub(crate) fn apply_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("dfsp_id", DEFAULT_DFSP_ID)?
        .set_default("hub.url", DEFAULT_HUB_URL)?
        .set_default("hub.timeout_secs", DEFAULT_HUB_TIMEOUT_SECS)?
        .set_default("openbao.url", DEFAULT_OPENBAO_URL)?
        .set_default("openbao.kv_mount", DEFAULT_KV_MOUNT)?
        .set_default("openbao.key_prefix", DEFAULT_KEY_PREFIX)?
        .set_default("openbao.token_refresh", DEFAULT_TOKEN_REFRESH)?
        .set_default("control.listen_addr", DEFAULT_LISTEN_ADDR)?
        .set_default("refresh.hub_ca", DEFAULT_REFRESH_INTERVAL)?
        .set_default("refresh.dfsp_ca", DEFAULT_REFRESH_INTERVAL)?
        .set_default("refresh.dfsp_client_cert", DEFAULT_REFRESH_INTERVAL)?
        .set_default("refresh.hub_client_cert", DEFAULT_REFRESH_INTERVAL)?
        .set_default("refresh.peer_jws", DEFAULT_REFRESH_INTERVAL)?
        .set_default("retry.interval", DEFAULT_RETRY_INTERVAL)?
        .set_default("dfsp_ca.common_name", DEFAULT_CA_COMMON_NAME)?
        .set_default("server_csr.subject.common_name", DEFAULT_SERVER_COMMON_NAME)?
        .set_default("server_csr.hosts", vec![DEFAULT_SERVER_COMMON_NAME])?
        .set_default("client_csr.subject.common_name", DEFAULT_CLIENT_COMMON_NAME)?
        .set_default("client_csr.hosts", Vec::<String>::new())?
        .set_default("state.secret_key", DEFAULT_STATE_SECRET_KEY)
}
