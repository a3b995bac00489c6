use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;

use super::{CsrParams, IpEntry, Settings};

pub(crate) fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.dfsp_id.trim().is_empty() {
        anyhow::bail!("dfsp_id must not be empty");
    }
    if !settings.dfsp_id.is_ascii() {
        anyhow::bail!("dfsp_id must be ASCII");
    }
    if settings.hub.url.trim().is_empty() {
        anyhow::bail!("hub.url must not be empty");
    }
    if settings.hub.timeout_secs == 0 {
        anyhow::bail!("hub.timeout_secs must be greater than 0");
    }
    if settings.openbao.url.trim().is_empty() {
        anyhow::bail!("openbao.url must not be empty");
    }
    if settings.openbao.kv_mount.trim().is_empty() {
        anyhow::bail!("openbao.kv_mount must not be empty");
    }
    if settings.openbao.role_id.is_some() != settings.openbao.secret_id.is_some() {
        anyhow::bail!("openbao.role_id and openbao.secret_id must be set together");
    }
    validate_duration(settings.openbao.token_refresh, "openbao.token_refresh")?;
    settings
        .control
        .listen_addr
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("control.listen_addr invalid: {e}"))?;
    validate_duration(settings.refresh.hub_ca, "refresh.hub_ca")?;
    validate_duration(settings.refresh.dfsp_ca, "refresh.dfsp_ca")?;
    validate_duration(settings.refresh.dfsp_client_cert, "refresh.dfsp_client_cert")?;
    validate_duration(settings.refresh.hub_client_cert, "refresh.hub_client_cert")?;
    validate_duration(settings.refresh.peer_jws, "refresh.peer_jws")?;
    validate_duration(settings.retry.interval, "retry.interval")?;
    if let Some(url) = &settings.endpoint.callback_url
        && url.trim().is_empty()
    {
        anyhow::bail!("endpoint.callback_url must not be empty when set");
    }
    for entry in &settings.endpoint.ip_allow_list {
        validate_ip_entry(entry)?;
    }
    if settings.dfsp_ca.common_name.trim().is_empty() {
        anyhow::bail!("dfsp_ca.common_name must not be empty");
    }
    validate_csr(&settings.server_csr, "server_csr")?;
    validate_csr(&settings.client_csr, "client_csr")?;
    if settings.state.secret_key.trim().is_empty() {
        anyhow::bail!("state.secret_key must not be empty");
    }
    Ok(())
}

fn validate_duration(value: Duration, label: &str) -> Result<()> {
    if value.is_zero() {
        anyhow::bail!("{label} must be greater than 0");
    }
    Ok(())
}

fn validate_ip_entry(entry: &IpEntry) -> Result<()> {
    let (address, prefix) = match entry.address.split_once('/') {
        Some((address, prefix)) => (address, Some(prefix)),
        None => (entry.address.as_str(), None),
    };
    let ip = address
        .parse::<IpAddr>()
        .map_err(|e| anyhow::anyhow!("endpoint.ip_allow_list address invalid: {e}"))?;
    if let Some(prefix) = prefix {
        let max = if ip.is_ipv4() { 32 } else { 128 };
        let bits = prefix
            .parse::<u8>()
            .map_err(|e| anyhow::anyhow!("endpoint.ip_allow_list prefix invalid: {e}"))?;
        if bits > max {
            anyhow::bail!("endpoint.ip_allow_list prefix must be <= {max}");
        }
    }
    for port in &entry.ports {
        let valid = match port.split_once('-') {
            Some((start, end)) => matches!(
                (start.parse::<u16>(), end.parse::<u16>()),
                (Ok(start), Ok(end)) if start <= end
            ),
            None => port.parse::<u16>().is_ok(),
        };
        if !valid {
            anyhow::bail!("endpoint.ip_allow_list port invalid: {port}");
        }
    }
    Ok(())
}

fn validate_csr(csr: &CsrParams, label: &str) -> Result<()> {
    if csr.subject.common_name.trim().is_empty() {
        anyhow::bail!("{label}.subject.common_name must not be empty");
    }
    if csr.hosts.iter().any(|host| host.trim().is_empty()) {
        anyhow::bail!("{label}.hosts entries must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: &str, ports: &[&str]) -> IpEntry {
        IpEntry {
            address: address.to_string(),
            ports: ports.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_validate_ip_entry_accepts_cidr_and_ranges() {
        assert!(validate_ip_entry(&entry("10.0.0.0/24", &["443", "8000-8010"])).is_ok());
        assert!(validate_ip_entry(&entry("fd00::1", &[])).is_ok());
    }

    #[test]
    fn test_validate_ip_entry_rejects_bad_values() {
        assert!(validate_ip_entry(&entry("not-an-ip", &[])).is_err());
        assert!(validate_ip_entry(&entry("10.0.0.1/33", &[])).is_err());
        assert!(validate_ip_entry(&entry("10.0.0.1", &["9000-80"])).is_err());
        assert!(validate_ip_entry(&entry("10.0.0.1", &["http"])).is_err());
    }
}
