use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Settings;
use crate::control::{ControlChannel, start_control_server};
use crate::hub::HubClient;
use crate::openbao::OpenBaoClient;
use crate::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
use crate::pki::LocalPki;
use crate::secrets::OpenBaoSecretStore;

/// Runs the connector manager until a shutdown signal arrives or the control listener
/// fails.
///
/// # Errors
/// Returns an error if a collaborator cannot be set up, the orchestrator cannot start, or
/// the control listener fails.
pub async fn run_daemon(settings: Arc<Settings>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Arc::new(open_secret_store(&settings).await?);
    let token_refresh = match (&settings.openbao.role_id, &settings.openbao.secret_id) {
        (Some(role_id), Some(secret_id)) => Some(store.spawn_token_refresh(
            role_id.clone(),
            secret_id.clone(),
            settings.openbao.token_refresh,
            shutdown_rx,
        )),
        _ => None,
    };

    let hub = HubClient::new(
        &settings.hub.url,
        &settings.dfsp_id,
        settings.hub.auth_token.clone(),
        Duration::from_secs(settings.hub.timeout_secs),
    )?;
    let pki = LocalPki::new(store.clone());
    let channel = ControlChannel::new();

    let orchestrator = Orchestrator::new(
        Collaborators {
            hub: Arc::new(hub),
            pki: Arc::new(pki),
            store,
        },
        OrchestratorSettings::from(&*settings),
        Arc::new(channel.clone()),
    )
    .start()
    .await?;

    let (addr, mut server) = start_control_server(
        &settings.control.listen_addr,
        Arc::new(orchestrator.clone()),
        channel,
    )
    .await?;
    info!("Connector manager for {} ready on {addr}", settings.dfsp_id);

    let result = tokio::select! {
        joined = &mut server => match joined {
            Ok(Ok(())) => Err(anyhow::anyhow!("Control listener stopped")),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(err).context("Control listener task panicked"),
        },
        signal = wait_for_shutdown() => {
            info!("Shutdown signal received");
            server.abort();
            signal
        }
    };

    if let Err(err) = orchestrator.stop().await {
        warn!("Orchestrator already stopped: {err:#}");
    }
    let _ = shutdown_tx.send(true);
    if let Some(handle) = token_refresh {
        let _ = handle.await;
    }
    result
}

async fn open_secret_store(settings: &Settings) -> anyhow::Result<OpenBaoSecretStore> {
    let openbao = &settings.openbao;
    let mut client = OpenBaoClient::new(&openbao.url)?;
    client
        .health_check()
        .await
        .with_context(|| format!("OpenBao at {} is not reachable", openbao.url))?;
    if let Some(token) = &openbao.token {
        client.set_token(token.clone());
    }
    let store = OpenBaoSecretStore::new(client, &openbao.kv_mount, &openbao.key_prefix);
    if let (Some(role_id), Some(secret_id)) = (&openbao.role_id, &openbao.secret_id) {
        store
            .login(role_id, secret_id)
            .await
            .context("OpenBao AppRole login failed")?;
        info!("Logged in to OpenBao with AppRole");
    }
    Ok(store)
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {e}"))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {e}"))?;
            }
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {e}"))?;
    }

    Ok(())
}
