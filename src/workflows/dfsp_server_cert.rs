use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Deps, Effects, Phase, Workflow, WorkflowName, from_snapshot, gave_up, to_snapshot};
use crate::config::CsrParams;
use crate::orchestrator::{Artifact, ConnectorConfig, Event, OrchestratorContext};
use crate::retry::action;
use crate::secrets::{self, DFSP_SERVER_CERT_KEY};
use crate::types::{ServerCertBundle, ServerCertificates};

const NAME: WorkflowName = WorkflowName::DfspServerCert;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct State {
    phase: Phase,
    #[serde(default)]
    requested_csr: Option<CsrParams>,
}

/// Issues the inbound server certificate from the DFSP CA.
pub struct DfspServerCertWorkflow {
    deps: Arc<Deps>,
    state: State,
}

impl DfspServerCertWorkflow {
    #[must_use]
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            state: State::default(),
        }
    }

    fn issue(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::Acting;
        let deps = Arc::clone(&self.deps);
        let params = self
            .state
            .requested_csr
            .clone()
            .unwrap_or_else(|| self.deps.settings.server_csr.clone());
        fx.run(
            NAME,
            action(move || {
                let deps = Arc::clone(&deps);
                let params = params.clone();
                async move {
                    let bundle = deps.pki.create_dfsp_server_cert(&params).await?;
                    secrets::save(deps.store.as_ref(), DFSP_SERVER_CERT_KEY, &bundle).await?;
                    Ok(Event::DfspServerCertIssued { bundle })
                }
            }),
        );
    }

    fn upload(&mut self, certificates: Option<ServerCertificates>, fx: &mut Effects) {
        self.state.phase = Phase::Uploading;
        let deps = Arc::clone(&self.deps);
        fx.run(
            NAME,
            action(move || {
                let deps = Arc::clone(&deps);
                let certificates = certificates.clone();
                async move {
                    let certificates = match certificates {
                        Some(certificates) => certificates,
                        None => {
                            secrets::load::<ServerCertBundle>(
                                deps.store.as_ref(),
                                DFSP_SERVER_CERT_KEY,
                            )
                            .await?
                            .context("Issued server certificate is missing from the secret store")?
                            .certificates
                        }
                    };
                    deps.hub.upload_server_certificates(&certificates).await?;
                    Ok(Event::DfspServerCertUploaded { certificates })
                }
            }),
        );
    }
}

impl Workflow for DfspServerCertWorkflow {
    fn name(&self) -> WorkflowName {
        NAME
    }

    fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Waits for the first `DFSP_CA_CHANGED` or an explicit request.
    fn enter(&mut self, _ctx: &OrchestratorContext, _fx: &mut Effects) {
        self.state.phase = Phase::Idle;
    }

    fn resume(&mut self, _ctx: &OrchestratorContext, fx: &mut Effects) {
        match self.state.phase {
            Phase::Acting => self.issue(fx),
            Phase::Uploading => self.upload(None, fx),
            _ => {}
        }
    }

    fn on_event(&mut self, _ctx: &OrchestratorContext, event: &Event, fx: &mut Effects) {
        match event {
            Event::CreateDfspServerCert { csr } => {
                self.state.requested_csr.clone_from(csr);
                self.issue(fx);
            }
            Event::DfspCaChanged => {
                self.state.requested_csr = None;
                self.issue(fx);
            }
            Event::DfspServerCertIssued { bundle } => {
                fx.emit(Event::UpdateConnectorConfig {
                    config: ConnectorConfig::inbound(
                        bundle.certificates.ca_bundle(),
                        bundle.certificates.server_certificate.clone(),
                        bundle.private_key.clone(),
                    ),
                });
                self.upload(Some(bundle.certificates.clone()), fx);
            }
            Event::DfspServerCertUploaded { certificates } => {
                info!("DFSP server certificate configured");
                self.state.phase = Phase::Completed;
                self.state.requested_csr = None;
                fx.emit(Event::StoreArtifact {
                    artifact: Artifact::DfspServerCert(certificates.clone()),
                });
                fx.emit(Event::DfspServerCertConfigured);
                fx.complete(NAME);
            }
            event if gave_up(NAME, event) => self.state.phase = Phase::Idle,
            _ => {}
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        to_snapshot(&self.state)
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.state = from_snapshot(NAME, snapshot)?;
        Ok(())
    }
}
