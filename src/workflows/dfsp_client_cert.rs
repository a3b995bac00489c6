use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Deps, Effects, Phase, Workflow, WorkflowName, from_snapshot, gave_up, to_snapshot};
use crate::orchestrator::{Artifact, ConnectorConfig, Event, OrchestratorContext};
use crate::retry::action;
use crate::secrets::{self, DFSP_CLIENT_KEY};
use crate::types::ClientEnrollment;

const NAME: WorkflowName = WorkflowName::DfspClientCert;

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    phase: Phase,
}

/// Obtains the outbound mTLS client certificate from the hub.
///
/// The private key never leaves the secret store except towards the connector; the
/// certificate comes from the hub's record of this DFSP's enrollment.
pub struct DfspClientCertWorkflow {
    deps: Arc<Deps>,
    state: State,
}

impl DfspClientCertWorkflow {
    #[must_use]
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            state: State::default(),
        }
    }

    fn fetch(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::Fetching;
        let hub = Arc::clone(&self.deps.hub);
        fx.run(
            NAME,
            action(move || {
                let hub = Arc::clone(&hub);
                async move {
                    let enrollment = hub.get_client_certificate().await?;
                    Ok(Event::ClientEnrollmentFetched { enrollment })
                }
            }),
        );
    }

    fn enroll(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::Acting;
        let deps = Arc::clone(&self.deps);
        fx.run(
            NAME,
            action(move || {
                let deps = Arc::clone(&deps);
                async move {
                    let bundle = deps.pki.create_csr(&deps.settings.client_csr).await?;
                    secrets::save(deps.store.as_ref(), DFSP_CLIENT_KEY, &bundle.private_key)
                        .await?;
                    deps.hub.upload_csr(&bundle.csr).await?;
                    Ok(Event::ClientCsrUploaded)
                }
            }),
        );
    }

    fn pair_with_key(&mut self, enrollment: &ClientEnrollment, fx: &mut Effects) {
        self.state.phase = Phase::Acting;
        let store = Arc::clone(&self.deps.store);
        let enrollment = enrollment.clone();
        fx.run(
            NAME,
            action(move || {
                let store = Arc::clone(&store);
                let enrollment = enrollment.clone();
                async move {
                    let private_key: String = secrets::load(store.as_ref(), DFSP_CLIENT_KEY)
                        .await?
                        .context("Client certificate key is missing from the secret store")?;
                    Ok(Event::DfspClientCertReady {
                        enrollment,
                        private_key,
                    })
                }
            }),
        );
    }

    fn wait(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::RetryWait;
        fx.refresh(NAME, self.deps.settings.refresh.dfsp_client_cert);
    }
}

impl Workflow for DfspClientCertWorkflow {
    fn name(&self) -> WorkflowName {
        NAME
    }

    fn phase(&self) -> Phase {
        self.state.phase
    }

    fn enter(&mut self, _ctx: &OrchestratorContext, fx: &mut Effects) {
        self.fetch(fx);
    }

    fn resume(&mut self, _ctx: &OrchestratorContext, fx: &mut Effects) {
        if self.state.phase.in_flight() {
            self.fetch(fx);
        }
    }

    fn on_event(&mut self, ctx: &OrchestratorContext, event: &Event, fx: &mut Effects) {
        match event {
            Event::Tick { workflow } if *workflow == NAME => self.fetch(fx),
            Event::ClientEnrollmentFetched { enrollment } => {
                self.state.phase = Phase::Evaluating;
                let propagated = ctx
                    .dfsp_client_cert
                    .as_ref()
                    .and_then(|known| known.certificate.as_ref());
                match enrollment {
                    None => {
                        info!("No outbound enrollment yet, submitting a CSR");
                        self.enroll(fx);
                    }
                    Some(enrollment) => match enrollment.certificate.as_ref() {
                        Some(certificate) if propagated != Some(certificate) => {
                            self.pair_with_key(enrollment, fx);
                        }
                        Some(_) => {
                            debug!("Client certificate unchanged");
                            self.wait(fx);
                        }
                        None => {
                            debug!("Enrollment {} waits for the hub's signature", enrollment.id);
                            self.wait(fx);
                        }
                    },
                }
            }
            Event::ClientCsrUploaded => self.wait(fx),
            Event::DfspClientCertReady {
                enrollment,
                private_key,
            } => {
                if let Some(certificate) = &enrollment.certificate {
                    fx.emit(Event::StoreArtifact {
                        artifact: Artifact::DfspClientCert(enrollment.clone()),
                    });
                    fx.emit(Event::UpdateConnectorConfig {
                        config: ConnectorConfig::outbound_client(
                            certificate.clone(),
                            private_key.clone(),
                        ),
                    });
                    fx.complete(NAME);
                }
                self.wait(fx);
            }
            event if gave_up(NAME, event) => self.wait(fx),
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
