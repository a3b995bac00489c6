use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Deps, Effects, Phase, Workflow, WorkflowName, from_snapshot, gave_up, to_snapshot};
use crate::orchestrator::{Artifact, Event, OrchestratorContext};
use crate::retry::action;
use crate::types::{HubCertRequest, SignedHubCert};

const NAME: WorkflowName = WorkflowName::HubClientCert;

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    phase: Phase,
}

/// Signs the hub's pending client certificate requests with the DFSP CA.
pub struct HubClientCertWorkflow {
    deps: Arc<Deps>,
    state: State,
}

impl HubClientCertWorkflow {
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
                    let requests = hub.get_unprocessed_certs().await?;
                    Ok(Event::HubCsrsFetched { requests })
                }
            }),
        );
    }

    /// Signs and uploads each request; fails only when no request went through.
    fn sign(&mut self, requests: &[HubCertRequest], fx: &mut Effects) {
        self.state.phase = Phase::Acting;
        let deps = Arc::clone(&self.deps);
        let requests = requests.to_vec();
        fx.run(
            NAME,
            action(move || {
                let deps = Arc::clone(&deps);
                let requests = requests.clone();
                async move {
                    let mut signed = Vec::new();
                    let mut last_err = None;
                    for request in requests {
                        let result = async {
                            let certificate = deps.pki.sign_hub_csr(&request.csr).await?;
                            deps.hub
                                .upload_signed_hub_certificate(request.id, &certificate)
                                .await?;
                            anyhow::Ok(certificate)
                        }
                        .await;
                        match result {
                            Ok(certificate) => signed.push(SignedHubCert {
                                id: request.id,
                                certificate,
                            }),
                            Err(err) => {
                                warn!("Failed to sign hub CSR {}: {err:#}", request.id);
                                last_err = Some(err);
                            }
                        }
                    }
                    match last_err {
                        Some(err) if signed.is_empty() => Err(err),
                        _ => Ok(Event::HubCsrsSigned { signed }),
                    }
                }
            }),
        );
    }

    fn wait(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::RetryWait;
        fx.refresh(NAME, self.deps.settings.refresh.hub_client_cert);
    }
}

impl Workflow for HubClientCertWorkflow {
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

    fn on_event(&mut self, _ctx: &OrchestratorContext, event: &Event, fx: &mut Effects) {
        match event {
            Event::Tick { workflow } if *workflow == NAME => self.fetch(fx),
            Event::HubCsrsFetched { requests } => {
                self.state.phase = Phase::Evaluating;
                if requests.is_empty() {
                    debug!("No hub CSRs to sign");
                    fx.complete(NAME);
                    self.wait(fx);
                } else {
                    info!("Signing {} hub CSR(s)", requests.len());
                    self.sign(requests, fx);
                }
            }
            Event::HubCsrsSigned { signed } => {
                fx.emit(Event::StoreArtifact {
                    artifact: Artifact::HubClientCerts(signed.clone()),
                });
                fx.complete(NAME);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::testing;

    #[test]
    fn test_empty_cycle_still_completes() {
        let mut workflow = HubClientCertWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::HubCsrsFetched {
                requests: Vec::new(),
            },
            &mut fx,
        );
        assert!(!testing::ran(&fx, NAME));
        assert!(
            fx.emitted()
                .any(|event| *event == Event::WorkflowCompleted { workflow: NAME })
        );
        assert!(testing::scheduled(&fx, "hubClientCert.refresh"));
    }

    #[test]
    fn test_pending_requests_are_signed() {
        let mut workflow = HubClientCertWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::HubCsrsFetched {
                requests: vec![HubCertRequest {
                    id: 9,
                    csr: "CSR".to_string(),
                    certificate: None,
                }],
            },
            &mut fx,
        );
        assert!(testing::ran(&fx, NAME));
        assert_eq!(workflow.phase(), Phase::Acting);
    }

    #[tokio::test]
    async fn test_signing_fails_when_nothing_went_through() {
        let mut workflow = HubClientCertWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::HubCsrsFetched {
                requests: vec![HubCertRequest {
                    id: 9,
                    csr: "CSR".to_string(),
                    certificate: None,
                }],
            },
            &mut fx,
        );
        let Some(crate::workflows::Command::Run(mut task)) = fx.into_commands().into_iter().next()
        else {
            panic!("expected a task");
        };
        assert!(task.attempt().await.is_err());
    }
}
