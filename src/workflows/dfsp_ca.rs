use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Deps, Effects, Phase, Workflow, WorkflowName, from_snapshot, gave_up, to_snapshot};
use crate::config::CertSubject;
use crate::orchestrator::{Artifact, Event, OrchestratorContext};
use crate::retry::action;
use crate::types::CaChain;

const NAME: WorkflowName = WorkflowName::DfspCa;

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    phase: Phase,
}

/// Publishes the DFSP CA to the hub.
///
/// The CA is minted on request (`CREATE_INT_CA`), supplied by an operator
/// (`CREATE_EXT_CA`), or taken from the secret store. Every upload is announced with
/// `DFSP_CA_CHANGED` so certificates issued by the previous CA get replaced.
pub struct DfspCaWorkflow {
    deps: Arc<Deps>,
    state: State,
}

impl DfspCaWorkflow {
    #[must_use]
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            state: State::default(),
        }
    }

    /// Loads the stored CA, minting one with the default subject when there is none.
    fn load(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::Fetching;
        let pki = Arc::clone(&self.deps.pki);
        let subject = self.deps.settings.dfsp_ca.clone();
        fx.run(
            NAME,
            action(move || {
                let pki = Arc::clone(&pki);
                let subject = subject.clone();
                async move {
                    let ca = match pki.get_ca().await? {
                        Some(ca) => ca,
                        None => {
                            info!("No DFSP CA stored, creating one");
                            pki.create_ca(&subject).await?
                        }
                    };
                    Ok(Event::DfspCaLoaded { ca })
                }
            }),
        );
    }

    fn create_internal(&mut self, subject: &CertSubject, fx: &mut Effects) {
        self.state.phase = Phase::Acting;
        fx.cancel(NAME.refresh_timer());
        let pki = Arc::clone(&self.deps.pki);
        let subject = subject.clone();
        fx.run(
            NAME,
            action(move || {
                let pki = Arc::clone(&pki);
                let subject = subject.clone();
                async move {
                    let ca = pki.create_ca(&subject).await?;
                    Ok(Event::DfspCaLoaded { ca })
                }
            }),
        );
    }

    fn set_external(&mut self, chain: CaChain, private_key: String, fx: &mut Effects) {
        self.state.phase = Phase::Acting;
        fx.cancel(NAME.refresh_timer());
        let pki = Arc::clone(&self.deps.pki);
        fx.run(
            NAME,
            action(move || {
                let pki = Arc::clone(&pki);
                let chain = chain.clone();
                let private_key = private_key.clone();
                async move {
                    pki.set_dfsp_ca_cert_chain(&chain, &private_key).await?;
                    Ok(Event::DfspCaLoaded { ca: chain })
                }
            }),
        );
    }

    fn upload(&mut self, ca: &CaChain, fx: &mut Effects) {
        self.state.phase = Phase::Uploading;
        let hub = Arc::clone(&self.deps.hub);
        let ca = ca.clone();
        fx.run(
            NAME,
            action(move || {
                let hub = Arc::clone(&hub);
                let ca = ca.clone();
                async move {
                    hub.upload_dfsp_ca(&ca).await?;
                    Ok(Event::DfspCaUploaded { ca })
                }
            }),
        );
    }

    fn wait(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::RetryWait;
        fx.refresh(NAME, self.deps.settings.refresh.dfsp_ca);
    }
}

impl Workflow for DfspCaWorkflow {
    fn name(&self) -> WorkflowName {
        NAME
    }

    fn phase(&self) -> Phase {
        self.state.phase
    }

    fn enter(&mut self, _ctx: &OrchestratorContext, fx: &mut Effects) {
        self.load(fx);
    }

    fn resume(&mut self, _ctx: &OrchestratorContext, fx: &mut Effects) {
        if self.state.phase.in_flight() {
            self.load(fx);
        }
    }

    fn on_event(&mut self, ctx: &OrchestratorContext, event: &Event, fx: &mut Effects) {
        match event {
            Event::Tick { workflow } if *workflow == NAME => self.load(fx),
            Event::CreateIntCa { subject } => self.create_internal(subject, fx),
            Event::CreateExtCa {
                root_certificate,
                intermediate_chain,
                private_key,
            } => {
                let chain = CaChain {
                    root_certificate: root_certificate.clone(),
                    intermediate_chain: intermediate_chain.clone(),
                };
                self.set_external(chain, private_key.clone(), fx);
            }
            Event::DfspCaLoaded { ca } => {
                self.state.phase = Phase::Evaluating;
                if ctx.dfsp_ca.as_ref() == Some(ca) {
                    debug!("DFSP CA unchanged");
                    self.wait(fx);
                } else {
                    self.upload(ca, fx);
                }
            }
            Event::DfspCaUploaded { ca } => {
                info!("DFSP CA uploaded to the hub");
                fx.emit(Event::StoreArtifact {
                    artifact: Artifact::DfspCa(ca.clone()),
                });
                fx.emit(Event::DfspCaChanged);
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
    use crate::workflows::{Command, testing};

    fn chain(root: &str) -> CaChain {
        CaChain {
            root_certificate: root.to_string(),
            intermediate_chain: None,
        }
    }

    #[test]
    fn test_new_ca_is_uploaded() {
        let mut workflow = DfspCaWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::DfspCaLoaded { ca: chain("CA1") },
            &mut fx,
        );
        assert_eq!(workflow.phase(), Phase::Uploading);
        assert!(testing::ran(&fx, NAME));
    }

    #[test]
    fn test_known_ca_is_not_uploaded_again() {
        let mut workflow = DfspCaWorkflow::new(testing::deps());
        let ctx = OrchestratorContext {
            dfsp_ca: Some(chain("CA1")),
            ..OrchestratorContext::default()
        };
        let mut fx = testing::effects();
        workflow.on_event(&ctx, &Event::DfspCaLoaded { ca: chain("CA1") }, &mut fx);
        assert!(!testing::ran(&fx, NAME));
        assert!(testing::scheduled(&fx, "dfspCa.refresh"));
    }

    #[test]
    fn test_upload_announces_change() {
        let mut workflow = DfspCaWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::DfspCaUploaded { ca: chain("CA1") },
            &mut fx,
        );
        let emitted: Vec<_> = fx.emitted().map(Event::kind).collect();
        assert_eq!(
            emitted,
            vec!["STORE_ARTIFACT", "DFSP_CA_CHANGED", "WORKFLOW_COMPLETED"]
        );
    }

    #[test]
    fn test_trigger_preempts_scheduled_poll() {
        let mut workflow = DfspCaWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::CreateIntCa {
                subject: CertSubject {
                    common_name: "Operator CA".to_string(),
                    ..CertSubject::default()
                },
            },
            &mut fx,
        );
        assert!(matches!(
            &fx.commands()[0],
            Command::Cancel(timer) if timer == "dfspCa.refresh"
        ));
        assert!(testing::ran(&fx, NAME));
        assert_eq!(workflow.phase(), Phase::Acting);
    }
}
