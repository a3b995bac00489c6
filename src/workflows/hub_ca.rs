use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Deps, Effects, Phase, Workflow, WorkflowName, from_snapshot, gave_up, to_snapshot};
use crate::orchestrator::{Artifact, ConnectorConfig, Event, OrchestratorContext};
use crate::retry::action;

const NAME: WorkflowName = WorkflowName::HubCa;

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    phase: Phase,
}

/// Keeps the connector's outbound trust anchor equal to the hub CA.
pub struct HubCaWorkflow {
    deps: Arc<Deps>,
    state: State,
}

impl HubCaWorkflow {
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
                    let ca = hub.get_hub_ca().await?;
                    Ok(Event::HubCaFetched { ca })
                }
            }),
        );
    }

    fn wait(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::RetryWait;
        fx.refresh(NAME, self.deps.settings.refresh.hub_ca);
    }
}

impl Workflow for HubCaWorkflow {
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
            Event::HubCaFetched { ca } => {
                self.state.phase = Phase::Evaluating;
                match ca {
                    Some(ca) if ctx.hub_ca.as_ref() != Some(ca) => {
                        fx.emit(Event::StoreArtifact {
                            artifact: Artifact::HubCa(ca.clone()),
                        });
                        fx.emit(Event::UpdateConnectorConfig {
                            config: ConnectorConfig::outbound_ca(ca.bundle()),
                        });
                        fx.complete(NAME);
                    }
                    Some(_) => debug!("Hub CA unchanged"),
                    None => debug!("Hub has no CA yet"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::reduce;
    use crate::types::CaChain;
    use crate::workflows::testing;

    fn fetched(root: &str, intermediate: Option<&str>) -> Event {
        Event::HubCaFetched {
            ca: Some(CaChain {
                root_certificate: root.to_string(),
                intermediate_chain: intermediate.map(ToString::to_string),
            }),
        }
    }

    fn apply_emitted(ctx: &mut OrchestratorContext, fx: &Effects) {
        for event in fx.emitted() {
            reduce(ctx, event);
        }
    }

    #[test]
    fn test_enter_fetches() {
        let mut workflow = HubCaWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.enter(&OrchestratorContext::default(), &mut fx);
        assert!(testing::ran(&fx, NAME));
        assert_eq!(workflow.phase(), Phase::Fetching);
    }

    #[test]
    fn test_same_value_twice_pushes_once() {
        let mut workflow = HubCaWorkflow::new(testing::deps());
        let mut ctx = OrchestratorContext::default();

        let mut first = testing::effects();
        workflow.on_event(&ctx, &fetched("R1", None), &mut first);
        apply_emitted(&mut ctx, &first);
        let mut second = testing::effects();
        workflow.on_event(&ctx, &fetched("R1", None), &mut second);

        assert_eq!(testing::config_updates(&first), 1);
        assert_eq!(testing::config_updates(&second), 0);
        assert!(testing::scheduled(&second, "hubCa.refresh"));
        assert_eq!(workflow.phase(), Phase::RetryWait);
    }

    #[test]
    fn test_pushes_intermediate_then_root() {
        let mut workflow = HubCaWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &fetched("ROOT", Some("INT")),
            &mut fx,
        );

        let pushed = fx.emitted().find_map(|event| match event {
            Event::UpdateConnectorConfig { config } => Some(config.clone()),
            _ => None,
        });
        assert_eq!(
            pushed,
            Some(ConnectorConfig::outbound_ca("INT\nROOT".to_string()))
        );
        assert!(
            fx.emitted()
                .any(|event| *event == Event::WorkflowCompleted { workflow: NAME })
        );
    }

    #[test]
    fn test_missing_hub_ca_waits_without_completion() {
        let mut workflow = HubCaWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::HubCaFetched { ca: None },
            &mut fx,
        );
        assert_eq!(fx.emitted().count(), 0);
        assert!(testing::scheduled(&fx, "hubCa.refresh"));
    }

    #[test]
    fn test_tick_for_other_workflow_is_ignored() {
        let mut workflow = HubCaWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::Tick {
                workflow: WorkflowName::DfspCa,
            },
            &mut fx,
        );
        assert!(fx.commands().is_empty());
    }

    #[test]
    fn test_snapshot_round_trip_restores_phase() {
        let mut workflow = HubCaWorkflow::new(testing::deps());
        workflow.enter(&OrchestratorContext::default(), &mut testing::effects());

        let mut restored = HubCaWorkflow::new(testing::deps());
        restored.restore(workflow.snapshot()).unwrap();
        let mut fx = testing::effects();
        restored.resume(&OrchestratorContext::default(), &mut fx);

        assert_eq!(restored.phase(), Phase::Fetching);
        assert!(testing::ran(&fx, NAME));
    }
}
