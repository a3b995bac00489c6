use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Deps, Effects, Phase, Workflow, WorkflowName, from_snapshot, gave_up, to_snapshot};
use crate::orchestrator::{Artifact, ConnectorConfig, Event, JwsPublicKey, OrchestratorContext};
use crate::retry::action;
use crate::secrets::{self, DFSP_JWS_KEY};
use crate::types::JwsKeyPair;

const NAME: WorkflowName = WorkflowName::DfspJws;

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    phase: Phase,
}

/// Maintains this DFSP's JWS signing key and publishes its public half to the hub.
pub struct DfspJwsWorkflow {
    deps: Arc<Deps>,
    state: State,
}

impl DfspJwsWorkflow {
    #[must_use]
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            state: State::default(),
        }
    }

    /// Uploads the stored key pair, or a new one when `rotate` is set or none is stored.
    fn publish(&mut self, rotate: bool, fx: &mut Effects) {
        self.state.phase = Phase::Acting;
        let deps = Arc::clone(&self.deps);
        fx.run(
            NAME,
            action(move || {
                let deps = Arc::clone(&deps);
                async move {
                    let stored: Option<JwsKeyPair> = if rotate {
                        None
                    } else {
                        secrets::load(deps.store.as_ref(), DFSP_JWS_KEY).await?
                    };
                    let key = match stored {
                        Some(key) => key,
                        None => {
                            let key = deps.pki.create_jws().await?;
                            secrets::save(deps.store.as_ref(), DFSP_JWS_KEY, &key).await?;
                            key
                        }
                    };
                    deps.hub
                        .upload_dfsp_jws(&key.public_key, key.created_at)
                        .await?;
                    Ok(Event::DfspJwsCreated { key })
                }
            }),
        );
    }
}

impl Workflow for DfspJwsWorkflow {
    fn name(&self) -> WorkflowName {
        NAME
    }

    fn phase(&self) -> Phase {
        self.state.phase
    }

    fn enter(&mut self, ctx: &OrchestratorContext, fx: &mut Effects) {
        if ctx.dfsp_jws.is_some() {
            self.state.phase = Phase::Completed;
        } else {
            self.publish(false, fx);
        }
    }

    /// A rotation interrupted after the new key was saved publishes that key.
    fn resume(&mut self, _ctx: &OrchestratorContext, fx: &mut Effects) {
        if self.state.phase.in_flight() {
            self.publish(false, fx);
        }
    }

    fn on_event(&mut self, _ctx: &OrchestratorContext, event: &Event, fx: &mut Effects) {
        match event {
            Event::CreateJws => {
                info!("Rotating the DFSP JWS key");
                self.publish(true, fx);
            }
            Event::DfspJwsCreated { key } => {
                self.state.phase = Phase::Completed;
                fx.emit(Event::StoreArtifact {
                    artifact: Artifact::DfspJws(JwsPublicKey {
                        public_key: key.public_key.clone(),
                        created_at: key.created_at,
                    }),
                });
                fx.emit(Event::UpdateConnectorConfig {
                    config: ConnectorConfig::jws_signing_key(key.private_key.clone()),
                });
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::{Command, testing};

    fn key_pair() -> JwsKeyPair {
        JwsKeyPair {
            public_key: "PUB".to_string(),
            private_key: "PRIV".to_string(),
            created_at: 42,
        }
    }

    #[test]
    fn test_enter_publishes_when_no_key_is_known() {
        let mut workflow = DfspJwsWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.enter(&OrchestratorContext::default(), &mut fx);
        assert!(testing::ran(&fx, NAME));
    }

    #[test]
    fn test_enter_skips_known_key() {
        let mut workflow = DfspJwsWorkflow::new(testing::deps());
        let ctx = OrchestratorContext {
            dfsp_jws: Some(JwsPublicKey {
                public_key: "PUB".to_string(),
                created_at: 42,
            }),
            ..OrchestratorContext::default()
        };
        let mut fx = testing::effects();
        workflow.enter(&ctx, &mut fx);
        assert!(fx.commands().is_empty());
        assert_eq!(workflow.phase(), Phase::Completed);
    }

    #[test]
    fn test_created_key_is_stored_without_private_half() {
        let mut workflow = DfspJwsWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::DfspJwsCreated { key: key_pair() },
            &mut fx,
        );
        let emitted: Vec<&Event> = fx.emitted().collect();
        assert_eq!(
            *emitted[0],
            Event::StoreArtifact {
                artifact: Artifact::DfspJws(JwsPublicKey {
                    public_key: "PUB".to_string(),
                    created_at: 42,
                }),
            }
        );
        assert_eq!(
            *emitted[1],
            Event::UpdateConnectorConfig {
                config: ConnectorConfig::jws_signing_key("PRIV".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_stored_key_is_reused_but_rotation_is_not() {
        let deps = testing::deps();
        secrets::save(deps.store.as_ref(), DFSP_JWS_KEY, &key_pair())
            .await
            .unwrap();
        let mut workflow = DfspJwsWorkflow::new(Arc::clone(&deps));

        let mut fx = testing::effects();
        workflow.on_event(&OrchestratorContext::default(), &Event::CreateJws, &mut fx);
        let Some(Command::Run(mut task)) = fx.into_commands().into_iter().next() else {
            panic!("expected a task");
        };

        // Rotation reaches the (failing) key generator instead of the stored pair.
        assert!(task.attempt().await.is_err());
    }
}
