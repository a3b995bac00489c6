use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::{Deps, Effects, Phase, Workflow, WorkflowName, from_snapshot, gave_up, to_snapshot};
use crate::config::EndpointSettings;
use crate::hub::HubApi;
use crate::orchestrator::{Artifact, Event, OrchestratorContext};
use crate::retry::action;
use crate::types::{Direction, EndpointDeclaration, EndpointKind, EndpointRecord};

const NAME: WorkflowName = WorkflowName::EndpointConfig;

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    phase: Phase,
}

/// Declares the DFSP's ingress callback URL and egress IP allow-list on the hub.
pub struct EndpointConfigWorkflow {
    deps: Arc<Deps>,
    state: State,
}

#[derive(Debug, PartialEq)]
enum Change {
    Create(EndpointDeclaration),
    Update(u64, EndpointDeclaration),
    Delete(u64),
}

/// Changes that turn the hub's records of one direction/kind into `desired`.
///
/// The first matching record is kept and updated; any further duplicates are removed.
fn plan(
    existing: &[EndpointRecord],
    direction: Direction,
    kind: EndpointKind,
    desired: Option<serde_json::Value>,
) -> Vec<Change> {
    let mut matching = existing.iter().filter(|record| {
        record.declaration.direction == direction && record.declaration.kind == kind
    });
    let mut changes = Vec::new();
    if let Some(value) = desired {
        let declaration = EndpointDeclaration {
            direction,
            kind,
            value,
        };
        match matching.next() {
            Some(record) if record.declaration == declaration => {}
            Some(record) => changes.push(Change::Update(record.id, declaration)),
            None => changes.push(Change::Create(declaration)),
        }
    }
    changes.extend(matching.map(|record| Change::Delete(record.id)));
    changes
}

async fn execute(hub: &dyn HubApi, changes: Vec<Change>) -> Result<()> {
    for change in changes {
        match change {
            Change::Create(declaration) => hub.create_endpoint(&declaration).await?,
            Change::Update(id, declaration) => hub.update_endpoint(id, &declaration).await?,
            Change::Delete(id) => hub.delete_endpoint(id).await?,
        }
    }
    Ok(())
}

impl EndpointConfigWorkflow {
    #[must_use]
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            state: State::default(),
        }
    }

    fn upload(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::Uploading;
        let hub = Arc::clone(&self.deps.hub);
        let endpoints = self.deps.settings.endpoint.clone();
        fx.run(
            NAME,
            action(move || {
                let hub = Arc::clone(&hub);
                let endpoints = endpoints.clone();
                async move {
                    let existing = hub.find_all_endpoints().await?;
                    let ingress = endpoints
                        .callback_url
                        .as_ref()
                        .map(|url| json!({ "url": url }));
                    let egress = if endpoints.ip_allow_list.is_empty() {
                        None
                    } else {
                        Some(
                            serde_json::to_value(&endpoints.ip_allow_list)
                                .context("Failed to encode the IP allow-list")?,
                        )
                    };
                    tokio::try_join!(
                        execute(
                            hub.as_ref(),
                            plan(&existing, Direction::Ingress, EndpointKind::Url, ingress),
                        ),
                        execute(
                            hub.as_ref(),
                            plan(&existing, Direction::Egress, EndpointKind::Ip, egress),
                        ),
                    )?;
                    Ok(Event::EndpointsUploaded { endpoints })
                }
            }),
        );
    }

    fn is_declared(&self, ctx: &OrchestratorContext) -> bool {
        ctx.endpoints.as_ref() == Some(&self.deps.settings.endpoint)
    }
}

impl Workflow for EndpointConfigWorkflow {
    fn name(&self) -> WorkflowName {
        NAME
    }

    fn phase(&self) -> Phase {
        self.state.phase
    }

    fn enter(&mut self, ctx: &OrchestratorContext, fx: &mut Effects) {
        if self.is_declared(ctx) {
            debug!("Endpoints already declared");
            self.state.phase = Phase::Completed;
        } else {
            self.upload(fx);
        }
    }

    fn resume(&mut self, ctx: &OrchestratorContext, fx: &mut Effects) {
        if self.state.phase.in_flight() || !self.is_declared(ctx) {
            self.upload(fx);
        }
    }

    fn on_event(&mut self, _ctx: &OrchestratorContext, event: &Event, fx: &mut Effects) {
        match event {
            Event::EndpointsUploaded { endpoints } => {
                info!("Endpoints declared on the hub");
                self.state.phase = Phase::Completed;
                fx.emit(Event::StoreArtifact {
                    artifact: Artifact::Endpoints(endpoints.clone()),
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
