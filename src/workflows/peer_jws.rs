use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Deps, Effects, Phase, Workflow, WorkflowName, from_snapshot, gave_up, to_snapshot};
use crate::orchestrator::{Artifact, ConnectorConfig, Event, OrchestratorContext};
use crate::retry::action;
use crate::types::JwsEntry;

/// Stores `keys` and propagates them to connectors as verification keys.
fn publish(keys: BTreeMap<String, JwsEntry>, fx: &mut Effects) {
    let public_keys = keys
        .iter()
        .map(|(dfsp_id, entry)| (dfsp_id.clone(), entry.public_key.clone()))
        .collect();
    fx.emit(Event::StoreArtifact {
        artifact: Artifact::PeerJws(keys.clone()),
    });
    fx.emit(Event::UpdateConnectorConfig {
        config: ConnectorConfig::peer_jws_keys(public_keys),
    });
    fx.emit(Event::PeerJwsChanged { keys });
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PullState {
    phase: Phase,
}

/// Mirrors the hub's peer JWS keys into the connector configuration.
pub struct PeerJwsPullWorkflow {
    deps: Arc<Deps>,
    state: PullState,
}

impl PeerJwsPullWorkflow {
    const NAME: WorkflowName = WorkflowName::PeerJwsPull;

    #[must_use]
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            state: PullState::default(),
        }
    }

    fn fetch(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::Fetching;
        let hub = Arc::clone(&self.deps.hub);
        fx.run(
            Self::NAME,
            action(move || {
                let hub = Arc::clone(&hub);
                async move {
                    let entries = hub.get_all_jws_certificates().await?;
                    Ok(Event::PeerJwsFetched { entries })
                }
            }),
        );
    }

    /// Newest entry per peer, leaving out this DFSP's own key.
    fn latest_per_peer(&self, entries: &[JwsEntry]) -> BTreeMap<String, JwsEntry> {
        let mut keys: BTreeMap<String, JwsEntry> = BTreeMap::new();
        for entry in entries {
            if entry.dfsp_id == self.deps.settings.dfsp_id {
                continue;
            }
            if entry.supersedes(keys.get(&entry.dfsp_id)) {
                keys.insert(entry.dfsp_id.clone(), entry.clone());
            }
        }
        keys
    }

    fn wait(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::RetryWait;
        fx.refresh(Self::NAME, self.deps.settings.refresh.peer_jws);
    }
}

impl Workflow for PeerJwsPullWorkflow {
    fn name(&self) -> WorkflowName {
        Self::NAME
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
            Event::Tick { workflow } if *workflow == Self::NAME => self.fetch(fx),
            Event::PeerJwsFetched { entries } => {
                self.state.phase = Phase::Evaluating;
                let keys = self.latest_per_peer(entries);
                if ctx.peer_jws.as_ref() == Some(&keys) {
                    debug!("Peer JWS keys unchanged");
                } else {
                    info!("Propagating {} peer JWS key(s)", keys.len());
                    publish(keys, fx);
                    fx.complete(Self::NAME);
                }
                self.wait(fx);
            }
            event if gave_up(Self::NAME, event) => self.wait(fx),
            _ => {}
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        to_snapshot(&self.state)
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.state = from_snapshot(Self::NAME, snapshot)?;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PushState {
    phase: Phase,
    #[serde(default)]
    pending: BTreeMap<String, JwsEntry>,
}

/// Uploads peer keys reported by connectors to the hub.
///
/// Only entries strictly newer than both the propagated key and any upload still in
/// progress are accepted.
pub struct PeerJwsPushWorkflow {
    deps: Arc<Deps>,
    state: PushState,
}

impl PeerJwsPushWorkflow {
    const NAME: WorkflowName = WorkflowName::PeerJwsPush;

    #[must_use]
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            state: PushState::default(),
        }
    }

    /// Adds the entries worth uploading to `pending`; returns how many were added.
    fn accept(&mut self, ctx: &OrchestratorContext, entries: &[JwsEntry]) -> usize {
        let mut accepted = 0;
        for entry in entries {
            if entry.dfsp_id == self.deps.settings.dfsp_id {
                debug!("Ignoring reported key of this DFSP");
                continue;
            }
            let propagated = ctx
                .peer_jws
                .as_ref()
                .and_then(|keys| keys.get(&entry.dfsp_id));
            if entry.supersedes(propagated)
                && entry.supersedes(self.state.pending.get(&entry.dfsp_id))
            {
                self.state
                    .pending
                    .insert(entry.dfsp_id.clone(), entry.clone());
                accepted += 1;
            }
        }
        accepted
    }

    /// Uploads every pending entry; fails only when none was accepted by the hub.
    fn upload(&mut self, fx: &mut Effects) {
        self.state.phase = Phase::Uploading;
        let hub = Arc::clone(&self.deps.hub);
        let entries: Vec<JwsEntry> = self.state.pending.values().cloned().collect();
        fx.run(
            Self::NAME,
            action(move || {
                let hub = Arc::clone(&hub);
                let entries = entries.clone();
                async move {
                    let mut uploaded = Vec::new();
                    let mut last_err = None;
                    for entry in entries {
                        match hub.upload_external_dfsp_jws(&entry).await {
                            Ok(()) => uploaded.push(entry),
                            Err(err) => {
                                warn!("Failed to upload JWS key of {}: {err:#}", entry.dfsp_id);
                                last_err = Some(err);
                            }
                        }
                    }
                    match last_err {
                        Some(err) if uploaded.is_empty() => Err(err),
                        _ => Ok(Event::PeerJwsUploaded { entries: uploaded }),
                    }
                }
            }),
        );
    }
}

impl Workflow for PeerJwsPushWorkflow {
    fn name(&self) -> WorkflowName {
        Self::NAME
    }

    fn phase(&self) -> Phase {
        self.state.phase
    }

    fn enter(&mut self, _ctx: &OrchestratorContext, _fx: &mut Effects) {
        self.state.phase = Phase::Idle;
    }

    fn resume(&mut self, _ctx: &OrchestratorContext, fx: &mut Effects) {
        if self.state.phase == Phase::Uploading && !self.state.pending.is_empty() {
            self.upload(fx);
        }
    }

    fn on_event(&mut self, ctx: &OrchestratorContext, event: &Event, fx: &mut Effects) {
        match event {
            Event::UploadPeerJws { entries } => {
                if self.accept(ctx, entries) == 0 {
                    debug!("No reported JWS key is newer than the known ones");
                } else {
                    self.upload(fx);
                }
            }
            Event::PeerJwsUploaded { entries } => {
                let mut keys = ctx.peer_jws.clone().unwrap_or_default();
                for entry in entries {
                    if entry.supersedes(keys.get(&entry.dfsp_id)) {
                        keys.insert(entry.dfsp_id.clone(), entry.clone());
                    }
                }
                self.state.pending.clear();
                self.state.phase = Phase::Idle;
                publish(keys, fx);
            }
            event if gave_up(Self::NAME, event) => {
                self.state.pending.clear();
                self.state.phase = Phase::Idle;
            }
            _ => {}
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        to_snapshot(&self.state)
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.state = from_snapshot(Self::NAME, snapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::testing;

    fn entry(dfsp_id: &str, created_at: i64) -> JwsEntry {
        JwsEntry {
            dfsp_id: dfsp_id.to_string(),
            public_key: format!("{dfsp_id}-{created_at}"),
            created_at,
        }
    }

    fn known(entries: &[JwsEntry]) -> OrchestratorContext {
        OrchestratorContext {
            peer_jws: Some(
                entries
                    .iter()
                    .map(|entry| (entry.dfsp_id.clone(), entry.clone()))
                    .collect(),
            ),
            ..OrchestratorContext::default()
        }
    }

    #[test]
    fn test_pull_keeps_newest_and_skips_own_key() {
        let mut workflow = PeerJwsPullWorkflow::new(testing::deps());
        let mut fx = testing::effects();
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::PeerJwsFetched {
                entries: vec![entry("f1", 1), entry("f1", 5), entry("pinkbank", 9)],
            },
            &mut fx,
        );

        let changed = fx.emitted().find_map(|event| match event {
            Event::PeerJwsChanged { keys } => Some(keys.clone()),
            _ => None,
        });
        let keys = changed.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys["f1"].created_at, 5);
        assert!(testing::scheduled(&fx, "peerJwsPull.refresh"));
    }

    #[test]
    fn test_pull_unchanged_keys_are_not_pushed() {
        let mut workflow = PeerJwsPullWorkflow::new(testing::deps());
        let ctx = known(&[entry("f1", 5)]);
        let mut fx = testing::effects();
        workflow.on_event(
            &ctx,
            &Event::PeerJwsFetched {
                entries: vec![entry("f1", 5)],
            },
            &mut fx,
        );
        assert_eq!(fx.emitted().count(), 0);
    }

    #[test]
    fn test_push_ignores_stale_and_equal_entries() {
        let mut workflow = PeerJwsPushWorkflow::new(testing::deps());
        let ctx = known(&[entry("f1", 100)]);
        let mut fx = testing::effects();
        workflow.on_event(
            &ctx,
            &Event::UploadPeerJws {
                entries: vec![entry("f1", 99), entry("f1", 100), entry("pinkbank", 500)],
            },
            &mut fx,
        );
        assert!(fx.commands().is_empty());
        assert_eq!(workflow.phase(), Phase::Idle);
    }

    #[test]
    fn test_push_uploads_newer_entry() {
        let mut workflow = PeerJwsPushWorkflow::new(testing::deps());
        let ctx = known(&[entry("f1", 100)]);
        let mut fx = testing::effects();
        workflow.on_event(
            &ctx,
            &Event::UploadPeerJws {
                entries: vec![entry("f1", 101)],
            },
            &mut fx,
        );
        assert!(testing::ran(&fx, WorkflowName::PeerJwsPush));
        assert_eq!(workflow.phase(), Phase::Uploading);
    }

    #[test]
    fn test_push_merges_uploaded_entries() {
        let mut workflow = PeerJwsPushWorkflow::new(testing::deps());
        let ctx = known(&[entry("f1", 100), entry("f2", 7)]);
        let mut fx = testing::effects();
        workflow.on_event(
            &ctx,
            &Event::PeerJwsUploaded {
                entries: vec![entry("f1", 101)],
            },
            &mut fx,
        );

        let pushed = fx.emitted().find_map(|event| match event {
            Event::UpdateConnectorConfig { config } => config.peer_jws_keys.clone(),
            _ => None,
        });
        let pushed = pushed.unwrap();
        assert_eq!(pushed["f1"], "f1-101");
        assert_eq!(pushed["f2"], "f2-7");
        assert_eq!(workflow.phase(), Phase::Idle);
    }

    #[test]
    fn test_push_partial_upload_publishes_only_accepted() {
        let mut workflow = PeerJwsPushWorkflow::new(testing::deps());
        let ctx = OrchestratorContext::default();
        workflow.on_event(
            &ctx,
            &Event::UploadPeerJws {
                entries: vec![entry("f1", 3), entry("f2", 4)],
            },
            &mut testing::effects(),
        );
        assert_eq!(workflow.state.pending.len(), 2);

        let mut fx = testing::effects();
        workflow.on_event(
            &ctx,
            &Event::PeerJwsUploaded {
                entries: vec![entry("f1", 3)],
            },
            &mut fx,
        );

        let stored = fx.emitted().find_map(|event| match event {
            Event::StoreArtifact {
                artifact: Artifact::PeerJws(keys),
            } => Some(keys.clone()),
            _ => None,
        });
        assert_eq!(stored.unwrap().keys().collect::<Vec<_>>(), vec!["f1"]);
        let pushed = fx.emitted().find_map(|event| match event {
            Event::UpdateConnectorConfig { config } => config.peer_jws_keys.clone(),
            _ => None,
        });
        assert!(!pushed.unwrap().contains_key("f2"));
        assert!(workflow.state.pending.is_empty());
        assert_eq!(workflow.phase(), Phase::Idle);
    }

    #[test]
    fn test_push_gave_up_drops_pending_without_publishing() {
        let mut workflow = PeerJwsPushWorkflow::new(testing::deps());
        let ctx = OrchestratorContext::default();
        workflow.on_event(
            &ctx,
            &Event::UploadPeerJws {
                entries: vec![entry("f1", 3)],
            },
            &mut testing::effects(),
        );
        assert_eq!(workflow.phase(), Phase::Uploading);

        let mut fx = testing::effects();
        workflow.on_event(
            &ctx,
            &Event::TaskFailed {
                task: WorkflowName::PeerJwsPush.as_str().to_string(),
            },
            &mut fx,
        );

        assert!(workflow.state.pending.is_empty());
        assert_eq!(workflow.phase(), Phase::Idle);
        assert_eq!(fx.emitted().count(), 0);
        assert!(fx.commands().is_empty());
    }

    #[test]
    fn test_push_resumes_pending_upload() {
        let mut workflow = PeerJwsPushWorkflow::new(testing::deps());
        workflow.on_event(
            &OrchestratorContext::default(),
            &Event::UploadPeerJws {
                entries: vec![entry("f3", 1)],
            },
            &mut testing::effects(),
        );

        let mut restored = PeerJwsPushWorkflow::new(testing::deps());
        restored.restore(workflow.snapshot()).unwrap();
        let mut fx = testing::effects();
        restored.resume(&OrchestratorContext::default(), &mut fx);

        assert!(testing::ran(&fx, WorkflowName::PeerJwsPush));
        assert!(restored.state.pending.contains_key("f3"));
    }
}
