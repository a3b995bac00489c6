use serde::{Deserialize, Serialize};

use super::context::OrchestratorContext;
use super::events::Event;
use crate::workflows::WorkflowName;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub completed: bool,
    pub last_updated: Option<i64>,
}

/// Workflows whose first success onboarding waits for. Peer JWS push only runs when a
/// connector reports keys, so it is left out.
pub fn tracked() -> impl Iterator<Item = WorkflowName> {
    WorkflowName::ALL
        .into_iter()
        .filter(|name| *name != WorkflowName::PeerJwsPush)
}

/// Adds a pending entry for every tracked workflow that has none yet.
pub fn init(ctx: &mut OrchestratorContext) {
    for name in tracked() {
        ctx.pending_states.entry(name).or_insert(true);
        ctx.progress_monitor.entry(name).or_default();
    }
}

/// Records a completion; returns true exactly once, when the last tracked workflow
/// completes for the first time.
pub fn record(ctx: &mut OrchestratorContext, event: &Event, now: i64) -> bool {
    let Event::WorkflowCompleted { workflow } = event else {
        return false;
    };
    let Some(entry) = ctx.progress_monitor.get_mut(workflow) else {
        return false;
    };
    entry.completed = true;
    entry.last_updated = Some(now);
    ctx.pending_states.insert(*workflow, false);

    if ctx.onboarding_complete || !ctx.progress_monitor.values().all(|entry| entry.completed) {
        return false;
    }
    ctx.onboarding_complete = true;
    true
}
