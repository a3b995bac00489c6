use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{Context, Result};
use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};

use super::context::OrchestratorContext;
use super::events::Event;
use crate::secrets::{self, SecretStore};
use crate::workflows::{Phase, WorkflowName};

/// Bumped whenever region snapshots change shape incompatibly.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub state: Snapshot,
    pub hash: String,
    pub version: u64,
    #[serde(default)]
    pub pending_timers: Vec<PendingTimer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub regions: BTreeMap<WorkflowName, serde_json::Value>,
    pub context: OrchestratorContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTimer {
    pub id: String,
    pub event: Event,
    pub delay_ms: u64,
    pub scheduled_at_ms: i64,
}

impl PendingTimer {
    /// Delay left at `now_ms`, never negative.
    #[must_use]
    pub fn remaining(&self, now_ms: i64) -> Duration {
        let elapsed = u64::try_from(now_ms.saturating_sub(self.scheduled_at_ms)).unwrap_or(0);
        Duration::from_millis(self.delay_ms.saturating_sub(elapsed))
    }
}

/// Fingerprint of the region set and phase vocabulary this build persists.
#[must_use]
pub fn shape_hash(regions: &[WorkflowName]) -> String {
    let mut shape = format!("schema:{SCHEMA_VERSION}");
    for region in regions {
        let _ = write!(shape, "|{region}");
    }
    for phase in Phase::ALL {
        let _ = write!(shape, "|{phase:?}");
    }
    digest(&SHA256, shape.as_bytes())
        .as_ref()
        .iter()
        .fold(String::new(), |mut hex, byte| {
            let _ = write!(hex, "{byte:02x}");
            hex
        })
}

/// Reads the persisted state, if any.
///
/// # Errors
/// Returns an error if the secret store cannot be read.
pub async fn load(store: &dyn SecretStore, key: &str) -> Result<Option<PersistedState>> {
    match store.get_secret(key).await? {
        None => Ok(None),
        Some(value) => match serde_json::from_value(value) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                tracing::warn!("Ignoring unreadable persisted state: {err}");
                Ok(None)
            }
        },
    }
}

/// Writes `state` under `key`.
///
/// # Errors
/// Returns an error if the secret store write fails.
pub async fn save(store: &dyn SecretStore, key: &str, state: &PersistedState) -> Result<()> {
    secrets::save(store, key, state)
        .await
        .with_context(|| format!("Failed to persist orchestrator state version {}", state.version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;

    fn timer(delay_ms: u64, scheduled_at_ms: i64) -> PendingTimer {
        PendingTimer {
            id: "hubCa.refresh".to_string(),
            event: Event::Tick {
                workflow: WorkflowName::HubCa,
            },
            delay_ms,
            scheduled_at_ms,
        }
    }

    #[test]
    fn test_remaining_delay_subtracts_elapsed_time() {
        assert_eq!(
            timer(60_000, 1_000).remaining(21_000),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn test_remaining_delay_clamps_to_zero() {
        assert_eq!(timer(60_000, 1_000).remaining(500_000), Duration::ZERO);
    }

    #[test]
    fn test_remaining_delay_with_clock_behind_keeps_full_delay() {
        assert_eq!(
            timer(60_000, 10_000).remaining(5_000),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_shape_hash_depends_on_regions() {
        let all = shape_hash(&WorkflowName::ALL);
        assert_eq!(all, shape_hash(&WorkflowName::ALL));
        assert_ne!(all, shape_hash(&WorkflowName::ALL[..8]));
        assert_eq!(all.len(), 64);
    }

    #[tokio::test]
    async fn test_unreadable_state_is_treated_as_absent() {
        let store = MemorySecretStore::new();
        store
            .set_secret("orchestrator-state", serde_json::json!({ "version": "x" }))
            .await
            .unwrap();
        assert!(load(&store, "orchestrator-state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_round_trips_through_store() {
        let store = MemorySecretStore::new();
        let state = PersistedState {
            state: Snapshot {
                regions: BTreeMap::from([(WorkflowName::HubCa, serde_json::json!({}))]),
                context: OrchestratorContext::default(),
            },
            hash: shape_hash(&WorkflowName::ALL),
            version: 3,
            pending_timers: vec![timer(1_000, 5)],
        };

        save(&store, "state", &state).await.unwrap();

        assert_eq!(load(&store, "state").await.unwrap(), Some(state));
    }
}
