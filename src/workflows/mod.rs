//! One state machine per trust artifact.
//!
//! Workflows never touch the orchestrator context directly: they read it, and describe what
//! should happen next as [`Command`]s collected in [`Effects`]. The orchestrator event loop
//! applies those commands, runs the collaborator calls and feeds their outcomes back in as
//! events.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::{CertSubject, CsrParams, EndpointSettings, RefreshSettings, Settings};
use crate::hub::HubApi;
use crate::orchestrator::{Event, OrchestratorContext};
use crate::pki::Pki;
use crate::retry::{Action, RetryPolicy, RetryableTask};
use crate::secrets::SecretStore;

mod dfsp_ca;
mod dfsp_client_cert;
mod dfsp_jws;
mod dfsp_server_cert;
mod endpoint;
mod hub_ca;
mod hub_client_cert;
mod peer_jws;

pub use dfsp_ca::DfspCaWorkflow;
pub use dfsp_client_cert::DfspClientCertWorkflow;
pub use dfsp_jws::DfspJwsWorkflow;
pub use dfsp_server_cert::DfspServerCertWorkflow;
pub use endpoint::EndpointConfigWorkflow;
pub use hub_ca::HubCaWorkflow;
pub use hub_client_cert::HubClientCertWorkflow;
pub use peer_jws::{PeerJwsPullWorkflow, PeerJwsPushWorkflow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowName {
    HubCa,
    DfspCa,
    DfspClientCert,
    DfspServerCert,
    HubClientCert,
    PeerJwsPull,
    PeerJwsPush,
    DfspJws,
    EndpointConfig,
}

impl WorkflowName {
    /// Every workflow, in the order regions see each event.
    pub const ALL: [WorkflowName; 9] = [
        WorkflowName::HubCa,
        WorkflowName::DfspCa,
        WorkflowName::DfspClientCert,
        WorkflowName::DfspServerCert,
        WorkflowName::HubClientCert,
        WorkflowName::PeerJwsPull,
        WorkflowName::PeerJwsPush,
        WorkflowName::DfspJws,
        WorkflowName::EndpointConfig,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowName::HubCa => "hubCa",
            WorkflowName::DfspCa => "dfspCa",
            WorkflowName::DfspClientCert => "dfspClientCert",
            WorkflowName::DfspServerCert => "dfspServerCert",
            WorkflowName::HubClientCert => "hubClientCert",
            WorkflowName::PeerJwsPull => "peerJwsPull",
            WorkflowName::PeerJwsPush => "peerJwsPush",
            WorkflowName::DfspJws => "dfspJws",
            WorkflowName::EndpointConfig => "endpointConfig",
        }
    }

    /// Timer id of the delayed poll that starts the next cycle.
    #[must_use]
    pub fn refresh_timer(self) -> String {
        format!("{}.refresh", self.as_str())
    }
}

impl fmt::Display for WorkflowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Idle,
    Fetching,
    Evaluating,
    Acting,
    Uploading,
    Completed,
    RetryWait,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Idle,
        Phase::Fetching,
        Phase::Evaluating,
        Phase::Acting,
        Phase::Uploading,
        Phase::Completed,
        Phase::RetryWait,
    ];

    /// Whether a collaborator call is outstanding while in this phase.
    #[must_use]
    pub fn in_flight(self) -> bool {
        matches!(self, Phase::Fetching | Phase::Acting | Phase::Uploading)
    }
}

pub enum Command {
    Run(RetryableTask<Event>),
    Emit(Event),
    Schedule {
        timer: String,
        delay: Duration,
        event: Event,
    },
    Cancel(String),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Run(task) => f.debug_tuple("Run").field(&task.id()).finish(),
            Command::Emit(event) => f.debug_tuple("Emit").field(&event.kind()).finish(),
            Command::Schedule { timer, delay, .. } => f
                .debug_struct("Schedule")
                .field("timer", timer)
                .field("delay", delay)
                .finish_non_exhaustive(),
            Command::Cancel(timer) => f.debug_tuple("Cancel").field(timer).finish(),
        }
    }
}

/// Commands produced by one transition, applied by the orchestrator in order.
pub struct Effects {
    commands: Vec<Command>,
    policy: RetryPolicy,
}

impl Effects {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            commands: Vec::new(),
            policy,
        }
    }

    /// Starts (or restarts) the single task owned by `workflow`.
    pub fn run(&mut self, workflow: WorkflowName, action: Action<Event>) {
        self.commands.push(Command::Run(RetryableTask::new(
            workflow.as_str(),
            self.policy,
            action,
        )));
    }

    pub fn emit(&mut self, event: Event) {
        self.commands.push(Command::Emit(event));
    }

    pub fn schedule(&mut self, timer: String, delay: Duration, event: Event) {
        self.commands.push(Command::Schedule {
            timer,
            delay,
            event,
        });
    }

    pub fn cancel(&mut self, timer: String) {
        self.commands.push(Command::Cancel(timer));
    }

    /// Arms the next poll of `workflow`.
    pub fn refresh(&mut self, workflow: WorkflowName, delay: Duration) {
        self.schedule(
            workflow.refresh_timer(),
            delay,
            Event::Tick { workflow },
        );
    }

    pub fn complete(&mut self, workflow: WorkflowName) {
        self.emit(Event::WorkflowCompleted { workflow });
    }

    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[must_use]
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    /// Events emitted so far, in order.
    pub fn emitted(&self) -> impl Iterator<Item = &Event> {
        self.commands.iter().filter_map(|command| match command {
            Command::Emit(event) => Some(event),
            _ => None,
        })
    }
}

/// A region of the orchestrator managing one artifact.
pub trait Workflow: Send {
    fn name(&self) -> WorkflowName;
    fn phase(&self) -> Phase;
    /// Initial transition on a fresh start.
    fn enter(&mut self, ctx: &OrchestratorContext, fx: &mut Effects);
    /// Re-issues the outstanding call of a restored in-flight phase.
    fn resume(&mut self, ctx: &OrchestratorContext, fx: &mut Effects);
    fn on_event(&mut self, ctx: &OrchestratorContext, event: &Event, fx: &mut Effects);
    fn snapshot(&self) -> serde_json::Value;
    /// Restores the state captured by [`Workflow::snapshot`].
    ///
    /// # Errors
    /// Returns an error if the snapshot has another shape.
    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()>;
}

/// The part of [`Settings`] workflows act on.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub dfsp_id: String,
    pub refresh: RefreshSettings,
    pub endpoint: EndpointSettings,
    pub dfsp_ca: CertSubject,
    pub server_csr: CsrParams,
    pub client_csr: CsrParams,
}

impl From<&Settings> for WorkflowSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            dfsp_id: settings.dfsp_id.clone(),
            refresh: settings.refresh.clone(),
            endpoint: settings.endpoint.clone(),
            dfsp_ca: settings.dfsp_ca.clone(),
            server_csr: settings.server_csr.clone(),
            client_csr: settings.client_csr.clone(),
        }
    }
}

/// Collaborators and settings shared by every workflow.
pub struct Deps {
    pub hub: Arc<dyn HubApi>,
    pub pki: Arc<dyn Pki>,
    pub store: Arc<dyn SecretStore>,
    pub settings: WorkflowSettings,
}

/// Builds every region in dispatch order.
#[must_use]
pub fn build(deps: &Arc<Deps>) -> Vec<Box<dyn Workflow>> {
    vec![
        Box::new(HubCaWorkflow::new(Arc::clone(deps))),
        Box::new(DfspCaWorkflow::new(Arc::clone(deps))),
        Box::new(DfspClientCertWorkflow::new(Arc::clone(deps))),
        Box::new(DfspServerCertWorkflow::new(Arc::clone(deps))),
        Box::new(HubClientCertWorkflow::new(Arc::clone(deps))),
        Box::new(PeerJwsPullWorkflow::new(Arc::clone(deps))),
        Box::new(PeerJwsPushWorkflow::new(Arc::clone(deps))),
        Box::new(DfspJwsWorkflow::new(Arc::clone(deps))),
        Box::new(EndpointConfigWorkflow::new(Arc::clone(deps))),
    ]
}

fn to_snapshot<T: Serialize>(state: &T) -> serde_json::Value {
    serde_json::to_value(state).unwrap_or_default()
}

fn from_snapshot<T: serde::de::DeserializeOwned>(
    name: WorkflowName,
    snapshot: serde_json::Value,
) -> Result<T> {
    serde_json::from_value(snapshot)
        .map_err(|err| anyhow::anyhow!("Invalid {name} region snapshot: {err}"))
}

/// Whether `event` reports that the task owned by `workflow` gave up.
fn gave_up(workflow: WorkflowName, event: &Event) -> bool {
    matches!(event, Event::TaskFailed { task } if task == workflow.as_str())
}
