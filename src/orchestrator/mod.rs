//! Event loop composing every workflow region over one shared context.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::hub::HubApi;
use crate::pki::Pki;
use crate::retry::{Outcome, RetryPolicy, RetryableTask};
use crate::secrets::SecretStore;
use crate::types::JwsEntry;
use crate::workflows::{self, Command, Deps, Effects, Phase, Workflow, WorkflowName, WorkflowSettings};

mod aggregator;
mod context;
mod events;
mod persist;
mod progress;

pub use aggregator::{ConnectorConfig, TlsConfig, TlsCreds, TlsSection};
pub use context::{Artifact, JwsPublicKey, OrchestratorContext, reduce};
pub use events::Event;
pub use persist::{PendingTimer, PersistedState, Snapshot, shape_hash};
pub use progress::ProgressEntry;

/// Receives everything the orchestrator propagates to connectors.
pub trait ConfigSink: Send + Sync {
    /// Called with the entire configuration after every merge or pull request. Revisions
    /// increase with every call.
    fn push_configuration(&self, revision: u64, config: &ConnectorConfig);
    fn push_peer_jws(&self, keys: &BTreeMap<String, JwsEntry>);
}

pub struct Collaborators {
    pub hub: Arc<dyn HubApi>,
    pub pki: Arc<dyn Pki>,
    pub store: Arc<dyn SecretStore>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workflows: WorkflowSettings,
    pub retry: RetryPolicy,
    /// Secret-store key of the persisted state.
    pub state_key: String,
}

impl From<&Settings> for OrchestratorSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            workflows: WorkflowSettings::from(settings),
            retry: RetryPolicy {
                interval: settings.retry.interval,
                max_retries: settings.retry.max_retries,
            },
            state_key: settings.state.secret_key.clone(),
        }
    }
}

pub struct Orchestrator {
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    sink: Arc<dyn ConfigSink>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        settings: OrchestratorSettings,
        sink: Arc<dyn ConfigSink>,
    ) -> Self {
        Self {
            collaborators,
            settings,
            sink,
        }
    }

    /// Resumes from the persisted state when it matches this build, otherwise starts every
    /// region fresh, then runs the event loop in the background.
    ///
    /// # Errors
    /// Returns an error if the persisted state cannot be read.
    pub async fn start(self) -> Result<OrchestratorHandle> {
        let Orchestrator {
            collaborators,
            settings,
            sink,
        } = self;
        let store = Arc::clone(&collaborators.store);
        let deps = Arc::new(Deps {
            hub: collaborators.hub,
            pki: collaborators.pki,
            store: collaborators.store,
            settings: settings.workflows,
        });
        let workflows = workflows::build(&deps);
        let names: Vec<WorkflowName> = workflows.iter().map(|workflow| workflow.name()).collect();
        let hash = persist::shape_hash(&names);

        let persisted = persist::load(store.as_ref(), &settings.state_key)
            .await
            .context("Failed to read persisted orchestrator state")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = watch::channel(None);
        let (onboarding_tx, onboarding_rx) = watch::channel(false);
        let persister = spawn_persister(store, settings.state_key, persist_rx);

        let mut event_loop = EventLoop {
            deps,
            ctx: OrchestratorContext::default(),
            workflows,
            tasks: HashMap::new(),
            timers: HashMap::new(),
            generation: 0,
            version: persisted.as_ref().map_or(0, |state| state.version),
            hash,
            policy: settings.retry,
            tx: tx.clone(),
            sink,
            persist_tx,
            persister: Some(persister),
            onboarding_tx,
        };

        match persisted {
            Some(state) if state.hash == event_loop.hash => {
                let version = state.version;
                if let Err(err) = event_loop.resume(state) {
                    warn!("Cannot resume persisted state, starting fresh: {err:#}");
                    event_loop.workflows = workflows::build(&event_loop.deps);
                    event_loop.fresh_start();
                } else {
                    info!("Orchestrator resumed from state version {version}");
                }
            }
            Some(_) => {
                info!("Persisted state belongs to another orchestrator shape, starting fresh");
                event_loop.fresh_start();
            }
            None => {
                info!("No persisted state, starting fresh");
                event_loop.fresh_start();
            }
        }

        tokio::spawn(event_loop.run(rx));
        Ok(OrchestratorHandle {
            tx,
            onboarding: onboarding_rx,
        })
    }
}

enum Envelope {
    Event(Event),
    TaskFinished {
        task: String,
        generation: u64,
        result: Result<Event>,
    },
    TimerFired {
        timer: String,
        generation: u64,
    },
    Inspect(oneshot::Sender<OrchestratorContext>),
    Phases(oneshot::Sender<BTreeMap<WorkflowName, Phase>>),
    Stop(oneshot::Sender<()>),
}

/// Cloneable access to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    onboarding: watch::Receiver<bool>,
}

impl OrchestratorHandle {
    /// Injects an external event such as `CREATE_JWS`.
    ///
    /// # Errors
    /// Returns an error if the orchestrator has stopped.
    pub fn send_event(&self, event: Event) -> Result<()> {
        self.tx
            .send(Envelope::Event(event))
            .map_err(|_| anyhow::anyhow!("Orchestrator is stopped"))
    }

    /// Read-only snapshot of the shared context.
    ///
    /// # Errors
    /// Returns an error if the orchestrator has stopped.
    pub async fn get_context(&self) -> Result<OrchestratorContext> {
        self.request(Envelope::Inspect).await
    }

    /// Current phase of every region.
    ///
    /// # Errors
    /// Returns an error if the orchestrator has stopped.
    pub async fn region_phases(&self) -> Result<BTreeMap<WorkflowName, Phase>> {
        self.request(Envelope::Phases).await
    }

    /// Halts every region and timer; returns once the last state write has finished.
    ///
    /// # Errors
    /// Returns an error if the orchestrator has already stopped.
    pub async fn stop(&self) -> Result<()> {
        self.request(Envelope::Stop).await
    }

    /// Turns `true` once every tracked workflow has succeeded at least once.
    #[must_use]
    pub fn onboarding(&self) -> watch::Receiver<bool> {
        self.onboarding.clone()
    }

    async fn request<T>(&self, envelope: impl FnOnce(oneshot::Sender<T>) -> Envelope) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(envelope(reply_tx))
            .map_err(|_| anyhow::anyhow!("Orchestrator is stopped"))?;
        reply_rx
            .await
            .context("Orchestrator stopped before replying")
    }
}

struct TaskSlot {
    task: RetryableTask<Event>,
    generation: u64,
}

struct TimerSlot {
    handle: JoinHandle<()>,
    generation: u64,
    event: Event,
    delay: Duration,
    scheduled_at_ms: i64,
}

struct EventLoop {
    deps: Arc<Deps>,
    ctx: OrchestratorContext,
    workflows: Vec<Box<dyn Workflow>>,
    tasks: HashMap<String, TaskSlot>,
    timers: HashMap<String, TimerSlot>,
    generation: u64,
    version: u64,
    hash: String,
    policy: RetryPolicy,
    tx: mpsc::UnboundedSender<Envelope>,
    sink: Arc<dyn ConfigSink>,
    persist_tx: watch::Sender<Option<PersistedState>>,
    persister: Option<JoinHandle<()>>,
    onboarding_tx: watch::Sender<bool>,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        let ack = loop {
            let Some(envelope) = rx.recv().await else {
                break None;
            };
            match envelope {
                Envelope::Event(event) => {
                    info!("Received {}", event.kind());
                    self.dispatch(event);
                }
                Envelope::TaskFinished {
                    task,
                    generation,
                    result,
                } => self.on_task_finished(task, generation, result),
                Envelope::TimerFired { timer, generation } => self.on_timer_fired(&timer, generation),
                Envelope::Inspect(reply) => {
                    let _ = reply.send(self.ctx.clone());
                }
                Envelope::Phases(reply) => {
                    let _ = reply.send(
                        self.workflows
                            .iter()
                            .map(|workflow| (workflow.name(), workflow.phase()))
                            .collect(),
                    );
                }
                Envelope::Stop(reply) => break Some(reply),
            }
        };

        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        self.tasks.clear();
        let persister = self.persister.take();
        drop(self);
        if let Some(persister) = persister {
            let _ = persister.await;
        }
        info!("Orchestrator stopped");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn fresh_start(&mut self) {
        self.ctx = OrchestratorContext::default();
        progress::init(&mut self.ctx);
        let mut fx = Effects::new(self.policy);
        for workflow in &mut self.workflows {
            workflow.enter(&self.ctx, &mut fx);
        }
        let mut queue = VecDeque::new();
        self.apply(fx, &mut queue, false);
        self.drain(queue);
        self.persist();
    }

    fn resume(&mut self, persisted: PersistedState) -> Result<()> {
        let PersistedState {
            state,
            pending_timers,
            ..
        } = persisted;
        for workflow in &mut self.workflows {
            if let Some(snapshot) = state.regions.get(&workflow.name()) {
                workflow.restore(snapshot.clone())?;
            }
        }

        self.ctx = state.context;
        progress::init(&mut self.ctx);
        if self.ctx.onboarding_complete {
            self.onboarding_tx.send_replace(true);
        }

        let now = now_ms();
        for timer in pending_timers {
            let delay = timer.remaining(now);
            debug!("Re-arming timer {} in {delay:?}", timer.id);
            self.arm_timer(timer.id, delay, timer.event);
        }

        let mut fx = Effects::new(self.policy);
        for workflow in &mut self.workflows {
            workflow.resume(&self.ctx, &mut fx);
        }
        let mut queue = VecDeque::new();
        self.apply(fx, &mut queue, true);
        self.drain(queue);
        self.persist();
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        self.drain(VecDeque::from([event]));
        self.persist();
    }

    /// Delivers events to the reducers and then to every region, in FIFO order.
    fn drain(&mut self, mut queue: VecDeque<Event>) {
        while let Some(event) = queue.pop_front() {
            debug!("Handling {}", event.kind());
            if let Event::RetryTask { task } = &event {
                self.retry_task(task);
                continue;
            }

            context::reduce(&mut self.ctx, &event);
            if aggregator::apply(&mut self.ctx, &event) {
                self.ctx.config_revision += 1;
                self.sink
                    .push_configuration(self.ctx.config_revision, &self.ctx.connector_config);
            }
            if let Event::PeerJwsChanged { keys } = &event {
                self.sink.push_peer_jws(keys);
            }
            if progress::record(&mut self.ctx, &event, now_secs()) {
                info!("Onboarding complete: every workflow succeeded at least once");
                self.onboarding_tx.send_replace(true);
            }

            let mut fx = Effects::new(self.policy);
            for workflow in &mut self.workflows {
                workflow.on_event(&self.ctx, &event, &mut fx);
            }
            self.apply(fx, &mut queue, false);
        }
    }

    fn apply(&mut self, fx: Effects, queue: &mut VecDeque<Event>, resuming: bool) {
        for command in fx.into_commands() {
            match command {
                Command::Run(task) => self.start_task(task, resuming),
                Command::Emit(event) => queue.push_back(event),
                Command::Schedule {
                    timer,
                    delay,
                    event,
                } => self.arm_timer(timer, delay, event),
                Command::Cancel(timer) => self.cancel_timer(&timer),
            }
        }
    }

    /// Replaces any task with the same id; its outstanding result becomes stale.
    fn start_task(&mut self, mut task: RetryableTask<Event>, resuming: bool) {
        let generation = self.next_generation();
        let retry_timer = task.timer_id();
        if resuming && self.timers.contains_key(&retry_timer) {
            debug!("Task {} resumes waiting for its retry", task.id());
            task.park();
        } else {
            self.cancel_timer(&retry_timer);
            spawn_attempt(&self.tx, &mut task, generation);
        }
        self.tasks.insert(
            task.id().to_string(),
            TaskSlot { task, generation },
        );
    }

    fn retry_task(&mut self, id: &str) {
        let Some(slot) = self.tasks.get_mut(id) else {
            debug!("No task {id} to retry");
            return;
        };
        spawn_attempt(&self.tx, &mut slot.task, slot.generation);
    }

    fn on_task_finished(&mut self, id: String, generation: u64, result: Result<Event>) {
        let Some(slot) = self.tasks.get_mut(&id) else {
            debug!("Discarding result of finished task {id}");
            return;
        };
        if slot.generation != generation {
            debug!("Discarding stale result of task {id}");
            return;
        }

        match result {
            Ok(event) => {
                slot.task.succeed();
                self.tasks.remove(&id);
                self.dispatch(event);
            }
            Err(err) => {
                let outcome = slot.task.fail(&err);
                let retry_timer = slot.task.timer_id();
                match outcome {
                    Outcome::RetryAfter(delay) => {
                        self.arm_timer(retry_timer, delay, Event::RetryTask { task: id });
                        self.persist();
                    }
                    Outcome::GaveUp => {
                        self.tasks.remove(&id);
                        self.dispatch(Event::TaskFailed { task: id });
                    }
                }
            }
        }
    }

    fn on_timer_fired(&mut self, id: &str, generation: u64) {
        if !self
            .timers
            .get(id)
            .is_some_and(|slot| slot.generation == generation)
        {
            debug!("Ignoring cancelled timer {id}");
            return;
        }
        if let Some(slot) = self.timers.remove(id) {
            self.dispatch(slot.event);
        }
    }

    fn arm_timer(&mut self, id: String, delay: Duration, event: Event) {
        self.cancel_timer(&id);
        let generation = self.next_generation();
        let tx = self.tx.clone();
        let timer = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Envelope::TimerFired { timer, generation });
        });
        self.timers.insert(
            id,
            TimerSlot {
                handle,
                generation,
                event,
                delay,
                scheduled_at_ms: now_ms(),
            },
        );
    }

    fn cancel_timer(&mut self, id: &str) {
        if let Some(slot) = self.timers.remove(id) {
            slot.handle.abort();
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Hands the current state to the background writer.
    fn persist(&mut self) {
        self.version += 1;
        let regions = self
            .workflows
            .iter()
            .map(|workflow| (workflow.name(), workflow.snapshot()))
            .collect();
        let mut pending_timers: Vec<PendingTimer> = self
            .timers
            .iter()
            .map(|(id, slot)| PendingTimer {
                id: id.clone(),
                event: slot.event.clone(),
                delay_ms: u64::try_from(slot.delay.as_millis()).unwrap_or(u64::MAX),
                scheduled_at_ms: slot.scheduled_at_ms,
            })
            .collect();
        pending_timers.sort_by(|a, b| a.id.cmp(&b.id));

        self.persist_tx.send_replace(Some(PersistedState {
            state: Snapshot {
                regions,
                context: self.ctx.clone(),
            },
            hash: self.hash.clone(),
            version: self.version,
            pending_timers,
        }));
    }
}

fn spawn_attempt(
    tx: &mpsc::UnboundedSender<Envelope>,
    task: &mut RetryableTask<Event>,
    generation: u64,
) {
    let attempt = task.attempt();
    let id = task.id().to_string();
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = attempt.await;
        let _ = tx.send(Envelope::TaskFinished {
            task: id,
            generation,
            result,
        });
    });
}

/// Writes the latest state after each transition; a burst of transitions may coalesce
/// into one write of the newest version.
fn spawn_persister(
    store: Arc<dyn SecretStore>,
    key: String,
    mut rx: watch::Receiver<Option<PersistedState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            let Some(state) = state else {
                continue;
            };
            if let Err(err) = persist::save(store.as_ref(), &key, &state).await {
                error!("{err:#}");
            }
        }
    })
}

fn now_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn now_ms() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
