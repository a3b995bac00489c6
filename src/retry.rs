use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Idempotent asynchronous action a task can attempt any number of times.
pub type Action<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Wraps an async closure into an [`Action`].
pub fn action<T, F, Fut>(f: F) -> Action<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Running,
    RetryWait,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Retries allowed after the first attempt; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    RetryAfter(Duration),
    GaveUp,
}

/// One action retried on a fixed interval until it succeeds or exceeds its retry ceiling.
pub struct RetryableTask<T> {
    id: String,
    action: Action<T>,
    policy: RetryPolicy,
    retries: u32,
    state: TaskState,
}

impl<T> RetryableTask<T> {
    pub fn new(id: impl Into<String>, policy: RetryPolicy, action: Action<T>) -> Self {
        Self {
            id: id.into(),
            action,
            policy,
            retries: 0,
            state: TaskState::Running,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Id of the delayed action that re-attempts this task.
    #[must_use]
    pub fn timer_id(&self) -> String {
        format!("retry:{}", self.id)
    }

    /// Marks the task as waiting for an already scheduled retry.
    pub fn park(&mut self) {
        self.state = TaskState::RetryWait;
    }

    /// Starts one attempt of the action.
    pub fn attempt(&mut self) -> BoxFuture<'static, Result<T>> {
        self.state = TaskState::Running;
        (self.action)()
    }

    pub fn succeed(&mut self) {
        self.state = TaskState::Success;
    }

    /// Records a failed attempt and decides whether another one follows.
    pub fn fail(&mut self, err: &anyhow::Error) -> Outcome {
        self.retries = self.retries.saturating_add(1);
        if self
            .policy
            .max_retries
            .is_some_and(|max| self.retries > max)
        {
            self.state = TaskState::Error;
            error!(
                "Task {} failed after {} attempts: {err:#}",
                self.id, self.retries
            );
            return Outcome::GaveUp;
        }
        self.state = TaskState::RetryWait;
        warn!(
            "Task {} failed (attempt {}), retrying in {:?}: {err:#}",
            self.id, self.retries, self.policy.interval
        );
        Outcome::RetryAfter(self.policy.interval)
    }
}

/// Drives a task outside the orchestrator, sleeping with `sleep_fn` between attempts.
///
/// # Errors
/// Returns the last error once the task exceeds its retry ceiling.
pub async fn run_to_completion<T, SleepFn, SleepFut>(
    task: &mut RetryableTask<T>,
    mut sleep_fn: SleepFn,
) -> Result<T>
where
    SleepFn: FnMut(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
{
    loop {
        match task.attempt().await {
            Ok(value) => {
                task.succeed();
                return Ok(value);
            }
            Err(err) => match task.fail(&err) {
                Outcome::RetryAfter(delay) => sleep_fn(delay).await,
                Outcome::GaveUp => return Err(err),
            },
        }
    }
}
