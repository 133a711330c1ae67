//! Worker runner: claims tasks, runs handlers in bounded slots, settles outcomes.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span, debug, error, info, warn};

use super::backoff::{BackoffPolicy, jittered};
use crate::error::{Error, Result};
use crate::model::{Arguments, Task, WorkerId};
use crate::registry::{HandlerError, TaskContext, TaskHandler, TaskRegistry};
use crate::store::{ClaimRequest, TaskStore};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Configuration for the worker runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of tasks executed concurrently.
    pub slots: usize,
    /// Idle wait between empty claim cycles.
    pub poll_interval: Duration,
    /// Fraction of `poll_interval` added at random to each idle wait.
    pub poll_jitter: f64,
    pub lease_duration: Duration,
    /// How often a running task's lease is pushed forward.
    pub renew_interval: Duration,
    /// Per-handler deadline. Exceeding it is a transient failure.
    pub task_timeout: Duration,
    /// How long shutdown waits for in-flight tasks before abandoning them.
    pub grace_period: Duration,
    pub backoff: BackoffPolicy,
    /// Pause after a claim cycle fails against the store.
    pub error_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            poll_interval: Duration::from_secs(1),
            poll_jitter: 0.2,
            lease_duration: Duration::from_secs(60),
            renew_interval: Duration::from_secs(20),
            task_timeout: Duration::from_secs(300),
            grace_period: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// How one attempt ended, before it is written back.
enum Attempt {
    Succeeded,
    Failed(HandlerError),
    /// Another worker took the lease over. Nothing may be written.
    LeaseLost,
}

impl Attempt {
    fn label(&self) -> &'static str {
        match self {
            Attempt::Succeeded => "succeeded",
            Attempt::Failed(e) if e.is_permanent() => "permanent_failure",
            Attempt::Failed(_) => "transient_failure",
            Attempt::LeaseLost => "lease_lost",
        }
    }
}

/// Aborts the wrapped task when dropped, so a timed-out or abandoned handler
/// does not outlive its slot.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The runner loop: claim up to the free slot count, execute, settle.
#[derive(Clone)]
pub struct Runner {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    config: RunnerConfig,
    worker_id: WorkerId,
    shutdown: Arc<Notify>,
}

impl Runner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            worker_id: WorkerId::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Signal the runner to stop claiming and drain in-flight tasks.
    ///
    /// Safe to call before `run` starts; the signal is kept until observed.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until [`Runner::shutdown`] is called.
    ///
    /// Store failures are logged and retried after `error_backoff`; they never
    /// end the loop.
    pub async fn run(&self) -> Result<()> {
        let slots = self.config.slots.max(1);
        info!(
            worker = %self.worker_id,
            slots,
            task_types = ?self.registry.task_types(),
            "runner started"
        );

        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_slot_exit(joined);
            }

            let free = slots.saturating_sub(in_flight.len());
            let mut claimed_any = false;
            let mut cycle_failed = false;

            if free > 0 {
                match self.claim(free).await {
                    Ok(tasks) => {
                        claimed_any = !tasks.is_empty();
                        for task in tasks {
                            let runner = self.clone();
                            in_flight.spawn(async move { runner.execute(task).await });
                        }
                    }
                    Err(e) => {
                        cycle_failed = true;
                        metrics::runner_cycle_errors().add(1, &[]);
                        warn!(error = %e, "claim cycle failed, backing off");
                    }
                }
            }

            let full = in_flight.len() >= slots;
            let busy = !in_flight.is_empty();
            let idle_wait = jittered(self.config.poll_interval, self.config.poll_jitter);

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                Some(joined) = in_flight.join_next(), if busy => log_slot_exit(joined),
                _ = tokio::time::sleep(self.config.error_backoff), if cycle_failed && !full => {}
                _ = std::future::ready(()), if claimed_any && !full => {}
                _ = self.store.wait_for_work(idle_wait), if !cycle_failed && !claimed_any && !full => {}
            }
        }

        self.drain(in_flight).await;
        info!(worker = %self.worker_id, "runner stopped");
        Ok(())
    }

    /// Claim and execute until nothing is claimable and no slot is busy.
    /// Returns the number of attempts executed.
    ///
    /// Unlike [`Runner::run`], store errors end the call.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let slots = self.config.slots.max(1);
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut executed = 0;

        loop {
            let free = slots.saturating_sub(in_flight.len());
            if free > 0 {
                for task in self.claim(free).await? {
                    executed += 1;
                    let runner = self.clone();
                    in_flight.spawn(async move { runner.execute(task).await });
                }
            }
            match in_flight.join_next().await {
                Some(joined) => log_slot_exit(joined),
                None => return Ok(executed),
            }
        }
    }

    async fn claim(&self, capacity: usize) -> Result<Vec<Task>> {
        let request = ClaimRequest {
            owner: self.worker_id.clone(),
            capacity,
            lease: to_chrono(self.config.lease_duration),
            now: Utc::now(),
        };
        let tasks = self.store.claim_next(&request).await?;
        if !tasks.is_empty() {
            metrics::task_claimed().add(tasks.len() as u64, &[]);
            debug!(count = tasks.len(), capacity, "claimed tasks");
        }
        Ok(tasks)
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        info!(
            in_flight = in_flight.len(),
            grace_period = ?self.config.grace_period,
            "shutdown requested, waiting for in-flight tasks"
        );

        let drained = tokio::time::timeout(self.config.grace_period, async {
            while let Some(joined) = in_flight.join_next().await {
                log_slot_exit(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "grace period elapsed, abandoning in-flight tasks to lease expiry"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
    }

    /// Run one claimed task to a settled state.
    async fn execute(&self, task: Task) {
        let span = start_task_span(&task.task_type, task.id, task.attempts);
        self.execute_in_span(task, &span)
            .instrument(span.clone())
            .await
    }

    async fn execute_in_span(&self, task: Task, span: &Span) {
        let Some(handler) = self.registry.get(&task.task_type) else {
            metrics::task_unroutable()
                .add(1, &[KeyValue::new("task_type", task.task_type.clone())]);
            let reason = format!(
                "configuration error: no handler registered for task type {:?}",
                task.task_type
            );
            warn!(%reason, "dead-lettering unroutable task");
            self.settle_dead(&task, &reason, span).await;
            return;
        };

        let ctx = TaskContext {
            task_id: task.id,
            task_type: task.task_type.clone(),
            attempt: task.attempts,
            max_attempts: task.max_attempts,
        };

        let started = Instant::now();
        let attempt = self.supervise(handler, ctx, task.arguments.clone()).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        metrics::task_duration_ms().record(
            duration_ms,
            &[
                KeyValue::new("task_type", task.task_type.clone()),
                KeyValue::new("outcome", attempt.label()),
            ],
        );

        match attempt {
            Attempt::Succeeded => {
                info!(duration_ms, "task completed");
                self.settle_done(&task, span).await;
            }
            Attempt::Failed(failure) => {
                warn!(duration_ms, error = %failure, "task attempt failed");
                self.settle_failure(&task, failure, span).await;
            }
            Attempt::LeaseLost => {
                warn!(duration_ms, "lease lost mid-execution, abandoning task");
            }
        }
    }

    /// Race the handler against its deadline while renewing the lease.
    async fn supervise(
        &self,
        handler: Arc<dyn TaskHandler>,
        ctx: TaskContext,
        arguments: Arguments,
    ) -> Attempt {
        let task_id = ctx.task_id;
        let mut handle = AbortOnDrop(tokio::spawn(
            async move { handler.run(ctx, arguments).await }.in_current_span(),
        ));

        let deadline = tokio::time::sleep(self.config.task_timeout);
        tokio::pin!(deadline);

        let period = self.config.renew_interval.max(Duration::from_millis(10));
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut handle.0 => {
                    return match joined {
                        Ok(Ok(())) => Attempt::Succeeded,
                        Ok(Err(failure)) => Attempt::Failed(failure),
                        Err(e) => Attempt::Failed(HandlerError::transient(join_failure(e))),
                    };
                }
                _ = &mut deadline => {
                    return Attempt::Failed(HandlerError::transient(format!(
                        "timed out after {:?}",
                        self.config.task_timeout
                    )));
                }
                _ = renew.tick() => {
                    let now = Utc::now();
                    let expires_at = now + to_chrono(self.config.lease_duration);
                    match self
                        .store
                        .renew_lease(task_id, &self.worker_id, expires_at, now)
                        .await
                    {
                        Ok(()) => debug!(%expires_at, "lease renewed"),
                        Err(Error::LeaseLost(_)) => return Attempt::LeaseLost,
                        Err(e) => warn!(error = %e, "lease renewal failed, will retry"),
                    }
                }
            }
        }
    }

    async fn settle_done(&self, task: &Task, span: &Span) {
        let result = self
            .store
            .mark_done(task.id, &self.worker_id, Utc::now())
            .await;
        self.record_settlement(result, "done", span);
    }

    async fn settle_failure(&self, task: &Task, failure: HandlerError, span: &Span) {
        if failure.is_permanent() {
            let reason = format!("permanent failure: {}", failure.message());
            self.settle_dead(task, &reason, span).await;
            return;
        }
        if task.attempts >= task.max_attempts {
            let reason = format!(
                "exhausted {}/{} attempts: {}",
                task.attempts,
                task.max_attempts,
                failure.message()
            );
            self.settle_dead(task, &reason, span).await;
            return;
        }

        let now = Utc::now();
        let delay = self.config.backoff.delay(task.attempts);
        let not_before = now + to_chrono(delay);
        let result = self
            .store
            .mark_failed_retry(task.id, &self.worker_id, failure.message(), not_before, now)
            .await;
        if result.is_ok() {
            info!(retry_in = ?delay, %not_before, "retry scheduled");
        }
        self.record_settlement(result, "pending", span);
    }

    async fn settle_dead(&self, task: &Task, reason: &str, span: &Span) {
        let result = self
            .store
            .mark_dead(task.id, &self.worker_id, reason, Utc::now())
            .await;
        if result.is_ok() {
            error!(task_type = %task.task_type, %reason, "task dead-lettered");
        }
        self.record_settlement(result, "dead", span);
    }

    /// Record a successful outcome write, or log why it was not applied.
    /// Outcome-write errors never propagate out of a slot.
    fn record_settlement(&self, result: Result<()>, to: &'static str, span: &Span) {
        match result {
            Ok(()) => {
                record_state_transition(span, "in_progress", to);
                metrics::task_state_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", "in_progress"),
                        KeyValue::new("to", to),
                    ],
                );
            }
            Err(Error::LeaseLost(id)) => {
                warn!(task = %id, to, "lease lost before outcome write, leaving task to its new owner");
            }
            Err(e) => {
                error!(error = %e, to, "outcome write failed, task will be reclaimed after lease expiry");
            }
        }
    }
}

fn log_slot_exit(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("slot panicked outside its handler: {}", join_failure(e));
        } else {
            debug!("slot cancelled");
        }
    }
}

fn join_failure(e: JoinError) -> String {
    if !e.is_panic() {
        return format!("handler cancelled: {e}");
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("handler panicked: {message}")
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
