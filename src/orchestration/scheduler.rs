//! Step scheduler for goal execution.
//!
//! The `StepScheduler` drives one goal's step graph to completion. It picks
//! steps according to the goal's execution approach, submits each one to the
//! `OperationQueue` on its assigned worker, hands failures to the
//! `ContingencyManager`, and reports every settled step to a `ProgressSink`.
//!
//! The approach is re-read between steps and rounds, so an `adapt`
//! contingency takes effect on the next pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, RwLock};

use crate::config::Config;
use crate::core::{Clock, StepId, StepStatus};
use crate::error::{Error, Result};
use crate::goal::{ExecutionApproach, Goal, GoalId, GoalStatus};
use crate::orchestration::contingency::{
    ContingencyDecision, ContingencyManager, ContingencyTrigger, FailureContext,
};
use crate::orchestration::queue::{OperationQueue, Priority};
use crate::orchestration::service::{OperationName, ServiceId};
use crate::{aplog_debug, aplog_warn};

/// Control signal for a running goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunControl {
    #[default]
    Run,
    /// Finish in-flight steps, start nothing new.
    Pause,
    /// Abandon the goal at the next checkpoint.
    Stop,
}

/// Outcome of one step attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step_id: StepId,
    pub step_name: String,
    pub worker: Option<ServiceId>,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub time_to_complete: Option<Duration>,
}

/// Goal progress after a step settled or the goal completed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub goal_id: GoalId,
    pub owner: String,
    pub progress: u8,
    pub status: GoalStatus,
    pub step: Option<StepReport>,
}

/// Receives progress updates from the scheduler.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, update: ProgressUpdate);
}

/// A sink that drops every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn publish(&self, _update: ProgressUpdate) {}
}

/// Everything needed to submit one step attempt.
struct Submission {
    name: String,
    service: ServiceId,
    operation: OperationName,
    params: Value,
    priority: Priority,
    min_quality: Option<f64>,
}

/// How a step attempt loop ended when it did not fail the goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StepRun {
    failures: u32,
}

/// Drives goal step graphs through the operation queue.
pub struct StepScheduler {
    queue: OperationQueue,
    contingency: ContingencyManager,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    progress: Arc<dyn ProgressSink>,
}

impl StepScheduler {
    /// Create a new scheduler.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue that runs step operations on workers
    /// * `config` - Dependency wait and adaptive parallelism settings
    /// * `clock` - Time source for step and goal timestamps
    /// * `progress` - Receiver of per-step progress updates
    pub fn new(
        queue: OperationQueue,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            queue,
            contingency: ContingencyManager::new(),
            config,
            clock,
            progress,
        }
    }

    /// Steps that may start now.
    pub async fn ready_set(&self, goal: &RwLock<Goal>) -> Vec<StepId> {
        goal.read().await.strategy.steps.ready_set()
    }

    /// Run the goal's steps until every step is completed.
    ///
    /// The final settle moves the goal to `completed`. A step failure that no
    /// contingency resolves is returned as the error, with the step recorded
    /// in `execution.failed_step`.
    ///
    /// # Errors
    /// - `Cancelled` when `control` switches to `Stop`
    /// - `DependencyTimeout` when dependencies stay unmet past the limit
    /// - `StepAborted` / `StepEscalated` from contingency actions
    /// - the step's own error when no contingency applies
    pub async fn drive(
        &self,
        goal: &RwLock<Goal>,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<()> {
        let base_cap = self.config.adaptive_parallelism.max(1);
        let mut adaptive_cap = base_cap;

        loop {
            checkpoint(control).await?;

            let approach = {
                let mut g = goal.write().await;
                if g.strategy.steps.all_completed() {
                    if g.status == GoalStatus::Active {
                        // Completion deferred by a pause that covered the last settle.
                        let now = self.clock.now();
                        g.transition(GoalStatus::Completed, now)?;
                        let update = ProgressUpdate {
                            goal_id: g.id,
                            owner: g.owner.clone(),
                            progress: g.execution.progress,
                            status: g.status,
                            step: None,
                        };
                        drop(g);
                        self.progress.publish(update).await;
                    }
                    return Ok(());
                }
                g.strategy.approach
            };

            match approach {
                ExecutionApproach::Sequential => self.sequential_pass(goal).await?,
                ExecutionApproach::Parallel => {
                    self.parallel_round(goal, usize::MAX).await?;
                }
                ExecutionApproach::Adaptive => {
                    let failures = self.parallel_round(goal, adaptive_cap).await?;
                    adaptive_cap = self.next_adaptive_cap(goal, failures, base_cap).await;
                }
            }
        }
    }

    /// Run the first unfinished step in list order.
    async fn sequential_pass(&self, goal: &RwLock<Goal>) -> Result<()> {
        let next = {
            let g = goal.read().await;
            g.strategy
                .steps
                .steps()
                .into_iter()
                .find(|step| !step.is_completed())
                .map(|step| step.id.clone())
        };
        let Some(step_id) = next else {
            return Ok(());
        };
        self.wait_for_dependencies(goal, &step_id).await?;
        self.run_step(goal, &step_id).await.map(|_| ())
    }

    /// Launch up to `cap` ready steps together and wait for all of them.
    ///
    /// Returns the number of failed attempts in the round.
    async fn parallel_round(&self, goal: &RwLock<Goal>, cap: usize) -> Result<u32> {
        let batch: Vec<StepId> = {
            let mut g = goal.write().await;
            let ready = g.strategy.steps.ready_set();
            if ready.is_empty() {
                let blocked = g
                    .strategy
                    .steps
                    .steps()
                    .into_iter()
                    .find(|step| step.status == StepStatus::Pending)
                    .map(|step| step.id.clone());
                drop(g);
                let step_id = blocked.ok_or_else(|| {
                    Error::Validation("no pending step left to schedule".to_string())
                })?;
                self.wait_for_dependencies(goal, &step_id).await?;
                return Ok(0);
            }
            let batch: Vec<StepId> = ready.into_iter().take(cap).collect();
            for id in &batch {
                if let Some(step) = g.strategy.steps.get_mut(id) {
                    step.mark_ready();
                }
            }
            batch
        };

        aplog_debug!("scheduler: launching round of {} steps", batch.len());
        let outcomes = join_all(batch.iter().map(|id| self.run_step(goal, id))).await;

        let mut failures = 0;
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(run) => failures += run.failures,
                Err(e) => {
                    failures += 1;
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(failures),
        }
    }

    /// Between adaptive rounds: a failing round narrows to one step, a goal
    /// behind schedule widens to the full ready set.
    async fn next_adaptive_cap(&self, goal: &RwLock<Goal>, failures: u32, base: usize) -> usize {
        if failures > 0 {
            return 1;
        }
        let g = goal.read().await;
        if g.is_overrun(1.0, self.clock.now()) {
            usize::MAX
        } else {
            base
        }
    }

    /// Wait until every dependency of `step_id` is completed.
    ///
    /// Polls every `dependency_poll_ms`. After `dependency_timeout_ms` the
    /// step is blocked and recorded as the goal's failed step.
    ///
    /// # Errors
    /// Returns `DependencyTimeout` naming the dependencies still unmet.
    pub async fn wait_for_dependencies(&self, goal: &RwLock<Goal>, step_id: &StepId) -> Result<()> {
        let limit = self.config.dependency_timeout();
        let poll = self.config.dependency_poll();
        let started = tokio::time::Instant::now();

        loop {
            let unmet = goal.read().await.strategy.steps.unmet_dependencies(step_id);
            if unmet.is_empty() {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= limit {
                let mut g = goal.write().await;
                let err = Error::DependencyTimeout {
                    step: step_id.clone(),
                    unmet,
                    waited,
                };
                if let Some(step) = g.strategy.steps.get_mut(step_id) {
                    step.block(&err.to_string());
                }
                g.execution.failed_step = Some(step_id.clone());
                aplog_warn!("goal {}: {}", g.id.short(), err);
                return Err(err);
            }
            tokio::time::sleep(poll.min(limit - waited)).await;
        }
    }

    /// Run one step, resubmitting it while contingencies say so.
    async fn run_step(&self, goal: &RwLock<Goal>, step_id: &StepId) -> Result<StepRun> {
        let mut failures = 0;
        loop {
            let submission = self.prepare(goal, step_id).await?;
            let outcome = self.submit(&submission).await;

            match outcome {
                Ok(value) => {
                    self.settle_success(goal, step_id, value).await?;
                    return Ok(StepRun { failures });
                }
                Err((failure, error)) => {
                    failures += 1;
                    let decision = self.settle_failure(goal, step_id, &failure, &error).await?;
                    match decision {
                        ContingencyDecision::Retry { delay } => {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        ContingencyDecision::Alternative { .. } => {}
                        ContingencyDecision::Adapted { .. } => return Ok(StepRun { failures }),
                        ContingencyDecision::Escalated { reason } => {
                            self.record_failed_step(goal, step_id).await;
                            return Err(Error::StepEscalated {
                                step: submission.name,
                                reason,
                            });
                        }
                        ContingencyDecision::Aborted { reason } => {
                            self.record_failed_step(goal, step_id).await;
                            return Err(Error::StepAborted {
                                step: submission.name,
                                reason,
                            });
                        }
                        ContingencyDecision::Unhandled => {
                            self.record_failed_step(goal, step_id).await;
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Move the step to `executing` and build its operation.
    async fn prepare(&self, goal: &RwLock<Goal>, step_id: &StepId) -> Result<Submission> {
        let mut g = goal.write().await;
        let now = self.clock.now();

        let step = g
            .strategy
            .steps
            .get(step_id)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in plan", step_id)))?;
        let service = step.assigned_worker().cloned().ok_or_else(|| {
            Error::Validation(format!("Step {} has no assigned worker", step_id))
        })?;

        let mut inputs = Map::new();
        for dep in g.strategy.steps.dependencies_of(step_id) {
            inputs.insert(
                dep.id.to_string(),
                dep.result.clone().unwrap_or(Value::Null),
            );
        }
        let params = json!({
            "goal_id": g.id,
            "step_id": step.id,
            "name": step.name,
            "description": step.description,
            "step_type": step.step_type,
            "inputs": inputs,
        });
        let submission = Submission {
            name: step.name.clone(),
            service,
            operation: step.operation.clone(),
            params,
            priority: Priority::from(g.priority),
            min_quality: g
                .strategy
                .contingencies
                .iter()
                .filter(|plan| plan.trigger == ContingencyTrigger::QualityThreshold)
                .find_map(|plan| plan.parameters.min_quality),
        };

        g.strategy.steps.start_step(step_id, now)?;
        if let Some(index) = g.strategy.steps.step_ids().iter().position(|id| id == step_id) {
            g.execution.current_step = index;
        }
        aplog_debug!(
            "goal {}: step {} -> {}.{}",
            g.id.short(),
            step_id,
            submission.service,
            submission.operation
        );
        Ok(submission)
    }

    /// Enqueue the step's operation and classify the outcome.
    async fn submit(
        &self,
        submission: &Submission,
    ) -> std::result::Result<Value, (FailureContext, Error)> {
        let outcome = match self
            .queue
            .enqueue(
                &submission.service,
                &submission.operation,
                submission.params.clone(),
                submission.priority,
            )
            .await
        {
            Ok(ticket) => ticket.wait().await,
            Err(e) => Err(e),
        };

        let value = outcome.map_err(|e| (FailureContext::from_error(&e), e))?;
        if let Some(required) = submission.min_quality {
            if let Some(observed) = value.get("quality").and_then(Value::as_f64) {
                if observed < required {
                    let failure = FailureContext::quality(observed, required);
                    let error = Error::StepFailure {
                        step: submission.name.clone(),
                        message: failure.message.clone(),
                    };
                    return Err((failure, error));
                }
            }
        }
        Ok(value)
    }

    async fn settle_success(&self, goal: &RwLock<Goal>, step_id: &StepId, value: Value) -> Result<()> {
        let mut g = goal.write().await;
        let now = self.clock.now();
        let step = g
            .strategy
            .steps
            .get_mut(step_id)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in plan", step_id)))?;
        step.complete(value, now);
        let report = StepReport {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            worker: step.assigned_worker().cloned(),
            success: true,
            result: step.result.clone(),
            error: None,
            time_to_complete: step.time_to_complete(),
        };

        g.refresh_progress(now);
        if g.strategy.steps.all_completed() && g.status == GoalStatus::Active {
            g.transition(GoalStatus::Completed, now)?;
        }
        let update = ProgressUpdate {
            goal_id: g.id,
            owner: g.owner.clone(),
            progress: g.execution.progress,
            status: g.status,
            step: Some(report),
        };
        drop(g);
        self.progress.publish(update).await;
        Ok(())
    }

    async fn settle_failure(
        &self,
        goal: &RwLock<Goal>,
        step_id: &StepId,
        failure: &FailureContext,
        error: &Error,
    ) -> Result<ContingencyDecision> {
        let mut g = goal.write().await;
        let now = self.clock.now();
        let step = g
            .strategy
            .steps
            .get_mut(step_id)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in plan", step_id)))?;
        step.fail(&error.to_string(), now);
        let report = StepReport {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            worker: step.assigned_worker().cloned(),
            success: false,
            result: None,
            error: step.error.clone(),
            time_to_complete: step.time_to_complete(),
        };
        aplog_debug!(
            "goal {}: step {} failed ({}): {}",
            g.id.short(),
            step_id,
            failure.trigger,
            error
        );

        let decision = self.contingency.evaluate(&mut g, step_id, failure)?;
        let update = ProgressUpdate {
            goal_id: g.id,
            owner: g.owner.clone(),
            progress: g.refresh_progress(now),
            status: g.status,
            step: Some(report),
        };
        drop(g);
        self.progress.publish(update).await;
        Ok(decision)
    }

    async fn record_failed_step(&self, goal: &RwLock<Goal>, step_id: &StepId) {
        goal.write().await.execution.failed_step = Some(step_id.clone());
    }
}

impl std::fmt::Debug for StepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepScheduler")
            .field("queue", &self.queue)
            .field("adaptive_parallelism", &self.config.adaptive_parallelism)
            .finish()
    }
}

/// Block while paused; fail once stopped.
async fn checkpoint(control: &mut watch::Receiver<RunControl>) -> Result<()> {
    loop {
        let current = *control.borrow_and_update();
        match current {
            RunControl::Run => return Ok(()),
            RunControl::Stop => return Err(Error::Cancelled),
            RunControl::Pause => {
                if control.changed().await.is_err() {
                    return Err(Error::Cancelled);
                }
            }
        }
    }
}
