//! Goal lifecycle driver.
//!
//! The `GoalExecutor` owns every goal. It creates and plans goals through the
//! `GoalPlanner`, activates them, drives their steps with the
//! `StepScheduler`, and turns the outcome into a terminal state with a
//! human-readable reason. Progress flows out as `goal.*` events and into
//! the memory collaborator.
//!
//! Two periodic responsibilities live here as well: `review` (overrun
//! safeguard and background goal synthesis) and `optimize` (historical
//! statistics).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::{Clock, PlanningStep, RiskLevel};
use crate::error::{Error, Result};
use crate::events::{EventBus, GoalEvent};
use crate::goal::insights::{GoalInsights, PerformanceTracker, WorkerPerformance};
use crate::goal::planner::GoalPlanner;
use crate::goal::{
    ExecutionApproach, Goal, GoalId, GoalPriority, GoalRequest, GoalStatus, GoalSummary, GoalType,
};
use crate::memory::{GoalPatch, MemoryStore, TaskOutcome};
use crate::orchestration::{
    ContingencyPlan, OperationQueue, ProgressSink, ProgressUpdate, RunControl, StepScheduler,
};
use crate::{aplog, aplog_debug, aplog_error, aplog_warn};

/// Owner recorded on goals the executor creates by itself.
pub const SYSTEM_OWNER: &str = "system";

/// Background objectives synthesized when fewer goals than the target are open.
const BACKGROUND_GOALS: &[(&str, &str, GoalType)] = &[
    (
        "System Performance Optimization",
        "Continuously monitor and improve system performance",
        GoalType::Optimization,
    ),
    (
        "User Experience Enhancement",
        "Learn from interaction patterns to improve assistance",
        GoalType::Learning,
    ),
];

/// What a review pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewReport {
    /// Active goals paused for exceeding their estimate.
    pub paused: Vec<GoalId>,
    /// Background goals created to reach the target load.
    pub created: Vec<GoalId>,
}

struct GoalSlot {
    goal: Arc<RwLock<Goal>>,
    control: watch::Sender<RunControl>,
}

/// Publishes scheduler progress as events, memory updates and worker stats.
struct ProgressPublisher {
    events: EventBus,
    memory: Arc<dyn MemoryStore>,
    performance: Arc<Mutex<PerformanceTracker>>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl ProgressSink for ProgressPublisher {
    async fn publish(&self, update: ProgressUpdate) {
        self.events.publish_goal(GoalEvent::Updated {
            goal_id: update.goal_id,
            progress: update.progress,
            status: update.status,
        });

        if let Some(step) = update.step {
            self.performance.lock().await.record(&step);
            let outcome = TaskOutcome {
                goal_id: update.goal_id,
                step_id: step.step_id,
                worker_id: step.worker,
                success: step.success,
                result: step.result,
                time_to_complete: step.time_to_complete,
                failure_reasons: step.error.into_iter().collect(),
                recorded_at: self.clock.now(),
            };
            if let Err(e) = self.memory.record_task_outcome(outcome).await {
                aplog_warn!("memory: task outcome not recorded: {}", e);
            }
        }

        let patch = GoalPatch::progress(update.status, update.progress);
        if let Err(e) = self
            .memory
            .update_goal(&update.owner, update.goal_id, patch)
            .await
        {
            aplog_debug!("memory: goal {} not updated: {}", update.goal_id.short(), e);
        }
    }
}

/// Pick an approach from the plan's shape.
///
/// Any high-risk step forces sequential execution. A plan with two or more
/// steps that can run side by side goes parallel for high and critical
/// goals and adaptive otherwise.
pub fn select_approach(goal: &Goal) -> ExecutionApproach {
    let steps = &goal.strategy.steps;
    if steps.steps().iter().any(|s| s.risk == RiskLevel::High) {
        return ExecutionApproach::Sequential;
    }
    if steps.max_parallel_width() >= 2 {
        if goal.priority >= GoalPriority::High {
            ExecutionApproach::Parallel
        } else {
            ExecutionApproach::Adaptive
        }
    } else {
        ExecutionApproach::Sequential
    }
}

/// Owns goals and drives them through their lifecycle.
pub struct GoalExecutor {
    planner: GoalPlanner,
    scheduler: StepScheduler,
    goals: RwLock<BTreeMap<GoalId, GoalSlot>>,
    memory: Arc<dyn MemoryStore>,
    events: EventBus,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    performance: Arc<Mutex<PerformanceTracker>>,
    insights: RwLock<GoalInsights>,
    synthesized: AtomicUsize,
}

impl GoalExecutor {
    /// Create a new executor.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue that runs step operations
    /// * `memory` - Persistence collaborator for goals and task outcomes
    /// * `events` - Bus for `goal.*` events
    /// * `config` - Planning, review and scheduling settings
    /// * `clock` - Time source for goal timestamps
    pub fn new(
        queue: OperationQueue,
        memory: Arc<dyn MemoryStore>,
        events: EventBus,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let performance = Arc::new(Mutex::new(PerformanceTracker::new()));
        let publisher = ProgressPublisher {
            events: events.clone(),
            memory: Arc::clone(&memory),
            performance: Arc::clone(&performance),
            clock: Arc::clone(&clock),
        };
        let scheduler = StepScheduler::new(
            queue,
            Arc::clone(&config),
            Arc::clone(&clock),
            Arc::new(publisher),
        );
        Self {
            planner: GoalPlanner::new(Arc::clone(&config), Arc::clone(&clock)),
            scheduler,
            goals: RwLock::new(BTreeMap::new()),
            memory,
            events,
            config,
            clock,
            performance,
            insights: RwLock::new(GoalInsights::default()),
            synthesized: AtomicUsize::new(0),
        }
    }

    pub fn planner(&self) -> &GoalPlanner {
        &self.planner
    }

    /// Create a goal planned from the template for its type.
    pub async fn create_goal(&self, request: GoalRequest) -> Result<GoalId> {
        let mut goal = self.planner.create_goal(request)?;
        self.planner.decompose(&mut goal)?;
        self.admit(goal).await
    }

    /// Create a goal with a caller-supplied plan.
    ///
    /// # Errors
    /// Returns `GoalPlanningFailure` for an empty or cyclic plan; the goal is
    /// not created.
    pub async fn create_goal_with_plan(
        &self,
        request: GoalRequest,
        steps: Vec<PlanningStep>,
        contingencies: Vec<ContingencyPlan>,
    ) -> Result<GoalId> {
        let mut goal = self.planner.create_goal(request)?;
        self.planner.plan_with(&mut goal, steps, contingencies)?;
        self.admit(goal).await
    }

    async fn admit(&self, goal: Goal) -> Result<GoalId> {
        let id = goal.id;
        let title = goal.title.clone();
        self.memory.store_goal(&goal.owner, goal.summary()).await?;

        let (control, _) = watch::channel(RunControl::Run);
        self.goals.write().await.insert(
            id,
            GoalSlot {
                goal: Arc::new(RwLock::new(goal)),
                control,
            },
        );
        aplog!("goal {} created: {}", id.short(), title);
        self.events.publish_goal(GoalEvent::Created { goal_id: id, title });
        Ok(id)
    }

    /// Activate a planned goal and run it to a terminal state.
    ///
    /// # Errors
    /// - `GoalNotFound` for an unknown goal
    /// - `Validation` if a prerequisite goal is not completed
    /// - `InvalidStatusTransition` if the goal is not in `planning`
    /// - the unresolved step error when the goal fails
    /// - `Cancelled` if the goal was deleted while running
    pub async fn execute(&self, id: GoalId) -> Result<()> {
        let (goal, mut control) = {
            let goals = self.goals.read().await;
            let slot = goals.get(&id).ok_or(Error::GoalNotFound(id))?;
            (Arc::clone(&slot.goal), slot.control.subscribe())
        };

        self.activate(&goal).await?;
        let outcome = self.scheduler.drive(&goal, &mut control).await;
        self.conclude(id, &goal, outcome).await
    }

    /// Run `execute` on its own task.
    pub fn spawn_execute(self: &Arc<Self>, id: GoalId) -> JoinHandle<Result<()>> {
        let executor = Arc::clone(self);
        tokio::spawn(async move { executor.execute(id).await })
    }

    async fn activate(&self, goal: &RwLock<Goal>) -> Result<()> {
        let prerequisites = goal.read().await.constraints.prerequisites.clone();
        for prerequisite in prerequisites {
            let status = self.status_of(prerequisite).await;
            if status != Some(GoalStatus::Completed) {
                return Err(Error::Validation(format!(
                    "prerequisite goal {} is not completed",
                    prerequisite.short()
                )));
            }
        }

        let mut g = goal.write().await;
        if g.strategy.steps.is_empty() {
            return Err(Error::GoalPlanningFailure(format!(
                "goal {} has no steps",
                g.id.short()
            )));
        }
        if !g.strategy.approach_pinned {
            g.strategy.approach = select_approach(&g);
        }
        g.transition(GoalStatus::Active, self.clock.now())?;

        let (id, owner, approach, progress) = (
            g.id,
            g.owner.clone(),
            g.strategy.approach,
            g.execution.progress,
        );
        drop(g);

        aplog!("goal {} active ({})", id.short(), approach);
        self.events.publish_goal(GoalEvent::Updated {
            goal_id: id,
            progress,
            status: GoalStatus::Active,
        });
        let patch = GoalPatch {
            approach: Some(approach),
            ..GoalPatch::progress(GoalStatus::Active, progress)
        };
        if let Err(e) = self.memory.update_goal(&owner, id, patch).await {
            aplog_debug!("memory: goal {} not updated: {}", id.short(), e);
        }
        Ok(())
    }

    async fn conclude(&self, id: GoalId, goal: &RwLock<Goal>, outcome: Result<()>) -> Result<()> {
        let err = match outcome {
            Ok(()) => {
                let owner = goal.read().await.owner.clone();
                aplog!("goal {} completed", id.short());
                self.events.publish_goal(GoalEvent::Completed { goal_id: id });
                self.patch_memory(&owner, id, GoalPatch::progress(GoalStatus::Completed, 100))
                    .await;
                return Ok(());
            }
            Err(e) => e,
        };

        if matches!(err, Error::Cancelled) && !self.goals.read().await.contains_key(&id) {
            aplog_debug!("goal {} stopped after deletion", id.short());
            return Err(err);
        }

        let (owner, progress, reason) = {
            let mut g = goal.write().await;
            let now = self.clock.now();
            let step_name = g
                .execution
                .failed_step
                .as_ref()
                .and_then(|step| g.strategy.steps.get(step))
                .map(|step| step.name.clone())
                .unwrap_or_else(|| "goal".to_string());
            let reason = format!("{}: {}: {}", step_name, err.kind(), err);
            // Failed is only reachable from active.
            if g.status == GoalStatus::Paused {
                g.transition(GoalStatus::Active, now)?;
            }
            g.fail(&reason, now)?;
            (g.owner.clone(), g.execution.progress, reason)
        };

        aplog_error!("goal {} failed: {}", id.short(), reason);
        self.events.publish_goal(GoalEvent::Failed {
            goal_id: id,
            reason: reason.clone(),
        });
        if let Error::StepEscalated { reason, .. } = &err {
            self.events.publish_goal(GoalEvent::ReviewRequested {
                goal_id: id,
                reason: reason.clone(),
            });
        }
        self.patch_memory(&owner, id, GoalPatch::progress(GoalStatus::Failed, progress))
            .await;
        Err(err)
    }

    async fn patch_memory(&self, owner: &str, id: GoalId, patch: GoalPatch) {
        if let Err(e) = self.memory.update_goal(owner, id, patch).await {
            aplog_debug!("memory: goal {} not updated: {}", id.short(), e);
        }
    }

    async fn status_of(&self, id: GoalId) -> Option<GoalStatus> {
        let goal = self
            .goals
            .read()
            .await
            .get(&id)
            .map(|slot| Arc::clone(&slot.goal))?;
        let status = goal.read().await.status;
        Some(status)
    }

    /// Pause an active goal. In-flight steps finish; no new step starts.
    pub async fn pause(&self, id: GoalId) -> Result<()> {
        self.switch(id, GoalStatus::Paused, RunControl::Pause).await
    }

    /// Resume a paused goal.
    pub async fn resume(&self, id: GoalId) -> Result<()> {
        self.switch(id, GoalStatus::Active, RunControl::Run).await
    }

    async fn switch(&self, id: GoalId, target: GoalStatus, control: RunControl) -> Result<()> {
        let (owner, progress) = {
            let goals = self.goals.read().await;
            let slot = goals.get(&id).ok_or(Error::GoalNotFound(id))?;
            let mut g = slot.goal.write().await;
            g.transition(target, self.clock.now())?;
            slot.control.send_replace(control);
            (g.owner.clone(), g.execution.progress)
        };

        aplog!("goal {} {}", id.short(), target);
        self.events.publish_goal(GoalEvent::Updated {
            goal_id: id,
            progress,
            status: target,
        });
        self.patch_memory(&owner, id, GoalPatch::progress(target, progress))
            .await;
        Ok(())
    }

    /// Remove a goal. A running goal stops at its next checkpoint.
    pub async fn delete(&self, id: GoalId) -> Result<()> {
        let slot = self
            .goals
            .write()
            .await
            .remove(&id)
            .ok_or(Error::GoalNotFound(id))?;
        slot.control.send_replace(RunControl::Stop);
        aplog!("goal {} deleted", id.short());
        self.events.publish_goal(GoalEvent::Deleted { goal_id: id });
        Ok(())
    }

    /// Snapshot of one goal.
    pub async fn get(&self, id: GoalId) -> Result<Goal> {
        let goal = self
            .goals
            .read()
            .await
            .get(&id)
            .map(|slot| Arc::clone(&slot.goal))
            .ok_or(Error::GoalNotFound(id))?;
        let snapshot = goal.read().await.clone();
        Ok(snapshot)
    }

    /// Summaries of all goals, oldest first.
    pub async fn list(&self) -> Vec<GoalSummary> {
        let mut summaries = Vec::new();
        for goal in self.all_goals().await {
            summaries.push(goal.read().await.summary());
        }
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    async fn all_goals(&self) -> Vec<Arc<RwLock<Goal>>> {
        self.goals
            .read()
            .await
            .values()
            .map(|slot| Arc::clone(&slot.goal))
            .collect()
    }

    /// Periodic goal review.
    ///
    /// Pauses active goals whose active time exceeds `overrun_factor` times
    /// their estimate, then synthesizes low-priority background goals until
    /// `target_active_goals` goals are open. Synthesized goals stay in
    /// `planning`.
    pub async fn review(&self) -> Result<ReviewReport> {
        let now = self.clock.now();
        let mut open = 0;
        let mut overrun = Vec::new();
        for goal in self.all_goals().await {
            let g = goal.read().await;
            if g.status.is_open() {
                open += 1;
            }
            if g.status == GoalStatus::Active && g.is_overrun(self.config.overrun_factor, now) {
                overrun.push(g.id);
            }
        }

        let mut report = ReviewReport::default();
        for id in overrun {
            match self.pause(id).await {
                Ok(()) => {
                    aplog_warn!(
                        "goal {} paused: running longer than {}x its estimate",
                        id.short(),
                        self.config.overrun_factor
                    );
                    report.paused.push(id);
                }
                Err(e) => aplog_debug!("review: goal {} not paused: {}", id.short(), e),
            }
        }

        while open + report.created.len() < self.config.target_active_goals {
            let id = self.create_goal(self.background_request()).await?;
            report.created.push(id);
        }
        if !report.created.is_empty() {
            aplog!("review: synthesized {} background goals", report.created.len());
        }
        Ok(report)
    }

    fn background_request(&self) -> GoalRequest {
        let n = self.synthesized.fetch_add(1, Ordering::Relaxed);
        let (title, description, goal_type) = BACKGROUND_GOALS[n % BACKGROUND_GOALS.len()];
        GoalRequest::new(SYSTEM_OWNER, title)
            .with_description(description)
            .with_type(goal_type)
            .with_priority(GoalPriority::Low)
    }

    /// Recompute historical statistics. Never changes goals.
    pub async fn optimize(&self) -> GoalInsights {
        let mut goals = Vec::new();
        for goal in self.all_goals().await {
            goals.push(goal.read().await.clone());
        }
        let insights = GoalInsights::compute(&goals, self.clock.now());
        aplog_debug!(
            "optimize: {} goals, success rate {:.2}, best approach {:?}",
            insights.total,
            insights.success_rate,
            insights.most_successful_approach
        );
        *self.insights.write().await = insights.clone();
        insights
    }

    /// Statistics from the last `optimize` pass.
    pub async fn insights(&self) -> GoalInsights {
        self.insights.read().await.clone()
    }

    pub async fn worker_performance(&self) -> Vec<WorkerPerformance> {
        self.performance.lock().await.snapshot()
    }
}

impl std::fmt::Debug for GoalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalExecutor")
            .field("scheduler", &self.scheduler)
            .field("target_active_goals", &self.config.target_active_goals)
            .finish()
    }
}
