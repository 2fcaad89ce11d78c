//! Historical goal statistics and worker performance.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::clock::elapsed_between;
use crate::goal::{ExecutionApproach, Goal, GoalStatus};
use crate::orchestration::{ServiceId, StepReport};

/// Aggregate statistics over all known goals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalInsights {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub open: usize,
    /// completed / (completed + failed); 0 with no finished goals.
    pub success_rate: f64,
    pub most_successful_approach: Option<ExecutionApproach>,
    pub mean_completion_time: Option<Duration>,
    pub computed_at: Option<DateTime<Utc>>,
}

impl GoalInsights {
    pub fn compute<'a>(goals: impl IntoIterator<Item = &'a Goal>, now: DateTime<Utc>) -> Self {
        let mut insights = GoalInsights {
            computed_at: Some(now),
            ..Self::default()
        };
        // approach -> (completed, finished)
        let mut by_approach: BTreeMap<ExecutionApproach, (usize, usize)> = BTreeMap::new();
        let mut durations = Vec::new();

        for goal in goals {
            insights.total += 1;
            let key = goal.strategy.approach;
            match goal.status {
                GoalStatus::Completed => {
                    insights.completed += 1;
                    let entry = by_approach.entry(key).or_insert((0, 0));
                    entry.0 += 1;
                    entry.1 += 1;
                    if let (Some(start), Some(end)) =
                        (goal.execution.started_at, goal.execution.ended_at)
                    {
                        durations.push(elapsed_between(start, end));
                    }
                }
                GoalStatus::Failed => {
                    insights.failed += 1;
                    by_approach.entry(key).or_insert((0, 0)).1 += 1;
                }
                _ => insights.open += 1,
            }
        }

        let finished = insights.completed + insights.failed;
        if finished > 0 {
            insights.success_rate = insights.completed as f64 / finished as f64;
        }
        insights.most_successful_approach = by_approach
            .iter()
            .filter(|(_, (completed, _))| *completed > 0)
            .max_by(|(_, a), (_, b)| {
                let rate_a = a.0 as f64 / a.1 as f64;
                let rate_b = b.0 as f64 / b.1 as f64;
                rate_a.total_cmp(&rate_b).then(a.0.cmp(&b.0))
            })
            .map(|(approach, _)| *approach);
        if !durations.is_empty() {
            let total: Duration = durations.iter().sum();
            insights.mean_completion_time = Some(total / durations.len() as u32);
        }
        insights
    }
}

/// Success statistics for one worker service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPerformance {
    pub worker: ServiceId,
    pub tasks: u64,
    pub successes: u64,
    pub total_time: Duration,
}

impl WorkerPerformance {
    fn new(worker: ServiceId) -> Self {
        Self {
            worker,
            tasks: 0,
            successes: 0,
            total_time: Duration::ZERO,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.tasks == 0 {
            0.0
        } else {
            self.successes as f64 / self.tasks as f64
        }
    }

    /// Mean time of successful tasks.
    pub fn mean_completion_time(&self) -> Option<Duration> {
        if self.successes == 0 {
            None
        } else {
            Some(self.total_time / self.successes as u32)
        }
    }
}

/// Accumulates step outcomes per worker.
#[derive(Debug, Clone, Default)]
pub struct PerformanceTracker {
    workers: BTreeMap<ServiceId, WorkerPerformance>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, report: &StepReport) {
        let Some(worker) = &report.worker else {
            return;
        };
        let entry = self
            .workers
            .entry(worker.clone())
            .or_insert_with(|| WorkerPerformance::new(worker.clone()));
        entry.tasks += 1;
        if report.success {
            entry.successes += 1;
            entry.total_time += report.time_to_complete.unwrap_or_default();
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerPerformance> {
        self.workers.values().cloned().collect()
    }
}
