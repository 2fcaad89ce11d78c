//! Goal lifecycle integration tests.
//!
//! These tests execute goals end to end through an assembled orchestrator
//! and check the progress sequence, failure reasons, and planning-time
//! rejection of malformed plans.

use autopilot::config::Config;
use autopilot::core::{PlanningStep, StepType};
use autopilot::events::GoalEvent;
use autopilot::goal::{GoalRequest, GoalStatus, GoalType};
use autopilot::orchestration::{ContingencyAction, ContingencyPlan, ContingencyTrigger};
use autopilot::Error;

use super::fixtures::{
    chain, drain_goal_events, echo_worker, flaky_worker, progress_of, quality_worker, running,
    RUN,
};

/// Test: Retried step in a sequential chain
/// Given steps A -> B -> C where B fails once and a retry plan with no delay
/// When the goal executes
/// Then it completes with progress [0, 33, 33, 66, 100]
#[tokio::test]
async fn test_retry_in_sequential_chain() {
    let (orchestrator, handle) = running(
        Config::default(),
        vec![echo_worker("steady"), flaky_worker("flaky", 1)],
    );
    let goals = orchestrator.goals();
    let mut rx = orchestrator.events().subscribe_goals();

    let mut steps = chain(&["a", "b", "c"], "steady");
    steps[1].workers = vec!["flaky".into()];
    let retry = ContingencyPlan::new(ContingencyTrigger::StepFailure, ContingencyAction::Retry)
        .with_delay(0);

    let id = goals
        .create_goal_with_plan(GoalRequest::new("alice", "Three steps"), steps, vec![retry])
        .await
        .unwrap();
    goals.execute(id).await.unwrap();

    let events = drain_goal_events(&mut rx);
    assert_eq!(progress_of(&events, id), vec![0, 33, 33, 66, 100]);
    assert_eq!(events.first().map(|e| e.name()), Some("goal.created"));
    assert_eq!(events.last().map(|e| e.name()), Some("goal.completed"));

    let goal = goals.get(id).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Completed);
    assert_eq!(goal.execution.progress, 100);
    assert!(goal.execution.ended_at.is_some());
    handle.shutdown();
}

/// Test: Cyclic plan rejected at planning time
/// Given two steps that depend on each other
/// When the goal is created
/// Then creation fails with GoalPlanningFailure and no goal exists
#[tokio::test]
async fn test_cyclic_plan_rejected() {
    let (orchestrator, handle) = running(Config::default(), vec![echo_worker("steady")]);
    let goals = orchestrator.goals();
    let steps = vec![
        PlanningStep::new("a", "A", StepType::Action)
            .with_worker("steady")
            .with_operation(RUN)
            .depends_on("b"),
        PlanningStep::new("b", "B", StepType::Action)
            .with_worker("steady")
            .with_operation(RUN)
            .depends_on("a"),
    ];

    let result = goals
        .create_goal_with_plan(GoalRequest::new("alice", "Loop"), steps, vec![])
        .await;

    assert!(matches!(result, Err(Error::GoalPlanningFailure(_))));
    assert!(goals.list().await.is_empty());
    handle.shutdown();
}

/// Test: Unhandled failure carries a reason chain
#[tokio::test]
async fn test_unhandled_failure_reason_chain() {
    let (orchestrator, handle) = running(
        Config::default(),
        vec![echo_worker("steady"), flaky_worker("flaky", usize::MAX)],
    );
    let goals = orchestrator.goals();
    let mut steps = chain(&["fetch", "store"], "steady");
    steps[1].workers = vec!["flaky".into()];
    steps[1].name = "Store results".to_string();

    let id = goals
        .create_goal_with_plan(GoalRequest::new("alice", "Store"), steps, vec![])
        .await
        .unwrap();
    let err = goals.execute(id).await.unwrap_err();
    assert_eq!(err.kind(), "Worker");

    let goal = goals.get(id).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Failed);
    assert_eq!(goal.execution.progress, 50);
    assert_eq!(
        goal.failure_reason.as_deref(),
        Some("Store results: Worker: Worker error: transient")
    );
    handle.shutdown();
}

/// Test: Low-quality result escalates for review
/// Given a worker that returns quality 0.2 and an escalate plan requiring 0.6
/// When the goal executes
/// Then the goal fails, needs review, and goal.review_requested is emitted
#[tokio::test]
async fn test_quality_escalation_requests_review() {
    let (orchestrator, handle) = running(Config::default(), vec![quality_worker("sloppy", 0.2)]);
    let goals = orchestrator.goals();
    let mut rx = orchestrator.events().subscribe_goals();
    let escalate = ContingencyPlan::new(
        ContingencyTrigger::QualityThreshold,
        ContingencyAction::Escalate,
    )
    .with_min_quality(0.6);

    let id = goals
        .create_goal_with_plan(
            GoalRequest::new("alice", "Draft report"),
            chain(&["draft"], "sloppy"),
            vec![escalate],
        )
        .await
        .unwrap();
    let err = goals.execute(id).await.unwrap_err();
    assert!(matches!(err, Error::StepEscalated { .. }));

    let goal = goals.get(id).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Failed);
    assert!(goal.needs_review);

    let events = drain_goal_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, GoalEvent::ReviewRequested { goal_id, .. } if *goal_id == id)));
    handle.shutdown();
}

/// Test: Template goal runs on the configured workers
/// Given a learning goal and workers named after step types
/// When the goal executes
/// Then every step completes and each worker has a success on record
#[tokio::test]
async fn test_decomposed_goal_completes() {
    let workers = ["research", "action", "verification"]
        .into_iter()
        .map(|id| {
            autopilot::orchestration::Service::new(id, id)
                .operation(id, |params| async move { Ok(params) })
        })
        .collect();
    let (orchestrator, handle) = running(Config::default(), workers);
    let goals = orchestrator.goals();

    let id = goals
        .create_goal(GoalRequest::new("alice", "Learn Rust").with_type(GoalType::Learning))
        .await
        .unwrap();
    goals.execute(id).await.unwrap();

    let goal = goals.get(id).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Completed);
    assert!(goal.strategy.steps.all_completed());

    let performance = goals.worker_performance().await;
    assert_eq!(performance.len(), 3);
    assert!(performance.iter().all(|w| w.success_rate() == 1.0));

    let insights = goals.optimize().await;
    assert_eq!(insights.completed, 1);
    handle.shutdown();
}

/// Test: Deleted goal disappears and announces itself
#[tokio::test]
async fn test_delete_goal() {
    let (orchestrator, handle) = running(Config::default(), vec![]);
    let goals = orchestrator.goals();
    let mut rx = orchestrator.events().subscribe_goals();

    let id = goals
        .create_goal(GoalRequest::new("alice", "Temporary"))
        .await
        .unwrap();
    assert_eq!(goals.list().await.len(), 1);

    goals.delete(id).await.unwrap();
    assert!(goals.list().await.is_empty());
    assert!(matches!(goals.delete(id).await, Err(Error::GoalNotFound(_))));

    let names: Vec<_> = drain_goal_events(&mut rx).iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["goal.created", "goal.deleted"]);
    handle.shutdown();
}
