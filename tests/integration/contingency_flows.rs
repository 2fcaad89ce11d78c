//! Contingency integration tests.
//!
//! These tests verify that step failures are offered to the goal's
//! contingency plans and that each action resolves the goal the way it
//! should: alternative workers, strategy adaptation and abort.

use autopilot::config::Config;
use autopilot::core::StepId;
use autopilot::goal::{ExecutionApproach, GoalRequest, GoalStatus};
use autopilot::orchestration::{
    ContingencyAction, ContingencyCondition, ContingencyPlan, ContingencyTrigger, ServiceId,
};
use autopilot::events::GoalEvent;
use autopilot::Error;

use super::fixtures::{
    chain, drain_goal_events, echo_worker, failing_worker, flaky_worker, running,
};

/// Test: Alternative worker takes over
/// Given a step allowed on [primary, backup] where primary always fails
/// When the alternative plan applies
/// Then the step completes on backup and primary is recorded as tried
#[tokio::test]
async fn test_alternative_worker_takes_over() {
    let (orchestrator, handle) = running(
        Config::default(),
        vec![failing_worker("primary"), echo_worker("backup")],
    );
    let goals = orchestrator.goals();
    let mut steps = chain(&["fetch"], "primary");
    steps[0].workers.push(ServiceId::from("backup"));
    let alternative = ContingencyPlan::new(
        ContingencyTrigger::StepFailure,
        ContingencyAction::Alternative,
    );

    let id = goals
        .create_goal_with_plan(GoalRequest::new("alice", "Fetch"), steps, vec![alternative])
        .await
        .unwrap();
    goals.execute(id).await.unwrap();

    let goal = goals.get(id).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Completed);
    let step = goal.strategy.steps.get(&StepId::from("fetch")).unwrap();
    assert_eq!(step.assigned_worker(), Some(&ServiceId::from("backup")));
    assert_eq!(step.tried_workers, vec![ServiceId::from("primary")]);

    let performance = goals.worker_performance().await;
    let primary = performance
        .iter()
        .find(|w| w.worker == ServiceId::from("primary"))
        .unwrap();
    assert_eq!(primary.tasks, 1);
    assert_eq!(primary.successes, 0);
    handle.shutdown();
}

/// Test: Adapt switches the goal to parallel execution
/// Given a goal pinned to sequential with a step that fails once
/// When the adapt plan applies
/// Then the goal finishes under the parallel approach
#[tokio::test]
async fn test_adapt_switches_strategy() {
    let (orchestrator, handle) = running(
        Config::default(),
        vec![echo_worker("steady"), flaky_worker("flaky", 1)],
    );
    let goals = orchestrator.goals();
    let mut steps = chain(&["a", "b"], "steady");
    steps[0].workers = vec!["flaky".into()];
    let adapt = ContingencyPlan::new(ContingencyTrigger::StepFailure, ContingencyAction::Adapt)
        .with_approach(ExecutionApproach::Parallel);

    let id = goals
        .create_goal_with_plan(
            GoalRequest::new("alice", "Adapt").with_approach(ExecutionApproach::Sequential),
            steps,
            vec![adapt],
        )
        .await
        .unwrap();
    goals.execute(id).await.unwrap();

    let goal = goals.get(id).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Completed);
    assert_eq!(goal.strategy.approach, ExecutionApproach::Parallel);
    handle.shutdown();
}

/// Test: Abort fails the goal with a reason chain
#[tokio::test]
async fn test_abort_fails_goal() {
    let (orchestrator, handle) = running(Config::default(), vec![failing_worker("broken")]);
    let goals = orchestrator.goals();
    let mut steps = chain(&["publish"], "broken");
    steps[0].name = "Publish".to_string();
    let abort = ContingencyPlan::new(ContingencyTrigger::StepFailure, ContingencyAction::Abort)
        .when(ContingencyCondition::error_matches("broken").unwrap());

    let id = goals
        .create_goal_with_plan(GoalRequest::new("alice", "Publish"), steps, vec![abort])
        .await
        .unwrap();
    let err = goals.execute(id).await.unwrap_err();
    assert!(matches!(err, Error::StepAborted { ref step, .. } if step == "Publish"));

    let goal = goals.get(id).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Failed);
    assert!(goal
        .failure_reason
        .unwrap()
        .starts_with("Publish: StepAborted: "));
    handle.shutdown();
}

/// Test: Non-matching condition leaves the failure unhandled
#[tokio::test]
async fn test_condition_mismatch_is_unhandled() {
    let (orchestrator, handle) = running(Config::default(), vec![failing_worker("broken")]);
    let goals = orchestrator.goals();
    let retry = ContingencyPlan::new(ContingencyTrigger::StepFailure, ContingencyAction::Retry)
        .when(ContingencyCondition::error_matches("rate limit").unwrap());

    let id = goals
        .create_goal_with_plan(
            GoalRequest::new("alice", "Unmatched"),
            chain(&["step"], "broken"),
            vec![retry],
        )
        .await
        .unwrap();
    let err = goals.execute(id).await.unwrap_err();
    assert_eq!(err.kind(), "Worker");
    assert_eq!(goals.get(id).await.unwrap().status, GoalStatus::Failed);
    handle.shutdown();
}

/// Test: Exhausted retries hand over to escalation
/// Given a retry plan capped at 2 followed by an escalate plan
/// When the step keeps failing
/// Then the third failure escalates and the goal is flagged for review
#[tokio::test]
async fn test_exhausted_retry_escalates() {
    let (orchestrator, handle) = running(Config::default(), vec![failing_worker("broken")]);
    let mut rx = orchestrator.events().subscribe_goals();
    let goals = orchestrator.goals();
    let plans = vec![
        ContingencyPlan::new(ContingencyTrigger::StepFailure, ContingencyAction::Retry)
            .with_max_attempts(2),
        ContingencyPlan::new(ContingencyTrigger::StepFailure, ContingencyAction::Escalate),
    ];

    let id = goals
        .create_goal_with_plan(
            GoalRequest::new("alice", "Escalate"),
            chain(&["step"], "broken"),
            plans,
        )
        .await
        .unwrap();
    let err = goals.execute(id).await.unwrap_err();
    assert!(matches!(err, Error::StepEscalated { .. }));

    let goal = goals.get(id).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Failed);
    assert!(goal.needs_review);
    let step = goal.strategy.steps.get(&StepId::from("step")).unwrap();
    assert_eq!(step.attempts_for(0), 2);
    assert_eq!(step.attempts_for(1), 1);

    let events = drain_goal_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, GoalEvent::ReviewRequested { goal_id, .. } if *goal_id == id)));
    handle.shutdown();
}
