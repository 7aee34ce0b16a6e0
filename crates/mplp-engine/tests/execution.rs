use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use mplp_core::config::EngineConfig;
use mplp_core::error::MplpError;
use mplp_core::types::{EventKind, StepStatus, WorkflowEvent, WorkflowStatus};
use mplp_engine::{
    AgentStepConfig, Condition, ConditionalStepConfig, ExecutionEngine, ExecutionOptions,
    LoopStepConfig, ParallelStepConfig, SequentialStepConfig, Step, StepConfig, WorkflowBuilder,
    WorkflowDefinition,
};
use mplp_test_utils::{FlakyAgent, MockMessageAgent, RecordingAgent, SlowAgent};

fn engine() -> ExecutionEngine {
    ExecutionEngine::with_config(EngineConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        ..EngineConfig::default()
    })
}

fn no_params() -> HashMap<String, serde_json::Value> {
    HashMap::new()
}

fn count_events(engine: &ExecutionEngine, kind: EventKind) -> usize {
    engine
        .event_bus()
        .history(None)
        .iter()
        .filter(|r| r.kind == kind)
        .count()
}

#[tokio::test]
async fn test_two_step_workflow_completes() {
    let engine = engine();
    let a1 = RecordingAgent::new("a1");
    let a2 = RecordingAgent::new("a2");
    engine.register_agent(a1.clone()).await;
    engine.register_agent(a2.clone()).await;

    let def = WorkflowBuilder::new("TestWorkflow")
        .step("step1", AgentStepConfig::new("Step 1", "a1", "test"))
        .unwrap()
        .step(
            "step2",
            AgentStepConfig::new("Step 2", "a2", "test").depends_on(["step1"]),
        )
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.steps.len(), 2);
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(a1.call_count(), 1);
    assert_eq!(a2.call_count(), 1);
}

#[tokio::test]
async fn test_dependencies_finish_before_dependents_start() {
    let engine = engine();
    engine
        .register_agent(SlowAgent::new("slow", Duration::from_millis(20)))
        .await;

    let def = WorkflowBuilder::new("Chain")
        .step("a", AgentStepConfig::new("A", "slow", "run"))
        .unwrap()
        .step("b", AgentStepConfig::new("B", "slow", "run").depends_on(["a"]))
        .unwrap()
        .step("c", AgentStepConfig::new("C", "slow", "run").depends_on(["a", "b"]))
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();

    let a = result.step("a").unwrap();
    let b = result.step("b").unwrap();
    let c = result.step("c").unwrap();
    assert!(a.end_time.unwrap() <= b.start_time);
    assert!(b.end_time.unwrap() <= c.start_time);

    let order: Vec<&str> = result.steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_independent_steps_run_concurrently() {
    let engine = engine();
    let slow = SlowAgent::new("slow", Duration::from_millis(50));
    engine.register_agent(slow.clone()).await;

    let def = WorkflowBuilder::new("Fan")
        .step("left", AgentStepConfig::new("Left", "slow", "run"))
        .unwrap()
        .step("right", AgentStepConfig::new("Right", "slow", "run"))
        .unwrap()
        .build()
        .unwrap();

    engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(slow.max_in_flight(), 2);
}

#[tokio::test]
async fn test_hand_built_cycle_fails_without_running_steps() {
    let engine = engine();
    let agent = RecordingAgent::new("a1");
    engine.register_agent(agent.clone()).await;

    let def = WorkflowDefinition {
        id: "cyclic".into(),
        name: "Cyclic".into(),
        description: None,
        version: None,
        steps: vec![
            Step::agent("step1", "Step 1", "a1", "test").with_dependencies(["step2"]),
            Step::agent("step2", "Step 2", "a1", "test").with_dependencies(["step1"]),
        ],
        timeout_ms: None,
        retries: None,
        metadata: HashMap::new(),
    };

    let err = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MplpError::Execution(ref msg) if msg.contains("cycle")));
    assert_eq!(agent.call_count(), 0);

    let executions = engine.list_executions().await;
    assert_eq!(executions[0].status, WorkflowStatus::Failed);
    assert!(executions[0].steps.is_empty());
}

#[tokio::test]
async fn test_false_condition_skips_step_and_unblocks_dependents() {
    let engine = engine();
    let gated = RecordingAgent::new("gated");
    let after = RecordingAgent::new("after");
    engine.register_agent(gated.clone()).await;
    engine.register_agent(after.clone()).await;

    let def = WorkflowBuilder::new("Skip")
        .step(
            "maybe",
            AgentStepConfig::new("Maybe", "gated", "run")
                .retries(3)
                .when(Condition::constant(false)),
        )
        .unwrap()
        .step(
            "next",
            AgentStepConfig::new("Next", "after", "run").depends_on(["maybe"]),
        )
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();

    let maybe = result.step("maybe").unwrap();
    assert_eq!(maybe.status, StepStatus::Skipped);
    assert_eq!(maybe.attempts, 0);
    assert!(maybe.end_time.is_some());
    assert_eq!(gated.call_count(), 0);
    assert_eq!(after.call_count(), 1);
    assert_eq!(count_events(&engine, EventKind::StepSkipped), 1);
}

#[tokio::test]
async fn test_condition_sees_step_status() {
    let engine = engine();
    let agent = RecordingAgent::new("a1");
    engine.register_agent(agent.clone()).await;

    let def = WorkflowBuilder::new("Expr")
        .step("first", AgentStepConfig::new("First", "a1", "first"))
        .unwrap()
        .step(
            "second",
            AgentStepConfig::new("Second", "a1", "second")
                .depends_on(["first"])
                .when(Condition::expr(r#"first_status == "completed""#)),
        )
        .unwrap()
        .build()
        .unwrap();

    engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(agent.actions(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_fail_fast_parallel_rejects_and_cancels_siblings() {
    let engine = engine();
    let slow = SlowAgent::new("slow", Duration::from_millis(500));
    engine.register_agent(FlakyAgent::always("bad")).await;
    engine.register_agent(slow.clone()).await;

    let def = WorkflowBuilder::new("FailFast")
        .parallel(
            "fan",
            ParallelStepConfig::new(
                "Fan",
                vec![
                    Step::agent("boom", "Boom", "bad", "run"),
                    Step::agent("wait", "Wait", "slow", "run"),
                ],
            )
            .fail_fast(true),
        )
        .unwrap()
        .build()
        .unwrap();

    let err = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MplpError::StepExecution { ref step_id, .. } if step_id == "boom"));
    assert_eq!(slow.finished(), 0);

    let result = &engine.list_executions().await[0];
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.step("boom").unwrap().status, StepStatus::Failed);
    assert_eq!(result.step("wait").unwrap().status, StepStatus::Cancelled);
    assert_eq!(result.step("fan").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_tolerant_parallel_reports_envelopes() {
    let engine = engine();
    engine.register_agent(FlakyAgent::always("bad")).await;
    engine.register_agent(RecordingAgent::new("good")).await;

    let def = WorkflowBuilder::new("Tolerant")
        .parallel(
            "fan",
            ParallelStepConfig::new(
                "Fan",
                vec![
                    Step::agent("ok", "Ok", "good", "run"),
                    Step::agent("boom", "Boom", "bad", "run"),
                ],
            ),
        )
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    let envelopes = result.step("fan").unwrap().result.clone().unwrap();
    assert_eq!(envelopes[0]["success"], true);
    assert_eq!(envelopes[0]["stepId"], "ok");
    assert_eq!(envelopes[0]["result"]["agentId"], "good");
    assert_eq!(envelopes[1]["success"], false);
    assert_eq!(envelopes[1]["stepId"], "boom");
    assert!(envelopes[1]["error"].as_str().unwrap().contains("bad"));
    assert_eq!(result.step("boom").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_parallel_concurrency_limit() {
    let engine = engine();
    let slow = SlowAgent::new("slow", Duration::from_millis(30));
    engine.register_agent(slow.clone()).await;

    let subs = (0..4)
        .map(|i| Step::agent(format!("w{i}"), format!("Worker {i}"), "slow", "run"))
        .collect();
    let def = WorkflowBuilder::new("Bounded")
        .parallel("fan", ParallelStepConfig::new("Fan", subs).concurrency(2))
        .unwrap()
        .build()
        .unwrap();

    engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(slow.started(), 4);
    assert_eq!(slow.max_in_flight(), 2);
}

#[tokio::test]
async fn test_concurrency_option_applies_to_unset_parallel_steps() {
    let engine = engine();
    let slow = SlowAgent::new("slow", Duration::from_millis(20));
    engine.register_agent(slow.clone()).await;

    let subs = (0..3)
        .map(|i| Step::agent(format!("w{i}"), format!("Worker {i}"), "slow", "run"))
        .collect();
    let def = WorkflowBuilder::new("Serial")
        .parallel("fan", ParallelStepConfig::new("Fan", subs).fail_fast(true))
        .unwrap()
        .build()
        .unwrap();

    let options = ExecutionOptions {
        concurrency: Some(1),
        ..ExecutionOptions::default()
    };
    engine.execute_workflow(&def, no_params(), options).await.unwrap();
    assert_eq!(slow.max_in_flight(), 1);
}

#[tokio::test]
async fn test_sequential_runs_in_order() {
    let engine = engine();
    let agent = RecordingAgent::new("a1");
    engine.register_agent(agent.clone()).await;

    let def = WorkflowBuilder::new("Seq")
        .sequential(
            "seq",
            SequentialStepConfig::new(
                "Seq",
                vec![
                    Step::agent("one", "One", "a1", "one"),
                    Step::agent("two", "Two", "a1", "two"),
                    Step::agent("three", "Three", "a1", "three"),
                ],
            ),
        )
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(agent.actions(), vec!["one", "two", "three"]);
    let outputs = result.step("seq").unwrap().result.clone().unwrap();
    assert_eq!(outputs.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_sequential_stops_at_first_failure() {
    let engine = engine();
    let agent = RecordingAgent::new("a1");
    engine.register_agent(agent.clone()).await;
    engine.register_agent(FlakyAgent::always("bad")).await;

    let def = WorkflowBuilder::new("Seq")
        .sequential(
            "seq",
            SequentialStepConfig::new(
                "Seq",
                vec![
                    Step::agent("one", "One", "a1", "one"),
                    Step::agent("two", "Two", "bad", "two"),
                    Step::agent("three", "Three", "a1", "three"),
                ],
            ),
        )
        .unwrap()
        .build()
        .unwrap();

    assert!(engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .is_err());
    assert_eq!(agent.actions(), vec!["one"]);
}

#[tokio::test]
async fn test_loop_stops_at_max_iterations() {
    let engine = engine();
    let agent = RecordingAgent::new("a1");
    engine.register_agent(agent.clone()).await;

    let def = WorkflowBuilder::new("Forever")
        .r#loop(
            "spin",
            LoopStepConfig::new(
                "Spin",
                Condition::constant(true),
                Step::agent("tick", "Tick", "a1", "tick"),
            )
            .max_iterations(5),
        )
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(agent.call_count(), 5);
    let outputs = result.step("spin").unwrap().result.clone().unwrap();
    assert_eq!(outputs.as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_loop_predicate_drives_iterations() {
    let engine = engine();
    let agent = RecordingAgent::new("a1");
    engine.register_agent(agent.clone()).await;

    let below_three = Condition::when("n < 3", |ctx| {
        let n = ctx.variable("n").and_then(|v| v.as_i64()).unwrap_or(0);
        ctx.set_variable("n", json!(n + 1));
        n < 3
    });
    let def = WorkflowBuilder::new("Counter")
        .r#loop(
            "count",
            LoopStepConfig::new("Count", below_three, Step::agent("tick", "Tick", "a1", "tick")),
        )
        .unwrap()
        .build()
        .unwrap();

    engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(agent.call_count(), 3);
    // Each body call sees the counter the predicate just bumped.
    let seen: Vec<i64> = agent
        .calls()
        .iter()
        .map(|c| c.parameters["context_n"].as_i64().unwrap())
        .collect();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_conditional_branches() {
    let engine = engine();
    let agent = RecordingAgent::new("a1");
    engine.register_agent(agent.clone()).await;

    let flag = Condition::when("flag is set", |ctx| ctx.variable("flag") == Some(json!(true)));
    let def = WorkflowBuilder::new("Branch")
        .condition(
            "choose",
            ConditionalStepConfig::new("Choose", flag, Step::agent("yes", "Yes", "a1", "yes"))
                .otherwise(Step::agent("no", "No", "a1", "no")),
        )
        .unwrap()
        .build()
        .unwrap();

    let params = HashMap::from([("flag".to_string(), json!(true))]);
    let taken = engine
        .execute_workflow(&def, params, ExecutionOptions::default())
        .await
        .unwrap();
    assert!(taken.step("yes").is_some());
    assert!(taken.step("no").is_none());

    let params = HashMap::from([("flag".to_string(), json!(false))]);
    let other = engine
        .execute_workflow(&def, params, ExecutionOptions::default())
        .await
        .unwrap();
    assert!(other.step("no").is_some());
    assert_eq!(agent.actions(), vec!["yes", "no"]);
}

#[tokio::test]
async fn test_conditional_without_else_yields_null() {
    let engine = engine();
    engine.register_agent(RecordingAgent::new("a1")).await;

    let def = WorkflowBuilder::new("NoElse")
        .condition(
            "choose",
            ConditionalStepConfig::new(
                "Choose",
                Condition::constant(false),
                Step::agent("yes", "Yes", "a1", "yes"),
            ),
        )
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    let choose = result.step("choose").unwrap();
    assert_eq!(choose.status, StepStatus::Completed);
    assert_eq!(choose.result, Some(serde_json::Value::Null));
}

#[tokio::test]
async fn test_message_agent_dispatch() {
    let engine = engine();
    let notifier = MockMessageAgent::new("notifier");
    engine.register_message_agent(notifier.clone()).await;

    let def = WorkflowBuilder::new("Notify")
        .step(
            "ping",
            AgentStepConfig::new("Ping", "notifier", "notify").parameter("text", json!("hi")),
        )
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();

    let received = notifier.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].action, "notify");
    assert_eq!(received[0].to, "notifier");
    assert_eq!(received[0].payload["text"], "hi");

    let ack = result.step("ping").unwrap().result.clone().unwrap();
    assert_eq!(ack["success"], true);
    assert_eq!(ack["messageId"], received[0].id.as_str());
}

#[tokio::test]
async fn test_each_execution_gets_its_own_id() {
    let engine = engine();
    engine.register_agent(RecordingAgent::new("a1")).await;
    let def = WorkflowBuilder::new("Twice")
        .step("s1", AgentStepConfig::new("S1", "a1", "run"))
        .unwrap()
        .build()
        .unwrap();

    let first = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    let second = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_ne!(first.execution_id, second.execution_id);
    let a = engine.get_execution(&first.execution_id).await.unwrap();
    let b = engine.get_execution(&second.execution_id).await.unwrap();
    assert_eq!(a.execution_id, first.execution_id);
    assert_eq!(b.execution_id, second.execution_id);
    assert_eq!(engine.list_executions().await.len(), 2);
}

#[tokio::test]
async fn test_retries_until_success() {
    let engine = engine();
    let flaky = FlakyAgent::new("flaky", 2);
    engine.register_agent(flaky.clone()).await;

    let def = WorkflowBuilder::new("Retry")
        .step("s1", AgentStepConfig::new("S1", "flaky", "run").retries(3))
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();

    let step = result.step("s1").unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.attempts, 3);
    assert_eq!(flaky.call_count(), 3);
    assert_eq!(count_events(&engine, EventKind::StepRetrying), 2);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let engine = engine();
    let flaky = FlakyAgent::always("flaky");
    engine.register_agent(flaky.clone()).await;

    let def = WorkflowBuilder::new("Retry")
        .retries(2)
        .step("s1", AgentStepConfig::new("S1", "flaky", "run"))
        .unwrap()
        .build()
        .unwrap();

    let err = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MplpError::StepExecution { .. }));
    assert_eq!(flaky.call_count(), 3);

    let result = &engine.list_executions().await[0];
    let step = result.step("s1").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts, 3);
    assert!(step.error.as_ref().unwrap().contains("flaky"));
}

#[tokio::test]
async fn test_retry_option_is_a_fallback() {
    let engine = engine();
    let flaky = FlakyAgent::new("flaky", 1);
    engine.register_agent(flaky.clone()).await;

    let def = WorkflowBuilder::new("Retry")
        .step("s1", AgentStepConfig::new("S1", "flaky", "run"))
        .unwrap()
        .build()
        .unwrap();

    let options = ExecutionOptions {
        retries: Some(1),
        ..ExecutionOptions::default()
    };
    let result = engine.execute_workflow(&def, no_params(), options).await.unwrap();
    assert_eq!(result.step("s1").unwrap().attempts, 2);
}

#[tokio::test]
async fn test_inherited_retries_do_not_multiply_through_nesting() {
    let engine = engine();
    let flaky = FlakyAgent::always("flaky");
    engine.register_agent(flaky.clone()).await;

    let mid = Step::sequential("mid", "Mid", vec![Step::agent("leaf", "Leaf", "flaky", "run")]);
    let def = WorkflowBuilder::new("Nested")
        .sequential("outer", SequentialStepConfig::new("Outer", vec![mid]))
        .unwrap()
        .build()
        .unwrap();

    let options = ExecutionOptions {
        retries: Some(2),
        ..ExecutionOptions::default()
    };
    engine
        .execute_workflow(&def, no_params(), options)
        .await
        .unwrap_err();
    assert_eq!(flaky.call_count(), 3);

    let result = &engine.list_executions().await[0];
    assert_eq!(result.step("leaf").unwrap().attempts, 3);
    assert_eq!(result.step("mid").unwrap().attempts, 1);
    assert_eq!(result.step("outer").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_composite_step_retries_when_set_explicitly() {
    let engine = engine();
    let flaky = FlakyAgent::always("flaky");
    engine.register_agent(flaky.clone()).await;

    let def = WorkflowBuilder::new("Nested")
        .sequential(
            "outer",
            SequentialStepConfig::new("Outer", vec![Step::agent("leaf", "Leaf", "flaky", "run")])
                .retries(1),
        )
        .unwrap()
        .build()
        .unwrap();

    engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(flaky.call_count(), 2);
    let result = &engine.list_executions().await[0];
    assert_eq!(result.step("outer").unwrap().attempts, 2);
}

#[tokio::test]
async fn test_step_timeout() {
    let engine = engine();
    engine
        .register_agent(SlowAgent::new("slow", Duration::from_millis(500)))
        .await;

    let def = WorkflowBuilder::new("Timeout")
        .step("s1", AgentStepConfig::new("S1", "slow", "run").timeout(20))
        .unwrap()
        .build()
        .unwrap();

    let err = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MplpError::StepTimeout { ref step_id, timeout_ms: 20 } if step_id == "s1"));

    let result = &engine.list_executions().await[0];
    assert_eq!(result.step("s1").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_workflow_timeout() {
    let engine = engine();
    engine
        .register_agent(SlowAgent::new("slow", Duration::from_millis(500)))
        .await;

    let def = WorkflowBuilder::new("Timeout")
        .timeout(30)
        .unwrap()
        .step("s1", AgentStepConfig::new("S1", "slow", "run"))
        .unwrap()
        .build()
        .unwrap();

    let err = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MplpError::WorkflowTimeout { timeout_ms: 30, .. }));

    let result = &engine.list_executions().await[0];
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.step("s1").unwrap().status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_with_token() {
    let engine = engine();
    engine
        .register_agent(SlowAgent::new("slow", Duration::from_millis(500)))
        .await;
    let def = WorkflowBuilder::new("Cancel")
        .step("s1", AgentStepConfig::new("S1", "slow", "run"))
        .unwrap()
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let options = ExecutionOptions {
        cancel: Some(token),
        ..ExecutionOptions::default()
    };
    let err = engine.execute_workflow(&def, no_params(), options).await.unwrap_err();
    assert!(matches!(err, MplpError::Cancelled(_)));

    let result = &engine.list_executions().await[0];
    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert_eq!(result.step("s1").unwrap().status, StepStatus::Cancelled);
    assert_eq!(count_events(&engine, EventKind::WorkflowCancelled), 1);
    assert!(engine.active_executions().await.is_empty());
}

#[tokio::test]
async fn test_cancel_execution_by_id() {
    let engine = Arc::new(engine());
    engine
        .register_agent(SlowAgent::new("slow", Duration::from_millis(1000)))
        .await;
    let def = WorkflowBuilder::new("Cancel")
        .step("s1", AgentStepConfig::new("S1", "slow", "run"))
        .unwrap()
        .build()
        .unwrap();

    let runner = engine.clone();
    let handle = tokio::spawn(async move {
        runner
            .execute_workflow(&def, HashMap::new(), ExecutionOptions::default())
            .await
    });

    let execution_id = loop {
        if let Some(id) = engine.active_executions().await.into_iter().next() {
            break id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let running = engine.get_execution(&execution_id).await.unwrap();
    assert_eq!(running.status, WorkflowStatus::Running);
    assert!(engine.context(&execution_id).await.is_some());
    assert!(!engine.clear_execution(&execution_id).await);

    assert!(engine.cancel_execution(&execution_id).await);
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, MplpError::Cancelled(_)));
    assert_eq!(
        engine.get_execution(&execution_id).await.unwrap().status,
        WorkflowStatus::Cancelled
    );
}

#[tokio::test]
async fn test_progress_reaches_one_over_nested_steps() {
    let engine = engine();
    engine.register_agent(RecordingAgent::new("a1")).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.event_bus().on(EventKind::Progress, move |event| {
        if let WorkflowEvent::Progress(update) = event {
            sink.lock().unwrap().push((update.finished, update.total, update.progress));
        }
    });

    let def = WorkflowBuilder::new("Progress")
        .step("first", AgentStepConfig::new("First", "a1", "run"))
        .unwrap()
        .parallel(
            "fan",
            ParallelStepConfig::new(
                "Fan",
                vec![
                    Step::agent("x", "X", "a1", "run"),
                    Step::agent("y", "Y", "a1", "run"),
                ],
            )
            .depends_on(["first"]),
        )
        .unwrap()
        .build()
        .unwrap();

    engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|&(_, total, _)| total == 4));
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(seen.last().map(|&(f, _, p)| (f, p)), Some((4, 1.0)));
}

#[tokio::test]
async fn test_progress_counts_steps_that_never_run() {
    let engine = engine();
    engine.register_agent(RecordingAgent::new("a1")).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.event_bus().on(EventKind::Progress, move |event| {
        if let WorkflowEvent::Progress(update) = event {
            sink.lock().unwrap().push((update.finished, update.total, update.progress));
        }
    });

    let def = WorkflowBuilder::new("Sparse")
        .step("first", AgentStepConfig::new("First", "a1", "run"))
        .unwrap()
        .parallel(
            "fan",
            ParallelStepConfig::new(
                "Fan",
                vec![
                    Step::agent("x", "X", "a1", "run"),
                    Step::agent("y", "Y", "a1", "run"),
                    Step::agent("z", "Z", "a1", "run"),
                ],
            )
            .depends_on(["first"])
            .when(Condition::constant(false)),
        )
        .unwrap()
        .condition(
            "branch",
            ConditionalStepConfig::new(
                "Branch",
                Condition::constant(false),
                Step::agent("then", "Then", "a1", "run"),
            ),
        )
        .unwrap()
        .r#loop(
            "idle",
            LoopStepConfig::new(
                "Idle",
                Condition::constant(false),
                Step::agent("body", "Body", "a1", "run"),
            ),
        )
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(result.step("fan").unwrap().status, StepStatus::Skipped);
    assert!(result.step("x").is_none());

    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|&(_, total, _)| total == 9));
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(seen.last().map(|&(f, _, p)| (f, p)), Some((9, 1.0)));
}

#[tokio::test]
async fn test_lifecycle_events() {
    let engine = engine();
    engine.register_agent(RecordingAgent::new("a1")).await;
    engine.register_agent(FlakyAgent::always("bad")).await;

    let ok = WorkflowBuilder::new("Ok")
        .step("s1", AgentStepConfig::new("S1", "a1", "run"))
        .unwrap()
        .build()
        .unwrap();
    engine
        .execute_workflow(&ok, no_params(), ExecutionOptions::default())
        .await
        .unwrap();

    let kinds: Vec<EventKind> = engine
        .event_bus()
        .history(None)
        .iter()
        .map(|r| r.kind)
        .filter(|k| *k != EventKind::Progress)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::WorkflowStarted,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::WorkflowCompleted,
        ]
    );

    let failing = WorkflowBuilder::new("Bad")
        .step("s1", AgentStepConfig::new("S1", "bad", "run"))
        .unwrap()
        .build()
        .unwrap();
    let _ = engine
        .execute_workflow(&failing, no_params(), ExecutionOptions::default())
        .await;
    assert_eq!(count_events(&engine, EventKind::StepFailed), 1);
    assert_eq!(count_events(&engine, EventKind::WorkflowFailed), 1);
}

#[tokio::test]
async fn test_panicking_listener_does_not_break_execution() {
    let engine = engine();
    engine.register_agent(RecordingAgent::new("a1")).await;
    engine
        .event_bus()
        .on(EventKind::StepCompleted, |_| panic!("listener bug"));

    let def = WorkflowBuilder::new("Robust")
        .step("s1", AgentStepConfig::new("S1", "a1", "run"))
        .unwrap()
        .build()
        .unwrap();

    let result = engine
        .execute_workflow(&def, no_params(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(engine.event_bus().stats().listener_failures, 1);
}

#[tokio::test]
async fn test_metadata_is_merged_into_result() {
    let engine = engine();
    engine.register_agent(RecordingAgent::new("a1")).await;
    let def = WorkflowBuilder::new("Meta")
        .metadata([("owner", json!("ops")), ("tier", json!(1))])
        .step("s1", AgentStepConfig::new("S1", "a1", "run"))
        .unwrap()
        .build()
        .unwrap();

    let options = ExecutionOptions {
        metadata: HashMap::from([("tier".to_string(), json!(2))]),
        ..ExecutionOptions::default()
    };
    let result = engine.execute_workflow(&def, no_params(), options).await.unwrap();
    assert_eq!(result.metadata["owner"], "ops");
    assert_eq!(result.metadata["tier"], 2);
}
