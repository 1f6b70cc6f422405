//! End-to-end orchestrator behaviour against both stores

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use tallyloom_durable::prelude::*;
use tallyloom_durable::ActivityExecution;
use tokio_test::assert_ok;

async fn double_of_five(backend: Backend) {
    let test_store = open_store(backend).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(2));
    register_double(&orchestrator, Duration::ZERO);
    assert_ok!(orchestrator.start().await);

    let id = orchestrator.invoke_workflow("w", json!({"x": 5})).await.unwrap();
    let finished = orchestrator.wait_for_completion(id, WAIT).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Done);
    assert_eq!(finished.output, Some(json!(10)));
    assert_eq!(finished.name, "w");
    assert_eq!(finished.input, json!({"x": 5}));
    assert_terminal_invariant(&finished);

    let history = orchestrator.activity_history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].activity_name, "double");
    assert_eq!(history[0].output, Some(json!(10)));

    assert_ok!(orchestrator.stop().await);
}

#[test_log::test(tokio::test)]
async fn test_double_workflow_completes_memory() {
    double_of_five(Backend::Memory).await;
}

#[test_log::test(tokio::test)]
async fn test_double_workflow_completes_sqlite() {
    double_of_five(Backend::Sqlite).await;
}

async fn failing_activity_fails_workflow(backend: Backend) {
    let test_store = open_store(backend).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(2));
    register_fail(&orchestrator);
    orchestrator.start().await.unwrap();

    let id = orchestrator.invoke_workflow("w2", json!({})).await.unwrap();
    let finished = orchestrator.wait_for_completion(id, WAIT).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Failed);
    assert_eq!(finished.error_message.as_deref(), Some("fail() always raises"));
    assert_eq!(finished.output, None);
    assert_terminal_invariant(&finished);

    let history = orchestrator.activity_history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].error.as_deref(), Some("fail() always raises"));
    assert!(history[0].finished_at.is_some());

    orchestrator.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_failing_activity_fails_workflow_memory() {
    failing_activity_fails_workflow(Backend::Memory).await;
}

#[test_log::test(tokio::test)]
async fn test_failing_activity_fails_workflow_sqlite() {
    failing_activity_fails_workflow(Backend::Sqlite).await;
}

async fn current_activity_is_observable(backend: Backend) {
    let test_store = open_store(backend).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(1));
    register_double(&orchestrator, Duration::from_millis(300));
    orchestrator.start().await.unwrap();

    let id = orchestrator.invoke_workflow("w", json!({"x": 5})).await.unwrap();

    let mut saw_double = false;
    loop {
        let workflow = orchestrator.get_workflow_status(id).await.unwrap();
        if workflow.current_activity.as_deref() == Some("double") {
            assert_eq!(workflow.status, WorkflowStatus::Processing);
            saw_double = true;
        }
        if workflow.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saw_double, "current_activity never showed \"double\"");

    let finished = orchestrator.get_workflow_status(id).await.unwrap();
    assert_eq!(finished.output, Some(json!(10)));
    assert_eq!(finished.current_activity, None);

    orchestrator.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_current_activity_is_observable_memory() {
    current_activity_is_observable(Backend::Memory).await;
}

#[test_log::test(tokio::test)]
async fn test_current_activity_is_observable_sqlite() {
    current_activity_is_observable(Backend::Sqlite).await;
}

#[test_log::test(tokio::test)]
async fn test_unknown_workflow_creates_no_row() {
    for backend in [Backend::Memory, Backend::Sqlite] {
        let test_store = open_store(backend).await;
        let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(1));
        register_double(&orchestrator, Duration::ZERO);
        orchestrator.start().await.unwrap();

        let error = orchestrator
            .invoke_workflow("not_registered", json!({}))
            .await
            .unwrap_err();
        assert!(error.is_unknown_handler(), "{backend:?}: {error}");

        let all = orchestrator
            .list_workflows(WorkflowFilter::default())
            .await
            .unwrap();
        assert!(all.is_empty(), "{backend:?} wrote a row");

        orchestrator.stop().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_status_right_after_invoke_is_not_terminal() {
    let test_store = open_store(Backend::Sqlite).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(2));
    register_double(&orchestrator, Duration::from_millis(50));
    orchestrator.start().await.unwrap();

    let mut ids = Vec::new();
    for x in 0..5 {
        let id = orchestrator.invoke_workflow("w", json!({ "x": x })).await.unwrap();
        let status = orchestrator.get_workflow_status(id).await.unwrap().status;
        assert!(
            matches!(status, WorkflowStatus::Pending | WorkflowStatus::Processing),
            "fresh workflow already {status}"
        );
        ids.push(id);
    }

    for id in ids {
        let finished = orchestrator.wait_for_completion(id, WAIT).await.unwrap();
        assert_terminal_invariant(&finished);
    }
    orchestrator.stop().await.unwrap();
}

async fn concurrency_is_bounded(backend: Backend) {
    const MAX_WORKERS: usize = 2;

    let test_store = open_store(backend).await;
    let store = test_store.store.clone();
    let orchestrator = Orchestrator::new(store.clone(), pool_config(MAX_WORKERS));
    register_double(&orchestrator, Duration::from_millis(40));
    orchestrator.start().await.unwrap();

    let mut ids = Vec::new();
    for x in 0..6 {
        ids.push(orchestrator.invoke_workflow("w", json!({ "x": x })).await.unwrap());
    }

    let mut max_seen = 0;
    loop {
        let processing = store
            .list_workflows(WorkflowFilter::default().with_status(WorkflowStatus::Processing))
            .await
            .unwrap()
            .len();
        max_seen = max_seen.max(processing);
        assert!(processing <= MAX_WORKERS, "{processing} workflows processing at once");

        let done = store
            .list_workflows(WorkflowFilter::default().with_status(WorkflowStatus::Done))
            .await
            .unwrap()
            .len();
        if done == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    assert!(max_seen >= 1);

    for (x, id) in ids.into_iter().enumerate() {
        let workflow = store.get_workflow(id).await.unwrap();
        assert_eq!(workflow.output, Some(json!(x as i64 * 2)));
    }

    orchestrator.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_concurrency_is_bounded_memory() {
    concurrency_is_bounded(Backend::Memory).await;
}

#[test_log::test(tokio::test)]
async fn test_concurrency_is_bounded_sqlite() {
    concurrency_is_bounded(Backend::Sqlite).await;
}

async fn activities_run_in_call_order(backend: Backend) {
    let test_store = open_store(backend).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(2));
    orchestrator
        .register_activity_fn("a", |_ctx, input| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(json!({ "a": input }))
        })
        .unwrap();
    orchestrator
        .register_activity_fn("b", |_ctx, input| async move { Ok(json!({ "b": input })) })
        .unwrap();
    orchestrator
        .register_workflow_fn("a_then_b", |ctx, input| async move {
            let first = ctx.call_activity("a", input).await?;
            Ok(ctx.call_activity("b", first).await?)
        })
        .unwrap();
    orchestrator.start().await.unwrap();

    let id = orchestrator.invoke_workflow("a_then_b", json!(1)).await.unwrap();
    let finished = orchestrator.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(finished.output, Some(json!({"b": {"a": 1}})));

    let history: Vec<ActivityExecution> = orchestrator.activity_history(id).await.unwrap();
    let names: Vec<&str> = history.iter().map(|e| e.activity_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);

    let a_finished = history[0].finished_at.unwrap();
    assert!(a_finished <= history[1].started_at);
    assert!(history[0].started_at >= finished.created_at);
    assert!(finished.updated_at >= history[1].finished_at.unwrap());

    orchestrator.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_activities_run_in_call_order_memory() {
    activities_run_in_call_order(Backend::Memory).await;
}

#[test_log::test(tokio::test)]
async fn test_activities_run_in_call_order_sqlite() {
    activities_run_in_call_order(Backend::Sqlite).await;
}

async fn joined_activity_calls_do_not_overlap(backend: Backend) {
    let test_store = open_store(backend).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(2));

    // Each activity reports the in-flight marker it sees after sleeping
    for (name, delay) in [("a", 80), ("b", 20)] {
        let store = test_store.store.clone();
        orchestrator
            .register_activity_fn(name, move |ctx, _input| {
                let store = store.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let workflow = store.get_workflow(ctx.workflow_id).await?;
                    Ok(json!(workflow.current_activity))
                }
            })
            .unwrap();
    }
    orchestrator
        .register_workflow_fn("par", |ctx, input| async move {
            let (a, b) = futures::join!(
                ctx.call_activity("a", input.clone()),
                ctx.call_activity("b", input)
            );
            Ok(json!([a?, b?]))
        })
        .unwrap();
    orchestrator.start().await.unwrap();

    let id = orchestrator.invoke_workflow("par", json!({})).await.unwrap();
    let finished = orchestrator.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Done);
    assert_eq!(finished.output, Some(json!(["a", "b"])));

    let history = orchestrator.activity_history(id).await.unwrap();
    let names: Vec<&str> = history.iter().map(|e| e.activity_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert!(history[0].finished_at.unwrap() <= history[1].started_at);

    orchestrator.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_joined_activity_calls_do_not_overlap_memory() {
    joined_activity_calls_do_not_overlap(Backend::Memory).await;
}

#[test_log::test(tokio::test)]
async fn test_joined_activity_calls_do_not_overlap_sqlite() {
    joined_activity_calls_do_not_overlap(Backend::Sqlite).await;
}

#[test_log::test(tokio::test)]
async fn test_duplicate_registration_prevents_start() {
    let test_store = open_store(Backend::Memory).await;
    let queued = test_store.store.create_workflow("w", json!({"x": 1})).await.unwrap();

    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(1));
    register_double(&orchestrator, Duration::ZERO);
    let duplicate = orchestrator.register_workflow_fn("w", |_ctx, input| async move { Ok(input) });
    assert!(matches!(
        duplicate,
        Err(OrchestratorError::Registry(RegistryError::DuplicateRegistration { .. }))
    ));

    let refused = orchestrator.start().await;
    assert!(matches!(
        refused,
        Err(OrchestratorError::Registry(RegistryError::DuplicateRegistration { .. }))
    ));
    assert!(!orchestrator.is_running());

    // Recovery never ran, so the queued instance is untouched
    let untouched = test_store.store.get_workflow(queued).await.unwrap();
    assert_eq!(untouched.status, WorkflowStatus::Pending);
}

#[test_log::test(tokio::test)]
async fn test_workflow_can_compensate_for_activity_error() {
    let test_store = open_store(Backend::Memory).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(1));
    register_fail(&orchestrator);
    orchestrator
        .register_activity_fn("fallback", |_ctx, _input| async move { Ok(json!("recovered")) })
        .unwrap();
    orchestrator
        .register_workflow_fn("careful", |ctx, input| async move {
            match ctx.call_activity("fail", input.clone()).await {
                Ok(output) => Ok(output),
                Err(_) => Ok(ctx.call_activity("fallback", input).await?),
            }
        })
        .unwrap();
    orchestrator.start().await.unwrap();

    let id = orchestrator.invoke_workflow("careful", json!({})).await.unwrap();
    let finished = orchestrator.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Done);
    assert_eq!(finished.output, Some(json!("recovered")));

    let history = orchestrator.activity_history(id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].error.is_some());
    assert_eq!(history[1].output, Some(json!("recovered")));

    orchestrator.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_retry_combinator_records_attempts() {
    let test_store = open_store(Backend::Sqlite).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(1));

    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = calls.clone();
    orchestrator
        .register_activity_fn("flaky", move |_ctx, _input| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 2 {
                    Err(ActivityError::retryable(format!("attempt {} failed", n + 1)))
                } else {
                    Ok(json!("third time lucky"))
                }
            }
        })
        .unwrap();
    orchestrator
        .register_workflow_fn("patient", |ctx, input| async move {
            let policy = RetryPolicy::fixed(Duration::from_millis(5), 3);
            Ok(ctx.call_activity_with_retry("flaky", input, &policy).await?)
        })
        .unwrap();
    orchestrator.start().await.unwrap();

    let id = orchestrator.invoke_workflow("patient", json!({})).await.unwrap();
    let finished = orchestrator.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(finished.output, Some(json!("third time lucky")));

    let errors: Vec<Option<String>> = orchestrator
        .activity_history(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.error)
        .collect();
    assert_eq!(
        errors,
        vec![
            Some("attempt 1 failed".to_string()),
            Some("attempt 2 failed".to_string()),
            None,
        ]
    );

    orchestrator.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_list_workflows_by_name() {
    let test_store = open_store(Backend::Sqlite).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(2));
    register_double(&orchestrator, Duration::ZERO);
    register_fail(&orchestrator);
    orchestrator.start().await.unwrap();

    let first = orchestrator.invoke_workflow("w", json!({"x": 1})).await.unwrap();
    let failing = orchestrator.invoke_workflow("w2", json!({})).await.unwrap();
    let second = orchestrator.invoke_workflow("w", json!({"x": 2})).await.unwrap();
    for id in [first, failing, second] {
        orchestrator.wait_for_completion(id, WAIT).await.unwrap();
    }

    let doubles = orchestrator
        .list_workflows(WorkflowFilter::by_name("w"))
        .await
        .unwrap();
    assert_eq!(doubles.iter().map(|w| w.id).collect::<Vec<_>>(), vec![first, second]);

    let failed = orchestrator
        .list_workflows(WorkflowFilter::default().with_status(WorkflowStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, failing);

    orchestrator.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_stop_drains_running_workflows() {
    let test_store = open_store(Backend::Memory).await;
    let orchestrator = Orchestrator::new(test_store.store.clone(), pool_config(1));
    register_double(&orchestrator, Duration::from_millis(100));
    orchestrator.start().await.unwrap();

    let running = orchestrator.invoke_workflow("w", json!({"x": 1})).await.unwrap();
    let queued = orchestrator.invoke_workflow("w", json!({"x": 2})).await.unwrap();
    wait_until(test_store.store.as_ref(), running, |w| {
        w.status == WorkflowStatus::Processing
    })
    .await;

    orchestrator.stop().await.unwrap();

    let running = orchestrator.get_workflow_status(running).await.unwrap();
    assert_eq!(running.status, WorkflowStatus::Done);

    let queued = orchestrator.get_workflow_status(queued).await.unwrap();
    assert_eq!(queued.status, WorkflowStatus::Pending);
}
