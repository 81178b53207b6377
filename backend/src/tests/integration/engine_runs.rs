use chrono::{Duration, Utc};
use flowcore_shared::{ActionKind, GenerateAiContentAction, RunStatus, SendEmailAction, WorkflowAction};
use serde_json::json;
use uuid::Uuid;

use crate::store::{LockStore, WorkflowStore};
use crate::tests::fixtures::*;
use crate::tests::helpers::wait_for_status;
use crate::tests::{TestContext, AI_REPLY};
use crate::workflows::engine::{run_job_id, StepProgress, LOOP_GUARD_ERROR};
use crate::workflows::EngineConfig;

#[tokio::test(flavor = "multi_thread")]
async fn test_context_accumulates_across_steps() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Accumulate");
    let compute = ctx.store.add_step(wf, "Compute", vec![script_action("Compute", "return { a: 1 };")]);
    let record = ctx.store.add_step(
        wf,
        "Record",
        vec![create_action("Record", "Tally", json!({ "count": "{result.a}", "source": "{triggerData.source}" }))],
    );
    ctx.store.link(compute, Some(record), None);

    let run = ctx
        .engine
        .create_run(wf, None, json!({ "triggerData": { "source": "manual" } }), None)
        .await
        .unwrap();
    let status = ctx.engine.start_run(run.id).await.unwrap();
    assert_eq!(status, Some(RunStatus::Completed));

    let tallies = ctx.data.documents("Tally");
    assert_eq!(tallies.len(), 1);
    assert_eq!(tallies[0]["count"], "1");
    assert_eq!(tallies[0]["source"], "manual");

    let run = ctx.store.run(run.id);
    assert_eq!(run.context_data["result"], json!({ "a": 1 }));
    assert_eq!(run.context_data["createdData"]["model"], "Tally");
    assert_eq!(run.current_step, None);
    assert!(run.completed_at.is_some());
    assert_eq!(run.executions_of(compute), 1);
    assert_eq!(run.executions_of(record), 1);
}

#[tokio::test]
async fn test_run_without_trigger_user_acts_as_owner() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Owner");
    ctx.store.add_step(wf, "Create", vec![create_action("Create", "Note", json!({ "text": "hi" }))]);

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    ctx.engine.start_run(run.id).await.unwrap();

    let run = ctx.store.run(run.id);
    let owner = run.run_as.clone().unwrap();
    assert_eq!(ctx.data.acting_users(), vec![Some(owner)]);
}

#[tokio::test]
async fn test_cycle_stops_at_loop_guard() {
    let ctx = TestContext::with_config(EngineConfig {
        max_executions_by_step: 5,
        ..EngineConfig::default()
    });
    let wf = ctx.store.add_workflow("Ping pong");
    let ping = ctx.store.add_step(wf, "Ping", Vec::new());
    let pong = ctx.store.add_step(wf, "Pong", Vec::new());
    ctx.store.link(ping, Some(pong), None);
    ctx.store.link(pong, Some(ping), None);

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    let status = ctx.engine.start_run(run.id).await.unwrap();
    assert_eq!(status, Some(RunStatus::Failed));

    let run = ctx.store.run(run.id);
    assert_eq!(run.error.as_deref(), Some(LOOP_GUARD_ERROR));
    assert_eq!(run.current_step, Some(ping));
    assert_eq!(run.executions_of(ping), 5);
    assert_eq!(run.executions_of(pong), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_action_takes_failure_branch() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Recover");
    let risky = ctx.store.add_step(
        wf,
        "Risky",
        vec![
            script_action("Prepare", "return 'prepared';"),
            script_action("Explode", "throw new Error('boom');"),
        ],
    );
    let cleanup = ctx.store.add_step(
        wf,
        "Cleanup",
        vec![create_action("Log", "Incident", json!({ "reason": "{error.message}", "action": "{error.action}" }))],
    );
    let happy = ctx.store.add_step(wf, "Happy", Vec::new());
    ctx.store.link(risky, Some(happy), Some(cleanup));

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    let lease = Uuid::new_v4();
    assert!(ctx.engine.store().start_run(run.id, lease).await.unwrap());

    let mut run = ctx.store.run(run.id);
    let progress = ctx.engine.execute_step(&mut run).await.unwrap();
    assert_eq!(progress, StepProgress::Advanced);

    let stored = ctx.store.run(run.id);
    assert_eq!(stored.status, RunStatus::Running);
    assert_eq!(stored.current_step, Some(cleanup));
    assert!(stored.error.as_deref().unwrap().starts_with("Explode: "));
    assert_eq!(stored.context_data["error"]["action"], "Explode");
    // patches of the failed step are discarded
    assert!(stored.context_data.get("result").is_none());

    let status = ctx.engine.drive(run.id, lease).await.unwrap();
    assert_eq!(status, RunStatus::Completed);

    let incidents = ctx.data.documents("Incident");
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0]["action"], "Explode");
    assert!(incidents[0]["reason"].as_str().unwrap().contains("boom"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_action_without_branch_fails_run() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Fragile");
    let step = ctx.store.add_step(wf, "Explode", vec![script_action("Explode", "null.property;")]);
    let after = ctx.store.add_step(wf, "Never", vec![create_action("Never", "Note", json!({}))]);
    ctx.store.link(step, Some(after), None);

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    let status = ctx.engine.start_run(run.id).await.unwrap();
    assert_eq!(status, Some(RunStatus::Failed));

    let run = ctx.store.run(run.id);
    assert_eq!(run.current_step, Some(step));
    assert!(run.error.unwrap().starts_with("Explode: "));
    assert!(run.completed_at.is_some());
    assert!(ctx.data.documents("Note").is_empty());
}

#[tokio::test]
async fn test_wait_pauses_until_resume_time() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Delayed");
    let wait = ctx.store.add_step(wf, "Wait", vec![wait_action("Wait", 2)]);
    let follow_up = ctx.store.add_step(wf, "Follow up", vec![create_action("Follow up", "Reminder", json!({ "sent": true }))]);
    ctx.store.link(wait, Some(follow_up), None);

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    let status = ctx.engine.start_run(run.id).await.unwrap();
    assert_eq!(status, Some(RunStatus::Paused));

    let paused = ctx.store.run(run.id);
    assert_eq!(paused.current_step, Some(follow_up));
    let resume_at = paused.resume_at.unwrap();
    assert!(resume_at > Utc::now() + Duration::seconds(1));
    assert!(resume_at <= Utc::now() + Duration::seconds(2));

    assert_eq!(ctx.engine.resume_due_runs(Utc::now()).await.unwrap(), 0);
    assert_eq!(ctx.store.run(run.id).status, RunStatus::Paused);

    let resumed = ctx
        .engine
        .resume_due_runs(Utc::now() + Duration::seconds(3))
        .await
        .unwrap();
    assert_eq!(resumed, 1);

    let run = ctx.store.run(run.id);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.resume_at, None);
    assert_eq!(run.current_step, None);
    assert_eq!(ctx.data.documents("Reminder").len(), 1);
}

#[tokio::test]
async fn test_wait_on_last_step_completes_run() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Trailing wait");
    ctx.store.add_step(wf, "Wait", vec![wait_action("Wait", 60)]);

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    let status = ctx.engine.start_run(run.id).await.unwrap();
    assert_eq!(status, Some(RunStatus::Completed));
}

#[tokio::test]
async fn test_cancelled_run_is_not_resumed() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Cancelled");
    let wait = ctx.store.add_step(wf, "Wait", vec![wait_action("Wait", 1)]);
    let next = ctx.store.add_step(wf, "Next", vec![create_action("Next", "Note", json!({}))]);
    ctx.store.link(wait, Some(next), None);

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    ctx.engine.start_run(run.id).await.unwrap();

    assert!(ctx.engine.cancel_run(run.id).await.unwrap());
    assert!(!ctx.engine.cancel_run(run.id).await.unwrap());

    let resumed = ctx
        .engine
        .resume_due_runs(Utc::now() + Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(resumed, 0);

    let run = ctx.store.run(run.id);
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(ctx.data.documents("Note").is_empty());
}

#[tokio::test]
async fn test_unmet_step_conditions_skip_actions() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Escalate");
    let escalate = ctx.store.add_step(
        wf,
        "Escalate",
        vec![create_action("Escalate", "Escalation", json!({ "title": "{triggerData.title}" }))],
    );
    ctx.store.update_step(escalate, |step| {
        step.conditions = Some(json!({ "$gte": ["$triggerData.priority", 3] }));
    });

    let low = ctx
        .engine
        .create_run(wf, None, json!({ "triggerData": { "title": "Low", "priority": 1 } }), None)
        .await
        .unwrap();
    let high = ctx
        .engine
        .create_run(wf, None, json!({ "triggerData": { "title": "High", "priority": 5 } }), None)
        .await
        .unwrap();

    assert_eq!(ctx.engine.start_run(low.id).await.unwrap(), Some(RunStatus::Completed));
    assert_eq!(ctx.engine.start_run(high.id).await.unwrap(), Some(RunStatus::Completed));

    let escalations = ctx.data.documents("Escalation");
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0]["title"], "High");
}

#[tokio::test]
async fn test_orphaned_run_is_recovered() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Orphan");
    ctx.store.add_step(wf, "Create", vec![create_action("Create", "Note", json!({}))]);

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    assert!(ctx.engine.store().start_run(run.id, Uuid::new_v4()).await.unwrap());

    assert_eq!(ctx.engine.recover_stale_runs(Utc::now()).await.unwrap(), 0);

    ctx.store.age_run(run.id, Duration::minutes(31));
    assert_eq!(ctx.engine.recover_stale_runs(Utc::now()).await.unwrap(), 1);
    assert_eq!(ctx.store.run(run.id).status, RunStatus::Completed);
    assert_eq!(ctx.data.documents("Note").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_step_is_not_recovered_while_driven() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Slow");
    ctx.store.add_step(
        wf,
        "Crunch",
        vec![script_action(
            "Crunch",
            r#"
            const end = Date.now() + 500;
            while (Date.now() < end) {}
            db.create("Hit", { at: end });
            return "done";
            "#,
        )],
    );

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    let driver = ctx.engine.spawn(run.id);
    wait_for_status(&ctx.store, run.id, RunStatus::Running).await;

    ctx.store.age_run(run.id, Duration::minutes(31));
    assert_eq!(ctx.engine.recover_stale_runs(Utc::now()).await.unwrap(), 0);

    driver.await.unwrap();
    let run = ctx.store.run(run.id);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.context_data["result"], "done");
    assert_eq!(ctx.data.documents("Hit").len(), 1);
}

#[tokio::test]
async fn test_superseded_driver_stops_writing() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Superseded");
    ctx.store.add_step(wf, "Create", vec![create_action("Create", "Note", json!({}))]);

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    let first = Uuid::new_v4();
    assert!(ctx.engine.store().start_run(run.id, first).await.unwrap());
    let mut stale_copy = ctx.store.run(run.id);

    ctx.store.age_run(run.id, Duration::minutes(31));
    let second = Uuid::new_v4();
    assert!(ctx
        .engine
        .store()
        .claim_stale_run(run.id, Utc::now() - Duration::minutes(30), second)
        .await
        .unwrap());

    // the replaced driver can neither continue nor write
    assert_eq!(ctx.engine.drive(run.id, first).await.unwrap(), RunStatus::Running);
    let progress = ctx.engine.execute_step(&mut stale_copy).await.unwrap();
    assert_eq!(progress, StepProgress::Halted);
    assert_eq!(stale_copy.status, RunStatus::Running);
    assert!(ctx.data.documents("Note").is_empty());

    let stored = ctx.store.run(run.id);
    assert_eq!(stored.lease, Some(second));
    assert!(stored.step_executions_count.is_empty());

    assert_eq!(ctx.engine.drive(run.id, second).await.unwrap(), RunStatus::Completed);
    assert_eq!(ctx.data.documents("Note").len(), 1);
}

#[tokio::test]
async fn test_locked_run_is_not_started() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Held");
    ctx.store.add_step(wf, "Only", Vec::new());

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    ctx.store
        .try_acquire(&run_job_id(run.id), Uuid::new_v4(), 5)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(ctx.engine.start_run(run.id).await.unwrap(), None);
    assert_eq!(ctx.store.run(run.id).status, RunStatus::Pending);
}

#[tokio::test]
async fn test_email_and_ai_actions() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Notify");
    ctx.store.add_step(
        wf,
        "Notify",
        vec![
            WorkflowAction::new(
                "Summarize",
                ActionKind::GenerateAiContent(GenerateAiContentAction {
                    prompt: "Summarize: {triggerData.title}".to_string(),
                    system_prompt: None,
                    model: None,
                    temperature: Some(0.2),
                    max_tokens: None,
                }),
            ),
            WorkflowAction::new(
                "Mail",
                ActionKind::SendEmail(SendEmailAction {
                    to: "{triggerData.reporter}; ops@example.com".to_string(),
                    cc: None,
                    subject: "Ticket {triggerData.title}".to_string(),
                    content: "{aiContent}".to_string(),
                    is_html: false,
                }),
            ),
        ],
    );

    let context = json!({ "triggerData": { "title": "Disk full", "reporter": "amy@example.com" } });
    let run = ctx.engine.create_run(wf, None, context, None).await.unwrap();
    assert_eq!(ctx.engine.start_run(run.id).await.unwrap(), Some(RunStatus::Completed));

    let requests = ctx.ai.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].prompt, "Summarize: Disk full");

    let sent = ctx.email.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["amy@example.com", "ops@example.com"]);
    assert_eq!(sent[0].subject, "Ticket Disk full");
    assert_eq!(sent[0].body, AI_REPLY);
    assert_eq!(ctx.store.run(run.id).context_data["aiContent"], AI_REPLY);
}

#[tokio::test]
async fn test_started_run_cannot_be_started_twice() {
    let ctx = TestContext::new();
    let wf = ctx.store.add_workflow("Once");
    ctx.store.add_step(wf, "Only", Vec::new());

    let run = ctx.engine.create_run(wf, None, json!({}), None).await.unwrap();
    assert_eq!(ctx.engine.start_run(run.id).await.unwrap(), Some(RunStatus::Completed));
    assert_eq!(ctx.engine.start_run(run.id).await.unwrap(), None);
}
