//! End-to-end engine scenarios against the in-memory stores.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use flowplane::engine::{CompleteTaskRequest, StartWorkflowRequest, WorkflowEngine};
use flowplane::error::EngineError;
use flowplane::model::{
    AssignmentKind, EventType, InstanceStatus, RetrySpec, StepType, TaskAssignment, TriggerConfig,
    WorkflowDefinition, WorkflowStep,
};

fn step(key: &str, step_type: StepType, position: u32) -> WorkflowStep {
    WorkflowStep::new(key, key, step_type, position)
}

fn end_step(key: &str, position: u32) -> WorkflowStep {
    let mut s = step(key, StepType::End, position);
    s.is_end = true;
    s
}

fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Process queued jobs until the queue has nothing due.
async fn drain(engine: &WorkflowEngine) {
    let queue = engine.job_queue();
    loop {
        let batch = queue.dequeue_batch("test-worker", 10).await.unwrap();
        if batch.is_empty() {
            break;
        }
        for job in &batch {
            engine.process_job(job).await;
        }
    }
}

async fn publish(engine: &WorkflowEngine, definition: WorkflowDefinition) -> WorkflowDefinition {
    let draft = engine.create_definition(definition).await.unwrap();
    engine
        .publish_definition(draft.id, draft.version)
        .await
        .unwrap()
}

/// start (automated) -> gate (condition on amount) -> high/low -> end
fn conditional_definition() -> WorkflowDefinition {
    let mut start = step("start", StepType::Automated, 0);
    start.is_start = true;
    start.config = json!({"action": "noop"});
    start.transitions.insert("default".into(), "gate".into());

    let mut gate = step("gate", StepType::Condition, 1);
    gate.config = json!({"expression": "amount > 1000"});
    gate.transitions.insert("true".into(), "high".into());
    gate.transitions.insert("false".into(), "low".into());

    let mut high = step("high", StepType::Automated, 2);
    high.config = json!({"action": "set_variables", "params": {"route": "high"}});
    high.transitions.insert("default".into(), "finish".into());

    let mut low = step("low", StepType::Automated, 3);
    low.config = json!({"action": "set_variables", "params": {"route": "low"}});
    low.transitions.insert("default".into(), "finish".into());

    WorkflowDefinition::new_draft(
        "deal-routing",
        TriggerConfig::manual(),
        vec![start, gate, high, low, end_step("finish", 4)],
    )
}

#[tokio::test]
async fn conditional_routes_high_amount() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, conditional_definition()).await;

    let instance = engine
        .start_workflow(
            StartWorkflowRequest::new(definition.id)
                .with_variables(vars(&[("amount", json!(1500))])),
        )
        .await
        .unwrap();
    drain(&engine).await;

    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    assert_eq!(detail.instance.status, InstanceStatus::Completed);
    assert_eq!(detail.instance.variables["route"], json!("high"));
    assert_eq!(detail.progress.percent, 100);
    assert_eq!(detail.steps.len(), 5);
    assert!(detail
        .events
        .iter()
        .any(|e| e.event_type == EventType::Completed));
    // The low branch never ran.
    assert!(!detail
        .events
        .iter()
        .any(|e| e.step_key.as_deref() == Some("low")));
}

#[tokio::test]
async fn conditional_routes_low_amount() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, conditional_definition()).await;

    let instance = engine
        .start_workflow(
            StartWorkflowRequest::new(definition.id)
                .with_variables(vars(&[("amount", json!(250))])),
        )
        .await
        .unwrap();
    drain(&engine).await;

    let stored = engine.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Completed);
    assert_eq!(stored.variables["route"], json!("low"));
}

fn approval_definition() -> WorkflowDefinition {
    let mut approve = step("approve", StepType::UserAction, 0);
    approve.is_start = true;
    approve.config = json!({
        "title": "Approve discount for {{ customer }}",
        "assignment": {"kind": "role", "target": "sales_manager"},
        "due_in_minutes": 120
    });
    approve.transitions.insert("Approve".into(), "finish".into());
    approve.transitions.insert("Reject".into(), "rejected".into());

    let mut rejected = end_step("rejected", 1);
    rejected.config = json!({"outcome": "rejected"});

    WorkflowDefinition::new_draft(
        "discount-approval",
        TriggerConfig::manual(),
        vec![approve, rejected, end_step("finish", 2)],
    )
}

#[tokio::test]
async fn user_task_blocks_then_resumes_on_completion() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, approval_definition()).await;

    let instance = engine
        .start_workflow(
            StartWorkflowRequest::new(definition.id)
                .with_variables(vars(&[("customer", json!("Acme"))])),
        )
        .await
        .unwrap();
    drain(&engine).await;

    let stored = engine.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::WaitingForTask);

    // A step parked on a task is not completed yet.
    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    assert!(!detail.events.iter().any(|e| {
        e.event_type == EventType::StepCompleted && e.step_key.as_deref() == Some("approve")
    }));

    let worklist = engine
        .list_open_tasks(AssignmentKind::Role, "sales_manager")
        .await
        .unwrap();
    assert_eq!(worklist.len(), 1);
    let task = &worklist[0];
    assert_eq!(task.title, "Approve discount for Acme");
    assert!(task.due_at.is_some());

    // A stray queued job while waiting is a no-op, not a second task.
    engine.process_workflow(instance.id).await.unwrap();
    drain(&engine).await;
    assert_eq!(
        engine
            .list_open_tasks(AssignmentKind::Role, "sales_manager")
            .await
            .unwrap()
            .len(),
        1
    );

    engine.claim_task(task.id, "mgr-7").await.unwrap();
    engine
        .complete_task(
            task.id,
            CompleteTaskRequest {
                action: "Approve".into(),
                user_id: "mgr-7".into(),
                comments: Some("looks good".into()),
                form_data: Some(json!({"approved_amount": 900})),
            },
        )
        .await
        .unwrap();
    drain(&engine).await;

    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    assert_eq!(detail.instance.status, InstanceStatus::Completed);
    // Form data merged into the bag.
    assert_eq!(detail.instance.variables["approved_amount"], json!(900));
    assert!(detail
        .events
        .iter()
        .any(|e| e.event_type == EventType::TaskCompleted));

    // The step completed exactly once, at task completion, and the trail
    // records entering the transition target.
    let approve_completions = detail
        .events
        .iter()
        .filter(|e| {
            e.event_type == EventType::StepCompleted && e.step_key.as_deref() == Some("approve")
        })
        .count();
    assert_eq!(approve_completions, 1);
    assert!(detail.events.iter().any(|e| {
        e.event_type == EventType::StepEntered && e.step_key.as_deref() == Some("finish")
    }));
}

#[tokio::test]
async fn invalid_task_action_is_rejected() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, approval_definition()).await;

    let instance = engine
        .start_workflow(StartWorkflowRequest::new(definition.id))
        .await
        .unwrap();
    drain(&engine).await;

    let task = engine
        .list_tasks_for_instance(instance.id)
        .await
        .unwrap()
        .remove(0);
    let err = engine
        .complete_task(
            task.id,
            CompleteTaskRequest {
                action: "Escalate".into(),
                user_id: "mgr-7".into(),
                comments: None,
                form_data: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Still open, still blocking.
    let stored = engine.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::WaitingForTask);
}

/// Failing step with max_attempts 3 and zero backoff.
fn failing_definition() -> WorkflowDefinition {
    let mut broken = step("broken", StepType::Condition, 0);
    broken.is_start = true;
    broken.config = json!({"expression": "amount >"});
    broken.transitions.insert("true".into(), "finish".into());
    broken.transitions.insert("false".into(), "finish".into());
    broken.retry = RetrySpec {
        max_attempts: 3,
        base_delay_secs: 0,
        max_delay_secs: 0,
    };

    WorkflowDefinition::new_draft(
        "broken-flow",
        TriggerConfig::manual(),
        vec![broken, end_step("finish", 1)],
    )
}

#[tokio::test]
async fn step_failure_exhausts_retries_then_fails_instance() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, failing_definition()).await;

    let instance = engine
        .start_workflow(
            StartWorkflowRequest::new(definition.id)
                .with_variables(vars(&[("amount", json!(5))])),
        )
        .await
        .unwrap();
    drain(&engine).await;

    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    assert_eq!(detail.instance.status, InstanceStatus::Failed);
    assert!(detail.instance.error_message.is_some());
    // Failed instances keep their step for retry.
    assert_eq!(detail.instance.current_step_key.as_deref(), Some("broken"));

    let failures: Vec<_> = detail
        .events
        .iter()
        .filter(|e| e.event_type == EventType::StepFailed)
        .collect();
    assert_eq!(failures.len(), 3);
}

#[tokio::test]
async fn manual_retry_reenters_failed_step_once() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, failing_definition()).await;

    let instance = engine
        .start_workflow(StartWorkflowRequest::new(definition.id))
        .await
        .unwrap();
    drain(&engine).await;
    assert_eq!(
        engine.get_instance(instance.id).await.unwrap().status,
        InstanceStatus::Failed
    );

    engine.retry_workflow(instance.id, Some("admin")).await.unwrap();
    let stored = engine.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Running);
    drain(&engine).await;

    // Attempt counter carried over: one more try, then failed again.
    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    assert_eq!(detail.instance.status, InstanceStatus::Failed);
    let failures = detail
        .events
        .iter()
        .filter(|e| e.event_type == EventType::StepFailed)
        .count();
    assert_eq!(failures, 4);
}

#[tokio::test]
async fn cancel_turns_queued_jobs_into_noops() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, conditional_definition()).await;

    // Start queues a job; cancel before any worker runs.
    let instance = engine
        .start_workflow(StartWorkflowRequest::new(definition.id))
        .await
        .unwrap();
    engine
        .cancel_workflow(instance.id, Some("admin"), Some("deal lost"))
        .await
        .unwrap();
    drain(&engine).await;

    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    assert_eq!(detail.instance.status, InstanceStatus::Cancelled);
    // No step ever executed.
    assert!(!detail
        .events
        .iter()
        .any(|e| e.event_type == EventType::StepCompleted));
    let cancelled = detail
        .events
        .iter()
        .find(|e| e.event_type == EventType::Cancelled)
        .unwrap();
    assert_eq!(cancelled.message.as_deref(), Some("deal lost"));
}

#[tokio::test]
async fn cancel_closes_open_tasks() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, approval_definition()).await;

    let instance = engine
        .start_workflow(StartWorkflowRequest::new(definition.id))
        .await
        .unwrap();
    drain(&engine).await;
    assert_eq!(
        engine
            .list_open_tasks(AssignmentKind::Role, "sales_manager")
            .await
            .unwrap()
            .len(),
        1
    );

    engine.cancel_workflow(instance.id, None, None).await.unwrap();
    assert!(engine
        .list_open_tasks(AssignmentKind::Role, "sales_manager")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn pause_and_resume_waiting_instance() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, approval_definition()).await;

    let instance = engine
        .start_workflow(StartWorkflowRequest::new(definition.id))
        .await
        .unwrap();
    drain(&engine).await;

    engine.pause_workflow(instance.id, Some("admin")).await.unwrap();
    let stored = engine.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Suspended);

    let task = engine
        .list_tasks_for_instance(instance.id)
        .await
        .unwrap()
        .remove(0);
    // Suspended instances reject task completion.
    let err = engine
        .complete_task(
            task.id,
            CompleteTaskRequest {
                action: "Approve".into(),
                user_id: "mgr-7".into(),
                comments: None,
                form_data: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotRunnable(_)));

    // Resume lands back in WaitingForTask because the task is still open.
    engine.resume_workflow(instance.id, Some("admin")).await.unwrap();
    let stored = engine.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::WaitingForTask);
}

#[tokio::test]
async fn delay_step_parks_and_resumes() {
    let mut wait = step("wait", StepType::Delay, 0);
    wait.is_start = true;
    wait.config = json!({"duration_secs": 0});
    wait.transitions.insert("default".into(), "finish".into());
    let definition = WorkflowDefinition::new_draft(
        "delayed",
        TriggerConfig::manual(),
        vec![wait, end_step("finish", 1)],
    );

    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, definition).await;
    let instance = engine
        .start_workflow(StartWorkflowRequest::new(definition.id))
        .await
        .unwrap();
    drain(&engine).await;

    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    assert_eq!(detail.instance.status, InstanceStatus::Completed);

    // The delay step completes once, when the resume fires.
    let wait_completions = detail
        .events
        .iter()
        .filter(|e| {
            e.event_type == EventType::StepCompleted && e.step_key.as_deref() == Some("wait")
        })
        .count();
    assert_eq!(wait_completions, 1);
}

#[tokio::test]
async fn process_workflow_is_a_noop_on_terminal_instances() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, conditional_definition()).await;

    let instance = engine
        .start_workflow(
            StartWorkflowRequest::new(definition.id)
                .with_variables(vars(&[("amount", json!(50))])),
        )
        .await
        .unwrap();
    drain(&engine).await;

    let nudged = engine.process_workflow(instance.id).await.unwrap();
    assert_eq!(nudged.status, InstanceStatus::Completed);
    drain(&engine).await;

    // No new step ran.
    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    let completions = detail
        .events
        .iter()
        .filter(|e| e.event_type == EventType::Completed)
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn parallel_branches_join_before_continuing() {
    let mut fork = step("fork", StepType::Parallel, 0);
    fork.is_start = true;
    fork.config = json!({
        "branches": ["credit", "legal"],
        "join_step": "merge"
    });

    let mut credit = step("credit", StepType::Automated, 1);
    credit.config = json!({"action": "set_variables", "params": {"credit_ok": true}});
    credit.transitions.insert("default".into(), "merge".into());

    let mut legal = step("legal", StepType::Automated, 2);
    legal.config = json!({"action": "set_variables", "params": {"legal_ok": true}});
    legal.transitions.insert("default".into(), "merge".into());

    let mut merge = step("merge", StepType::Automated, 3);
    merge.config = json!({"action": "noop"});
    merge.transitions.insert("default".into(), "finish".into());

    let definition = WorkflowDefinition::new_draft(
        "dual-review",
        TriggerConfig::manual(),
        vec![fork, credit, legal, merge, end_step("finish", 4)],
    );

    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, definition).await;
    let instance = engine
        .start_workflow(StartWorkflowRequest::new(definition.id))
        .await
        .unwrap();
    drain(&engine).await;

    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    assert_eq!(detail.instance.status, InstanceStatus::Completed);
    assert_eq!(detail.instance.variables["credit_ok"], json!(true));
    assert_eq!(detail.instance.variables["legal_ok"], json!(true));

    // The join step ran exactly once despite two arrivals.
    let merge_runs = detail
        .events
        .iter()
        .filter(|e| {
            e.event_type == EventType::StepCompleted && e.step_key.as_deref() == Some("merge")
        })
        .count();
    assert_eq!(merge_runs, 1);
}

/// Branch jobs racing on the instance row must not lose join arrivals:
/// a lost swap re-queues the branch job until its arrival lands.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_branch_arrivals_all_reach_the_join() {
    use std::sync::Arc;

    let branch_count: usize = 8;
    let branch_keys: Vec<String> = (0..branch_count).map(|i| format!("check_{}", i)).collect();

    let mut fork = step("fork", StepType::Parallel, 0);
    fork.is_start = true;
    fork.config = json!({"branches": branch_keys.clone(), "join_step": "merge"});

    let mut steps = vec![fork];
    for (i, key) in branch_keys.iter().enumerate() {
        let mut branch = step(key, StepType::Automated, (i + 1) as u32);
        let mut params = Map::new();
        params.insert(key.clone(), json!(true));
        branch.config = json!({"action": "set_variables", "params": params});
        branch.transitions.insert("default".into(), "merge".into());
        steps.push(branch);
    }
    let mut merge = step("merge", StepType::Automated, (branch_count + 1) as u32);
    merge.config = json!({"action": "noop"});
    merge.transitions.insert("default".into(), "finish".into());
    steps.push(merge);
    steps.push(end_step("finish", (branch_count + 2) as u32));

    let engine = Arc::new(WorkflowEngine::in_memory());
    let definition = publish(
        &engine,
        WorkflowDefinition::new_draft("many-checks", TriggerConfig::manual(), steps),
    )
    .await;
    let instance = engine
        .start_workflow(StartWorkflowRequest::new(definition.id))
        .await
        .unwrap();

    // Run the start job: it enters the fork and fans out one job per branch.
    let queue = engine.job_queue();
    let start_job = queue.dequeue("setup").await.unwrap().unwrap();
    engine.process_job(&start_job).await;

    let branch_jobs = queue.dequeue_batch("racer", branch_count).await.unwrap();
    assert_eq!(branch_jobs.len(), branch_count);

    let barrier = Arc::new(tokio::sync::Barrier::new(branch_count));
    let mut handles = Vec::new();
    for job in branch_jobs {
        let engine = engine.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.process_job(&job).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Losers of the swap were re-queued; this picks them up.
    drain(&engine).await;

    let detail = engine.get_instance_detail(instance.id).await.unwrap();
    assert_eq!(
        detail.instance.status,
        InstanceStatus::Completed,
        "variables: {:?}",
        detail.instance.variables
    );
    for key in &branch_keys {
        assert_eq!(detail.instance.variables[key.as_str()], json!(true));
    }
    let merge_runs = detail
        .events
        .iter()
        .filter(|e| {
            e.event_type == EventType::StepCompleted && e.step_key.as_deref() == Some("merge")
        })
        .count();
    assert_eq!(merge_runs, 1);
}

#[tokio::test]
async fn sub_workflow_starts_child_instance() {
    let engine = WorkflowEngine::in_memory();

    let mut child_start = step("child_start", StepType::Automated, 0);
    child_start.is_start = true;
    child_start.config = json!({"action": "set_variables", "params": {"handled": true}});
    child_start
        .transitions
        .insert("default".into(), "child_end".into());
    let child_definition = publish(
        &engine,
        WorkflowDefinition::new_draft(
            "escalation",
            TriggerConfig::manual(),
            vec![child_start, end_step("child_end", 1)],
        ),
    )
    .await;

    let mut escalate = step("escalate", StepType::SubWorkflow, 0);
    escalate.is_start = true;
    escalate.config = json!({
        "definition_id": child_definition.id,
        "input": {"deal": "{{ deal }}"},
        "output_variable": "escalation_id"
    });
    escalate.transitions.insert("default".into(), "finish".into());
    let parent_definition = publish(
        &engine,
        WorkflowDefinition::new_draft(
            "parent",
            TriggerConfig::manual(),
            vec![escalate, end_step("finish", 1)],
        ),
    )
    .await;

    let parent = engine
        .start_workflow(
            StartWorkflowRequest::new(parent_definition.id)
                .with_variables(vars(&[("deal", json!("Acme renewal"))])),
        )
        .await
        .unwrap();
    drain(&engine).await;

    let stored = engine.get_instance(parent.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Completed);

    let child_id: Uuid = stored.variables["escalation_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let child = engine.get_instance(child_id).await.unwrap();
    assert_eq!(child.status, InstanceStatus::Completed);
    assert_eq!(child.parent_instance_id, Some(parent.id));
    assert_eq!(child.variables["deal"], json!("Acme renewal"));
    assert_eq!(child.variables["handled"], json!(true));
}

#[tokio::test]
async fn entity_event_trigger_starts_matching_definitions() {
    let engine = WorkflowEngine::in_memory();

    let mut matching = conditional_definition();
    matching.trigger = TriggerConfig::entity_event("opportunity", "stage_changed");
    let matching = publish(&engine, matching).await;

    let mut other = conditional_definition();
    other.trigger = TriggerConfig::entity_event("opportunity", "created");
    publish(&engine, other).await;

    let started = engine
        .trigger_workflows(
            "opportunity",
            "stage_changed",
            "opp-42",
            vars(&[("amount", json!(2000))]),
        )
        .await
        .unwrap();
    assert_eq!(started.len(), 1);

    let instance = engine.get_instance(started[0]).await.unwrap();
    assert_eq!(instance.definition_id, matching.id);
    assert_eq!(instance.entity_id.as_deref(), Some("opp-42"));

    drain(&engine).await;
    assert_eq!(
        engine.get_instance(started[0]).await.unwrap().status,
        InstanceStatus::Completed
    );
}

#[tokio::test]
async fn unpublished_definition_cannot_start() {
    let engine = WorkflowEngine::in_memory();
    let draft = engine
        .create_definition(conditional_definition())
        .await
        .unwrap();

    // The definition exists, so the failure is about executability.
    let err = engine
        .start_workflow(StartWorkflowRequest::new(draft.id))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DefinitionNotExecutable(_)));

    // Pinning the draft version explicitly hits the same check.
    let mut request = StartWorkflowRequest::new(draft.id);
    request.definition_version = Some(draft.version);
    let err = engine.start_workflow(request).await.unwrap_err();
    assert!(matches!(err, EngineError::DefinitionNotExecutable(_)));

    // An unknown id is a genuine not-found.
    let err = engine
        .start_workflow(StartWorkflowRequest::new(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DefinitionNotFound(_)));
}

#[tokio::test]
async fn publish_rejects_invalid_definition() {
    let engine = WorkflowEngine::in_memory();
    let mut definition = conditional_definition();
    definition.steps[0].is_start = false;
    let draft = engine.create_definition(definition).await.unwrap();

    let err = engine
        .publish_definition(draft.id, draft.version)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn publish_rejects_malformed_step_config() {
    let engine = WorkflowEngine::in_memory();
    let mut definition = conditional_definition();
    // Empty condition expression fails config validation at publish.
    definition.steps[1].config = json!({"expression": "   "});
    let draft = engine.create_definition(definition).await.unwrap();

    let err = engine
        .publish_definition(draft.id, draft.version)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let report = engine.validate_definition(
        &engine
            .get_definition(draft.id, draft.version)
            .await
            .unwrap(),
    );
    assert!(!report.is_valid);
    assert!(report.errors.iter().any(|e| e.contains("gate")));
}

#[tokio::test]
async fn new_version_leaves_running_instances_pinned() {
    let engine = WorkflowEngine::in_memory();
    let v1 = publish(&engine, approval_definition()).await;

    let instance = engine
        .start_workflow(StartWorkflowRequest::new(v1.id))
        .await
        .unwrap();
    drain(&engine).await;

    // Publish v2 while the instance waits on its task.
    let v2 = engine.new_definition_version(v1.id).await.unwrap();
    engine.publish_definition(v2.id, v2.version).await.unwrap();
    engine.deprecate_definition(v1.id, 1).await.unwrap();

    let stored = engine.get_instance(instance.id).await.unwrap();
    assert_eq!(stored.definition_version, 1);

    // The pinned v1 keeps executing to completion.
    let task = engine
        .list_tasks_for_instance(instance.id)
        .await
        .unwrap()
        .remove(0);
    engine
        .complete_task(
            task.id,
            CompleteTaskRequest {
                action: "Approve".into(),
                user_id: "mgr-7".into(),
                comments: None,
                form_data: None,
            },
        )
        .await
        .unwrap();
    drain(&engine).await;
    assert_eq!(
        engine.get_instance(instance.id).await.unwrap().status,
        InstanceStatus::Completed
    );

    // New starts pick up v2.
    let fresh = engine
        .start_workflow(StartWorkflowRequest::new(v1.id))
        .await
        .unwrap();
    assert_eq!(fresh.definition_version, 2);
}

#[tokio::test]
async fn stuck_job_recovery_allows_redelivery() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, conditional_definition()).await;
    engine
        .start_workflow(
            StartWorkflowRequest::new(definition.id)
                .with_variables(vars(&[("amount", json!(1))])),
        )
        .await
        .unwrap();

    // A worker leases the first job and dies.
    let queue = engine.job_queue();
    let abandoned = queue.dequeue("dead-worker").await.unwrap().unwrap();

    assert_eq!(
        engine
            .recover_stuck_jobs(std::time::Duration::from_secs(0))
            .await
            .unwrap(),
        1
    );
    let redelivered = queue.dequeue("live-worker").await.unwrap().unwrap();
    assert_eq!(redelivered.id, abandoned.id);

    engine.process_job(&redelivered).await;
    drain(&engine).await;
}

#[tokio::test]
async fn reassigned_task_moves_worklists() {
    let engine = WorkflowEngine::in_memory();
    let definition = publish(&engine, approval_definition()).await;
    engine
        .start_workflow(StartWorkflowRequest::new(definition.id))
        .await
        .unwrap();
    drain(&engine).await;

    let task = engine
        .list_open_tasks(AssignmentKind::Role, "sales_manager")
        .await
        .unwrap()
        .remove(0);
    engine
        .reassign_task(
            task.id,
            flowplane::engine::ReassignTaskRequest {
                assignment: TaskAssignment::user("u-99"),
                user_id: "admin".into(),
                reason: Some("out of office".into()),
            },
        )
        .await
        .unwrap();

    assert!(engine
        .list_open_tasks(AssignmentKind::Role, "sales_manager")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        engine
            .list_open_tasks(AssignmentKind::User, "u-99")
            .await
            .unwrap()
            .len(),
        1
    );
}
