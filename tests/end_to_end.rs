//! End-to-end scenarios spanning the Dispatcher, Queue, Limiter, and the
//! agent state machines together, complementing the per-module unit tests.

use maestro_core::agents::{self, coder::CoderHandlers, pm::PmHandlers};
use maestro_core::capabilities::{ChatMessage, CompletionChunk, CompletionRequest, CompletionResponse, LlmClient, StopReason, ToolCall};
use maestro_core::config::ModelLimits;
use maestro_core::dispatcher::Dispatcher;
use maestro_core::limiter::Limiter;
use maestro_core::message::{AgentId, AgentMsg, AgentType, MessageType, Payload};
use maestro_core::persistence::InMemoryPersistence;
use maestro_core::queue::{ExternalApi, QueuedStory, StoryQueue, StoryType};
use maestro_core::state_machine::{BaseStateMachine, EffectsRuntime, StateMachine, StepInput};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

struct NeverTerminalLlm;

#[async_trait::async_trait]
impl LlmClient for NeverTerminalLlm {
    async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        Ok(CompletionResponse {
            content: "still thinking".to_string(),
            tool_calls: vec![ToolCall { id: "1".to_string(), name: "read_file".to_string(), arguments: serde_json::json!({}) }],
            stop_reason: StopReason::ToolUse,
        })
    }
    async fn stream(&self, _req: CompletionRequest) -> anyhow::Result<tokio::sync::mpsc::Receiver<CompletionChunk>> {
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        Ok(rx)
    }
    fn model_name(&self) -> &str {
        "never-terminal"
    }
}

fn limiter_with(model: &str) -> Arc<Limiter> {
    let mut configs = HashMap::new();
    configs.insert(model.to_string(), ModelLimits { max_tpm: 1_000_000, daily_budget_usd: 1000.0, max_connections: 10, cpm_usd: 0.001 });
    Arc::new(Limiter::new(configs))
}

/// Scenario 8: a tool-loop with no terminal tool in its output exhausts its
/// iteration budget in exactly the configured number of LLM calls.
#[tokio::test]
async fn tool_loop_exhausts_budget_in_exactly_four_calls() {
    use maestro_core::tool_loop::{ToolLoopError, ToolLoopHarness, ToolRegistry};

    let harness = ToolLoopHarness::new(
        Arc::new(NeverTerminalLlm),
        limiter_with("never-terminal"),
        ToolRegistry::new(),
        vec!["submit_stories".to_string()],
        4,
        100,
    );
    let err = harness.run("never-terminal", vec![], vec![ChatMessage::user("go")]).await.unwrap_err();
    assert_eq!(err, ToolLoopError::BudgetExceeded);
}

/// Scenario 7: graceful stop with multiple attached agents drains every
/// mailbox and the dispatcher rejects further dispatch afterward.
#[tokio::test]
async fn shutdown_drains_multiple_agents() {
    let queue = Arc::new(StoryQueue::new());
    let api = Arc::new(ExternalApi::new(queue.clone()));
    let dispatcher = Arc::new(Dispatcher::new(api, 16));

    let pm = dispatcher.attach(AgentId::from("pm-1"), AgentType::Pm, "claude", "WAITING").await.unwrap();
    let arch = dispatcher.attach(AgentId::from("arch-1"), AgentType::Architect, "claude", "WAITING").await.unwrap();
    let coder = dispatcher.attach(AgentId::from("coder-1"), AgentType::Coder, "claude", "WAITING").await.unwrap();

    let persistence = Arc::new(InMemoryPersistence::new());
    let effects = Arc::new(EffectsRuntime::new(dispatcher.clone(), persistence, queue.clone()));

    let pm_sm = StateMachine::new(
        BaseStateMachine::new(AgentId::from("pm-1"), maestro_core::agents::pm::transition_table(), "WAITING"),
        PmHandlers { architect_id: AgentId::from("arch-1") },
    );
    let coder_sm = StateMachine::new(
        BaseStateMachine::new(AgentId::from("coder-1"), maestro_core::agents::coder::transition_table(), "WAITING"),
        CoderHandlers { architect_id: AgentId::from("arch-1") },
    );

    let d1 = dispatcher.clone();
    let e1 = effects.clone();
    let pm_task = tokio::spawn(agents::run(AgentId::from("pm-1"), pm_sm, pm.mailbox, e1, d1));
    let d2 = dispatcher.clone();
    let e2 = effects.clone();
    let coder_task = tokio::spawn(agents::run(AgentId::from("coder-1"), coder_sm, coder.mailbox, e2, d2));
    drop(arch.mailbox);

    dispatcher.stop(Duration::from_secs(2)).await;

    pm_task.await.unwrap();
    coder_task.await.unwrap();

    let msg = AgentMsg::new(MessageType::Spec, AgentId::from("user"), AgentId::from("pm-1"), Payload::new());
    assert!(dispatcher.dispatch_message(msg).await.is_err());
}

/// Scenario 3 + 4 combined at the integration level: a story becomes ready
/// only once its dependency completes, and a failed coder's story returns
/// to the ready set without anyone else holding it.
#[tokio::test]
async fn dependency_then_failure_recovery() {
    let queue = Arc::new(StoryQueue::new());
    queue.add_story(QueuedStory::new("001", "base", "c", StoryType::App, BTreeSet::new(), 1)).unwrap();
    queue.add_story(QueuedStory::new("002", "dependent", "c", StoryType::App, BTreeSet::from(["001".to_string()]), 1)).unwrap();

    assert_eq!(queue.get_ready_stories().into_iter().map(|s| s.id).collect::<Vec<_>>(), vec!["001".to_string()]);

    queue.update_story_status("001", maestro_core::queue::StoryStatus::InProgress).unwrap();
    let api = ExternalApi::new(queue.clone());
    let recovered = api.requeue_and_release("001").unwrap();
    assert_eq!(recovered.status, maestro_core::queue::StoryStatus::Pending);
    assert_eq!(queue.get_ready_stories().into_iter().map(|s| s.id).collect::<Vec<_>>(), vec!["001".to_string()]);

    queue.update_story_status("001", maestro_core::queue::StoryStatus::InProgress).unwrap();
    queue.update_story_status("001", maestro_core::queue::StoryStatus::Done).unwrap();
    assert_eq!(queue.get_ready_stories().into_iter().map(|s| s.id).collect::<Vec<_>>(), vec!["002".to_string()]);
}

/// Scenario 9: an invalid transition attempt on the Architect leaves the
/// live state unchanged and reports an error rather than panicking.
#[tokio::test]
async fn architect_invalid_transition_is_rejected() {
    use maestro_core::agents::architect;

    let base = BaseStateMachine::new(AgentId::from("arch-1"), architect::transition_table(), architect::DISPATCHING);
    let err = base.transition_to(architect::ESCALATED, Default::default()).await.unwrap_err();
    assert!(matches!(err, maestro_core::error::StateMachineError::InvalidTransition { .. }));
    assert_eq!(base.get_current_state(), architect::DISPATCHING);
}

#[allow(unused)]
async fn _step_noop(sm: &mut StateMachine<PmHandlers>) {
    let _ = sm.step(StepInput::Timer).await;
}
