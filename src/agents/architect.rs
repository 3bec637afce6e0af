//! Architect role: spec review, story generation, dispatch to coders,
//! and monitoring of in-flight work, escalating to a human when a
//! tool-loop exhausts its iteration budget.

use crate::capabilities::{ChatChannel, CreatePrRequest, HostApi, LlmClient};
use crate::error::StateMachineError;
use crate::limiter::Limiter;
use crate::message::{AgentId, AgentMsg, ApprovalType, MessageType, Payload, ReviewOutcome};
use crate::queue::{QueuedStory, StoryQueue, StoryStatus, StoryType};
use crate::state_machine::{BaseStateMachine, Effect, RoleHandlers, StepInput, DONE, ERROR, WAITING};
use crate::tool_loop::{ToolLoopError, ToolLoopHarness, ToolRegistry};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

pub const SETUP: &str = "SETUP";
pub const REQUEST: &str = "REQUEST";
pub const DISPATCHING: &str = "DISPATCHING";
pub const MONITORING: &str = "MONITORING";
pub const ESCALATED: &str = "ESCALATED";

pub fn transition_table() -> crate::state_machine::TransitionTable {
    crate::state_machine::TransitionTable::builder()
        .edges(WAITING, &[SETUP])
        .edges(SETUP, &[REQUEST, ERROR])
        .edges(REQUEST, &[DISPATCHING, REQUEST, ESCALATED, ERROR])
        .edges(DISPATCHING, &[MONITORING, ERROR])
        .edges(MONITORING, &[DISPATCHING, REQUEST, MONITORING, ESCALATED, DONE, ERROR])
        .edges(ESCALATED, &[REQUEST, ERROR])
        .build()
}

/// Terminal tools for the spec-review and story-dispatch tool-loops.
const TERMINAL_TOOLS: &[&str] = &["review_complete", "submit_reply", "submit_stories", "spec_feedback"];

pub struct ArchitectHandlers {
    pub llm: Arc<dyn LlmClient>,
    pub limiter: Arc<Limiter>,
    pub queue: Arc<StoryQueue>,
    pub model: String,
    pub max_iterations: u32,
    /// Used only on `ESCALATED` entry to post to the human escalation
    /// channel. `None` disables escalation posting, useful for
    /// embedding the core without a chat surface wired up.
    pub chat: Option<Arc<dyn ChatChannel>>,
    /// Used only on an approved code review to open and merge the story's
    /// PR. `None` disables the merge handoff, leaving the story
    /// `in_progress` until something external moves it to `done`.
    pub host: Option<Arc<dyn HostApi>>,
}

#[async_trait]
impl RoleHandlers for ArchitectHandlers {
    async fn handle(&mut self, base: &BaseStateMachine, input: StepInput) -> Result<(String, Vec<Effect>), StateMachineError> {
        let current = base.get_current_state();

        match input {
            StepInput::Shutdown => return Ok((DONE.to_string(), vec![])),
            StepInput::Timer if current == DISPATCHING => return self.dispatch_next(base).await,
            StepInput::Timer => return Ok((current, vec![])),
            StepInput::Message(msg) => self.handle_message(base, &current, msg).await,
        }
    }
}

impl ArchitectHandlers {
    fn harness(&self) -> ToolLoopHarness {
        ToolLoopHarness::new(
            self.llm.clone(),
            self.limiter.clone(),
            ToolRegistry::new(),
            TERMINAL_TOOLS.iter().map(|s| s.to_string()).collect(),
            self.max_iterations,
            1000,
        )
    }

    async fn handle_message(
        &mut self,
        base: &BaseStateMachine,
        current: &str,
        msg: AgentMsg,
    ) -> Result<(String, Vec<Effect>), StateMachineError> {
        match (current, msg.msg_type) {
            (WAITING, MessageType::Spec) => {
                base.mutate_state_data(|d| {
                    d.insert("spec".to_string(), serde_json::Value::String(msg.payload.content().unwrap_or_default().to_string()));
                });
                Ok((SETUP.to_string(), vec![]))
            }
            (SETUP, _) => Ok((REQUEST.to_string(), vec![])),
            (REQUEST, _) => self.run_spec_review(base).await,
            (MONITORING, MessageType::Question) => {
                base.mutate_state_data(|d| {
                    let table = d.entry("pending_questions").or_insert_with(|| serde_json::Value::Object(Default::default()));
                    if let serde_json::Value::Object(map) = table {
                        map.insert(msg.id.clone(), serde_json::to_value(&msg.payload.0).unwrap_or_default());
                    }
                });
                Ok((MONITORING.to_string(), vec![]))
            }
            (MONITORING, MessageType::Result) => {
                let story_id = msg.payload.story_id().unwrap_or_default().to_string();
                if msg.payload.0.get("escalation").and_then(|v| v.as_bool()).unwrap_or(false) {
                    if let Some(chat) = &self.chat {
                        if let Err(e) = chat
                            .post(
                                "architect",
                                &format!("story {story_id} escalated: {}", msg.payload.content().unwrap_or_default()),
                                "escalation",
                            )
                            .await
                        {
                            warn!(error = %e, "failed to post escalation message");
                        }
                    }
                    return Ok((ESCALATED.to_string(), vec![Effect::UpdateStoryStatus { story_id, status: StoryStatus::AwaitHumanFeedback }]));
                }
                let effect = Effect::UpdateStoryStatus { story_id: story_id.clone(), status: StoryStatus::WaitingReview };
                base.mutate_state_data(|d| {
                    let table = d.entry("pending_reviews").or_insert_with(|| serde_json::Value::Object(Default::default()));
                    if let serde_json::Value::Object(map) = table {
                        map.insert(story_id, serde_json::to_value(&msg.payload.0).unwrap_or_default());
                    }
                });
                Ok((MONITORING.to_string(), vec![effect]))
            }
            (MONITORING, MessageType::Request) => self.handle_approval_request(base, msg).await,
            (MONITORING, MessageType::Response) => {
                let story_id = msg.payload.story_id().unwrap_or_default().to_string();
                match (msg.payload.status(), msg.payload.approval_type()) {
                    (Some(ReviewOutcome::Approved), Some(ApprovalType::Completion)) if !story_id.is_empty() => {
                        Ok((MONITORING.to_string(), vec![Effect::UpdateStoryStatus { story_id, status: StoryStatus::Completed }]))
                    }
                    _ => Ok((MONITORING.to_string(), vec![])),
                }
            }
            (ESCALATED, MessageType::Answer) => Ok((REQUEST.to_string(), vec![])),
            (state, msg_type) => Err(StateMachineError::InvalidTransition { from: state.to_string(), to: format!("{:?}", msg_type) }),
        }
    }

    /// Runs the spec-review tool-loop to its terminal tool and decides the
    /// next state from the outcome.
    async fn run_spec_review(&self, base: &BaseStateMachine) -> Result<(String, Vec<Effect>), StateMachineError> {
        let spec = base.get_state_data().get("spec").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let messages = vec![crate::capabilities::ChatMessage::user(spec)];

        match self.harness().run(&self.model, vec![], messages).await {
            Ok(outcome) if outcome.terminal_tool == "submit_stories" => {
                let stories = self.seed_stories(&outcome.arguments);
                Ok((DISPATCHING.to_string(), stories.into_iter().map(|s| Effect::PersistRecord { kind: "story_seeded".to_string(), payload: serde_json::to_value(&s.id).unwrap_or_default() }).collect()))
            }
            Ok(outcome) => {
                base.mutate_state_data(|d| {
                    d.insert("last_spec_feedback".to_string(), outcome.arguments.clone());
                });
                Ok((DISPATCHING.to_string(), vec![]))
            }
            Err(ToolLoopError::BudgetExceeded) => {
                if let Some(chat) = &self.chat {
                    if let Err(e) = chat.post("architect", "spec review exhausted its iteration budget and needs a human decision", "escalation").await {
                        warn!(error = %e, "failed to post escalation message");
                    }
                }
                Ok((ESCALATED.to_string(), vec![]))
            }
            Err(e) => {
                warn!(error = %e, "spec review tool-loop failed");
                Err(StateMachineError::InvalidTransition { from: REQUEST.to_string(), to: ERROR.to_string() })
            }
        }
    }

    /// Runs the plan/code/completion/budget-review tool-loop against a
    /// Coder's approval request and replies with a RESPONSE carrying the
    /// verdict, the exit path `AWAIT_PLAN_REVIEW`/`AWAIT_CODE_REVIEW`
    /// depend on. An approved code review additionally triggers the merge
    /// handoff.
    async fn handle_approval_request(&self, base: &BaseStateMachine, msg: AgentMsg) -> Result<(String, Vec<Effect>), StateMachineError> {
        let story_id = msg.payload.story_id().unwrap_or_default().to_string();
        let approval_type = msg.payload.approval_type();
        let content = msg.payload.code_content().or_else(|| msg.payload.content()).unwrap_or_default().to_string();
        let messages = vec![crate::capabilities::ChatMessage::user(content)];

        base.mutate_state_data(|d| {
            let table = d.entry("pending_approvals").or_insert_with(|| serde_json::Value::Object(Default::default()));
            if let serde_json::Value::Object(map) = table {
                map.insert(msg.id.clone(), serde_json::to_value(&msg.payload.0).unwrap_or_default());
            }
        });

        let (outcome, feedback) = match self.harness().run(&self.model, vec![], messages).await {
            Ok(o) if o.terminal_tool == "review_complete" => {
                let approved = o.arguments.get("approved").and_then(|v| v.as_bool()).unwrap_or(false);
                let feedback = o.arguments.get("feedback").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                (if approved { ReviewOutcome::Approved } else { ReviewOutcome::NeedsChanges }, feedback)
            }
            Ok(o) => (ReviewOutcome::NeedsChanges, o.arguments.to_string()),
            Err(ToolLoopError::BudgetExceeded) => {
                if let Some(chat) = &self.chat {
                    if let Err(e) = chat
                        .post(
                            "architect",
                            &format!("review of story {story_id} exhausted its iteration budget and needs a human decision"),
                            "escalation",
                        )
                        .await
                    {
                        warn!(error = %e, "failed to post escalation message");
                    }
                }
                (ReviewOutcome::NeedsChanges, "review budget exhausted, escalated to a human".to_string())
            }
            Err(e) => {
                warn!(error = %e, "approval review tool-loop failed");
                (ReviewOutcome::NeedsChanges, format!("review failed: {e}"))
            }
        };

        let status_str = match outcome {
            ReviewOutcome::Approved => "APPROVED",
            ReviewOutcome::NeedsChanges => "NEEDS_CHANGES",
            ReviewOutcome::Rejected => "REJECTED",
        };
        let mut response_payload = Payload::new().with("status", status_str).with("story_id", story_id.clone()).with("feedback", feedback);
        if let Some(at) = approval_type {
            let type_str = match at {
                ApprovalType::Plan => "plan",
                ApprovalType::Code => "code",
                ApprovalType::Completion => "completion",
                ApprovalType::BudgetReview => "budget_review",
                ApprovalType::Spec => "spec",
            };
            response_payload = response_payload.with("approval_type", type_str);
        }
        let mut effects = vec![Effect::DispatchMessage(msg.reply_to(MessageType::Response, AgentId::from("architect"), response_payload))];

        if outcome == ReviewOutcome::Approved && approval_type == Some(ApprovalType::Code) && !story_id.is_empty() {
            effects.extend(self.handle_code_merge(&story_id).await);
        }

        Ok((MONITORING.to_string(), effects))
    }

    /// The merge handoff for an approved code review: signal the "merge"
    /// chat channel, then, when a host adapter is configured, open and
    /// merge the story's PR before returning the `done` status effect.
    /// The story stays `in_progress` until the merge actually completes.
    async fn handle_code_merge(&self, story_id: &str) -> Vec<Effect> {
        if let Some(chat) = &self.chat {
            if let Err(e) = chat.post("architect", &format!("story {story_id} approved, queued for merge"), "merge").await {
                warn!(error = %e, "failed to post merge-channel message");
            }
        }
        let Some(host) = &self.host else {
            return vec![];
        };
        let branch = format!("story/{story_id}");
        let pr = match host
            .create_pr(CreatePrRequest { branch: branch.clone(), base: "main".to_string(), title: format!("story {story_id}"), body: String::new() })
            .await
        {
            Ok(pr) => pr,
            Err(e) => {
                warn!(error = %e, story_id, "failed to open merge PR");
                return vec![];
            }
        };
        match host.merge_pr(pr.number).await {
            Ok(result) if result.merged => vec![Effect::UpdateStoryStatus { story_id: story_id.to_string(), status: StoryStatus::Done }],
            Ok(result) => {
                warn!(story_id, conflicts = ?result.conflicts, "merge did not complete, story stays in progress");
                vec![]
            }
            Err(e) => {
                warn!(error = %e, story_id, "merge attempt failed, story stays in progress");
                vec![]
            }
        }
    }

    fn seed_stories(&self, args: &serde_json::Value) -> Vec<QueuedStory> {
        let mut seeded = Vec::new();
        if let Some(stories) = args.get("stories").and_then(|v| v.as_array()) {
            for s in stories {
                let id = s.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let title = s.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let content = s.get("content").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let points = s.get("estimated_points").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
                let deps: BTreeSet<String> = s
                    .get("depends_on")
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|d| d.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                let story = QueuedStory::new(id, title, content, StoryType::App, deps, points);
                if self.queue.add_story(story.clone()).is_ok() {
                    seeded.push(story);
                }
            }
        }
        seeded
    }

    /// DISPATCHING: pull the next ready story and hand it to a coder,
    /// marking it `in_progress`.
    async fn dispatch_next(&self, _base: &BaseStateMachine) -> Result<(String, Vec<Effect>), StateMachineError> {
        match self.queue.next_ready_story() {
            Some(story) => {
                let msg = AgentMsg::new(
                    MessageType::Request,
                    AgentId::from("architect"),
                    AgentId::from("coder"),
                    Payload::new().with("story_id", story.id.clone()).with("content", story.content.clone()),
                );
                Ok((
                    MONITORING.to_string(),
                    vec![
                        Effect::UpdateStoryStatus { story_id: story.id.clone(), status: StoryStatus::InProgress },
                        Effect::DispatchMessage(msg),
                    ],
                ))
            }
            None => Ok((MONITORING.to_string(), vec![])),
        }
    }
}
