//! Coder role: turns an assigned story into a plan, then code, cycling
//! through architect approvals. Escalation after three successive review
//! failures is tracked here and surfaced to the Architect as a flagged
//! RESULT message rather than a normal completed-work report.

use crate::error::StateMachineError;
use crate::message::{AgentId, AgentMsg, MessageType, Payload, ReviewOutcome};
use crate::state_machine::{BaseStateMachine, Effect, RoleHandlers, StepInput, DONE, ERROR, WAITING};
use async_trait::async_trait;

pub const PLANNING: &str = "PLANNING";
pub const AWAIT_PLAN_REVIEW: &str = "AWAIT_PLAN_REVIEW";
pub const CODING: &str = "CODING";
pub const TESTING: &str = "TESTING";
pub const AWAIT_CODE_REVIEW: &str = "AWAIT_CODE_REVIEW";

const MAX_SUCCESSIVE_FAILURES: u64 = 3;

pub fn transition_table() -> crate::state_machine::TransitionTable {
    crate::state_machine::TransitionTable::builder()
        .edges(WAITING, &[PLANNING])
        .edges(PLANNING, &[AWAIT_PLAN_REVIEW, ERROR])
        .edges(AWAIT_PLAN_REVIEW, &[CODING, PLANNING, ERROR])
        .edges(CODING, &[TESTING, ERROR])
        .edges(TESTING, &[AWAIT_CODE_REVIEW, CODING, ERROR])
        .edges(AWAIT_CODE_REVIEW, &[DONE, CODING, ERROR])
        .build()
}

pub struct CoderHandlers {
    pub architect_id: AgentId,
}

#[async_trait]
impl RoleHandlers for CoderHandlers {
    async fn handle(&mut self, base: &BaseStateMachine, input: StepInput) -> Result<(String, Vec<Effect>), StateMachineError> {
        let current = base.get_current_state();

        match input {
            StepInput::Shutdown => return Ok((DONE.to_string(), vec![])),
            StepInput::Timer => return Ok((current, vec![])),
            StepInput::Message(msg) => self.handle_message(base, &current, msg).await,
        }
    }
}

impl CoderHandlers {
    async fn handle_message(
        &mut self,
        base: &BaseStateMachine,
        current: &str,
        msg: AgentMsg,
    ) -> Result<(String, Vec<Effect>), StateMachineError> {
        match (current, msg.msg_type) {
            (WAITING, MessageType::Request) => {
                base.mutate_state_data(|d| {
                    d.insert("story_id".to_string(), serde_json::Value::String(msg.payload.story_id().unwrap_or_default().to_string()));
                    d.insert("plan_failures".to_string(), serde_json::json!(0));
                    d.insert("code_failures".to_string(), serde_json::json!(0));
                });
                Ok((PLANNING.to_string(), vec![]))
            }
            (PLANNING, MessageType::Result) => {
                let story_id = base.get_state_data().get("story_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let plan_msg = AgentMsg::new(
                    MessageType::Request,
                    AgentId::from("coder"),
                    self.architect_id.clone(),
                    Payload::new()
                        .with("request_type", "approval")
                        .with("approval_type", "plan")
                        .with("story_id", story_id)
                        .with("content", msg.payload.content().unwrap_or_default()),
                );
                Ok((AWAIT_PLAN_REVIEW.to_string(), vec![Effect::DispatchMessage(plan_msg)]))
            }
            (AWAIT_PLAN_REVIEW, MessageType::Response) => match msg.payload.status() {
                Some(ReviewOutcome::Approved) => {
                    base.mutate_state_data(|d| { d.insert("plan_failures".to_string(), serde_json::json!(0)); });
                    Ok((CODING.to_string(), vec![]))
                }
                _ => self.record_failure(base, "plan_failures", msg.payload.feedback(), PLANNING),
            },
            (CODING, MessageType::Result) => Ok((TESTING.to_string(), vec![])),
            (TESTING, MessageType::Result) => {
                let passed = msg.payload.0.get("passed").and_then(|v| v.as_bool()).unwrap_or(false);
                if passed {
                    let story_id = base.get_state_data().get("story_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let code_msg = AgentMsg::new(
                        MessageType::Request,
                        AgentId::from("coder"),
                        self.architect_id.clone(),
                        Payload::new()
                            .with("request_type", "approval")
                            .with("approval_type", "code")
                            .with("story_id", story_id)
                            .with("code_content", msg.payload.code_content().unwrap_or_default())
                            .with("code_path", msg.payload.code_path().unwrap_or_default()),
                    );
                    Ok((AWAIT_CODE_REVIEW.to_string(), vec![Effect::DispatchMessage(code_msg)]))
                } else {
                    Ok((CODING.to_string(), vec![]))
                }
            }
            (AWAIT_CODE_REVIEW, MessageType::Response) => match msg.payload.status() {
                Some(ReviewOutcome::Approved) => Ok((DONE.to_string(), vec![])),
                _ => self.record_failure(base, "code_failures", msg.payload.feedback(), CODING),
            },
            (state, msg_type) => Err(StateMachineError::InvalidTransition { from: state.to_string(), to: format!("{:?}", msg_type) }),
        }
    }

    /// Increments the relevant failure counter; on the third successive
    /// failure, emits an escalation RESULT to the Architect instead of
    /// simply looping back.
    fn record_failure(
        &self,
        base: &BaseStateMachine,
        counter_key: &str,
        feedback: Option<&str>,
        retry_state: &str,
    ) -> Result<(String, Vec<Effect>), StateMachineError> {
        let count = base.get_state_data().get(counter_key).and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        base.mutate_state_data(|d| {
            d.insert(counter_key.to_string(), serde_json::json!(count));
        });

        if count >= MAX_SUCCESSIVE_FAILURES {
            let story_id = base.get_state_data().get("story_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let escalation = AgentMsg::new(
                MessageType::Result,
                AgentId::from("coder"),
                self.architect_id.clone(),
                Payload::new()
                    .with("story_id", story_id)
                    .with("escalation", true)
                    .with("content", format!("escalating after {count} successive failures: {}", feedback.unwrap_or_default())),
            );
            return Ok((ERROR.to_string(), vec![Effect::DispatchMessage(escalation)]));
        }

        Ok((retry_state.to_string(), vec![]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StateMachine;

    fn handlers() -> CoderHandlers {
        CoderHandlers { architect_id: AgentId::from("architect") }
    }

    #[tokio::test]
    async fn three_successive_plan_failures_escalate_to_error() {
        let base = BaseStateMachine::new(AgentId::from("coder-1"), transition_table(), WAITING);
        let mut sm = StateMachine::new(base, handlers());

        let assign = AgentMsg::new(MessageType::Request, AgentId::from("architect"), AgentId::from("coder-1"), Payload::new().with("story_id", "001"));
        sm.step(StepInput::Message(assign)).await.unwrap();
        let plan_done = AgentMsg::new(MessageType::Result, AgentId::from("coder-1"), AgentId::from("coder-1"), Payload::new().with("content", "plan text"));
        sm.step(StepInput::Message(plan_done)).await.unwrap();
        assert_eq!(sm.base.get_current_state(), AWAIT_PLAN_REVIEW);

        for _ in 0..2 {
            let rejected = AgentMsg::new(MessageType::Response, AgentId::from("architect"), AgentId::from("coder-1"), Payload::new().with("status", "NEEDS_CHANGES"));
            sm.step(StepInput::Message(rejected)).await.unwrap();
            assert_eq!(sm.base.get_current_state(), PLANNING);
            let replan = AgentMsg::new(MessageType::Result, AgentId::from("coder-1"), AgentId::from("coder-1"), Payload::new().with("content", "revised"));
            sm.step(StepInput::Message(replan)).await.unwrap();
            assert_eq!(sm.base.get_current_state(), AWAIT_PLAN_REVIEW);
        }

        let rejected_again = AgentMsg::new(MessageType::Response, AgentId::from("architect"), AgentId::from("coder-1"), Payload::new().with("status", "NEEDS_CHANGES"));
        sm.step(StepInput::Message(rejected_again)).await.unwrap();
        assert_eq!(sm.base.get_current_state(), ERROR);
    }

    #[tokio::test]
    async fn approved_plan_moves_to_coding() {
        let base = BaseStateMachine::new(AgentId::from("coder-1"), transition_table(), AWAIT_PLAN_REVIEW);
        base.mutate_state_data(|d| {
            d.insert("plan_failures".to_string(), serde_json::json!(0));
            d.insert("story_id".to_string(), serde_json::json!("001"));
        });
        let mut sm = StateMachine::new(base, handlers());
        let approved = AgentMsg::new(MessageType::Response, AgentId::from("architect"), AgentId::from("coder-1"), Payload::new().with("status", "APPROVED"));
        sm.step(StepInput::Message(approved)).await.unwrap();
        assert_eq!(sm.base.get_current_state(), CODING);
    }
}
