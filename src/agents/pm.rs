//! Product Manager role: conducts a chat-driven interview, drafts a
//! spec, and mediates user preview actions before handing off to the
//! Architect.

use crate::error::StateMachineError;
use crate::message::{AgentId, AgentMsg, MessageType, Payload};
use crate::state_machine::{BaseStateMachine, Effect, RoleHandlers, StepInput, DONE, ERROR, WAITING};
use async_trait::async_trait;

pub const INTERVIEWING: &str = "INTERVIEWING";
pub const DRAFTING: &str = "DRAFTING";
pub const AWAITING_USER: &str = "AWAITING_USER";
pub const AWAITING_ARCHITECT: &str = "AWAITING_ARCHITECT";
pub const WORKING: &str = "WORKING";

pub fn transition_table() -> crate::state_machine::TransitionTable {
    crate::state_machine::TransitionTable::builder()
        .edges(WAITING, &[INTERVIEWING])
        .edges(INTERVIEWING, &[DRAFTING, ERROR])
        .edges(DRAFTING, &[AWAITING_USER, ERROR])
        .edges(AWAITING_USER, &[DRAFTING, AWAITING_ARCHITECT, ERROR])
        .edges(AWAITING_ARCHITECT, &[WORKING, DRAFTING, ERROR])
        .edges(WORKING, &[DONE, ERROR])
        .build()
}

/// Result of the explicit `PreviewAction` API call: `Continue` loops back
/// to drafting for another revision, `Submit` hands the draft to the
/// Architect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewAction {
    Continue,
    Submit,
}

impl PreviewAction {
    /// Parses the `preview_action` field off a payload; anything other
    /// than the literal `"submit"` is treated as `Continue`.
    fn from_payload(payload: &Payload) -> Self {
        match payload.get_str("preview_action") {
            Some("submit") => PreviewAction::Submit,
            _ => PreviewAction::Continue,
        }
    }
}

pub struct PmHandlers {
    pub architect_id: AgentId,
}

#[async_trait]
impl RoleHandlers for PmHandlers {
    async fn handle(&mut self, base: &BaseStateMachine, input: StepInput) -> Result<(String, Vec<Effect>), StateMachineError> {
        let current = base.get_current_state();

        match input {
            StepInput::Shutdown => return Ok((DONE.to_string(), vec![])),
            StepInput::Timer => return Ok((current, vec![])),
            StepInput::Message(msg) => self.handle_message(base, &current, msg).await,
        }
    }
}

impl PmHandlers {
    async fn handle_message(
        &mut self,
        base: &BaseStateMachine,
        current: &str,
        msg: AgentMsg,
    ) -> Result<(String, Vec<Effect>), StateMachineError> {
        match (current, msg.msg_type) {
            (WAITING, MessageType::Request) => {
                // StartInterview
                base.mutate_state_data(|d| {
                    d.insert("transcript".to_string(), serde_json::Value::Array(vec![]));
                });
                Ok((INTERVIEWING.to_string(), vec![]))
            }
            (INTERVIEWING, MessageType::Answer) => {
                base.mutate_state_data(|d| {
                    if let Some(serde_json::Value::Array(transcript)) = d.get_mut("transcript") {
                        transcript.push(serde_json::json!({
                            "question": msg.payload.question_id(),
                            "answer": msg.payload.answer(),
                        }));
                    }
                });
                // UploadSpec / InjectSpecFile: the caller signals interview
                // completion by sending a SPEC message instead of ANSWER.
                Ok((INTERVIEWING.to_string(), vec![]))
            }
            (INTERVIEWING, MessageType::Spec) => {
                base.mutate_state_data(|d| {
                    d.insert("draft".to_string(), serde_json::Value::String(msg.payload.content().unwrap_or_default().to_string()));
                });
                Ok((DRAFTING.to_string(), vec![]))
            }
            (DRAFTING, MessageType::Response) => {
                // Draft rendered; await the user's PreviewAction.
                Ok((AWAITING_USER.to_string(), vec![]))
            }
            (AWAITING_USER, MessageType::Request) => match PreviewAction::from_payload(&msg.payload) {
                PreviewAction::Submit => {
                    let draft = base.get_state_data().get("draft").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let spec_msg = AgentMsg::new(MessageType::Spec, AgentId::from("pm"), self.architect_id.clone(), Payload::new().with("content", draft));
                    Ok((AWAITING_ARCHITECT.to_string(), vec![Effect::DispatchMessage(spec_msg)]))
                }
                PreviewAction::Continue => Ok((DRAFTING.to_string(), vec![])),
            },
            (AWAITING_ARCHITECT, MessageType::Response) => match msg.payload.status() {
                Some(crate::message::ReviewOutcome::Approved) => Ok((WORKING.to_string(), vec![])),
                _ => Ok((DRAFTING.to_string(), vec![])),
            },
            (WORKING, MessageType::Result) => Ok((DONE.to_string(), vec![Effect::PersistRecord { kind: "pm_complete".to_string(), payload: serde_json::to_value(&msg.payload.0).unwrap_or_default() }])),
            (state, msg_type) => Err(StateMachineError::InvalidTransition { from: state.to_string(), to: format!("{:?}", msg_type) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StateMachine;

    #[tokio::test]
    async fn interview_to_drafting_to_submit() {
        let base = BaseStateMachine::new(AgentId::from("pm-1"), transition_table(), WAITING);
        let mut sm = StateMachine::new(base, PmHandlers { architect_id: AgentId::from("architect") });

        let start = AgentMsg::new(MessageType::Request, AgentId::from("user"), AgentId::from("pm-1"), Payload::new());
        sm.step(StepInput::Message(start)).await.unwrap();
        assert_eq!(sm.base.get_current_state(), INTERVIEWING);

        let spec = AgentMsg::new(MessageType::Spec, AgentId::from("user"), AgentId::from("pm-1"), Payload::new().with("content", "draft body"));
        sm.step(StepInput::Message(spec)).await.unwrap();
        assert_eq!(sm.base.get_current_state(), DRAFTING);

        let rendered = AgentMsg::new(MessageType::Response, AgentId::from("pm-1"), AgentId::from("pm-1"), Payload::new());
        sm.step(StepInput::Message(rendered)).await.unwrap();
        assert_eq!(sm.base.get_current_state(), AWAITING_USER);

        let submit = AgentMsg::new(MessageType::Request, AgentId::from("user"), AgentId::from("pm-1"), Payload::new().with("preview_action", "submit"));
        let effects = sm.step(StepInput::Message(submit)).await.unwrap();
        assert_eq!(sm.base.get_current_state(), AWAITING_ARCHITECT);
        assert_eq!(effects.len(), 1);
    }
}
