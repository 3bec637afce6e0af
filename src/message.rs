//! Agent identity and the `AgentMsg` envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Pm,
    Architect,
    Coder,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentType::Pm => "pm",
            AgentType::Architect => "architect",
            AgentType::Coder => "coder",
        };
        write!(f, "{}", s)
    }
}

/// Time-ordered unique message id: a zero-padded millisecond timestamp
/// followed by a random suffix, so lexicographic and chronological order
/// agree.
pub type MessageId = String;

pub fn new_message_id() -> MessageId {
    format!("{:020}-{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Spec,
    Request,
    Response,
    Result,
    Question,
    Answer,
    Shutdown,
}

impl MessageType {
    /// `parent_id`, when set, names a prior message of a "compatible" type
    /// (request <-> response, question <-> answer, and so on).
    pub fn compatible_with(self, parent: MessageType) -> bool {
        use MessageType::*;
        matches!(
            (parent, self),
            (Request, Response)
                | (Question, Answer)
                | (Spec, Response)
                | (Result, Response)
                | (Request, Request) // escalation follow-ups re-open a REQUEST
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Question,
    Approval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Plan,
    Code,
    Completion,
    BudgetReview,
    Spec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewOutcome {
    Approved,
    NeedsChanges,
    Rejected,
}

/// A tagged map of semantic keys (`story_id`, `question`, `answer`,
/// `content`, approval subfields, ...). Kept as a thin wrapper over a JSON
/// object rather than a closed struct, with typed accessors for the
/// normative keys handlers and capability adapters exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload(pub Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn story_id(&self) -> Option<&str> {
        self.get_str("story_id")
    }

    pub fn content(&self) -> Option<&str> {
        self.get_str("content")
    }

    pub fn question(&self) -> Option<&str> {
        self.get_str("question")
    }

    pub fn answer(&self) -> Option<&str> {
        self.get_str("answer")
    }

    pub fn request_type(&self) -> Option<RequestType> {
        match self.get_str("request_type") {
            Some("question") => Some(RequestType::Question),
            Some("approval") => Some(RequestType::Approval),
            _ => None,
        }
    }

    pub fn approval_type(&self) -> Option<ApprovalType> {
        match self.get_str("approval_type") {
            Some("plan") => Some(ApprovalType::Plan),
            Some("code") => Some(ApprovalType::Code),
            Some("completion") => Some(ApprovalType::Completion),
            Some("budget_review") => Some(ApprovalType::BudgetReview),
            Some("spec") => Some(ApprovalType::Spec),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<ReviewOutcome> {
        match self.get_str("status") {
            Some("APPROVED") => Some(ReviewOutcome::Approved),
            Some("NEEDS_CHANGES") => Some(ReviewOutcome::NeedsChanges),
            Some("REJECTED") => Some(ReviewOutcome::Rejected),
            _ => None,
        }
    }

    pub fn feedback(&self) -> Option<&str> {
        self.get_str("feedback")
    }

    pub fn code_path(&self) -> Option<&str> {
        self.get_str("code_path")
    }

    pub fn code_content(&self) -> Option<&str> {
        self.get_str("code_content")
    }

    pub fn filename(&self) -> Option<&str> {
        self.get_str("filename")
    }

    pub fn question_id(&self) -> Option<&str> {
        self.get_str("question_id")
    }
}

/// Immutable-after-send message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMsg {
    pub id: MessageId,
    pub parent_id: Option<MessageId>,
    pub msg_type: MessageType,
    pub from_agent: AgentId,
    pub to_agent: AgentId,
    pub payload: Payload,
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AgentMsg {
    pub fn new(
        msg_type: MessageType,
        from_agent: impl Into<AgentId>,
        to_agent: impl Into<AgentId>,
        payload: Payload,
    ) -> Self {
        Self {
            id: new_message_id(),
            parent_id: None,
            msg_type,
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            payload,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn reply_to(&self, msg_type: MessageType, from_agent: impl Into<AgentId>, payload: Payload) -> Self {
        let mut reply = Self::new(msg_type, from_agent, self.from_agent.clone(), payload);
        reply.parent_id = Some(self.id.clone());
        reply
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validates that `parent_id`, when set against a known parent type,
    /// names a message of compatible type.
    pub fn parent_compatible(&self, parent_type: MessageType) -> bool {
        self.parent_id.is_none() || self.msg_type.compatible_with(parent_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_lexicographically_time_ordered() {
        let a = new_message_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_message_id();
        assert!(a < b);
    }

    #[test]
    fn reply_links_parent_and_flips_direction() {
        let req = AgentMsg::new(
            MessageType::Request,
            AgentId::from("architect"),
            AgentId::from("coder-1"),
            Payload::new().with("story_id", "001"),
        );
        let resp = req.reply_to(MessageType::Response, AgentId::from("coder-1"), Payload::new());
        assert_eq!(resp.parent_id.as_deref(), Some(req.id.as_str()));
        assert_eq!(resp.to_agent, req.from_agent);
        assert!(resp.parent_compatible(MessageType::Request));
    }

    #[test]
    fn payload_accessors_round_trip() {
        let p = Payload::new()
            .with("story_id", "042")
            .with("status", "APPROVED");
        assert_eq!(p.story_id(), Some("042"));
        assert_eq!(p.status(), Some(ReviewOutcome::Approved));
    }
}
