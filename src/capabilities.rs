//! External capability contracts. These are boundary surfaces the core
//! depends on but does not implement: LLM provider clients, the Git/host-API
//! client, persistence, and the chat channel are all domain glue that lives
//! outside this crate. Each is a narrow `async_trait` with concrete adapters
//! living at the edges, never inside the core.

use crate::message::AgentMsg;
use async_trait::async_trait;
use regex::escape;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into(), tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into(), tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into(), tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: "tool".to_string(), content: content.into(), tool_call_id: Some(tool_call_id.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tool_specs: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    ToolUse,
    Length,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub delta: String,
    pub done: bool,
}

/// LLM provider capability contract.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse>;
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<mpsc::Receiver<CompletionChunk>>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub branch: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePrRequest {
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub merged: bool,
    pub conflicts: Option<Vec<String>>,
    pub sha: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub state: WorkflowState,
    pub counts: WorkflowCounts,
    pub failed_names: Vec<String>,
}

/// Git/host-API capability contract.
#[async_trait]
pub trait HostApi: Send + Sync {
    async fn list_prs_for_branch(&self, branch: &str) -> anyhow::Result<Vec<PullRequest>>;
    async fn create_pr(&self, req: CreatePrRequest) -> anyhow::Result<PullRequest>;
    async fn merge_pr(&self, number: u64) -> anyhow::Result<MergeResult>;
    async fn cleanup_merged_branches(&self) -> anyhow::Result<Vec<String>>;
    async fn workflow_status(&self, branch: &str) -> anyhow::Result<WorkflowStatus>;
}

/// Wildcard-prefix protected-branch matching (`release/*` matches
/// `release/x`).
pub fn branch_matches_pattern(branch: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        let anchored = format!("^{}", escape(prefix));
        regex::Regex::new(&anchored).map(|re| re.is_match(branch)).unwrap_or(false)
    } else {
        branch == pattern
    }
}

pub fn matches_any_protected_pattern(branch: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| branch_matches_pattern(branch, p))
}

/// Persistence capability contract. Exact schema is out of scope; the
/// core only requires durable-before-ack append and O(N) recent-N query.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn append_message(&self, session_id: &str, msg: &AgentMsg) -> anyhow::Result<()>;
    async fn recent_messages(&self, session_id: &str, n: usize) -> anyhow::Result<Vec<AgentMsg>>;
    async fn append_record(&self, kind: &str, payload: serde_json::Value) -> anyhow::Result<()>;
    async fn append_transition(
        &self,
        agent_id: &str,
        from_state: &str,
        to_state: &str,
    ) -> anyhow::Result<()>;
}

/// Chat channel capability contract, used for escalation and review
/// preview flows.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn post(&self, author: &str, text: &str, channel: &str) -> anyhow::Result<String>;
    async fn wait_for_reply(&self, msg_id: &str, poll_interval: Duration) -> anyhow::Result<AgentMsg>;
}
