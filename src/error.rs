//! Typed error taxonomy for the orchestration core.
//!
//! Errors are values, never panics. Each component gets its own enum so
//! callers can match on the exact failure mode instead of string-matching;
//! `anyhow` is reserved for glue code at the edges (tests, capability
//! adapters).

use crate::message::AgentType;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LimiterError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("rate limited for model {0}")]
    RateLimited(String),
    #[error("daily budget exceeded for model {0}")]
    BudgetExceeded(String),
    #[error("connection limit reached for model {0}")]
    ConnectionLimit(String),
    #[error("no connection held for model {0}")]
    NoConnection(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),
    #[error("adding story {0} would introduce a dependency cycle")]
    CycleDetected(String),
    #[error("story not found: {0}")]
    NotFound(String),
    #[error("story {0} is terminal; only RequeueStory may move it")]
    TerminalStory(String),
    #[error("story {0} is not in_progress; cannot requeue")]
    NotInProgress(String),
    #[error("duplicate story id: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error("no such agent: {0}")]
    NoSuchAgent(String),
    #[error("mailbox full for agent {0}")]
    MailboxFull(String),
    #[error("dispatcher stopped")]
    DispatcherStopped,
    #[error("agent of singleton type {0:?} already attached")]
    SingletonAlreadyAttached(AgentType),
    #[error("no idle coder available")]
    NoIdleCoder,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ToolLoopError {
    #[error("no terminal tool was invoked")]
    NoTerminalTool,
    #[error("invalid tool result: {0}")]
    InvalidResult(String),
    #[error("iteration budget exceeded")]
    BudgetExceeded,
}

/// The four-way taxonomy used by the effects runtime to decide
/// retry vs. fatal-to-ERROR behavior.
#[derive(Debug, Error, Clone)]
pub enum EffectError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    ResourceLimit(#[from] LimiterError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("external collaborator failure: {0}")]
    External(String),
    #[error("cancelled")]
    Cancelled,
}
