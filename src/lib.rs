//! Maestro orchestration core: an in-process message dispatcher, a
//! dependency-aware story queue, a per-model rate/budget/connection
//! limiter, and the generic agent state-machine skeleton that the Product
//! Manager, Architect, and Coder roles are built on.
//!
//! LLM provider internals, the Git/host-API client, the web UI, template
//! rendering, and configuration loading are domain glue that live outside
//! this crate; it only specifies the capability contracts they must
//! satisfy (`capabilities` module).

pub mod agents;
pub mod capabilities;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod message;
pub mod persistence;
pub mod queue;
pub mod state_machine;
pub mod tool_loop;

pub use config::MaestroConfig;
pub use dispatcher::Dispatcher;
pub use limiter::Limiter;
pub use message::{AgentId, AgentMsg, AgentType};
pub use queue::{ExternalApi, StoryQueue};
