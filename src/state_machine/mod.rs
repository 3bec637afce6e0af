//! Generic finite-state-machine skeleton shared by all three agent roles.
//! Each role is a *value* of `StateMachine<H>` parameterized by its own
//! handler map, not a subclass — the transition table and handler dispatch
//! are the only things that vary between PM, Architect, and Coder.

pub mod effects;

pub use effects::{Effect, EffectsRuntime};

use crate::capabilities::PersistenceAdapter;
use crate::error::StateMachineError;
use crate::message::{AgentId, AgentMsg};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock;
use tracing::{error, info};

pub const WAITING: &str = "WAITING";
pub const ERROR: &str = "ERROR";
pub const DONE: &str = "DONE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
}

/// `{state -> allowed-next-states}`. `WAITING`, `ERROR`, and `DONE` are
/// always present: `ERROR`'s only valid exit is `WAITING`; `DONE` may
/// return to `WAITING` on reset.
pub struct TransitionTable {
    table: HashMap<String, HashSet<String>>,
}

impl TransitionTable {
    pub fn builder() -> TransitionTableBuilder {
        TransitionTableBuilder { table: HashMap::new() }
    }

    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.table.get(from).map(|nexts| nexts.contains(to)).unwrap_or(false)
    }

    pub fn valid_states(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }
}

pub struct TransitionTableBuilder {
    table: HashMap<String, HashSet<String>>,
}

impl TransitionTableBuilder {
    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.table.entry(from.to_string()).or_default().insert(to.to_string());
        self
    }

    pub fn edges(mut self, from: &str, tos: &[&str]) -> Self {
        for to in tos {
            self = self.edge(from, to);
        }
        self
    }

    pub fn build(mut self) -> TransitionTable {
        self.table.entry(ERROR.to_string()).or_default().insert(WAITING.to_string());
        self.table.entry(DONE.to_string()).or_default().insert(WAITING.to_string());
        self.table.entry(WAITING.to_string()).or_default();
        // Shutdown is reachable from any named state except ERROR, whose
        // only valid exit is WAITING: cancellation on the global shutdown
        // token transitions to DONE, never ERROR.
        let states: Vec<String> = self.table.keys().cloned().collect();
        for state in states {
            if state != ERROR {
                self.table.get_mut(&state).unwrap().insert(DONE.to_string());
            }
        }
        TransitionTable { table: self.table }
    }
}

/// Owns the current state, the state-data map (mutated only inside
/// handlers), and the append-only transition log.
pub struct BaseStateMachine {
    pub agent_id: AgentId,
    current_state: RwLock<String>,
    state_data: RwLock<Map<String, Value>>,
    transitions: RwLock<Vec<TransitionRecord>>,
    table: TransitionTable,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
}

impl BaseStateMachine {
    pub fn new(agent_id: AgentId, table: TransitionTable, initial_state: impl Into<String>) -> Self {
        Self {
            agent_id,
            current_state: RwLock::new(initial_state.into()),
            state_data: RwLock::new(Map::new()),
            transitions: RwLock::new(Vec::new()),
            table,
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn get_current_state(&self) -> String {
        self.current_state.read().unwrap().clone()
    }

    /// External readers get a deep copy; only handlers may mutate in place.
    pub fn get_state_data(&self) -> Map<String, Value> {
        self.state_data.read().unwrap().clone()
    }

    pub fn mutate_state_data(&self, f: impl FnOnce(&mut Map<String, Value>)) {
        f(&mut self.state_data.write().unwrap());
    }

    pub fn validate_state(&self, state: &str) -> bool {
        self.table.valid_states().iter().any(|s| s == state)
    }

    pub fn get_valid_states(&self) -> Vec<String> {
        self.table.valid_states()
    }

    pub fn get_transitions(&self) -> Vec<TransitionRecord> {
        self.transitions.read().unwrap().clone()
    }

    pub async fn transition_to(&self, next: &str, annotations: Map<String, Value>) -> Result<(), StateMachineError> {
        let current = self.get_current_state();
        if !self.table.allows(&current, next) {
            return Err(StateMachineError::InvalidTransition { from: current, to: next.to_string() });
        }
        let record = TransitionRecord { from: current.clone(), to: next.to_string(), at: Utc::now() };
        *self.current_state.write().unwrap() = next.to_string();
        self.transitions.write().unwrap().push(record);
        if !annotations.is_empty() {
            self.mutate_state_data(|data| data.extend(annotations));
        }
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.append_transition(&self.agent_id.0, &current, next).await {
                error!(agent_id = %self.agent_id, error = %e, "failed to persist transition");
            }
        }
        info!(agent_id = %self.agent_id, from = %current, to = %next, "state transition");
        Ok(())
    }
}

/// One `Step` cycle's input: a mailbox message, a cooperative timer wake,
/// or shutdown.
pub enum StepInput {
    Message(AgentMsg),
    Timer,
    Shutdown,
}

/// Per-role handler dispatch. Implementors own their `state_data` access
/// pattern internally via `BaseStateMachine::mutate_state_data`; the state
/// machine core only owns the transition table and bookkeeping.
#[async_trait]
pub trait RoleHandlers: Send + Sync {
    async fn handle(&mut self, base: &BaseStateMachine, input: StepInput) -> Result<(String, Vec<Effect>), StateMachineError>;
}

pub struct StateMachine<H: RoleHandlers> {
    pub base: BaseStateMachine,
    pub handlers: H,
}

impl<H: RoleHandlers> StateMachine<H> {
    pub fn new(base: BaseStateMachine, handlers: H) -> Self {
        Self { base, handlers }
    }

    /// One cycle: invoke the handler for the current state, apply the
    /// resulting transition, and hand effects back to the caller (who owns
    /// the `EffectsRuntime` and applies them before the next `Step` begins).
    /// If `apply_all` later reports a fatal effect failure, the caller is
    /// responsible for driving this state machine into `ERROR`.
    pub async fn step(&mut self, input: StepInput) -> Result<Vec<Effect>, StateMachineError> {
        match self.handlers.handle(&self.base, input).await {
            Ok((next, effects)) => {
                self.base.transition_to(&next, Map::new()).await?;
                Ok(effects)
            }
            Err(StateMachineError::Cancelled) => Err(StateMachineError::Cancelled),
            Err(e) => {
                // Roll back to prior state (no partial transition) and
                // take the ERROR transition instead of propagating.
                error!(agent_id = %self.base.agent_id, error = %e, "handler error, transitioning to ERROR");
                let _ = self.base.transition_to(ERROR, Map::new()).await;
                Ok(vec![])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TransitionTable {
        TransitionTable::builder()
            .edges(WAITING, &["SETUP"])
            .edges("SETUP", &["DISPATCHING"])
            .edges("DISPATCHING", &["MONITORING"])
            .edges("MONITORING", &[DONE])
            .build()
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected_and_state_unchanged() {
        let sm = BaseStateMachine::new(AgentId::from("arch-1"), table(), "DISPATCHING");
        let err = sm.transition_to(ERROR, Map::new()).await.unwrap_err();
        assert_eq!(err, StateMachineError::InvalidTransition { from: "DISPATCHING".to_string(), to: ERROR.to_string() });
        assert_eq!(sm.get_current_state(), "DISPATCHING");
    }

    #[tokio::test]
    async fn error_exits_only_to_waiting() {
        let sm = BaseStateMachine::new(AgentId::from("arch-1"), table(), ERROR);
        sm.transition_to(WAITING, Map::new()).await.unwrap();
        assert_eq!(sm.get_current_state(), WAITING);
    }

    #[tokio::test]
    async fn error_cannot_shortcut_to_done() {
        let sm = BaseStateMachine::new(AgentId::from("arch-1"), table(), ERROR);
        let err = sm.transition_to(DONE, Map::new()).await.unwrap_err();
        assert_eq!(err, StateMachineError::InvalidTransition { from: ERROR.to_string(), to: DONE.to_string() });
        assert_eq!(sm.get_current_state(), ERROR);
    }

    #[tokio::test]
    async fn valid_transition_appends_record() {
        let sm = BaseStateMachine::new(AgentId::from("arch-1"), table(), WAITING);
        sm.transition_to("SETUP", Map::new()).await.unwrap();
        let records = sm.get_transitions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].from, WAITING);
        assert_eq!(records[0].to, "SETUP");
    }
}
