//! In-process persistence, used for tests and for embedding the core
//! without a durable backing store.

use crate::capabilities::PersistenceAdapter;
use crate::message::AgentMsg;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryPersistence {
    messages: Mutex<HashMap<String, Vec<AgentMsg>>>,
    records: Mutex<Vec<(String, serde_json::Value)>>,
    transitions: Mutex<Vec<(String, String, String)>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn append_message(&self, session_id: &str, msg: &AgentMsg) -> anyhow::Result<()> {
        self.messages.lock().unwrap().entry(session_id.to_string()).or_default().push(msg.clone());
        Ok(())
    }

    async fn recent_messages(&self, session_id: &str, n: usize) -> anyhow::Result<Vec<AgentMsg>> {
        let messages = self.messages.lock().unwrap();
        let all = messages.get(session_id).cloned().unwrap_or_default();
        Ok(all.into_iter().rev().take(n).rev().collect())
    }

    async fn append_record(&self, kind: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        self.records.lock().unwrap().push((kind.to_string(), payload));
        Ok(())
    }

    async fn append_transition(&self, agent_id: &str, from_state: &str, to_state: &str) -> anyhow::Result<()> {
        self.transitions.lock().unwrap().push((agent_id.to_string(), from_state.to_string(), to_state.to_string()));
        Ok(())
    }
}
