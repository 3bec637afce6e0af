//! Durable persistence adapter. Every operation opens a connection
//! inside `spawn_blocking`, since `rusqlite::Connection` is not
//! `Send`-friendly across awaits.

use crate::capabilities::PersistenceAdapter;
use crate::message::AgentMsg;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tokio::task;

#[derive(Clone)]
pub struct SqlitePersistence {
    db_path: PathBuf,
}

impl SqlitePersistence {
    pub async fn new(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS messages (
                    session_id TEXT NOT NULL,
                    id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at);",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS records (
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS transitions (
                    agent_id TEXT NOT NULL,
                    from_state TEXT NOT NULL,
                    to_state TEXT NOT NULL,
                    at TEXT NOT NULL
                );",
                [],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }
}

#[async_trait]
impl PersistenceAdapter for SqlitePersistence {
    async fn append_message(&self, session_id: &str, msg: &AgentMsg) -> anyhow::Result<()> {
        let path = self.db_path.clone();
        let session_id = session_id.to_string();
        let id = msg.id.clone();
        let payload = serde_json::to_string(msg)?;

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages (session_id, id, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![&session_id, &id, &payload, &now],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn recent_messages(&self, session_id: &str, n: usize) -> anyhow::Result<Vec<AgentMsg>> {
        let path = self.db_path.clone();
        let session_id = session_id.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT payload FROM messages WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![&session_id, n as i64], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(serde_json::from_str::<AgentMsg>(&row?)?);
            }
            out.reverse();
            Ok::<_, anyhow::Error>(out)
        })
        .await?
    }

    async fn append_record(&self, kind: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let path = self.db_path.clone();
        let kind = kind.to_string();
        let payload_json = serde_json::to_string(&payload)?;

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO records (kind, payload, created_at) VALUES (?1, ?2, ?3)",
                params![&kind, &payload_json, &now],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn append_transition(&self, agent_id: &str, from_state: &str, to_state: &str) -> anyhow::Result<()> {
        let path = self.db_path.clone();
        let agent_id = agent_id.to_string();
        let from_state = from_state.to_string();
        let to_state = to_state.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO transitions (agent_id, from_state, to_state, at) VALUES (?1, ?2, ?3, ?4)",
                params![&agent_id, &from_state, &to_state, &now],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }
}
