//! In-process message router with per-agent mailboxes, logical-name
//! resolution, and attach/detach lifecycle.

pub mod mailbox;

pub use mailbox::{mailbox, MailboxHandle, MailboxReceiver};

use crate::error::DispatchError;
use crate::message::{AgentId, AgentMsg, AgentType, MessageType, Payload};
use crate::queue::ExternalApi;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// How long a point-to-point dispatch waits on a full destination mailbox
/// before giving up. Logical-name/round-robin resolution never waits (a
/// stuck single coder shouldn't stall routing to the others), but a direct
/// send to a known `AgentId` is worth a bounded wait rather than an
/// immediate failure.
const MAILBOX_SEND_DEADLINE: Duration = Duration::from_secs(5);

/// Seam that breaks the Dispatcher<->Driver cycle: drivers hold this
/// narrow trait object instead of the full `Dispatcher`.
#[async_trait]
pub trait DispatcherPort: Send + Sync {
    async fn dispatch(&self, msg: AgentMsg) -> Result<(), DispatchError>;
}

struct AgentRegistration {
    id: AgentId,
    agent_type: AgentType,
    mailbox: MailboxHandle,
    /// Live state name, read by coder round-robin resolution; updated by
    /// the driver under its own task, read here under the registry lock.
    current_state: std::sync::Mutex<String>,
    model_name: String,
    story_id: std::sync::Mutex<Option<String>>,
}

/// Read-write lock over the registry: reads (listing, resolution) dominate
/// writes (attach/detach).
pub struct Dispatcher {
    registry: RwLock<HashMap<AgentId, Arc<AgentRegistration>>>,
    stopping: AtomicBool,
    coder_rr: AtomicUsize,
    external_api: Arc<ExternalApi>,
    mailbox_capacity: usize,
}

pub struct AttachedAgent {
    pub id: AgentId,
    pub mailbox: MailboxReceiver,
}

impl Dispatcher {
    pub fn new(external_api: Arc<ExternalApi>, mailbox_capacity: usize) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            coder_rr: AtomicUsize::new(0),
            external_api,
            mailbox_capacity,
        }
    }

    pub async fn attach(
        &self,
        id: AgentId,
        agent_type: AgentType,
        model_name: impl Into<String>,
        initial_state: impl Into<String>,
    ) -> Result<AttachedAgent, DispatchError> {
        let mut registry = self.registry.write().await;

        if matches!(agent_type, AgentType::Pm | AgentType::Architect)
            && registry.values().any(|r| r.agent_type == agent_type)
        {
            return Err(DispatchError::SingletonAlreadyAttached(agent_type));
        }

        let (tx, rx) = mailbox(self.mailbox_capacity);
        registry.insert(
            id.clone(),
            Arc::new(AgentRegistration {
                id: id.clone(),
                agent_type,
                mailbox: tx,
                current_state: std::sync::Mutex::new(initial_state.into()),
                model_name: model_name.into(),
                story_id: std::sync::Mutex::new(None),
            }),
        );
        info!(agent_id = %id, ?agent_type, "agent attached");
        Ok(AttachedAgent { id, mailbox: rx })
    }

    pub async fn detach(&self, id: &AgentId) {
        let mut registry = self.registry.write().await;
        if registry.remove(id).is_some() {
            info!(agent_id = %id, "agent detached");
        }
    }

    pub async fn set_agent_state(&self, id: &AgentId, state: impl Into<String>) {
        let registry = self.registry.read().await;
        if let Some(reg) = registry.get(id) {
            *reg.current_state.lock().unwrap() = state.into();
        }
    }

    pub async fn set_agent_story(&self, id: &AgentId, story_id: Option<String>) {
        let registry = self.registry.read().await;
        if let Some(reg) = registry.get(id) {
            *reg.story_id.lock().unwrap() = story_id;
        }
    }

    pub async fn get_agent_story(&self, id: &AgentId) -> Option<String> {
        let registry = self.registry.read().await;
        registry.get(id).and_then(|reg| reg.story_id.lock().unwrap().clone())
    }

    pub async fn get_agent(&self, id: &AgentId) -> Option<AgentId> {
        self.registry.read().await.get(id).map(|r| r.id.clone())
    }

    pub async fn get_registered_agents(&self) -> Vec<AgentId> {
        self.registry.read().await.keys().cloned().collect()
    }

    /// Introspection: the first `n` agents by attach order with their
    /// current live state. Mailbox contents are not peekable through
    /// `tokio::mpsc` without consuming, so this reports agent/state, not
    /// message bodies.
    pub async fn dump_heads(&self, n: usize) -> Vec<(AgentId, String)> {
        let registry = self.registry.read().await;
        registry
            .values()
            .take(n)
            .map(|r| (r.id.clone(), r.current_state.lock().unwrap().clone()))
            .collect()
    }

    fn resolve_logical<'a>(
        to_agent: &str,
        registry: &'a HashMap<AgentId, Arc<AgentRegistration>>,
        coder_rr: &AtomicUsize,
    ) -> Option<&'a Arc<AgentRegistration>> {
        if let Some(reg) = registry.get(&AgentId::from(to_agent)) {
            return Some(reg);
        }
        match to_agent {
            "architect" => registry.values().find(|r| r.agent_type == AgentType::Architect),
            "pm" => registry.values().find(|r| r.agent_type == AgentType::Pm),
            "coder" => {
                let mut idle: Vec<&Arc<AgentRegistration>> = registry
                    .values()
                    .filter(|r| r.agent_type == AgentType::Coder && *r.current_state.lock().unwrap() == "WAITING")
                    .collect();
                if idle.is_empty() {
                    return None;
                }
                idle.sort_by(|a, b| a.id.0.cmp(&b.id.0));
                let idx = coder_rr.fetch_add(1, Ordering::Relaxed) % idle.len();
                Some(idle[idx])
            }
            _ => None,
        }
    }

    /// Direct sends to a known `AgentId` wait, bounded, on a full mailbox
    /// rather than failing immediately. Logical-name and round-robin
    /// resolution (`"architect"`, `"pm"`, `"coder"`) keep the fail-fast
    /// `try_send`: there's no single destination worth blocking on when the
    /// resolution itself is a choice among several idle candidates.
    pub async fn dispatch_message(&self, msg: AgentMsg) -> Result<(), DispatchError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(DispatchError::DispatcherStopped);
        }
        let registry = self.registry.read().await;
        if let Some(reg) = registry.get(&msg.to_agent) {
            let mailbox = reg.mailbox.clone_handle();
            drop(registry);
            return mailbox.send(msg, MAILBOX_SEND_DEADLINE).await;
        }
        let target = Self::resolve_logical(&msg.to_agent.0, &registry, &self.coder_rr)
            .ok_or_else(|| {
                if msg.to_agent.0 == "coder" {
                    DispatchError::NoIdleCoder
                } else {
                    DispatchError::NoSuchAgent(msg.to_agent.0.clone())
                }
            })?;
        target.mailbox.try_send(msg)
    }

    /// Best-effort fan-out; skips mailboxes that are full rather than
    /// blocking, and reports per-agent failures.
    pub async fn broadcast(
        &self,
        msg_type: MessageType,
        predicate: impl Fn(AgentType, &str) -> bool,
        payload: Payload,
        from: impl Into<AgentId>,
    ) -> Vec<(AgentId, Result<(), DispatchError>)> {
        let registry = self.registry.read().await;
        let from = from.into();
        registry
            .values()
            .filter(|r| predicate(r.agent_type, &r.current_state.lock().unwrap()))
            .map(|r| {
                let msg = AgentMsg::new(msg_type, from.clone(), r.id.clone(), payload.clone());
                (r.id.clone(), r.mailbox.try_send(msg))
            })
            .collect()
    }

    /// Sets the stopping flag, broadcasts SHUTDOWN, and waits for mailboxes
    /// to drain or for the timeout to elapse.
    pub async fn stop(&self, timeout: Duration) {
        self.stopping.store(true, Ordering::Release);
        let _ = self
            .broadcast(MessageType::Shutdown, |_, _| true, Payload::new(), AgentId::from("dispatcher"))
            .await;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = {
                let registry = self.registry.read().await;
                registry.values().all(|r| r.mailbox.is_quiescent())
            };
            if drained || tokio::time::Instant::now() >= deadline {
                if !drained {
                    warn!("dispatcher stop timed out with undrained mailboxes");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Invoked when the Dispatcher learns a Coder's driver task exited
    /// abnormally (the dispatcher owns the driver task): requeues the coder's
    /// last assigned story and removes the registration.
    pub async fn handle_agent_failure(&self, id: &AgentId) -> Result<(), DispatchError> {
        if let Some(story_id) = self.get_agent_story(id).await {
            if let Err(e) = self.external_api.requeue_and_release(&story_id) {
                warn!(agent_id = %id, story_id, error = %e, "requeue-and-release failed on agent failure");
            }
        }
        self.detach(id).await;
        Ok(())
    }
}

#[async_trait]
impl DispatcherPort for Dispatcher {
    async fn dispatch(&self, msg: AgentMsg) -> Result<(), DispatchError> {
        self.dispatch_message(msg).await
    }
}
