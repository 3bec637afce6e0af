//! Declarative effects produced by a `Step` and the runtime that applies
//! them. `CallLLM` is not a variant here: it is synchronous from the
//! handler's point of view, gated by the Limiter inline, and never queued.

use crate::capabilities::PersistenceAdapter;
use crate::dispatcher::DispatcherPort;
use crate::error::EffectError;
use crate::message::AgentMsg;
use crate::queue::{StoryQueue, StoryStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum Effect {
    SendResponse(AgentMsg),
    DispatchMessage(AgentMsg),
    PersistRecord { kind: String, payload: Value },
    UpdateStoryStatus { story_id: String, status: StoryStatus },
}

/// Bounded exponential backoff for `EffectError::External` before an effect
/// is treated as fatal and escalated to the caller (who takes the ERROR
/// transition).
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(50);

pub struct EffectsRuntime {
    dispatcher: Arc<dyn DispatcherPort>,
    persistence: Arc<dyn PersistenceAdapter>,
    queue: Arc<StoryQueue>,
}

impl EffectsRuntime {
    pub fn new(dispatcher: Arc<dyn DispatcherPort>, persistence: Arc<dyn PersistenceAdapter>, queue: Arc<StoryQueue>) -> Self {
        Self { dispatcher, persistence, queue }
    }

    /// Applies every effect from one `Step` in order. A fatal failure stops
    /// applying further effects and returns the error; the caller is
    /// responsible for rolling the agent back to ERROR (the guarantee is
    /// "no partial transition", not "no partial effects" — effects already
    /// applied before the failing one stand).
    pub async fn apply_all(&self, effects: Vec<Effect>) -> Result<(), EffectError> {
        for effect in effects {
            self.apply_one(effect).await?;
        }
        Ok(())
    }

    async fn apply_one(&self, effect: Effect) -> Result<(), EffectError> {
        let mut attempt = 0;
        loop {
            let result = self.try_apply(&effect).await;
            match result {
                Ok(()) => return Ok(()),
                Err(EffectError::External(msg)) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %msg, "retrying effect after external failure");
                    tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_apply(&self, effect: &Effect) -> Result<(), EffectError> {
        match effect {
            Effect::SendResponse(msg) | Effect::DispatchMessage(msg) => {
                self.dispatcher.dispatch(msg.clone()).await?;
                Ok(())
            }
            Effect::PersistRecord { kind, payload } => {
                self.persistence
                    .append_record(kind, payload.clone())
                    .await
                    .map_err(|e| EffectError::External(e.to_string()))
            }
            Effect::UpdateStoryStatus { story_id, status } => {
                self.queue.update_story_status(story_id, *status).map_err(EffectError::from)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AgentId, MessageType, Payload};
    use crate::persistence::InMemoryPersistence;
    use crate::queue::{ExternalApi, QueuedStory, StoryType};
    use async_trait::async_trait;

    struct RecordingDispatcher {
        received: std::sync::Mutex<Vec<AgentMsg>>,
    }

    #[async_trait]
    impl DispatcherPort for RecordingDispatcher {
        async fn dispatch(&self, msg: AgentMsg) -> Result<(), crate::error::DispatchError> {
            self.received.lock().unwrap().push(msg);
            Ok(())
        }
    }

    fn setup() -> (EffectsRuntime, Arc<RecordingDispatcher>, Arc<StoryQueue>) {
        let dispatcher = Arc::new(RecordingDispatcher { received: std::sync::Mutex::new(vec![]) });
        let persistence = Arc::new(InMemoryPersistence::new());
        let queue = Arc::new(StoryQueue::new());
        let _api = ExternalApi::new(queue.clone());
        let runtime = EffectsRuntime::new(dispatcher.clone(), persistence, queue.clone());
        (runtime, dispatcher, queue)
    }

    #[tokio::test]
    async fn dispatch_effect_reaches_dispatcher() {
        let (runtime, dispatcher, _queue) = setup();
        let msg = AgentMsg::new(MessageType::Response, AgentId::from("coder-1"), AgentId::from("architect"), Payload::new());
        runtime.apply_all(vec![Effect::DispatchMessage(msg)]).await.unwrap();
        assert_eq!(dispatcher.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_story_status_effect_mutates_queue() {
        let (runtime, _dispatcher, queue) = setup();
        queue.add_story(QueuedStory::new("001", "t", "c", StoryType::App, Default::default(), 1)).unwrap();
        runtime
            .apply_all(vec![Effect::UpdateStoryStatus { story_id: "001".to_string(), status: StoryStatus::InProgress }])
            .await
            .unwrap();
        assert_eq!(queue.get_story("001").unwrap().status, StoryStatus::InProgress);
    }

    #[tokio::test]
    async fn effects_apply_in_order_and_stop_on_fatal_error() {
        let (runtime, _dispatcher, queue) = setup();
        let effects = vec![
            Effect::UpdateStoryStatus { story_id: "ghost".to_string(), status: StoryStatus::InProgress },
        ];
        let err = runtime.apply_all(effects).await.unwrap_err();
        assert!(matches!(err, EffectError::Queue(_)));
        assert!(queue.get_story("ghost").is_none());
    }
}
