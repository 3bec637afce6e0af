//! Thin external entry point for requeue-and-release flows.
//!
//! Invoked by the Dispatcher when it learns a Coder has failed. Acquires
//! only the queue's own mutex and never the Architect's state-machine lock,
//! keeping the lock order `Limiter < Queue < Dispatcher < Driver` acyclic.

use super::{QueuedStory, StoryQueue, StoryStatus};
use crate::error::QueueError;
use std::sync::Arc;

pub struct ExternalApi {
    queue: Arc<StoryQueue>,
}

impl ExternalApi {
    pub fn new(queue: Arc<StoryQueue>) -> Self {
        Self { queue }
    }

    /// 1. Verify the story is `in_progress`.
    /// 2. Transition `in_progress -> pending`.
    /// 3. Ready-set recomputation happens lazily on the next
    ///    `GetReadyStories` call; here we only wake any waiter.
    /// 4. The caller (Dispatcher) is responsible for notifying the
    ///    Architect via its own event path; this method only guarantees the
    ///    queue-side state is consistent and wakes `ready_notify`.
    pub fn requeue_and_release(&self, story_id: &str) -> Result<QueuedStory, QueueError> {
        let story = self.queue.get_story(story_id).ok_or_else(|| QueueError::NotFound(story_id.to_string()))?;
        if story.status != StoryStatus::InProgress {
            return Err(QueueError::NotInProgress(story_id.to_string()));
        }
        self.queue.requeue_story(story_id)?;
        Ok(self.queue.get_story(story_id).expect("story exists after requeue"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueuedStory, StoryType};
    use std::collections::BTreeSet;

    #[test]
    fn requeue_and_release_scenario() {
        let queue = Arc::new(StoryQueue::new());
        queue
            .add_story(QueuedStory::new("001", "t", "c", StoryType::App, BTreeSet::new(), 1))
            .unwrap();
        queue.update_story_status("001", StoryStatus::InProgress).unwrap();

        let api = ExternalApi::new(queue.clone());
        let story = api.requeue_and_release("001").unwrap();
        assert_eq!(story.status, StoryStatus::Pending);
        assert!(story.assigned_agent.is_none());

        let ready: Vec<String> = queue.get_ready_stories().into_iter().map(|s| s.id).collect();
        assert_eq!(ready, vec!["001".to_string()]);
    }

    #[test]
    fn requeue_rejects_non_in_progress() {
        let queue = Arc::new(StoryQueue::new());
        queue
            .add_story(QueuedStory::new("001", "t", "c", StoryType::App, BTreeSet::new(), 1))
            .unwrap();
        let api = ExternalApi::new(queue);
        assert_eq!(api.requeue_and_release("001").unwrap_err(), QueueError::NotInProgress("001".to_string()));
    }
}
