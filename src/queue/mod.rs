//! Dependency-aware story queue.
//!
//! A single-mutex-guarded store with explicit status transitions, moving
//! from a flat pending/running/completed/failed/retrying set to a richer
//! dependency-aware lifecycle, and from a SQLite-backed queue to an
//! in-process one (durability is a persistence-layer concern, not the
//! queue's).

mod external_api;

pub use external_api::ExternalApi;

use crate::error::QueueError;
use crate::message::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryType {
    App,
    Devops,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    WaitingReview,
    Completed,
    Done,
    AwaitHumanFeedback,
}

impl StoryStatus {
    /// `completed`/`done` are terminal except via the explicit requeue
    /// exemption, and satisfied-dependency checks only accept these two.
    pub fn is_terminal(self) -> bool {
        matches!(self, StoryStatus::Completed | StoryStatus::Done)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedStory {
    pub id: String,
    pub title: String,
    pub content: String,
    pub knowledge_pack: Option<String>,
    pub story_type: StoryType,
    pub status: StoryStatus,
    pub depends_on: BTreeSet<String>,
    pub estimated_points: u32,
    pub assigned_agent: Option<AgentId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub file_path: Option<String>,
}

impl QueuedStory {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        story_type: StoryType,
        depends_on: BTreeSet<String>,
        estimated_points: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            knowledge_pack: None,
            story_type,
            status: StoryStatus::Pending,
            depends_on,
            estimated_points,
            assigned_agent: None,
            started_at: None,
            completed_at: None,
            last_updated: now,
            file_path: None,
        }
    }
}

struct Inner {
    stories: HashMap<String, QueuedStory>,
    /// Insertion order, used as the final tiebreaker in `NextReadyStory`.
    insertion_order: Vec<String>,
}

/// Single queue-wide mutex. All mutation and every read go through this
/// lock; `get_ready_stories` recomputes from scratch rather than caching,
/// keeping the ready-set invariant obvious at the cost of an O(n) scan.
pub struct StoryQueue {
    inner: Mutex<Inner>,
    /// Woken whenever a mutation could have changed the ready set, so the
    /// Architect's Monitoring loop can `select!` on it alongside its mailbox.
    pub ready_notify: tokio::sync::Notify,
}

impl StoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { stories: HashMap::new(), insertion_order: Vec::new() }),
            ready_notify: tokio::sync::Notify::new(),
        }
    }

    pub fn add_story(&self, story: QueuedStory) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stories.contains_key(&story.id) {
            return Err(QueueError::DuplicateId(story.id));
        }
        for dep in &story.depends_on {
            if !inner.stories.contains_key(dep) {
                return Err(QueueError::UnknownDependency(dep.clone()));
            }
        }
        if would_cycle(&inner.stories, &story.id, &story.depends_on) {
            return Err(QueueError::CycleDetected(story.id));
        }
        inner.insertion_order.push(story.id.clone());
        inner.stories.insert(story.id.clone(), story);
        drop(inner);
        self.ready_notify.notify_waiters();
        Ok(())
    }

    pub fn add_maintenance_story(&self, mut story: QueuedStory) -> Result<(), QueueError> {
        story.story_type = StoryType::Maintenance;
        self.add_story(story)
    }

    pub fn update_story_status(&self, id: &str, status: StoryStatus) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let story = inner.stories.get(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if story.status.is_terminal() {
            // Idempotent no-op when re-applying the same terminal status.
            if story.status == status {
                return Ok(());
            }
            return Err(QueueError::TerminalStory(id.to_string()));
        }

        let story = inner.stories.get_mut(id).unwrap();
        story.status = status;
        story.last_updated = Utc::now();
        match status {
            StoryStatus::InProgress => {
                story.started_at.get_or_insert(Utc::now());
            }
            StoryStatus::Completed | StoryStatus::Done => {
                story.completed_at.get_or_insert(Utc::now());
            }
            _ => {}
        }
        drop(inner);
        self.ready_notify.notify_waiters();
        Ok(())
    }

    /// Sanctioned path back to `pending` from `in_progress`, used by
    /// `ExternalApi::requeue_and_release` on coder failure.
    pub fn requeue_story(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let story = inner.stories.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if story.status != StoryStatus::InProgress {
            return Err(QueueError::NotInProgress(id.to_string()));
        }
        story.status = StoryStatus::Pending;
        story.assigned_agent = None;
        story.last_updated = Utc::now();
        drop(inner);
        self.ready_notify.notify_waiters();
        Ok(())
    }

    pub fn get_story(&self, id: &str) -> Option<QueuedStory> {
        self.inner.lock().unwrap().stories.get(id).cloned()
    }

    pub fn get_all_stories(&self) -> Vec<QueuedStory> {
        let inner = self.inner.lock().unwrap();
        inner.insertion_order.iter().filter_map(|id| inner.stories.get(id).cloned()).collect()
    }

    pub fn get_stories_by_status(&self, status: StoryStatus) -> Vec<QueuedStory> {
        self.get_all_stories().into_iter().filter(|s| s.status == status).collect()
    }

    /// A story is ready iff it is pending and every dependency is
    /// completed or done.
    pub fn get_ready_stories(&self) -> Vec<QueuedStory> {
        let inner = self.inner.lock().unwrap();
        let mut ready: Vec<&QueuedStory> = inner
            .insertion_order
            .iter()
            .filter_map(|id| inner.stories.get(id))
            .filter(|s| {
                s.status == StoryStatus::Pending
                    && s.depends_on.iter().all(|dep| {
                        inner.stories.get(dep).map(|d| d.status.is_terminal()).unwrap_or(false)
                    })
            })
            .collect();

        let order_index: HashMap<&str, usize> =
            inner.insertion_order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

        ready.sort_by(|a, b| {
            let a_maint = a.story_type != StoryType::Maintenance;
            let b_maint = b.story_type != StoryType::Maintenance;
            a_maint
                .cmp(&b_maint)
                .then(a.estimated_points.cmp(&b.estimated_points))
                .then(order_index[a.id.as_str()].cmp(&order_index[b.id.as_str()]))
        });

        ready.into_iter().cloned().collect()
    }

    /// Returns one ready story without mutating status; assignment is the
    /// caller's responsibility.
    pub fn next_ready_story(&self) -> Option<QueuedStory> {
        self.get_ready_stories().into_iter().next()
    }
}

impl Default for StoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// DFS from the new node's dependency edges, checking whether any
/// transitive dependency reaches back to the new node's own id.
fn would_cycle(stories: &HashMap<String, QueuedStory>, new_id: &str, new_deps: &BTreeSet<String>) -> bool {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = new_deps.iter().map(String::as_str).collect();
    while let Some(cur) = stack.pop() {
        if cur == new_id {
            return true;
        }
        if !visited.insert(cur) {
            continue;
        }
        if let Some(story) = stories.get(cur) {
            stack.extend(story.depends_on.iter().map(String::as_str));
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str, deps: &[&str]) -> QueuedStory {
        QueuedStory::new(id, id, "content", StoryType::App, deps.iter().map(|s| s.to_string()).collect(), 1)
    }

    #[test]
    fn dependency_ordering_scenario() {
        let q = StoryQueue::new();
        q.add_story(story("001", &[])).unwrap();
        q.add_story(story("002", &["001"])).unwrap();

        let ready: Vec<String> = q.get_ready_stories().into_iter().map(|s| s.id).collect();
        assert_eq!(ready, vec!["001".to_string()]);

        q.update_story_status("001", StoryStatus::Done).unwrap();
        let ready: Vec<String> = q.get_ready_stories().into_iter().map(|s| s.id).collect();
        assert_eq!(ready, vec!["002".to_string()]);
    }

    #[test]
    fn unknown_dependency_rejected() {
        let q = StoryQueue::new();
        let err = q.add_story(story("002", &["ghost"])).unwrap_err();
        assert_eq!(err, QueueError::UnknownDependency("ghost".to_string()));
    }

    #[test]
    fn duplicate_id_rejected() {
        let q = StoryQueue::new();
        q.add_story(story("001", &[])).unwrap();
        assert_eq!(q.add_story(story("001", &[])).unwrap_err(), QueueError::DuplicateId("001".to_string()));
    }

    #[test]
    fn terminal_status_rejects_further_transitions_except_requeue() {
        let q = StoryQueue::new();
        q.add_story(story("001", &[])).unwrap();
        q.update_story_status("001", StoryStatus::InProgress).unwrap();
        q.update_story_status("001", StoryStatus::Done).unwrap();

        assert_eq!(
            q.update_story_status("001", StoryStatus::Pending).unwrap_err(),
            QueueError::TerminalStory("001".to_string())
        );
        // Idempotent re-application of the same terminal status succeeds.
        q.update_story_status("001", StoryStatus::Done).unwrap();
    }

    #[test]
    fn requeue_only_from_in_progress() {
        let q = StoryQueue::new();
        q.add_story(story("001", &[])).unwrap();
        assert_eq!(
            q.requeue_story("001").unwrap_err(),
            QueueError::NotInProgress("001".to_string())
        );
        q.update_story_status("001", StoryStatus::InProgress).unwrap();
        q.requeue_story("001").unwrap();
        assert_eq!(q.get_story("001").unwrap().status, StoryStatus::Pending);
    }

    #[test]
    fn ready_ordering_prefers_maintenance_then_points_then_insertion() {
        let q = StoryQueue::new();
        q.add_story(story("a", &[])).unwrap();
        let mut maint = story("b", &[]);
        maint.story_type = StoryType::Maintenance;
        q.add_story(maint).unwrap();
        let mut small = story("c", &[]);
        small.estimated_points = 0;
        q.add_story(small).unwrap();

        let ready: Vec<String> = q.get_ready_stories().into_iter().map(|s| s.id).collect();
        assert_eq!(ready, vec!["b".to_string(), "c".to_string(), "a".to_string()]);
    }

    #[test]
    fn add_story_round_trips_pointwise() {
        let q = StoryQueue::new();
        let s = story("001", &[]);
        q.add_story(s.clone()).unwrap();
        let fetched = q.get_story("001").unwrap();
        assert_eq!(fetched.id, s.id);
        assert_eq!(fetched.title, s.title);
        assert_eq!(fetched.depends_on, s.depends_on);
    }
}
