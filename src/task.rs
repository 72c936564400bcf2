//! Schedulable tasks and the time-ordered task queue
//!
//! A task is *idle* while it sits in the ordered set waiting for its
//! `scheduled` time. Popping it makes it *queued*; the scheduler then
//! either dispatches it (*running*) or puts it back for the next tick.
//! Only the task's own completion moves `scheduled` forward.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::interval::Delay;
use crate::plugin::Plugin;
use crate::{CheckResult, LogMeta};

pub type TaskId = u64;

/// One item of the desired check list for a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRequest {
    pub itemid: u64,
    pub key: String,
    pub delay: String,
    pub lastlogsize: u64,
    pub mtime: i64,
}

/// Receives the results produced for one client
#[async_trait]
pub trait ResultWriter: Send + Sync {
    async fn write(&self, result: CheckResult);
}

/// Writer that hands exactly one result to a waiting caller
#[derive(Debug)]
pub struct SingleResult {
    sender: Mutex<Option<oneshot::Sender<CheckResult>>>,
}

impl SingleResult {
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<CheckResult>) {
        let (tx, rx) = oneshot::channel();
        let writer = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
        });
        (writer, rx)
    }
}

#[async_trait]
impl ResultWriter for SingleResult {
    async fn write(&self, result: CheckResult) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // the caller may have given up waiting
            let _ = sender.send(result);
        }
    }
}

/// What an exporter or passive task evaluates
#[derive(Clone)]
pub struct ExportItem {
    pub itemid: u64,
    pub client_id: u64,
    /// Key text as configured
    pub key: String,
    pub name: String,
    pub params: Vec<String>,
    pub delay: Delay,
    pub delay_text: String,
    pub log: Option<LogMeta>,
    pub writer: Arc<dyn ResultWriter>,
}

impl std::fmt::Debug for ExportItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportItem")
            .field("itemid", &self.itemid)
            .field("client_id", &self.client_id)
            .field("key", &self.key)
            .field("delay", &self.delay_text)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Periodic data gathering of a collector plugin
    Collector,
    /// Active check of one item
    Exporter(ExportItem),
    /// Single-shot evaluation; removed after it completes
    PassiveCheck(ExportItem),
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Collector => "collector",
            TaskKind::Exporter(_) => "exporter",
            TaskKind::PassiveCheck(_) => "passive",
        }
    }
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub plugin: Arc<Plugin>,
    pub scheduled: DateTime<Utc>,
    pub kind: TaskKind,
    pub running: bool,
}

impl Task {
    /// Units of plugin capacity the task holds while running
    pub fn weight(&self) -> u32 {
        match self.kind {
            TaskKind::Collector => 0,
            TaskKind::Exporter(_) | TaskKind::PassiveCheck(_) => 1,
        }
    }
}

/// Tasks keyed by id, idle ones ordered by scheduled time
#[derive(Debug, Default)]
pub struct TaskQueue {
    idle: BTreeSet<(DateTime<Utc>, TaskId)>,
    tasks: HashMap<TaskId, Task>,
    next_id: TaskId,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an idle task
    pub fn insert(&mut self, plugin: Arc<Plugin>, scheduled: DateTime<Utc>, kind: TaskKind) -> TaskId {
        self.next_id += 1;
        let id = self.next_id;
        self.tasks.insert(
            id,
            Task {
                id,
                plugin,
                scheduled,
                kind,
                running: false,
            },
        );
        self.idle.insert((scheduled, id));
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let task = self.tasks.remove(&id)?;
        self.idle.remove(&(task.scheduled, id));
        Some(task)
    }

    /// Take every idle task due at `now`, earliest first
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut due = Vec::new();
        while let Some(&(scheduled, id)) = self.idle.first() {
            if scheduled > now {
                break;
            }
            self.idle.pop_first();
            due.push(id);
        }
        due
    }

    /// Put a popped task back as idle at `at`
    pub fn requeue(&mut self, id: TaskId, at: DateTime<Utc>) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        self.idle.remove(&(task.scheduled, id));
        task.scheduled = at;
        task.running = false;
        self.idle.insert((at, id));
        true
    }

    /// Move an idle task to a new time; running tasks keep theirs until
    /// they complete
    pub fn reschedule_idle(&mut self, id: TaskId, at: DateTime<Utc>) -> bool {
        match self.tasks.get(&id) {
            Some(task) if self.idle.contains(&(task.scheduled, id)) => self.requeue(id, at),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::agent;
    use chrono::Duration;

    fn plugin() -> Arc<Plugin> {
        Arc::new(agent::plugin("test"))
    }

    #[test]
    fn test_pop_due_in_time_order() {
        let mut queue = TaskQueue::new();
        let now = Utc::now();
        let late = queue.insert(plugin(), now + Duration::seconds(10), TaskKind::Collector);
        let second = queue.insert(plugin(), now - Duration::seconds(1), TaskKind::Collector);
        let first = queue.insert(plugin(), now - Duration::seconds(5), TaskKind::Collector);

        assert_eq!(queue.pop_due(now), vec![first, second]);
        assert_eq!(queue.idle_len(), 1);
        assert_eq!(queue.len(), 3);
        assert!(!queue.reschedule_idle(first, now));
        assert!(queue.reschedule_idle(late, now + Duration::seconds(20)));
        assert_eq!(queue.get(late).unwrap().scheduled, now + Duration::seconds(20));
    }

    #[test]
    fn test_requeue_and_remove() {
        let mut queue = TaskQueue::new();
        let now = Utc::now();
        let id = queue.insert(plugin(), now, TaskKind::Collector);
        assert_eq!(queue.pop_due(now), vec![id]);

        // popped tasks are not moved by idle rescheduling
        assert!(!queue.reschedule_idle(id, now + Duration::seconds(1)));
        assert!(queue.requeue(id, now + Duration::seconds(30)));
        assert!(queue.pop_due(now).is_empty());
        assert!(queue.reschedule_idle(id, now + Duration::seconds(5)));
        assert_eq!(queue.get(id).unwrap().scheduled, now + Duration::seconds(5));

        assert!(queue.remove(id).is_some());
        assert!(queue.is_empty());
        assert_eq!(queue.idle_len(), 0);
        assert!(!queue.requeue(id, now));
    }

    #[tokio::test]
    async fn test_single_result_delivers_once() {
        let (writer, rx) = SingleResult::channel();
        writer.write(CheckResult::error(1, "first")).await;
        writer.write(CheckResult::error(1, "second")).await;
        assert_eq!(rx.await.unwrap().error_message(), Some("first"));
    }
}
