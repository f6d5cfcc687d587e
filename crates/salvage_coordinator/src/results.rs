//! Bounded store of terminal task snapshots.

use crate::task::TaskSnapshot;
use salvage_protocol::TaskId;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Keeps the newest N terminals, or T seconds worth, whichever bound bites
/// first. Owned by the scheduler task.
pub struct ResultStore {
    max_entries: usize,
    max_age: Duration,
    order: VecDeque<(TaskId, Instant)>,
    by_id: HashMap<TaskId, TaskSnapshot>,
}

impl ResultStore {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        Self {
            max_entries,
            max_age,
            order: VecDeque::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn insert(&mut self, snapshot: TaskSnapshot) {
        self.order
            .push_back((snapshot.task_id.clone(), Instant::now()));
        self.by_id.insert(snapshot.task_id.clone(), snapshot);
        self.prune();
    }

    /// Stable snapshot lookup. Absence means either never-seen or evicted;
    /// callers distinguish "still running" via the scheduler.
    pub fn get(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        self.by_id.get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drop entries over the count bound or past the age bound.
    pub fn prune(&mut self) {
        let now = Instant::now();
        while let Some((task_id, inserted)) = self.order.front() {
            let over_count = self.order.len() > self.max_entries;
            let over_age = now.duration_since(*inserted) >= self.max_age;
            if !over_count && !over_age {
                break;
            }
            let task_id = task_id.clone();
            self.order.pop_front();
            self.by_id.remove(&task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskSpec};
    use salvage_protocol::TaskState;
    use serde_json::json;

    fn snapshot() -> TaskSnapshot {
        let spec: TaskSpec = serde_json::from_value(json!({ "task_type": "echo" })).unwrap();
        let mut task = Task::from_spec(spec, 300, 3);
        task.state = TaskState::Success;
        task.snapshot()
    }

    #[test]
    fn test_lookup_after_insert() {
        let mut store = ResultStore::new(10, Duration::from_secs(60));
        let snap = snapshot();
        let id = snap.task_id.clone();
        store.insert(snap);
        assert_eq!(store.get(&id).unwrap().state, TaskState::Success);
        assert!(store.get(&TaskId::from("missing")).is_none());
    }

    #[test]
    fn test_count_retention_evicts_oldest() {
        let mut store = ResultStore::new(2, Duration::from_secs(60));
        let first = snapshot();
        let first_id = first.task_id.clone();
        store.insert(first);
        store.insert(snapshot());
        store.insert(snapshot());
        assert_eq!(store.len(), 2);
        assert!(store.get(&first_id).is_none());
    }

    #[test]
    fn test_age_retention() {
        let mut store = ResultStore::new(10, Duration::from_millis(30));
        let snap = snapshot();
        let id = snap.task_id.clone();
        store.insert(snap);
        std::thread::sleep(Duration::from_millis(50));
        store.prune();
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }
}
