//! Bounded per-task store of execution events.
//!
//! Process-wide map from task name to a ring of the most recent events.
//! Nothing is persisted; history is lost on restart.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;

use crate::domain::models::event::Event;
use crate::domain::models::task::TaskStatus;

pub const DEFAULT_CAPACITY: usize = 5;

/// Append-only event rings, one per task, oldest entries evicted first.
pub struct EventStore {
    rings: RwLock<HashMap<String, VecDeque<Event>>>,
    capacity: usize,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append an event to its task's ring, evicting the oldest entry when
    /// the ring is full.
    pub fn write(&self, event: Event) {
        let mut rings = self.rings.write().expect("event store lock poisoned");
        let ring = rings.entry(event.task_name.clone()).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Events for one task, newest first. Empty when the task is unknown.
    pub fn task_events(&self, task_name: &str) -> Vec<Event> {
        let rings = self.rings.read().expect("event store lock poisoned");
        rings
            .get(task_name)
            .map(|ring| ring.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Events for every task, newest first per task.
    pub fn all_events(&self) -> BTreeMap<String, Vec<Event>> {
        let rings = self.rings.read().expect("event store lock poisoned");
        rings
            .iter()
            .map(|(name, ring)| (name.clone(), ring.iter().rev().cloned().collect()))
            .collect()
    }

    /// Status derived from a task's recent success history.
    pub fn task_status(&self, task_name: &str) -> TaskStatus {
        let rings = self.rings.read().expect("event store lock poisoned");
        let history: Vec<bool> = rings
            .get(task_name)
            .map(|ring| ring.iter().rev().map(|e| e.success).collect())
            .unwrap_or_default();
        TaskStatus::from_history(&history)
    }

    /// Drop a task's ring. Called when the task is deleted.
    pub fn delete_task(&self, task_name: &str) {
        let mut rings = self.rings.write().expect("event store lock poisoned");
        rings.remove(task_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::Event;
    use crate::domain::models::task::{Condition, ConsulKvMonitor, ModuleRef, Task};

    fn task(name: &str) -> Task {
        Task {
            name: name.to_string(),
            enabled: true,
            description: String::new(),
            module: ModuleRef {
                source: "./m".to_string(),
                version: None,
            },
            services: vec![],
            condition: Condition::ConsulKv(ConsulKvMonitor {
                path: "k".to_string(),
                ..Default::default()
            }),
            module_input: None,
            buffer: None,
            working_dir: None,
            variables: Default::default(),
        }
    }

    fn event(task_name: &str, success: bool) -> Event {
        let t = task(task_name);
        Event::start(&t).finish(if success { Ok(()) } else { Err("boom") })
    }

    #[test]
    fn ring_holds_newest_five_after_six_writes() {
        let store = EventStore::new(DEFAULT_CAPACITY);
        let mut ids = Vec::new();
        for _ in 0..6 {
            let e = event("t", true);
            ids.push(e.id);
            store.write(e);
        }
        let events = store.task_events("t");
        assert_eq!(events.len(), 5);
        // Newest first; the first write was evicted.
        assert_eq!(events[0].id, ids[5]);
        assert!(!events.iter().any(|e| e.id == ids[0]));
    }

    #[test]
    fn unknown_task_reads_empty_and_unknown() {
        let store = EventStore::default();
        assert!(store.task_events("nope").is_empty());
        assert_eq!(store.task_status("nope"), TaskStatus::Unknown);
    }

    #[test]
    fn status_tracks_consecutive_failures() {
        let store = EventStore::default();
        store.write(event("t", true));
        assert_eq!(store.task_status("t"), TaskStatus::Successful);
        store.write(event("t", false));
        assert_eq!(store.task_status("t"), TaskStatus::Errored);
        store.write(event("t", false));
        assert_eq!(store.task_status("t"), TaskStatus::Critical);
        store.write(event("t", true));
        assert_eq!(store.task_status("t"), TaskStatus::Successful);
    }

    #[test]
    fn delete_task_clears_ring() {
        let store = EventStore::default();
        store.write(event("t", true));
        store.delete_task("t");
        assert!(store.task_events("t").is_empty());
    }
}
