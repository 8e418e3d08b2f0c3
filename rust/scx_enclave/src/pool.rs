//! Thread-safe task pool.
//!
//! The pool owns every task record; runqueues and per-CPU `current` slots
//! hold `Arc` clones, so a record is only dropped once every holder lets
//! go. Capacity is reserved up front: a scheduler that needs to allocate
//! must not fail mid-flight, so exceeding the pool is fatal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::types::Gtid;

pub struct TaskPool<T> {
    max_tasks: usize,
    tasks: Mutex<HashMap<Gtid, Arc<T>>>,
}

impl<T> TaskPool<T> {
    pub fn new(max_tasks: usize) -> Self {
        TaskPool {
            max_tasks,
            tasks: Mutex::new(HashMap::with_capacity(max_tasks)),
        }
    }

    /// Register a freshly built task. Duplicate gtids and pool exhaustion
    /// are programming errors.
    pub fn insert(&self, gtid: Gtid, task: Arc<T>) {
        let mut tasks = self.tasks.lock().unwrap();
        assert!(tasks.len() < self.max_tasks, "task pool exhausted");
        let prev = tasks.insert(gtid, task);
        assert!(prev.is_none(), "task {gtid} allocated twice");
    }

    pub fn get(&self, gtid: Gtid) -> Option<Arc<T>> {
        self.tasks.lock().unwrap().get(&gtid).cloned()
    }

    /// Return the record to the pool. The caller must be the unique handler
    /// that observed the task's departure or death.
    pub fn free(&self, gtid: Gtid) -> Arc<T> {
        self.tasks
            .lock()
            .unwrap()
            .remove(&gtid)
            .unwrap_or_else(|| panic!("free of unknown task {gtid}"))
    }

    pub fn for_each(&self, mut f: impl FnMut(Gtid, &Arc<T>)) {
        let tasks = self.tasks.lock().unwrap();
        let mut gtids: Vec<Gtid> = tasks.keys().copied().collect();
        gtids.sort();
        for gtid in gtids {
            f(gtid, &tasks[&gtid]);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }
}
