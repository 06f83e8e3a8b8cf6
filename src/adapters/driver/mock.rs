//! Scriptable driver for tests: counts calls and fails on demand.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::Task;
use crate::domain::ports::driver::{Driver, Plan, RunOption, TaskPatch};

pub struct MockDriver {
    task: StdMutex<Task>,
    pub render_calls: AtomicU32,
    pub inspect_calls: AtomicU32,
    pub apply_calls: AtomicU32,
    fail_apply: AtomicBool,
    plan_changes: AtomicBool,
    apply_delay: StdMutex<std::time::Duration>,
    op_lock: Mutex<()>,
    /// Observes the single-flight guarantee: set while an apply runs.
    in_apply: AtomicBool,
    pub overlapping_applies: AtomicU32,
}

impl MockDriver {
    pub fn new(task: Task) -> Self {
        Self {
            task: StdMutex::new(task),
            render_calls: AtomicU32::new(0),
            inspect_calls: AtomicU32::new(0),
            apply_calls: AtomicU32::new(0),
            fail_apply: AtomicBool::new(false),
            plan_changes: AtomicBool::new(false),
            apply_delay: StdMutex::new(std::time::Duration::from_millis(5)),
            op_lock: Mutex::new(()),
            in_apply: AtomicBool::new(false),
            overlapping_applies: AtomicU32::new(0),
        }
    }

    pub fn fail_next_applies(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn set_plan_changes(&self, changes: bool) {
        self.plan_changes.store(changes, Ordering::SeqCst);
    }

    pub fn set_apply_delay(&self, delay: std::time::Duration) {
        *self.apply_delay.lock().expect("mock lock") = delay;
    }

    pub fn applies(&self) -> u32 {
        self.apply_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn init(&self) -> DomainResult<()> {
        Ok(())
    }

    async fn init_task(&self) -> DomainResult<()> {
        Ok(())
    }

    async fn render_template(&self) -> DomainResult<bool> {
        let _op = self.op_lock.lock().await;
        self.render_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn inspect_task(&self) -> DomainResult<Plan> {
        let _op = self.op_lock.lock().await;
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Plan {
            changes_present: self.plan_changes.load(Ordering::SeqCst),
            text: "mock plan".to_string(),
        })
    }

    async fn apply_task(&self) -> DomainResult<()> {
        let _op = self.op_lock.lock().await;
        if self.in_apply.swap(true, Ordering::SeqCst) {
            self.overlapping_applies.fetch_add(1, Ordering::SeqCst);
        }
        // Let concurrent callers pile up if serialization is broken.
        let delay = *self.apply_delay.lock().expect("mock lock");
        tokio::time::sleep(delay).await;
        self.in_apply.store(false, Ordering::SeqCst);
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_apply.load(Ordering::SeqCst) {
            let task = self.task.lock().expect("mock lock").name.clone();
            return Err(DomainError::DriverApply {
                task,
                reason: "mock apply failure".to_string(),
            });
        }
        Ok(())
    }

    async fn update_task(&self, patch: TaskPatch) -> DomainResult<Option<Plan>> {
        if patch.run == Some(RunOption::Inspect) {
            return self.inspect_task().await.map(Some);
        }
        if let Some(enabled) = patch.enabled {
            self.task.lock().expect("mock lock").enabled = enabled;
        }
        Ok(None)
    }

    fn task(&self) -> Task {
        self.task.lock().expect("mock lock").clone()
    }

    async fn destroy_task(&self) {}
}
