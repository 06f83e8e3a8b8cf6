//! Controller: exclusive owner of the task set.
//!
//! Startup runs **once-mode**: every configured task is constructed, given
//! until a deadline to reach first-completion, and run exactly once. Only
//! then does the daemon enter steady state, where each task's runtime loop
//! reacts to notifications and the controller merely mediates API mutations
//! under a writer lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::event::Event;
use crate::domain::models::task::{BufferPeriod, Task, TaskStatus};
use crate::domain::ports::driver::{Driver, Plan, RunOption, TaskPatch};
use crate::services::event_store::EventStore;
use crate::services::task_runtime::{RunState, TaskHandle, TaskRuntime};
use crate::services::template::{MonitorGuard, Notification, TaskTemplate, TemplateEngine};

/// Builds the driver bound to one task. Injected so tests can substitute a
/// mock and `main` can pick the configured implementation.
pub type DriverFactory = Arc<dyn Fn(Task, TaskTemplate) -> Arc<dyn Driver> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Applied to tasks that do not set their own buffer.
    pub default_buffer: BufferPeriod,
    /// Once-mode deadline; tasks that miss it start erroring instead of
    /// blocking the daemon.
    pub once_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_buffer: BufferPeriod::default(),
            once_timeout: Duration::from_secs(60),
        }
    }
}

/// Aggregate counts over every task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSummary {
    pub successful: usize,
    pub errored: usize,
    pub critical: usize,
    pub unknown: usize,
    pub enabled: usize,
    pub disabled: usize,
}

/// Status of one task as reported by the API.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub task_name: String,
    pub status: TaskStatus,
    pub enabled: bool,
    pub condition: String,
    pub services: Vec<String>,
    pub events_url: String,
}

struct ManagedTask {
    driver: Arc<dyn Driver>,
    handle: Arc<TaskHandle>,
    guard: MonitorGuard,
}

/// A task that has been constructed but whose runtime is not started yet.
struct StagedTask {
    task: Task,
    driver: Arc<dyn Driver>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    first_completion: watch::Receiver<bool>,
    guard: MonitorGuard,
}

pub struct Controller {
    engine: TemplateEngine,
    events: Arc<EventStore>,
    drivers: DriverFactory,
    config: ControllerConfig,
    tasks: RwLock<HashMap<String, ManagedTask>>,
}

impl Controller {
    pub fn new(
        engine: TemplateEngine,
        events: Arc<EventStore>,
        drivers: DriverFactory,
        config: ControllerConfig,
    ) -> Self {
        Self {
            engine,
            events,
            drivers,
            config,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    fn normalize(&self, mut task: Task) -> Task {
        if task.buffer.is_none() {
            task.buffer = Some(self.config.default_buffer);
        }
        task
    }

    fn stage(&self, task: Task) -> DomainResult<StagedTask> {
        task.validate()?;
        let monitor = self.engine.register(&task)?;
        let (template, notifications, first_completion, guard) = monitor.into_parts();
        let driver = (self.drivers)(task.clone(), template);
        Ok(StagedTask {
            task,
            driver,
            notifications,
            first_completion,
            guard,
        })
    }

    /// Once-mode startup. Construct every configured task, wait until each
    /// signals first-completion or the deadline passes, run one synchronous
    /// inspect-or-apply per completed task, then start the runtimes.
    pub async fn init_once(&self, tasks: Vec<Task>, inspect: bool) -> DomainResult<()> {
        let mut staged = Vec::new();
        for task in tasks {
            let task = self.normalize(task);
            if staged
                .iter()
                .any(|s: &StagedTask| s.task.name == task.name)
            {
                return Err(DomainError::ConfigInvalid(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
            staged.push(self.stage(task)?);
        }

        let deadline = Instant::now() + self.config.once_timeout;
        for s in &mut staged {
            if !s.task.enabled {
                continue;
            }
            let completed = tokio::time::timeout_at(
                deadline,
                s.first_completion.wait_for(|done| *done),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

            if completed {
                let recorder = Event::start(&s.driver.task());
                let result = run_once(s.driver.as_ref(), inspect).await;
                if let Err(err) = &result {
                    tracing::error!(
                        target: "catsync::controller",
                        task = %s.task.name,
                        error = %err,
                        "once-mode run failed"
                    );
                }
                self.events
                    .write(recorder.finish(result.map_err(|e| e.to_string())));
            } else {
                tracing::error!(
                    target: "catsync::controller",
                    task = %s.task.name,
                    "task did not reach first-completion before the once-mode deadline"
                );
                let recorder = Event::start(&s.driver.task());
                self.events.write(recorder.finish(Err::<(), _>(
                    "dependencies unresolved at once-mode deadline",
                )));
            }
        }

        let mut map = self.tasks.write().await;
        for s in staged {
            let initial_run_done = *s.first_completion.borrow() && s.task.enabled;
            let handle = Arc::new(
                TaskRuntime {
                    task: s.task.clone(),
                    driver: Arc::clone(&s.driver),
                    events: Arc::clone(&self.events),
                    notifications: s.notifications,
                    initial_run_done,
                }
                .spawn(),
            );
            map.insert(
                s.task.name.clone(),
                ManagedTask {
                    driver: s.driver,
                    handle,
                    guard: s.guard,
                },
            );
        }
        tracing::info!(
            target: "catsync::controller",
            tasks = map.len(),
            "once-mode complete, entering steady state"
        );
        Ok(())
    }

    /// Create a task at runtime. `run=inspect` dry-runs and discards the
    /// task; `run=now` waits for first-completion and applies immediately.
    pub async fn create_task(
        &self,
        task: Task,
        run: Option<RunOption>,
    ) -> DomainResult<Option<Plan>> {
        let task = self.normalize(task);
        task.validate()?;
        {
            let map = self.tasks.read().await;
            if map.contains_key(&task.name) {
                return Err(DomainError::ValidationFailed(format!(
                    "task '{}' already exists",
                    task.name
                )));
            }
        }

        let mut staged = self.stage(task)?;
        match run {
            Some(RunOption::Inspect) => {
                let result = self.first_completion_then(&mut staged, true).await;
                staged.guard.release(self.engine.watcher());
                return result;
            }
            Some(RunOption::Now) => {
                if let Err(err) = self.first_completion_then(&mut staged, false).await {
                    staged.guard.release(self.engine.watcher());
                    return Err(err);
                }
                let recorder = Event::start(&staged.driver.task());
                self.events.write(recorder.finish(Ok::<(), String>(())));
            }
            None => {}
        }

        let initial_run_done = matches!(run, Some(RunOption::Now));
        let mut map = self.tasks.write().await;
        if map.contains_key(&staged.task.name) {
            staged.guard.release(self.engine.watcher());
            return Err(DomainError::ValidationFailed(format!(
                "task '{}' already exists",
                staged.task.name
            )));
        }
        let handle = Arc::new(self.start_runtime(
            &staged.task,
            &staged.driver,
            staged.notifications,
            initial_run_done,
        ));
        map.insert(
            staged.task.name.clone(),
            ManagedTask {
                driver: staged.driver,
                handle,
                guard: staged.guard,
            },
        );
        Ok(None)
    }

    fn start_runtime(
        &self,
        task: &Task,
        driver: &Arc<dyn Driver>,
        notifications: mpsc::UnboundedReceiver<Notification>,
        initial_run_done: bool,
    ) -> TaskHandle {
        TaskRuntime {
            task: task.clone(),
            driver: Arc::clone(driver),
            events: Arc::clone(&self.events),
            notifications,
            initial_run_done,
        }
        .spawn()
    }

    /// Wait for first-completion (bounded by the once deadline), render, and
    /// either inspect or apply.
    async fn first_completion_then(
        &self,
        staged: &mut StagedTask,
        inspect: bool,
    ) -> DomainResult<Option<Plan>> {
        tokio::time::timeout(
            self.config.once_timeout,
            staged.first_completion.wait_for(|done| *done),
        )
        .await
        .map_err(|_| DomainError::TemplateRender {
            task: staged.task.name.clone(),
            reason: "dependencies unresolved".to_string(),
        })?
        .map_err(|_| DomainError::TaskNotFound(staged.task.name.clone()))?;

        staged.driver.render_template().await?;
        if inspect {
            staged.driver.inspect_task().await.map(Some)
        } else {
            staged.driver.apply_task().await.map(|()| None)
        }
    }

    /// Patch a task (enabled toggle, optional run). Returns the plan for
    /// `run=inspect` patches. The lock guards only the map lookup; the run
    /// itself is serialised by the task's own runtime.
    pub async fn patch_task(&self, name: &str, patch: TaskPatch) -> DomainResult<Option<Plan>> {
        let handle = {
            let map = self.tasks.write().await;
            let managed = map
                .get(name)
                .ok_or_else(|| DomainError::TaskNotFound(name.to_string()))?;
            Arc::clone(&managed.handle)
        };
        handle.patch(patch).await
    }

    /// Delete a task and its events. Refused while a run is in flight.
    pub async fn delete_task(&self, name: &str) -> DomainResult<()> {
        let mut map = self.tasks.write().await;
        let managed = map
            .remove(name)
            .ok_or_else(|| DomainError::TaskNotFound(name.to_string()))?;
        if managed.handle.is_running() {
            map.insert(name.to_string(), managed);
            return Err(DomainError::TaskActive(name.to_string()));
        }
        drop(map);

        managed.handle.shutdown();
        managed.guard.release(self.engine.watcher());
        managed.driver.destroy_task().await;
        self.events.delete_task(name);
        tracing::info!(target: "catsync::controller", task = %name, "task deleted");
        Ok(())
    }

    pub async fn task(&self, name: &str) -> DomainResult<Task> {
        let map = self.tasks.read().await;
        map.get(name)
            .map(|m| m.driver.task())
            .ok_or_else(|| DomainError::TaskNotFound(name.to_string()))
    }

    pub async fn task_status(&self, name: &str) -> DomainResult<TaskStatusReport> {
        let map = self.tasks.read().await;
        let managed = map
            .get(name)
            .ok_or_else(|| DomainError::TaskNotFound(name.to_string()))?;
        Ok(self.report(name, managed))
    }

    pub async fn task_statuses(&self) -> Vec<TaskStatusReport> {
        let map = self.tasks.read().await;
        let mut reports: Vec<TaskStatusReport> = map
            .iter()
            .map(|(name, managed)| self.report(name, managed))
            .collect();
        reports.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        reports
    }

    pub async fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for report in self.task_statuses().await {
            match report.status {
                TaskStatus::Successful => summary.successful += 1,
                TaskStatus::Errored => summary.errored += 1,
                TaskStatus::Critical => summary.critical += 1,
                TaskStatus::Unknown => summary.unknown += 1,
            }
            if report.enabled {
                summary.enabled += 1;
            } else {
                summary.disabled += 1;
            }
        }
        summary
    }

    fn report(&self, name: &str, managed: &ManagedTask) -> TaskStatusReport {
        let task = managed.driver.task();
        let status = match managed.handle.state() {
            // Driver-init style failures surface as critical regardless of
            // event history.
            RunState::Critical => TaskStatus::Critical,
            _ => self.events.task_status(name),
        };
        TaskStatusReport {
            task_name: name.to_string(),
            status,
            enabled: task.enabled,
            condition: task.condition.kind().to_string(),
            services: task
                .watched_services()
                .into_iter()
                .map(|s| s.name)
                .collect(),
            events_url: format!("/v1/status/tasks/{name}?include=events"),
        }
    }

    /// Stop every runtime and watcher poll. Called on daemon shutdown.
    pub async fn shutdown(&self) {
        let mut map = self.tasks.write().await;
        for (_, managed) in map.drain() {
            managed.handle.shutdown();
            managed.guard.release(self.engine.watcher());
        }
        self.engine.watcher().stop();
    }
}

async fn run_once(driver: &dyn Driver, inspect: bool) -> DomainResult<()> {
    driver.render_template().await?;
    if inspect {
        driver.inspect_task().await.map(|_| ())
    } else {
        driver.apply_task().await
    }
}
