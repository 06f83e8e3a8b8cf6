//! Per-task runtime: the state machine that turns filtered notifications
//! into driver runs.
//!
//! Each runtime is one spawned loop. Notifications, buffer expiry, cron
//! ticks, and control messages all funnel through a single `select`, so
//! driver operations for a task are strictly serialised: there is never more
//! than one render/inspect/apply in flight per task.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::event::Event;
use crate::domain::models::task::{BufferPeriod, Condition, Task};
use crate::domain::ports::driver::{Driver, Plan, RunOption, TaskPatch};
use crate::services::event_store::EventStore;
use crate::services::template::Notification;

/// Lifecycle state of a task runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Disabled,
    Idle,
    Buffering,
    Running,
    Erroring,
    Critical,
}

/// Resettable `(min, max)` coalescing window.
///
/// `min` restarts on every signal; `max` is anchored at the first signal of
/// the burst. The window fires at whichever comes first.
#[derive(Debug, Clone, Copy)]
struct BufferWindow {
    first_signal_at: Instant,
    last_signal_at: Instant,
    min: Duration,
    max: Duration,
}

impl BufferWindow {
    fn open(period: BufferPeriod, now: Instant) -> Self {
        Self {
            first_signal_at: now,
            last_signal_at: now,
            min: period.min,
            max: period.max,
        }
    }

    fn signal(&mut self, now: Instant) {
        self.last_signal_at = now;
    }

    fn fire_at(&self) -> Instant {
        (self.last_signal_at + self.min).min(self.first_signal_at + self.max)
    }
}

enum TaskControl {
    Patch {
        patch: TaskPatch,
        reply: oneshot::Sender<DomainResult<Option<Plan>>>,
    },
    Run {
        run: RunOption,
        reply: oneshot::Sender<DomainResult<Option<Plan>>>,
    },
    Shutdown,
}

/// Controller-side handle to a running task.
pub struct TaskHandle {
    name: String,
    control: mpsc::UnboundedSender<TaskControl>,
    in_flight: Arc<AtomicBool>,
    state: Arc<StdMutex<RunState>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a driver run is in flight right now.
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().expect("run state lock")
    }

    /// Apply an API patch: enabled toggle and/or an immediate run option.
    pub async fn patch(&self, patch: TaskPatch) -> DomainResult<Option<Plan>> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(TaskControl::Patch { patch, reply })
            .map_err(|_| DomainError::TaskNotFound(self.name.clone()))?;
        rx.await
            .map_err(|_| DomainError::TaskNotFound(self.name.clone()))?
    }

    /// Run the task immediately (`now`) or dry-run it (`inspect`).
    pub async fn run(&self, run: RunOption) -> DomainResult<Option<Plan>> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(TaskControl::Run { run, reply })
            .map_err(|_| DomainError::TaskNotFound(self.name.clone()))?;
        rx.await
            .map_err(|_| DomainError::TaskNotFound(self.name.clone()))?
    }

    /// Stop the loop. An in-flight run completes first; a pending buffer is
    /// dropped.
    pub fn shutdown(&self) {
        let _ = self.control.send(TaskControl::Shutdown);
    }
}

/// Spawn parameters for one task runtime.
pub struct TaskRuntime {
    pub task: Task,
    pub driver: Arc<dyn Driver>,
    pub events: Arc<EventStore>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    /// Set when once-mode already ran this task's initial pass, so the
    /// first-completion notification left in the channel is not run twice.
    pub initial_run_done: bool,
}

impl TaskRuntime {
    pub fn spawn(self) -> TaskHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicBool::new(false));
        let initial_state = if self.task.enabled {
            RunState::Idle
        } else {
            RunState::Disabled
        };
        let state = Arc::new(StdMutex::new(initial_state));
        let name = self.task.name.clone();

        let worker = Worker {
            name: name.clone(),
            buffer: self.task.effective_buffer(),
            cron: match &self.task.condition {
                Condition::Schedule { cron } => cron::Schedule::from_str(cron).ok(),
                _ => None,
            },
            driver: self.driver,
            events: self.events,
            notifications: self.notifications,
            control: control_rx,
            enabled: self.task.enabled,
            handled_first_completion: self.initial_run_done,
            pending_while_disabled: false,
            window: None,
            consecutive_failures: 0,
            in_flight: Arc::clone(&in_flight),
            state: Arc::clone(&state),
        };
        tokio::spawn(worker.run());

        TaskHandle {
            name,
            control: control_tx,
            in_flight,
            state,
        }
    }
}

struct Worker {
    name: String,
    buffer: Option<BufferPeriod>,
    cron: Option<cron::Schedule>,
    driver: Arc<dyn Driver>,
    events: Arc<EventStore>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    control: mpsc::UnboundedReceiver<TaskControl>,
    enabled: bool,
    handled_first_completion: bool,
    pending_while_disabled: bool,
    window: Option<BufferWindow>,
    consecutive_failures: u32,
    in_flight: Arc<AtomicBool>,
    state: Arc<StdMutex<RunState>>,
}

impl Worker {
    async fn run(mut self) {
        let mut notifications_open = true;
        loop {
            let buffer_expiry = self.window.map(|w| w.fire_at());
            let cron_tick = self.next_cron_tick();

            tokio::select! {
                note = self.notifications.recv(), if notifications_open => match note {
                    Some(note) => self.on_notification(note),
                    // Engine gone; cron ticks and control remain live.
                    None => notifications_open = false,
                },
                ctrl = self.control.recv() => {
                    let Some(ctrl) = ctrl else { return };
                    if self.on_control(ctrl).await { return; }
                }
                _ = sleep_until_opt(buffer_expiry) => {
                    self.window = None;
                    self.execute().await;
                }
                _ = sleep_until_opt(cron_tick) => {
                    if self.enabled {
                        tracing::debug!(target: "catsync::runtime", task = %self.name, "cron tick");
                        self.execute().await;
                    }
                }
            }
        }
    }

    fn next_cron_tick(&self) -> Option<Instant> {
        // No ticks before the initial pass has run.
        if !self.enabled || !self.handled_first_completion {
            return None;
        }
        let schedule = self.cron.as_ref()?;
        let next = schedule.upcoming(Utc).next()?;
        let delta = (next - Utc::now()).to_std().ok()?;
        Some(Instant::now() + delta)
    }

    fn on_notification(&mut self, note: Notification) {
        let first = matches!(note, Notification::FirstCompletion);
        if first {
            if self.handled_first_completion {
                return;
            }
            self.handled_first_completion = true;
        }
        if !self.enabled {
            self.pending_while_disabled = true;
            return;
        }
        if first && self.window.is_none() {
            // The initial run is not a burst; skip the coalescing window.
            self.window = Some(BufferWindow::open(
                BufferPeriod::new(Duration::ZERO, Duration::ZERO),
                Instant::now(),
            ));
        } else {
            self.wake();
        }
    }

    /// Start or extend the buffer window; tasks without one run at once.
    fn wake(&mut self) {
        match self.buffer {
            None => {
                // Fire on the next loop turn.
                self.window = Some(BufferWindow::open(
                    BufferPeriod::new(Duration::ZERO, Duration::ZERO),
                    Instant::now(),
                ));
            }
            Some(period) => {
                let now = Instant::now();
                match &mut self.window {
                    Some(window) => window.signal(now),
                    None => {
                        self.set_state(RunState::Buffering);
                        self.window = Some(BufferWindow::open(period, now));
                    }
                }
            }
        }
    }

    async fn on_control(&mut self, ctrl: TaskControl) -> bool {
        match ctrl {
            TaskControl::Shutdown => return true,
            TaskControl::Run { run, reply } => {
                let result = match run {
                    RunOption::Now => self.execute().await.map(|()| None),
                    RunOption::Inspect => self.driver.inspect_task().await.map(Some),
                };
                let _ = reply.send(result);
            }
            TaskControl::Patch { patch, reply } => {
                let result = self.apply_patch(patch).await;
                let _ = reply.send(result);
            }
        }
        false
    }

    async fn apply_patch(&mut self, patch: TaskPatch) -> DomainResult<Option<Plan>> {
        if patch.run == Some(RunOption::Inspect) {
            // Dry-run and discard: the driver must not persist the change.
            return self.driver.update_task(patch).await;
        }

        self.driver.update_task(patch).await?;
        if let Some(enabled) = patch.enabled {
            if enabled && !self.enabled {
                self.enabled = true;
                self.consecutive_failures = 0;
                self.set_state(RunState::Idle);
                if std::mem::take(&mut self.pending_while_disabled) {
                    // Dependencies changed while disabled; run once for them.
                    self.wake();
                }
            } else if !enabled && self.enabled {
                self.enabled = false;
                self.window = None;
                self.pending_while_disabled = false;
                self.set_state(RunState::Disabled);
            }
        }
        if patch.run == Some(RunOption::Now) {
            self.execute().await?;
        }
        Ok(None)
    }

    async fn execute(&mut self) -> DomainResult<()> {
        self.window = None;
        self.set_state(RunState::Running);
        self.in_flight.store(true, Ordering::SeqCst);

        let recorder = Event::start(&self.driver.task());
        let result = self.run_driver().await;
        self.in_flight.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.set_state(if self.enabled {
                    RunState::Idle
                } else {
                    RunState::Disabled
                });
            }
            Err(err) => {
                self.consecutive_failures += 1;
                tracing::error!(
                    target: "catsync::runtime",
                    task = %self.name,
                    failures = self.consecutive_failures,
                    error = %err,
                    "task run failed"
                );
                self.set_state(if self.consecutive_failures >= 2 {
                    RunState::Critical
                } else {
                    RunState::Erroring
                });
            }
        }
        self.events
            .write(recorder.finish(result.as_ref().map(|_| ()).map_err(|e| e.to_string())));
        result
    }

    async fn run_driver(&self) -> DomainResult<()> {
        self.driver.render_template().await?;
        self.driver.apply_task().await
    }

    fn set_state(&self, next: RunState) {
        *self.state.lock().expect("run state lock") = next;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::driver::mock::MockDriver;
    use crate::domain::models::task::{ModuleRef, ServicesMonitor};

    fn test_task(buffer: Option<BufferPeriod>) -> Task {
        Task {
            name: "t".to_string(),
            enabled: true,
            description: String::new(),
            module: ModuleRef {
                source: "./m".to_string(),
                version: None,
            },
            services: Vec::new(),
            condition: Condition::Services(ServicesMonitor {
                names: vec!["web".to_string()],
                ..Default::default()
            }),
            module_input: None,
            buffer,
            working_dir: None,
            variables: Default::default(),
        }
    }

    struct Fixture {
        handle: TaskHandle,
        driver: Arc<MockDriver>,
        events: Arc<EventStore>,
        notify: mpsc::UnboundedSender<Notification>,
    }

    fn fixture(task: Task) -> Fixture {
        let driver = Arc::new(MockDriver::new(task.clone()));
        let events = Arc::new(EventStore::default());
        let (notify, notifications) = mpsc::unbounded_channel();
        let handle = TaskRuntime {
            task,
            driver: Arc::clone(&driver) as Arc<dyn Driver>,
            events: Arc::clone(&events),
            notifications,
            initial_run_done: true,
        }
        .spawn();
        Fixture {
            handle,
            driver,
            events,
            notify,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unbuffered_notification_runs_immediately() {
        let f = fixture(test_task(None));
        f.notify
            .send(Notification::DepChange(dep()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.driver.applies(), 1);
        assert_eq!(f.events.task_events("t").len(), 1);
    }

    fn dep() -> crate::domain::models::dependency::Dependency {
        crate::domain::models::dependency::Dependency::KvValue {
            path: "k".to_string(),
            datacenter: None,
            namespace: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_coalesces_burst_into_one_run() {
        let period = BufferPeriod::new(Duration::from_millis(100), Duration::from_millis(400));
        let f = fixture(test_task(Some(period)));

        for _ in 0..3 {
            f.notify.send(Notification::DepChange(dep())).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        // Quiet period shorter than min so far: nothing ran.
        assert_eq!(f.driver.applies(), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(f.driver.applies(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_max_caps_a_sustained_burst() {
        let period = BufferPeriod::new(Duration::from_millis(100), Duration::from_millis(300));
        let f = fixture(test_task(Some(period)));

        // Signal every 50ms: min alone would postpone forever.
        for _ in 0..10 {
            f.notify.send(Notification::DepChange(dep())).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // max=300ms elapsed mid-burst; the run must have fired.
        assert_eq!(f.driver.applies(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_task_is_quiescent_and_reenable_runs_once() {
        let f = fixture(test_task(None));

        f.handle
            .patch(TaskPatch {
                enabled: Some(false),
                run: None,
            })
            .await
            .unwrap();
        assert_eq!(f.handle.state(), RunState::Disabled);

        f.notify.send(Notification::DepChange(dep())).unwrap();
        f.notify.send(Notification::DepChange(dep())).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.driver.applies(), 0);

        f.handle
            .patch(TaskPatch {
                enabled: Some(true),
                run: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The burst during the disabled window coalesces into one run.
        assert_eq!(f.driver.applies(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reenable_without_changes_stays_quiet() {
        let f = fixture(test_task(None));
        f.handle
            .patch(TaskPatch {
                enabled: Some(false),
                run: None,
            })
            .await
            .unwrap();
        f.handle
            .patch(TaskPatch {
                enabled: Some(true),
                run: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.driver.applies(), 0);
        assert_eq!(f.handle.state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_move_through_erroring_to_critical_and_recover() {
        let f = fixture(test_task(None));
        f.driver.fail_next_applies(true);

        f.notify.send(Notification::DepChange(dep())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.handle.state(), RunState::Erroring);

        f.notify.send(Notification::DepChange(dep())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.handle.state(), RunState::Critical);

        f.driver.fail_next_applies(false);
        f.notify.send(Notification::DepChange(dep())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.handle.state(), RunState::Idle);

        let events = f.events.task_events("t");
        assert_eq!(events.len(), 3);
        assert!(events[0].success);
        assert!(!events[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn run_inspect_produces_plan_without_event() {
        let f = fixture(test_task(None));
        let plan = f.handle.run(RunOption::Inspect).await.unwrap().unwrap();
        assert_eq!(plan.text, "mock plan");
        assert!(f.events.task_events("t").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_notifications_never_overlap_runs() {
        let f = fixture(test_task(None));
        for _ in 0..5 {
            f.notify.send(Notification::DepChange(dep())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.driver.overlapping_applies.load(Ordering::SeqCst), 0);
        assert!(f.driver.applies() >= 1);
    }
}
