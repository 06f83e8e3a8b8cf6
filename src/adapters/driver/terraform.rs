//! Driver spawning the external executor binary, one process per operation,
//! in the task's working directory. State files stay under that directory
//! and are owned by the executor.

use std::path::PathBuf;
use std::process::Output;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::Task;
use crate::domain::ports::driver::{Driver, Plan, RunOption, TaskPatch};
use crate::services::template::{RenderOutcome, TaskTemplate, TFVARS_FILE};

pub struct TerraformDriver {
    bin: PathBuf,
    template: TaskTemplate,
    task: StdMutex<Task>,
    initialized: AtomicBool,
    // At-most-one concurrent operation per driver.
    op_lock: Mutex<()>,
}

impl TerraformDriver {
    pub fn new(bin: PathBuf, task: Task, template: TaskTemplate) -> Self {
        Self {
            bin,
            template,
            task: StdMutex::new(task),
            initialized: AtomicBool::new(false),
            op_lock: Mutex::new(()),
        }
    }

    fn task_name(&self) -> String {
        self.task.lock().expect("driver task lock").name.clone()
    }

    async fn exec(&self, args: &[&str]) -> DomainResult<Output> {
        let dir = self.template.working_dir();
        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(&dir)
            .kill_on_drop(false)
            .output()
            .await
            .map_err(|e| DomainError::DriverApply {
                task: self.task_name(),
                reason: format!("spawn {:?} {:?}: {e}", self.bin, args),
            })?;
        Ok(output)
    }

    async fn ensure_workspace(&self) -> DomainResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let output = self.exec(&["init", "-input=false", "-no-color"]).await?;
        if !output.status.success() {
            return Err(DomainError::DriverInit {
                task: self.task_name(),
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl Driver for TerraformDriver {
    async fn init(&self) -> DomainResult<()> {
        let output = self.exec(&["version"]).await?;
        if !output.status.success() {
            return Err(DomainError::DriverInit {
                task: self.task_name(),
                reason: format!("executor binary {:?} is not runnable", self.bin),
            });
        }
        Ok(())
    }

    async fn init_task(&self) -> DomainResult<()> {
        let _op = self.op_lock.lock().await;
        std::fs::create_dir_all(self.template.working_dir()).map_err(|e| {
            DomainError::DriverInit {
                task: self.task_name(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    async fn render_template(&self) -> DomainResult<bool> {
        let _op = self.op_lock.lock().await;
        let (outcome, _) = self.template.render()?;
        Ok(matches!(outcome, RenderOutcome::Rendered { .. }))
    }

    async fn inspect_task(&self) -> DomainResult<Plan> {
        let _op = self.op_lock.lock().await;
        self.ensure_workspace().await?;
        let output = self
            .exec(&[
                "plan",
                "-input=false",
                "-no-color",
                "-detailed-exitcode",
                &format!("-var-file={TFVARS_FILE}"),
            ])
            .await?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        match output.status.code() {
            Some(0) => Ok(Plan {
                changes_present: false,
                text,
            }),
            Some(2) => Ok(Plan {
                changes_present: true,
                text,
            }),
            _ => Err(DomainError::DriverApply {
                task: self.task_name(),
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }

    async fn apply_task(&self) -> DomainResult<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_workspace().await?;
        let output = self
            .exec(&[
                "apply",
                "-input=false",
                "-no-color",
                "-auto-approve",
                &format!("-var-file={TFVARS_FILE}"),
            ])
            .await?;
        if !output.status.success() {
            return Err(DomainError::DriverApply {
                task: self.task_name(),
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn update_task(&self, patch: TaskPatch) -> DomainResult<Option<Plan>> {
        if patch.run == Some(RunOption::Inspect) {
            // Dry-run the patched task and discard the change.
            return self.inspect_task().await.map(Some);
        }
        if let Some(enabled) = patch.enabled {
            self.task.lock().expect("driver task lock").enabled = enabled;
            self.template.set_enabled(enabled);
        }
        Ok(None)
    }

    fn task(&self) -> Task {
        self.task.lock().expect("driver task lock").clone()
    }

    async fn destroy_task(&self) {
        // External state is deliberately left alone; deleting a task must
        // not tear down the infrastructure it converged.
        tracing::info!(
            target: "catsync::driver",
            task = %self.task_name(),
            "releasing driver"
        );
    }
}
