//! Development driver: executes nothing externally. Renders the template
//! bundle, emulates a local file module by materializing `resources/`, and
//! reports plans by diffing the rendered values against the last apply.

use std::fs;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::DomainResult;
use crate::domain::models::task::Task;
use crate::domain::ports::driver::{Driver, Plan, RunOption, TaskPatch};
use crate::services::template::{RenderOutcome, TaskTemplate, TFVARS_FILE};

pub struct PrinterDriver {
    template: TaskTemplate,
    task: StdMutex<Task>,
    /// tfvars content as of the last successful apply.
    applied: StdMutex<Option<String>>,
    op_lock: Mutex<()>,
}

impl PrinterDriver {
    pub fn new(task: Task, template: TaskTemplate) -> Self {
        Self {
            template,
            task: StdMutex::new(task),
            applied: StdMutex::new(None),
            op_lock: Mutex::new(()),
        }
    }

    fn current_tfvars(&self) -> String {
        fs::read_to_string(self.template.working_dir().join(TFVARS_FILE)).unwrap_or_default()
    }
}

#[async_trait]
impl Driver for PrinterDriver {
    async fn init(&self) -> DomainResult<()> {
        Ok(())
    }

    async fn init_task(&self) -> DomainResult<()> {
        Ok(())
    }

    async fn render_template(&self) -> DomainResult<bool> {
        let _op = self.op_lock.lock().await;
        let (outcome, _) = self.template.render()?;
        Ok(matches!(outcome, RenderOutcome::Rendered { .. }))
    }

    async fn inspect_task(&self) -> DomainResult<Plan> {
        let _op = self.op_lock.lock().await;
        let current = self.current_tfvars();
        let applied = self.applied.lock().expect("printer lock");
        let changes_present = applied.as_deref() != Some(current.as_str());
        Ok(Plan {
            changes_present,
            text: current,
        })
    }

    async fn apply_task(&self) -> DomainResult<()> {
        let _op = self.op_lock.lock().await;
        let name = self.task.lock().expect("printer lock").name.clone();
        tracing::info!(target: "catsync::driver", task = %name, "printer apply");
        self.template.materialize_resources()?;
        *self.applied.lock().expect("printer lock") = Some(self.current_tfvars());
        Ok(())
    }

    async fn update_task(&self, patch: TaskPatch) -> DomainResult<Option<Plan>> {
        if patch.run == Some(RunOption::Inspect) {
            return self.inspect_task().await.map(Some);
        }
        if let Some(enabled) = patch.enabled {
            self.task.lock().expect("printer lock").enabled = enabled;
            self.template.set_enabled(enabled);
        }
        Ok(None)
    }

    fn task(&self) -> Task {
        self.task.lock().expect("printer lock").clone()
    }

    async fn destroy_task(&self) {}
}
