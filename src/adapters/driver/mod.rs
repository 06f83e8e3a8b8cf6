//! Driver implementations: external executor, development printer, and the
//! scriptable test mock.

pub mod mock;
pub mod printer;
pub mod terraform;

use std::sync::Arc;

use crate::domain::models::config::{DriverConfig, DriverKind};
use crate::domain::models::task::Task;
use crate::domain::ports::driver::Driver;
use crate::services::template::TaskTemplate;

pub use mock::MockDriver;
pub use printer::PrinterDriver;
pub use terraform::TerraformDriver;

/// Build the configured driver for one task.
pub fn new_driver(config: &DriverConfig, task: Task, template: TaskTemplate) -> Arc<dyn Driver> {
    match config.kind {
        DriverKind::Terraform => Arc::new(TerraformDriver::new(
            config.bin.clone(),
            task,
            template,
        )),
        DriverKind::Printer => Arc::new(PrinterDriver::new(task, template)),
    }
}
