//! Driver port: the capability that renders a task's template bundle and
//! executes plan/apply against the external infrastructure executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;
use crate::domain::models::task::Task;

/// Result of an inspect (dry-run). Plans are comparable: a repeated inspect
/// with no dependency change must report `changes_present == false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub changes_present: bool,
    pub text: String,
}

/// How an API-initiated update should run, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOption {
    /// Apply immediately, bypassing the buffer period.
    Now,
    /// Dry-run, report the plan, and discard the change.
    Inspect,
}

impl RunOption {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "now" => Some(Self::Now),
            "inspect" => Some(Self::Inspect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::Inspect => "inspect",
        }
    }
}

/// Patch applied to a task through the control API.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskPatch {
    pub enabled: Option<bool>,
    pub run: Option<RunOption>,
}

/// Capability bound to exactly one task.
///
/// Implementations guarantee at-most-one concurrent operation per driver
/// instance; callers may hold the driver behind an `Arc` and invoke it from
/// the task runtime and the control API without further locking.
#[async_trait]
pub trait Driver: Send + Sync {
    /// One-time environment initialization shared by all tasks, e.g.
    /// verifying the executor binary.
    async fn init(&self) -> DomainResult<()>;

    /// Prepare the per-task working directory and executor workspace.
    async fn init_task(&self) -> DomainResult<()>;

    /// Render the task's template bundle. Returns whether anything was
    /// (re)rendered since the last call.
    async fn render_template(&self) -> DomainResult<bool>;

    /// Dry-run the task and report the resulting plan.
    async fn inspect_task(&self) -> DomainResult<Plan>;

    /// Converge real state to the rendered configuration.
    async fn apply_task(&self) -> DomainResult<()>;

    /// Apply a patch from the control API. Returns the plan when the patch
    /// requested an inspect run.
    async fn update_task(&self, patch: TaskPatch) -> DomainResult<Option<Plan>>;

    /// Snapshot of the task as the driver currently sees it.
    fn task(&self) -> Task;

    /// Tear down per-task executor state. Called on task deletion.
    async fn destroy_task(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_option_parses_case_insensitively() {
        assert_eq!(RunOption::parse("now"), Some(RunOption::Now));
        assert_eq!(RunOption::parse("INSPECT"), Some(RunOption::Inspect));
        assert_eq!(RunOption::parse("later"), None);
    }
}
