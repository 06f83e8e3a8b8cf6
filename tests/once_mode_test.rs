//! Once-mode and enable/disable lifecycle coverage.

mod common;

use std::sync::Arc;
use std::time::Duration;

use catsync::adapters::catalog::FakeCatalog;
use catsync::domain::ports::driver::TaskPatch;

use common::*;

#[tokio::test]
async fn every_enabled_task_runs_exactly_once_before_steady_state() {
    let catalog = Arc::new(FakeCatalog::new());
    catalog.register_instance(instance("web", "web-1"));
    catalog.register_instance(instance("api", "api-1"));

    let mut disabled = kv_task("disabled_task", false);
    disabled.enabled = false;

    let daemon = start_daemon_with_catalog(
        catalog,
        vec![kv_task("kv_a", false), services_task("svc_b"), disabled],
        Drivers::Mock,
    )
    .await;

    wait_for_events(&daemon.events, "kv_a", 1).await;
    wait_for_events(&daemon.events, "svc_b", 1).await;
    settle().await;

    assert_eq!(daemon.events.task_events("kv_a").len(), 1);
    assert_eq!(daemon.events.task_events("svc_b").len(), 1);
    assert!(daemon.events.task_events("kv_a")[0].success);
    assert!(daemon.events.task_events("disabled_task").is_empty());

    let drivers = daemon.mock_drivers.lock().unwrap();
    assert_eq!(drivers["kv_a"].applies(), 1);
    assert_eq!(drivers["svc_b"].applies(), 1);
    assert_eq!(drivers["disabled_task"].applies(), 0);
}

#[tokio::test]
async fn once_mode_deadline_marks_task_erroring_then_recovers() {
    let catalog = Arc::new(FakeCatalog::new());
    catalog.register_instance(instance("web", "web-1"));
    catalog.register_instance(instance("api", "api-1"));
    catalog.set_failing(true);

    let daemon = start_daemon_opts(
        Arc::clone(&catalog),
        vec![kv_task("slow_task", false)],
        Drivers::Mock,
        Duration::from_millis(300),
    )
    .await;

    // Startup did not block: the task has a failure event.
    let events = daemon.events.task_events("slow_task");
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);

    // Dependencies eventually resolve; the initial run happens then.
    catalog.set_failing(false);
    wait_for_events(&daemon.events, "slow_task", 2).await;
    let events = daemon.events.task_events("slow_task");
    assert!(events[0].success);
}

#[tokio::test]
async fn disable_is_quiescent_and_reenable_runs_once() {
    let catalog = Arc::new(FakeCatalog::new());
    catalog.register_instance(instance("api", "api-1"));

    let daemon = start_daemon_with_catalog(
        Arc::clone(&catalog),
        vec![services_task("enable_disable")],
        Drivers::Mock,
    )
    .await;
    wait_for_events(&daemon.events, "enable_disable", 1).await;

    daemon
        .controller
        .patch_task(
            "enable_disable",
            TaskPatch {
                enabled: Some(false),
                run: None,
            },
        )
        .await
        .unwrap();

    // Catalog activity while disabled produces no events.
    catalog.register_instance(instance("api", "api-2"));
    settle().await;
    assert_eq!(daemon.events.task_events("enable_disable").len(), 1);

    // Re-enabling runs exactly once for the changes that accumulated.
    daemon
        .controller
        .patch_task(
            "enable_disable",
            TaskPatch {
                enabled: Some(true),
                run: None,
            },
        )
        .await
        .unwrap();
    wait_for_events(&daemon.events, "enable_disable", 2).await;
    settle().await;
    assert_eq!(daemon.events.task_events("enable_disable").len(), 2);
}

#[tokio::test]
async fn reenable_without_catalog_activity_stays_quiet() {
    let catalog = Arc::new(FakeCatalog::new());
    catalog.register_instance(instance("api", "api-1"));

    let daemon = start_daemon_with_catalog(
        Arc::clone(&catalog),
        vec![services_task("quiet_reenable")],
        Drivers::Mock,
    )
    .await;
    wait_for_events(&daemon.events, "quiet_reenable", 1).await;

    for enabled in [false, true] {
        daemon
            .controller
            .patch_task(
                "quiet_reenable",
                TaskPatch {
                    enabled: Some(enabled),
                    run: None,
                },
            )
            .await
            .unwrap();
    }
    settle().await;
    assert_eq!(daemon.events.task_events("quiet_reenable").len(), 1);
}

#[tokio::test]
async fn overall_summary_counts_statuses() {
    let catalog = Arc::new(FakeCatalog::new());
    catalog.register_instance(instance("web", "web-1"));
    catalog.register_instance(instance("api", "api-1"));

    let daemon = start_daemon_with_catalog(
        catalog,
        vec![kv_task("sum_a", false), services_task("sum_b")],
        Drivers::Mock,
    )
    .await;
    wait_for_events(&daemon.events, "sum_a", 1).await;
    wait_for_events(&daemon.events, "sum_b", 1).await;

    let summary = daemon.controller.summary().await;
    assert_eq!(summary.successful, 2);
    assert_eq!(summary.errored, 0);
    assert_eq!(summary.enabled, 2);
    assert_eq!(summary.disabled, 0);
}
