//! Dependency watcher: one long-poll per watched catalog input, fanned out
//! to every subscribed task.
//!
//! Entries are reference-counted. The first subscription to an identity
//! spawns its poll loop; the last unsubscribe stops the loop after a short
//! quiescent delay so task re-registration churn does not tear watches down
//! and back up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::errors::DomainResult;
use crate::domain::models::dependency::{Dependency, DependencyUpdate, DependencyValue};
use crate::domain::ports::catalog::{Catalog, QueryMeta, QueryOptions};

/// Tuning for the watcher's poll loops.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Long-poll wait per blocking query.
    pub wait_time: Duration,
    /// Consecutive failures before an entry is marked degraded.
    pub failure_threshold: u32,
    /// How long an entry with no subscribers lingers before its poll stops.
    pub quiescent_delay: Duration,
    /// Base sleep between failed poll rounds; doubled per consecutive
    /// failure up to `retry_cap`.
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(60),
            failure_threshold: 5,
            quiescent_delay: Duration::from_secs(5),
            retry_base: Duration::from_millis(250),
            retry_cap: Duration::from_secs(30),
        }
    }
}

pub type SubscriptionId = u64;

struct WatchEntry {
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<DependencyUpdate>>,
    last_index: u64,
    last_value: Option<DependencyValue>,
    degraded: bool,
    consecutive_failures: u32,
    poll: Option<JoinHandle<()>>,
}

impl WatchEntry {
    fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            last_index: 0,
            last_value: None,
            degraded: false,
            consecutive_failures: 0,
            poll: None,
        }
    }

    fn fan_out(&mut self, update: &DependencyUpdate) {
        self.subscribers
            .retain(|_, tx| tx.send(update.clone()).is_ok());
    }
}

struct WatcherInner {
    catalog: Arc<dyn Catalog>,
    entries: Mutex<HashMap<Dependency, WatchEntry>>,
    next_subscription: AtomicU64,
    config: WatcherConfig,
}

/// Shared watcher over all tasks' dependencies. Cloning is cheap; clones
/// share the entry map.
#[derive(Clone)]
pub struct DependencyWatcher {
    inner: Arc<WatcherInner>,
}

impl DependencyWatcher {
    pub fn new(catalog: Arc<dyn Catalog>, config: WatcherConfig) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                catalog,
                entries: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                config,
            }),
        }
    }

    /// Subscribe to a dependency. The receiver gets the current value
    /// immediately when one is already known, then every semantic change in
    /// the order the catalog's index returned them.
    pub fn subscribe(
        &self,
        dependency: Dependency,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<DependencyUpdate>) {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut entries = self.inner.entries.lock().expect("watcher lock poisoned");
        let entry = entries
            .entry(dependency.clone())
            .or_insert_with(WatchEntry::new);
        if let Some(value) = &entry.last_value {
            let _ = tx.send(DependencyUpdate {
                dependency: dependency.clone(),
                value: value.clone(),
                index: entry.last_index,
                degraded: entry.degraded,
            });
        }
        entry.subscribers.insert(id, tx);
        if entry.poll.is_none() {
            tracing::debug!(target: "catsync::watcher", dependency = %dependency, "starting watch");
            entry.poll = Some(self.spawn_poll(dependency));
        }
        (id, rx)
    }

    /// Drop one subscription. When the entry has no subscribers left after
    /// the quiescent delay, its poll loop is stopped and the entry removed.
    pub fn unsubscribe(&self, dependency: &Dependency, id: SubscriptionId) {
        let mut entries = self.inner.entries.lock().expect("watcher lock poisoned");
        let Some(entry) = entries.get_mut(dependency) else {
            return;
        };
        entry.subscribers.remove(&id);
        if !entry.subscribers.is_empty() {
            return;
        }
        let watcher = self.clone();
        let dependency = dependency.clone();
        let delay = self.inner.config.quiescent_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut entries = watcher.inner.entries.lock().expect("watcher lock poisoned");
            let still_idle = entries
                .get(&dependency)
                .is_some_and(|e| e.subscribers.is_empty());
            if still_idle {
                tracing::debug!(target: "catsync::watcher", dependency = %dependency, "stopping watch");
                if let Some(entry) = entries.remove(&dependency) {
                    if let Some(poll) = entry.poll {
                        poll.abort();
                    }
                }
            }
        });
    }

    /// Abort every poll loop. Called on daemon shutdown.
    pub fn stop(&self) {
        let mut entries = self.inner.entries.lock().expect("watcher lock poisoned");
        for (_, entry) in entries.drain() {
            if let Some(poll) = entry.poll {
                poll.abort();
            }
        }
    }

    #[cfg(test)]
    fn watched_count(&self) -> usize {
        self.inner.entries.lock().expect("watcher lock poisoned").len()
    }

    fn spawn_poll(&self, dependency: Dependency) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            loop {
                let last_index = {
                    let entries = watcher.inner.entries.lock().expect("watcher lock poisoned");
                    match entries.get(&dependency) {
                        Some(entry) => entry.last_index,
                        None => return,
                    }
                };

                let opts = QueryOptions::blocking(last_index, watcher.inner.config.wait_time);
                match watcher.resolve(&dependency, opts).await {
                    Ok((value, meta)) => watcher.record_success(&dependency, value, meta),
                    Err(err) => {
                        let failures = watcher.record_failure(&dependency);
                        let exp = failures.saturating_sub(1).min(10);
                        let backoff = (watcher.inner.config.retry_base * 2u32.pow(exp))
                            .min(watcher.inner.config.retry_cap);
                        tracing::warn!(
                            target: "catsync::watcher",
                            dependency = %dependency,
                            failures,
                            error = %err,
                            "watch poll failed"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        })
    }

    fn record_success(&self, dependency: &Dependency, value: DependencyValue, meta: QueryMeta) {
        let mut entries = self.inner.entries.lock().expect("watcher lock poisoned");
        let Some(entry) = entries.get_mut(dependency) else {
            return;
        };
        entry.consecutive_failures = 0;
        entry.degraded = false;

        let first = entry.last_value.is_none();
        let changed = entry.last_value.as_ref() != Some(&value);
        entry.last_index = entry.last_index.max(meta.index);
        if first || changed {
            entry.last_value = Some(value.clone());
            let update = DependencyUpdate {
                dependency: dependency.clone(),
                value,
                index: entry.last_index,
                degraded: false,
            };
            entry.fan_out(&update);
        }
    }

    fn record_failure(&self, dependency: &Dependency) -> u32 {
        let mut entries = self.inner.entries.lock().expect("watcher lock poisoned");
        let Some(entry) = entries.get_mut(dependency) else {
            return 0;
        };
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.inner.config.failure_threshold && !entry.degraded {
            entry.degraded = true;
            if let Some(value) = entry.last_value.clone() {
                let update = DependencyUpdate {
                    dependency: dependency.clone(),
                    value,
                    index: entry.last_index,
                    degraded: true,
                };
                entry.fan_out(&update);
            }
        }
        entry.consecutive_failures
    }

    async fn resolve(
        &self,
        dependency: &Dependency,
        opts: QueryOptions,
    ) -> DomainResult<(DependencyValue, QueryMeta)> {
        let catalog = &self.inner.catalog;
        match dependency {
            Dependency::HealthServices(selector) => {
                let (instances, meta) = catalog.health_services(selector, opts).await?;
                Ok((DependencyValue::HealthServices(instances), meta))
            }
            Dependency::CatalogServices {
                datacenter,
                namespace,
                node_meta,
            } => {
                let opts = QueryOptions {
                    datacenter: datacenter.clone(),
                    namespace: namespace.clone(),
                    ..opts
                };
                let (services, meta) = catalog.catalog_services(node_meta, opts).await?;
                Ok((DependencyValue::CatalogServices(services), meta))
            }
            Dependency::KvValue {
                path,
                datacenter,
                namespace,
            } => {
                let opts = QueryOptions {
                    datacenter: datacenter.clone(),
                    namespace: namespace.clone(),
                    ..opts
                };
                let (value, meta) = catalog.kv_get(path, opts).await?;
                Ok((DependencyValue::KvValue(value), meta))
            }
            Dependency::KvKeys {
                prefix,
                datacenter,
                namespace,
            } => {
                let opts = QueryOptions {
                    datacenter: datacenter.clone(),
                    namespace: namespace.clone(),
                    ..opts
                };
                let (pairs, meta) = catalog.kv_list(prefix, opts).await?;
                Ok((DependencyValue::KvKeys(pairs), meta))
            }
            Dependency::KvExists {
                path,
                datacenter,
                namespace,
            } => {
                let opts = QueryOptions {
                    datacenter: datacenter.clone(),
                    namespace: namespace.clone(),
                    ..opts
                };
                let (value, meta) = catalog.kv_get(path, opts).await?;
                Ok((DependencyValue::KvExists(value.is_some()), meta))
            }
        }
    }
}
