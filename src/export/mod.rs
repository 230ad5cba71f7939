//! Export fan-out.
//!
//! Every accepted message is delivered to each export schema subscribed by
//! any of its topics, one task per (topic, schema) pair. A [`ReleaseSwitch`]
//! joins those tasks and fires the commit hook once all of them settled.
//! Failed tasks go to a shared retry queue swept on a fixed period; a task
//! failing `max_attempts` sweeps is abandoned so its barrier still completes.

mod retry;
mod schema;
mod switch;

pub use retry::{ExportTask, RetryQueue};
pub use schema::{Exporter, FileDropExporter};
pub use switch::{CommitHook, ReleaseSwitch};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::models::{property_types, ExportSchemaConfig, Message};
use crate::namespace::NamespaceTree;
use crate::registry::PluginRegistry;
use crate::system::{FailureReporter, SystemState};

/// Outcome of one retry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub retried: usize,
    pub recovered: usize,
    pub abandoned: usize,
}

/// Dirty-state module type of an exporter.
fn dirty_type(exporter: &dyn Exporter) -> String {
    format!("export:{}", exporter.module_type())
}

/// Subscription table, schema instances and retry machinery.
pub struct ExportCoordinator {
    schemas: RwLock<HashMap<String, Arc<dyn Exporter>>>,
    subscriptions: RwLock<HashMap<String, Arc<[String]>>>,
    retry: RetryQueue,
    system: Arc<SystemState>,
    hook: CommitHook,
    retry_interval: Duration,
    max_attempts: u32,
    sweeper_started: AtomicBool,
    stop: watch::Sender<bool>,
    reporter: FailureReporter,
}

impl ExportCoordinator {
    pub fn new(
        system: Arc<SystemState>,
        hook: CommitHook,
        retry_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            schemas: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            retry: RetryQueue::new(),
            system,
            hook,
            retry_interval,
            max_attempts,
            sweeper_started: AtomicBool::new(false),
            stop,
            reporter: FailureReporter::disabled(),
        }
    }

    /// Send first-attempt failures to `reporter`.
    pub fn with_reporter(mut self, reporter: FailureReporter) -> Self {
        self.reporter = reporter;
        self
    }

    // ==================== LOADING ====================

    /// Build one exporter per config. Unknown types and rejected settings are
    /// logged and skipped. Returns the number of schemas loaded.
    pub fn load_schemas(&self, configs: &[ExportSchemaConfig], registry: &PluginRegistry) -> usize {
        let mut loaded = 0;
        for config in configs {
            let Some(factory) = registry.resolve_exporter(&config.module_type) else {
                error!(schema = %config.name, module_type = %config.module_type, "Unknown exporter type");
                continue;
            };
            match factory(config) {
                Ok(exporter) => {
                    self.add_schema(exporter);
                    loaded += 1;
                }
                Err(e) => {
                    error!(schema = %config.name, error = %e, "Failed to construct exporter");
                }
            }
        }
        info!(loaded, configured = configs.len(), "Export schemas loaded");
        loaded
    }

    pub fn add_schema(&self, exporter: Arc<dyn Exporter>) {
        debug!(schema = exporter.name(), module_type = exporter.module_type(), "Export schema added");
        self.schemas
            .write()
            .insert(exporter.name().to_string(), exporter);
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.schemas.read().contains_key(name)
    }

    /// Subscribe a topic to schemas. Unknown names are dropped with a warning;
    /// a topic left with no valid names gets no entry.
    pub fn subscribe<S: AsRef<str>>(&self, topic: &str, names: &[S]) {
        let mut valid: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            let name: &str = name.as_ref();
            if self.has_schema(name) {
                valid.push(name.to_string());
            } else {
                warn!(topic, schema = name, "Dropping subscription to unknown export schema");
            }
        }

        if valid.is_empty() {
            return;
        }
        self.subscriptions
            .write()
            .insert(topic.to_string(), Arc::from(valid));
    }

    /// Subscribe every topic of the tree to its configured schemas.
    pub fn load_subscriptions(&self, tree: &NamespaceTree) {
        for node in tree.topics() {
            if !node.export_subscriptions.is_empty() {
                self.subscribe(&node.full_path, &node.export_subscriptions);
            }
        }
        info!(topics = self.subscriptions.read().len(), "Export subscriptions loaded");
    }

    /// Snapshot of a topic's subscribed schema names.
    pub fn subscriptions_of(&self, topic: &str) -> Option<Arc<[String]>> {
        self.subscriptions.read().get(topic).cloned()
    }

    // ==================== PUBLISH ====================

    /// Fan a message out to its subscribers.
    ///
    /// Returns the barrier, or `None` when nothing is exported.
    pub fn publish(self: &Arc<Self>, message: &Message) -> Option<Arc<ReleaseSwitch>> {
        if message.entry.has_property(property_types::PROCESSING_FORBIDDEN) {
            debug!(id = %message.id(), "Export skipped, processing forbidden");
            return None;
        }

        let tasks: Vec<(String, Arc<dyn Exporter>)> = {
            let subscriptions = self.subscriptions.read();
            let schemas = self.schemas.read();
            message
                .entry
                .topics
                .iter()
                .filter_map(|topic| subscriptions.get(topic).map(|names| (topic, Arc::clone(names))))
                .flat_map(|(topic, names)| {
                    names
                        .iter()
                        .filter_map(|name| schemas.get(name).cloned())
                        .map(|exporter| (topic.clone(), exporter))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        if tasks.is_empty() {
            return None;
        }

        let switch = ReleaseSwitch::new(
            message.id(),
            tasks.iter().map(|(_, e)| e.name().to_string()),
            Arc::clone(&self.hook),
        );
        let union: BTreeSet<&str> = tasks.iter().map(|(_, e)| e.name()).collect();
        debug!(id = %message.id(), schemas = ?union, tasks = tasks.len(), "Exporting message");

        self.ensure_sweeper();

        let message = Arc::new(message.clone());
        for (topic, schema) in tasks {
            let task = ExportTask {
                schema,
                message: Arc::clone(&message),
                switch: Arc::clone(&switch),
                source_topic: topic,
                attempts: 0,
            };
            let coordinator = Arc::clone(self);
            tokio::spawn(async move { coordinator.run_first(task).await });
        }

        Some(switch)
    }

    async fn run_first(&self, task: ExportTask) {
        match attempt(&task, false).await {
            Ok(()) => {
                task.switch.mark(task.schema_name());
            }
            Err(reason) => {
                warn!(
                    id = %task.message.id(),
                    schema = task.schema_name(),
                    topic = %task.source_topic,
                    error = %reason,
                    "Export failed, queued for retry"
                );
                self.reporter.report(
                    format!("export schema '{}'", task.schema_name()),
                    format!(
                        "Delivery of message {} from {} failed: {}",
                        task.message.id(),
                        task.source_topic,
                        reason
                    ),
                );
                let system = &self.system;
                self.retry.push_then(task, |task| {
                    system.set_dirty(&dirty_type(&*task.schema), task.schema_name(), task.schema_name());
                });
            }
        }
    }

    // ==================== RETRY ====================

    fn ensure_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let coordinator = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            info!(interval = ?coordinator.retry_interval, "Export retry sweeper started");
            let period = coordinator.retry_interval.max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !coordinator.retry.is_empty() {
                            coordinator.sweep_once().await;
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            info!("Export retry sweeper stopped");
        });
    }

    /// Retry every queued task once.
    pub async fn sweep_once(&self) -> SweepReport {
        let tasks = self.retry.take_all();
        let mut report = SweepReport {
            retried: tasks.len(),
            ..SweepReport::default()
        };
        let mut still_failing = Vec::new();
        let mut touched: HashMap<String, Arc<dyn Exporter>> = HashMap::new();

        for mut task in tasks {
            touched
                .entry(task.schema_name().to_string())
                .or_insert_with(|| Arc::clone(&task.schema));

            match attempt(&task, true).await {
                Ok(()) => {
                    info!(id = %task.message.id(), schema = task.schema_name(), "Export recovered");
                    task.switch.mark(task.schema_name());
                    report.recovered += 1;
                }
                Err(reason) => {
                    task.attempts += 1;
                    if self.max_attempts > 0 && task.attempts >= self.max_attempts {
                        error!(
                            id = %task.message.id(),
                            schema = task.schema_name(),
                            attempts = task.attempts,
                            error = %reason,
                            "Export abandoned"
                        );
                        task.switch.mark_abandoned(task.schema_name());
                        report.abandoned += 1;
                    } else {
                        still_failing.push(task);
                    }
                }
            }
        }
        self.retry.requeue(still_failing);

        for (name, exporter) in touched {
            let module_type = dirty_type(&*exporter);
            self.retry.when_idle(&name, || {
                if self.system.is_dirty(&module_type, &name, &name) {
                    self.system.clear_dirty(&module_type, &name, &name);
                }
            });
        }

        if report.retried > 0 {
            debug!(?report, "Export retry sweep finished");
        }
        report
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry.len()
    }

    /// Stop the retry sweeper. In-flight tasks run to completion.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Run one delivery in its own task so a panicking exporter counts as a failure.
async fn attempt(task: &ExportTask, is_retry: bool) -> Result<(), String> {
    let schema = Arc::clone(&task.schema);
    let message = Arc::clone(&task.message);
    let topic = task.source_topic.clone();
    let handle = tokio::spawn(async move {
        if is_retry {
            schema.retry(&message, &topic).await
        } else {
            schema.export(&message, &topic).await
        }
    });
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(join) => Err(format!("exporter task aborted: {}", join)),
    }
}
