//! Import scheduling.
//!
//! Each configured source runs its own polling loop: wait the interval, try
//! recovery while the source is dirty, then run one cycle. A failing or
//! panicking cycle marks the source dirty; the loop itself keeps going until
//! [`ImportScheduler::stop`].
//!
//! A fetched message is acknowledged to its source only after the sink
//! published it. Messages the sink defers stay at the source for the next
//! cycle; messages it can never accept are rejected.

mod source;

pub use source::{Imported, Importer, SpoolImporter};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::AppError;
use crate::models::{ImportSchemaConfig, Message, MessageId};
use crate::registry::PluginRegistry;
use crate::system::{FailureReporter, SystemState};

/// Receiver of imported messages.
#[async_trait]
pub trait ImportSink: Send + Sync {
    async fn accept(&self, message: Message) -> Result<MessageId, AppError>;
}

/// A source plus its polling period.
#[derive(Clone)]
pub struct ImportSource {
    pub importer: Arc<dyn Importer>,
    pub interval: Duration,
}

impl ImportSource {
    fn dirty_type(&self) -> String {
        format!("import:{}", self.importer.module_type())
    }

    fn is_dirty(&self, system: &SystemState) -> bool {
        system.is_dirty(
            &self.dirty_type(),
            self.importer.name(),
            self.importer.fingerprint(),
        )
    }
}

/// Counts from one import cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    /// Refused for good and set aside at the source.
    pub rejected: usize,
    /// Left at the source for a later cycle.
    pub deferred: usize,
}

/// Owns the polling loops of all import sources.
pub struct ImportScheduler {
    sources: Mutex<Vec<ImportSource>>,
    system: Arc<SystemState>,
    sink: Arc<dyn ImportSink>,
    stop: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    reporter: FailureReporter,
}

impl ImportScheduler {
    pub fn new(system: Arc<SystemState>, sink: Arc<dyn ImportSink>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            sources: Mutex::new(Vec::new()),
            system,
            sink,
            stop,
            handles: Mutex::new(Vec::new()),
            reporter: FailureReporter::disabled(),
        }
    }

    /// Send failed cycles to `reporter`.
    pub fn with_reporter(mut self, reporter: FailureReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Build one importer per config. Unknown types and rejected settings are
    /// logged and skipped.
    pub fn load(&self, configs: &[ImportSchemaConfig], registry: &PluginRegistry) -> usize {
        let mut loaded = 0;
        for config in configs {
            let Some(factory) = registry.resolve_importer(&config.module_type) else {
                error!(source = %config.name, module_type = %config.module_type, "Unknown importer type");
                continue;
            };
            match factory(config) {
                Ok(importer) => {
                    self.add_source(importer, Duration::from_secs(config.interval_secs));
                    loaded += 1;
                }
                Err(e) => error!(source = %config.name, error = %e, "Failed to construct importer"),
            }
        }
        info!(loaded, configured = configs.len(), "Import sources loaded");
        loaded
    }

    pub fn add_source(&self, importer: Arc<dyn Importer>, interval: Duration) {
        self.sources.lock().push(ImportSource { importer, interval });
    }

    pub fn sources(&self) -> Vec<ImportSource> {
        self.sources.lock().clone()
    }

    /// Spawn one loop per source.
    pub fn start(self: &Arc<Self>) {
        let sources = self.sources();
        let mut handles = self.handles.lock();
        for source in sources {
            info!(source = source.importer.name(), interval = ?source.interval, "Import loop started");
            let scheduler = Arc::clone(self);
            let stop = self.stop.subscribe();
            handles.push(tokio::spawn(async move {
                scheduler.run_loop(source, stop).await;
            }));
        }
    }

    /// Ask every loop to end after its current wait or cycle.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Wait for all loops to end.
    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_loop(&self, source: ImportSource, mut stop: watch::Receiver<bool>) {
        let period = source.interval.max(Duration::from_millis(10));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }

            self.try_recover(&source).await;

            if let Err(reason) = self.run_cycle(&source).await {
                error!(source = source.importer.name(), error = %reason, "Import cycle failed");
                self.reporter.report(
                    format!("import source '{}'", source.importer.name()),
                    format!("Import cycle failed: {}", reason),
                );
                self.system.set_dirty(
                    &source.dirty_type(),
                    source.importer.name(),
                    source.importer.fingerprint(),
                );
            }
        }
        info!(source = source.importer.name(), "Import loop stopped");
    }

    /// Run the recovery hook of a dirty source. Success clears the dirty flag.
    pub async fn try_recover(&self, source: &ImportSource) {
        if !source.is_dirty(&self.system) {
            return;
        }
        match source.importer.recover().await {
            Ok(()) => {
                info!(source = source.importer.name(), "Import source recovered");
                self.system.clear_dirty(
                    &source.dirty_type(),
                    source.importer.name(),
                    source.importer.fingerprint(),
                );
            }
            Err(e) => warn!(source = source.importer.name(), error = %e, "Import recovery failed"),
        }
    }

    /// Run one cycle in its own task.
    ///
    /// Published messages are acknowledged, validation refusals rejected. Any
    /// other refusal stops the cycle and leaves that message and the rest at
    /// the source. A failed acknowledgement fails the cycle.
    pub async fn run_cycle(&self, source: &ImportSource) -> Result<CycleReport, String> {
        let importer = Arc::clone(&source.importer);
        let sink = Arc::clone(&self.sink);

        let handle = tokio::spawn(async move {
            let fetched = importer.poll().await.map_err(|e| e.to_string())?;
            let mut report = CycleReport {
                fetched: fetched.len(),
                ..CycleReport::default()
            };

            let mut pending = fetched.into_iter();
            while let Some(Imported { message, receipt }) = pending.next() {
                let header = message.entry.header.clone();
                match sink.accept(message).await {
                    Ok(id) => {
                        debug!(source = importer.name(), id = %id, "Imported message published");
                        report.published += 1;
                        importer.acknowledge(&receipt).await.map_err(|e| {
                            format!("message {} published but not acknowledged: {}", id, e)
                        })?;
                    }
                    Err(AppError::Validation(reason)) => {
                        warn!(source = importer.name(), header = %header, error = %reason, "Imported message rejected");
                        report.rejected += 1;
                        if let Err(e) = importer.reject(&receipt).await {
                            error!(source = importer.name(), header = %header, error = %e, "Failed to reject imported message");
                        }
                    }
                    Err(e) => {
                        report.deferred = 1 + pending.len();
                        warn!(
                            source = importer.name(),
                            header = %header,
                            deferred = report.deferred,
                            error = %e,
                            "Imported message refused, leaving it at the source"
                        );
                        break;
                    }
                }
            }
            Ok::<_, String>(report)
        });

        match handle.await {
            Ok(result) => result,
            Err(join) => Err(format!("import cycle aborted: {}", join)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PluginError;
    use crate::system::SystemMode;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        next: AtomicU64,
        headers: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImportSink for RecordingSink {
        async fn accept(&self, message: Message) -> Result<MessageId, AppError> {
            match message.entry.header.as_str() {
                "refuse" => return Err(AppError::Validation("bad property".into())),
                "later" => return Err(AppError::SystemNotReady("System is MAINTAINING".into())),
                _ => {}
            }
            self.headers.lock().push(message.entry.header);
            Ok(MessageId::new(self.next.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    struct ScriptedSource {
        broken: AtomicBool,
        panic: AtomicBool,
        polls: AtomicUsize,
        recoveries: AtomicUsize,
        headers: Mutex<Vec<&'static str>>,
        acknowledged: Mutex<Vec<String>>,
        rejected: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn new() -> Arc<Self> {
            Self::with_headers(&["one", "refuse"])
        }

        fn with_headers(headers: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                broken: AtomicBool::new(false),
                panic: AtomicBool::new(false),
                polls: AtomicUsize::new(0),
                recoveries: AtomicUsize::new(0),
                headers: Mutex::new(headers.to_vec()),
                acknowledged: Mutex::new(Vec::new()),
                rejected: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Importer for ScriptedSource {
        fn name(&self) -> &str {
            "wire"
        }

        fn module_type(&self) -> &str {
            "scripted"
        }

        fn fingerprint(&self) -> &str {
            "wire-1"
        }

        async fn poll(&self) -> Result<Vec<Imported>, PluginError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.panic.load(Ordering::SeqCst) {
                panic!("source exploded");
            }
            if self.broken.load(Ordering::SeqCst) {
                return Err(PluginError::Unavailable("feed offline".into()));
            }
            Ok(self
                .headers
                .lock()
                .iter()
                .map(|h| Imported {
                    message: Message::new(h, "wire", "EN", &["NEWS"], &[], ""),
                    receipt: h.to_string(),
                })
                .collect())
        }

        async fn acknowledge(&self, receipt: &str) -> Result<(), PluginError> {
            self.acknowledged.lock().push(receipt.to_string());
            self.headers.lock().retain(|h| *h != receipt);
            Ok(())
        }

        async fn reject(&self, receipt: &str) -> Result<(), PluginError> {
            self.rejected.lock().push(receipt.to_string());
            self.headers.lock().retain(|h| *h != receipt);
            Ok(())
        }

        async fn recover(&self) -> Result<(), PluginError> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                Err(PluginError::Unavailable("still offline".into()))
            } else {
                Ok(())
            }
        }
    }

    fn scheduler() -> (Arc<ImportScheduler>, Arc<SystemState>, Arc<RecordingSink>) {
        let system = Arc::new(SystemState::new(false));
        system.set_mode(SystemMode::Ready);
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Arc::new(ImportScheduler::new(Arc::clone(&system), sink.clone()));
        (scheduler, system, sink)
    }

    #[tokio::test]
    async fn test_cycle_acknowledges_published_and_rejects_invalid() {
        let (scheduler, _, sink) = scheduler();
        let scripted = ScriptedSource::new();
        let source = ImportSource {
            importer: scripted.clone(),
            interval: Duration::from_secs(60),
        };

        let report = scheduler.run_cycle(&source).await.unwrap();

        assert_eq!(
            report,
            CycleReport {
                fetched: 2,
                published: 1,
                rejected: 1,
                deferred: 0
            }
        );
        assert_eq!(*sink.headers.lock(), vec!["one".to_string()]);
        assert_eq!(*scripted.acknowledged.lock(), vec!["one".to_string()]);
        assert_eq!(*scripted.rejected.lock(), vec!["refuse".to_string()]);
    }

    #[tokio::test]
    async fn test_deferred_messages_stay_at_source() {
        let (scheduler, _, sink) = scheduler();
        let scripted = ScriptedSource::with_headers(&["one", "later", "two"]);
        let source = ImportSource {
            importer: scripted.clone(),
            interval: Duration::from_secs(60),
        };

        let report = scheduler.run_cycle(&source).await.unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(*sink.headers.lock(), vec!["one".to_string()]);
        assert_eq!(*scripted.headers.lock(), vec!["later", "two"]);
        assert!(scripted.rejected.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_cycle_is_reported() {
        let system = Arc::new(SystemState::new(false));
        system.set_mode(SystemMode::Ready);
        let (reporter, mut reports) = FailureReporter::channel();
        let scheduler = Arc::new(
            ImportScheduler::new(system, Arc::new(RecordingSink::default())).with_reporter(reporter),
        );
        let scripted = ScriptedSource::new();
        scripted.broken.store(true, Ordering::SeqCst);
        scheduler.add_source(scripted, Duration::from_millis(10));
        scheduler.start();

        let report = reports.recv().await.unwrap();
        scheduler.stop();
        scheduler.join().await;

        assert_eq!(report.origin, "import source 'wire'");
        assert!(report.detail.contains("feed offline"));
    }

    #[tokio::test]
    async fn test_panicking_cycle_is_contained() {
        let (scheduler, _, _) = scheduler();
        let scripted = ScriptedSource::new();
        scripted.panic.store(true, Ordering::SeqCst);
        let source = ImportSource {
            importer: scripted,
            interval: Duration::from_secs(60),
        };

        assert!(scheduler.run_cycle(&source).await.is_err());
    }

    #[tokio::test]
    async fn test_loop_marks_dirty_and_recovers() {
        let (scheduler, system, sink) = scheduler();
        let scripted = ScriptedSource::new();
        scripted.broken.store(true, Ordering::SeqCst);
        scheduler.add_source(scripted.clone(), Duration::from_millis(20));
        scheduler.start();

        for _ in 0..200 {
            if system.mode() == SystemMode::Dirty {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(system.mode(), SystemMode::Dirty);
        assert!(system.is_dirty("import:scripted", "wire", "wire-1"));

        scripted.broken.store(false, Ordering::SeqCst);
        for _ in 0..200 {
            if system.mode() == SystemMode::Ready && !sink.headers.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(system.mode(), SystemMode::Ready);
        assert!(scripted.recoveries.load(Ordering::SeqCst) >= 1);
        assert!(!sink.headers.lock().is_empty());

        scheduler.stop();
        scheduler.join().await;
        let polls = scripted.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(scripted.polls.load(Ordering::SeqCst), polls);
    }

    #[tokio::test]
    async fn test_load_skips_unknown_types() {
        let (scheduler, _, _) = scheduler();
        let registry = PluginRegistry::with_builtins();
        let configs = vec![
            ImportSchemaConfig::new("spool", "spool", "fp", 5).with_setting("dir", "/tmp/spool"),
            ImportSchemaConfig::new("ftp", "ftp", "fp2", 5),
        ];
        assert_eq!(scheduler.load(&configs, &registry), 1);
        assert_eq!(scheduler.sources()[0].interval, Duration::from_secs(5));
    }
}
