//! System mode, dirty-state registry and event notification.

use std::collections::HashSet;
use std::fmt;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::models::MessageId;

/// Overall mode of the running system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMode {
    Init,
    Ready,
    Dirty,
    Maintaining,
    Closing,
}

impl SystemMode {
    /// Whether new messages may be posted.
    pub fn accepts_posts(self) -> bool {
        matches!(self, SystemMode::Ready | SystemMode::Dirty)
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemMode::Init => "INIT",
            SystemMode::Ready => "READY",
            SystemMode::Dirty => "DIRTY",
            SystemMode::Maintaining => "MAINTAINING",
            SystemMode::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// Identity of a module instance that reported a failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyKey {
    pub module_type: String,
    pub scheme: String,
    pub fingerprint: String,
}

impl DirtyKey {
    pub fn new(module_type: &str, scheme: &str, fingerprint: &str) -> Self {
        Self {
            module_type: module_type.to_string(),
            scheme: scheme.to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }
}

impl fmt::Display for DirtyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.module_type, self.scheme, self.fingerprint)
    }
}

/// System mode plus the set of modules currently in a failed state.
///
/// The first dirty entry moves `Ready` to `Dirty`; removing the last one moves
/// it back. With `ignore_dirty` set the registry is inert.
pub struct SystemState {
    mode: RwLock<SystemMode>,
    dirty: Mutex<HashSet<DirtyKey>>,
    ignore_dirty: bool,
}

impl SystemState {
    pub fn new(ignore_dirty: bool) -> Self {
        Self {
            mode: RwLock::new(SystemMode::Init),
            dirty: Mutex::new(HashSet::new()),
            ignore_dirty,
        }
    }

    pub fn mode(&self) -> SystemMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: SystemMode) {
        let prev = std::mem::replace(&mut *self.mode.write(), mode);
        if prev != mode {
            tracing::info!(from = %prev, to = %mode, "System mode changed");
        }
    }

    pub fn set_dirty(&self, module_type: &str, scheme: &str, fingerprint: &str) {
        if self.ignore_dirty {
            return;
        }
        let key = DirtyKey::new(module_type, scheme, fingerprint);
        let mut dirty = self.dirty.lock();
        if !dirty.insert(key.clone()) {
            return;
        }
        tracing::error!(module = %key, "Module entered dirty state");
        if dirty.len() == 1 {
            let mut mode = self.mode.write();
            if *mode == SystemMode::Ready {
                *mode = SystemMode::Dirty;
                tracing::error!("System is now DIRTY");
            }
        }
    }

    pub fn clear_dirty(&self, module_type: &str, scheme: &str, fingerprint: &str) {
        if self.ignore_dirty {
            return;
        }
        let key = DirtyKey::new(module_type, scheme, fingerprint);
        let mut dirty = self.dirty.lock();
        if !dirty.remove(&key) {
            tracing::error!(module = %key, "Clearing dirty state of a module that is not dirty");
            return;
        }
        tracing::info!(module = %key, "Module recovered");
        if dirty.is_empty() {
            let mut mode = self.mode.write();
            if *mode == SystemMode::Dirty {
                *mode = SystemMode::Ready;
                tracing::info!("System is READY again");
            }
        }
    }

    pub fn is_dirty(&self, module_type: &str, scheme: &str, fingerprint: &str) -> bool {
        self.dirty
            .lock()
            .contains(&DirtyKey::new(module_type, scheme, fingerprint))
    }

    pub fn dirty_modules(&self) -> Vec<DirtyKey> {
        self.dirty.lock().iter().cloned().collect()
    }
}

/// A module failure to be posted as a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub origin: String,
    pub detail: String,
}

/// Hands module failures to the engine, which posts them to the debug topic.
///
/// A disabled reporter drops everything.
#[derive(Clone, Default)]
pub struct FailureReporter {
    tx: Option<mpsc::UnboundedSender<FailureReport>>,
}

impl FailureReporter {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FailureReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn report(&self, origin: impl Into<String>, detail: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let report = FailureReport {
            origin: origin.into(),
            detail: detail.into(),
        };
        if tx.send(report).is_err() {
            tracing::debug!("Failure report dropped, poster is gone");
        }
    }
}

/// Who should receive a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    Admins,
    User(String),
}

/// Events pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireEvent {
    MessagePosted { id: MessageId, topics: Vec<String> },
    MessageModified { id: MessageId },
    MessageDeleted { id: MessageId },
    PropertiesChanged { id: MessageId },
    IndexCommitted { id: MessageId },
    ModeChanged { mode: SystemMode },
    UserUpdated { login: String },
    GroupUpdated { name: String },
}

/// Outbound notification sink consumed by the session layer.
pub trait Notifier: Send + Sync {
    fn broadcast(&self, event: WireEvent, audience: Audience);
}

/// Notifier backed by a `tokio::sync::broadcast` channel.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<(WireEvent, Audience)>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(WireEvent, Audience)> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn broadcast(&self, event: WireEvent, audience: Audience) {
        tracing::debug!(?event, ?audience, "Broadcast");
        // No subscribers is fine.
        let _ = self.tx.send((event, audience));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_transitions() {
        let state = SystemState::new(false);
        state.set_mode(SystemMode::Ready);

        state.set_dirty("import:spool", "wire", "fp1");
        state.set_dirty("export:file", "drop", "drop");
        assert_eq!(state.mode(), SystemMode::Dirty);

        state.clear_dirty("import:spool", "wire", "fp1");
        assert_eq!(state.mode(), SystemMode::Dirty);

        state.clear_dirty("export:file", "drop", "drop");
        assert_eq!(state.mode(), SystemMode::Ready);
    }

    #[test]
    fn test_clearing_unknown_key_is_harmless() {
        let state = SystemState::new(false);
        state.set_mode(SystemMode::Ready);
        state.clear_dirty("x", "y", "z");
        assert_eq!(state.mode(), SystemMode::Ready);
    }

    #[test]
    fn test_dirty_does_not_override_maintenance() {
        let state = SystemState::new(false);
        state.set_mode(SystemMode::Maintaining);
        state.set_dirty("x", "y", "z");
        assert_eq!(state.mode(), SystemMode::Maintaining);
        assert!(state.is_dirty("x", "y", "z"));
    }

    #[test]
    fn test_ignore_dirty() {
        let state = SystemState::new(true);
        state.set_mode(SystemMode::Ready);
        state.set_dirty("x", "y", "z");
        assert_eq!(state.mode(), SystemMode::Ready);
        assert!(state.dirty_modules().is_empty());
    }

    #[test]
    fn test_accepts_posts() {
        assert!(SystemMode::Ready.accepts_posts());
        assert!(SystemMode::Dirty.accepts_posts());
        assert!(!SystemMode::Init.accepts_posts());
        assert!(!SystemMode::Maintaining.accepts_posts());
        assert!(!SystemMode::Closing.accepts_posts());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.broadcast(
            WireEvent::MessageDeleted { id: MessageId::new(4) },
            Audience::Everyone,
        );
        let (event, audience) = rx.recv().await.unwrap();
        assert_eq!(event, WireEvent::MessageDeleted { id: MessageId::new(4) });
        assert_eq!(audience, Audience::Everyone);
    }

    #[tokio::test]
    async fn test_disabled_reporter_drops_reports() {
        FailureReporter::disabled().report("import source 'wire'", "offline");

        let (reporter, mut rx) = FailureReporter::channel();
        reporter.report("import source 'wire'", "offline");
        assert_eq!(
            rx.recv().await.unwrap(),
            FailureReport {
                origin: "import source 'wire'".into(),
                detail: "offline".into(),
            }
        );
    }
}
