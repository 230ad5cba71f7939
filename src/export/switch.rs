//! Per-message completion barrier.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::MessageId;

/// Called once when every export slot of a message has settled.
///
/// Receives the schemas that were abandoned instead of delivered.
pub type CommitHook = Arc<dyn Fn(MessageId, &[String]) + Send + Sync>;

struct SwitchState {
    // Schema name to outstanding task count.
    pending: HashMap<String, usize>,
    abandoned: Vec<String>,
    hook: Option<CommitHook>,
}

/// Barrier joining every export task spawned for one message.
///
/// Holds one slot per (topic, schema) task. The hook fires exactly once, when
/// the last slot is released.
pub struct ReleaseSwitch {
    message_id: MessageId,
    state: Mutex<SwitchState>,
}

impl ReleaseSwitch {
    pub fn new<I, S>(message_id: MessageId, slots: I, hook: CommitHook) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pending = HashMap::new();
        for schema in slots {
            *pending.entry(schema.into()).or_insert(0) += 1;
        }
        Arc::new(Self {
            message_id,
            state: Mutex::new(SwitchState {
                pending,
                abandoned: Vec::new(),
                hook: Some(hook),
            }),
        })
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Release one slot of `schema` after a successful delivery.
    ///
    /// Unknown schema names are ignored. Returns `true` if this call
    /// committed the barrier.
    pub fn mark(&self, schema: &str) -> bool {
        self.release(schema, false)
    }

    /// Release one slot of `schema` whose delivery was given up.
    pub fn mark_abandoned(&self, schema: &str) -> bool {
        self.release(schema, true)
    }

    fn release(&self, schema: &str, abandoned: bool) -> bool {
        let fire = {
            let mut state = self.state.lock();
            let Some(count) = state.pending.get_mut(schema) else {
                return false;
            };
            *count -= 1;
            if *count == 0 {
                state.pending.remove(schema);
            }
            if abandoned {
                state.abandoned.push(schema.to_string());
            }
            if state.pending.is_empty() {
                state.hook.take().map(|hook| (hook, state.abandoned.clone()))
            } else {
                None
            }
        };

        match fire {
            Some((hook, abandoned)) => {
                tracing::debug!(id = %self.message_id, "Export barrier released");
                hook(self.message_id, &abandoned);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Schemas still holding at least one slot.
    pub fn pending(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().pending.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hook() -> (CommitHook, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let hook: CommitHook = Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (hook, fired)
    }

    #[test]
    fn test_commit_fires_once_after_all_marks() {
        for order in [["A", "B"], ["B", "A"]] {
            let (hook, fired) = counting_hook();
            let switch = ReleaseSwitch::new(MessageId::new(1), ["A", "B"], hook);

            assert!(!switch.mark(order[0]));
            assert_eq!(fired.load(Ordering::SeqCst), 0);
            assert!(switch.mark(order[1]));
            assert_eq!(fired.load(Ordering::SeqCst), 1);

            assert!(!switch.mark("A"));
            assert!(!switch.mark("B"));
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_unknown_schema_is_noop() {
        let (hook, fired) = counting_hook();
        let switch = ReleaseSwitch::new(MessageId::new(1), ["A"], hook);
        assert!(!switch.mark("Z"));
        assert_eq!(switch.pending(), vec!["A"]);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_schema_with_two_topics_needs_two_marks() {
        let (hook, fired) = counting_hook();
        let switch = ReleaseSwitch::new(MessageId::new(1), ["A", "A"], hook);
        assert!(!switch.mark("A"));
        assert!(!switch.is_released());
        assert!(switch.mark("A"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandoned_schema_reported_to_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: CommitHook = Arc::new(move |_, abandoned| {
            sink.lock().extend(abandoned.iter().cloned());
        });
        let switch = ReleaseSwitch::new(MessageId::new(7), ["A", "B"], hook);

        switch.mark("A");
        assert!(switch.mark_abandoned("B"));
        assert_eq!(*seen.lock(), vec!["B".to_string()]);
    }
}
