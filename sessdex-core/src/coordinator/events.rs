//! Subscriber registry for change events

use crate::types::ChangeEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle returned by [`IndexService::subscribe`](super::IndexService::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fire-and-forget fan-out. Callbacks run on the coordinator task and must
/// return quickly.
#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, Callback)>>,
}

impl Subscribers {
    pub(crate) fn add(&self, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().unwrap().push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub(crate) fn emit(&self, event: ChangeEvent) {
        tracing::trace!(?event, "Emitting change event");
        // Snapshot so a callback may subscribe or unsubscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_unsubscribe() {
        let subscribers = Subscribers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let id = subscribers.add(Arc::new(move |e: &ChangeEvent| {
            sink.lock().unwrap().push(e.clone());
        }));

        subscribers.emit(ChangeEvent::Deleted {
            session_id: "a".into(),
        });
        assert!(subscribers.remove(id));
        assert!(!subscribers.remove(id));
        subscribers.emit(ChangeEvent::Deleted {
            session_id: "b".into(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![ChangeEvent::Deleted {
                session_id: "a".into()
            }]
        );
    }
}
