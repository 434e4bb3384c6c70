//! Change notification for consumers of merged views.
//!
//! Listeners are plain callbacks, so the engine does not depend on any
//! rendering technology. A listener is told which kind changed and why, and
//! re-reads the merged view itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Why a merged view may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// A new remote snapshot was applied to the mirror.
    MirrorRefreshed,
    /// A local write was recorded.
    LocalWrite,
    /// The delivery status of a Local Change changed.
    StatusChanged,
    /// Converged Local Changes were retired.
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: String,
    pub reason: ChangeReason,
}

type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Registry of change listeners.
#[derive(Default)]
pub struct ChangeNotifier {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `listener`. It stays registered until the returned handle's
    /// [`ListenerHandle::unsubscribe`] is called; dropping the handle does
    /// not unregister it.
    pub fn on_change<F>(self: &Arc<Self>, listener: F) -> ListenerHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        ListenerHandle {
            id,
            notifier: Arc::downgrade(self),
        }
    }

    /// Tells every listener that `kind` changed for `reason`. Listeners run
    /// outside the registry lock, so they may register or unsubscribe
    /// listeners themselves.
    pub fn notify(&self, kind: &str, reason: ChangeReason) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if listeners.is_empty() {
            return;
        }
        let event = ChangeEvent {
            kind: kind.to_string(),
            reason,
        };
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn remove(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(existing, _)| *existing != id);
    }
}

/// Returned by [`ChangeNotifier::on_change`].
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    notifier: Weak<ChangeNotifier>,
}

impl ListenerHandle {
    /// Unregisters the listener. Events already being delivered may still
    /// reach it.
    pub fn unsubscribe(self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.remove(self.id);
        }
    }
}
