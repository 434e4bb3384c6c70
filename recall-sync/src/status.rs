//! Aggregate sync status for presentation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// What a status indicator should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    /// Nothing outstanding and the remote store is reachable.
    Synced,
    /// Local Changes are waiting for acknowledgement.
    Syncing,
    /// The application reports no network.
    Offline,
    /// The network is up but the remote store does not answer.
    ServerUnreachable,
}

impl SyncStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Syncing => "syncing",
            Self::Offline => "offline",
            Self::ServerUnreachable => "server-unreachable",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct KindState {
    reachable: bool,
    outstanding: usize,
}

impl Default for KindState {
    fn default() -> Self {
        Self {
            reachable: true,
            outstanding: 0,
        }
    }
}

/// Collects the signals the aggregate status is derived from.
#[derive(Debug)]
pub struct StatusTracker {
    online: AtomicBool,
    kinds: Mutex<HashMap<String, KindState>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// Starts online, with every kind reachable and nothing outstanding.
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            kinds: Mutex::new(HashMap::new()),
        }
    }

    fn kinds(&self) -> MutexGuard<'_, HashMap<String, KindState>> {
        self.kinds.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Network state as reported by the application.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Whether the last remote call for `kind` got through.
    pub fn set_reachable(&self, kind: &str, reachable: bool) {
        self.kinds().entry(kind.to_string()).or_default().reachable = reachable;
    }

    pub fn is_reachable(&self, kind: &str) -> bool {
        self.kinds().get(kind).is_none_or(|k| k.reachable)
    }

    /// Number of pending or in-flight Local Changes of `kind`.
    pub fn set_outstanding(&self, kind: &str, outstanding: usize) {
        self.kinds().entry(kind.to_string()).or_default().outstanding = outstanding;
    }

    /// Counts one more outstanding change of `kind` under the tracker lock.
    pub fn add_outstanding(&self, kind: &str) {
        self.kinds().entry(kind.to_string()).or_default().outstanding += 1;
    }

    pub fn outstanding(&self, kind: &str) -> usize {
        self.kinds().get(kind).map_or(0, |k| k.outstanding)
    }

    /// Offline beats unreachable, which beats syncing.
    pub fn status(&self) -> SyncStatus {
        if !self.is_online() {
            return SyncStatus::Offline;
        }
        let kinds = self.kinds();
        if kinds.values().any(|k| !k.reachable) {
            SyncStatus::ServerUnreachable
        } else if kinds.values().any(|k| k.outstanding > 0) {
            SyncStatus::Syncing
        } else {
            SyncStatus::Synced
        }
    }
}
