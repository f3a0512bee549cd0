//! Cancellation and in-flight Run tracking.
//!
//! Each Run owns a [`CancelToken`]; the matching [`CancelHandle`] lives in
//! the [`RunRegistry`] under the Run's concurrency group. A newer accepted
//! event for the same group supersedes (cancels) the Runs still in flight.

use std::collections::HashMap;
use std::sync::Mutex;

use tidewater_state::RunId;
use tokio::sync::watch;
use tracing::info;

/// Sender side of a Run's cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiver side, polled by the Run between and during stages.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let signalled = rx.wait_for(|cancelled| *cancelled).await.is_ok();
        if !signalled {
            std::future::pending::<()>().await;
        }
    }
}

struct Entry {
    run_id: RunId,
    handle: CancelHandle,
}

/// In-flight Runs keyed by concurrency group.
#[derive(Default)]
pub struct RunRegistry {
    groups: Mutex<HashMap<String, Vec<Entry>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn groups(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancel every in-flight Run of `group`. Returns how many were cancelled.
    pub fn supersede(&self, group: &str) -> usize {
        let entries = self.groups().remove(group).unwrap_or_default();
        for entry in &entries {
            info!(group, run_id = %entry.run_id, "Superseding in-flight run");
            entry.handle.cancel();
        }
        entries.len()
    }

    /// Track a new Run and hand back its cancellation token.
    pub fn register(&self, group: &str, run_id: &RunId) -> CancelToken {
        let (handle, token) = cancel_pair();
        self.groups()
            .entry(group.to_string())
            .or_default()
            .push(Entry {
                run_id: run_id.clone(),
                handle,
            });
        token
    }

    /// Stop tracking a finished Run.
    pub fn release(&self, group: &str, run_id: &RunId) {
        let mut groups = self.groups();
        if let Some(entries) = groups.get_mut(group) {
            entries.retain(|e| e.run_id != *run_id);
            if entries.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Cancel everything in flight (shutdown).
    pub fn cancel_all(&self) -> usize {
        let groups = self.groups();
        let mut count = 0;
        for entry in groups.values().flatten() {
            entry.handle.cancel();
            count += 1;
        }
        count
    }

    /// Number of Runs currently tracked.
    pub fn in_flight(&self) -> usize {
        self.groups().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_token() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn(async move { token.cancelled().await });
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_token_stays_pending() {
        let token = CancelToken::never();
        let waited = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let (handle, token) = cancel_pair();
        drop(handle);
        let waited = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(waited.is_err());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_supersede_cancels_only_its_group() {
        let registry = RunRegistry::new();
        let old = registry.register("push:main", &RunId::new());
        let other = registry.register("pr:feature->main", &RunId::new());

        assert_eq!(registry.supersede("push:main"), 1);
        assert!(old.is_cancelled());
        assert!(!other.is_cancelled());
        assert_eq!(registry.in_flight(), 1);
    }

    #[test]
    fn test_released_run_is_not_superseded() {
        let registry = RunRegistry::new();
        let a = RunId::new();
        let b = RunId::new();
        let token_a = registry.register("push:main", &a);
        let token_b = registry.register("push:main", &b);

        registry.release("push:main", &a);
        assert_eq!(registry.in_flight(), 1);
        assert_eq!(registry.supersede("push:main"), 1);
        assert!(!token_a.is_cancelled());
        assert!(token_b.is_cancelled());
    }

    #[test]
    fn test_cancel_all() {
        let registry = RunRegistry::new();
        let tokens: Vec<_> = (0..3)
            .map(|i| registry.register(&format!("push:b{i}"), &RunId::new()))
            .collect();
        assert_eq!(registry.cancel_all(), 3);
        assert!(tokens.iter().all(CancelToken::is_cancelled));
    }
}
