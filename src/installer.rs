// Dependency installation: replaying the accumulated manifest into a worker

use crate::messages::{DependencyId, Manifest, PoolMessage};
use crate::protocol::ProtocolResult;
use crate::worker::WorkerHandle;
use std::collections::HashSet;
use tokio::sync::oneshot;
use tracing::debug;

/// Post a manifest into a worker.
///
/// Variables and functions are plain assignments and expect no
/// acknowledgement; each script is confirmed later by one
/// `DependencyInstalled` message. Returns the number of confirmations to
/// expect.
pub fn install_manifest(worker: &WorkerHandle, manifest: &Manifest) -> ProtocolResult<usize> {
    worker.post(PoolMessage::InstallVariables(manifest.variables.clone()))?;
    worker.post(PoolMessage::InstallFunctions(manifest.functions.clone()))?;
    for script in &manifest.scripts {
        worker.post(PoolMessage::InstallScript(script.clone()))?;
    }
    debug!(
        worker_id = %worker.id(),
        scripts = manifest.script_count(),
        "manifest posted to worker"
    );
    Ok(manifest.script_count())
}

/// Tracks install confirmations for one bootstrapping worker.
///
/// Side-effects complete concurrently, so confirmations arrive in any order
/// and the tracker counts distinct dependency ids. The readiness signal
/// fires once the count reaches the expected number of scripts; with zero
/// scripts it fires immediately.
pub struct InstallTracker {
    expected: usize,
    confirmed: HashSet<DependencyId>,
    ready: Option<oneshot::Sender<()>>,
}

impl InstallTracker {
    /// Create a tracker expecting `expected` distinct confirmations,
    /// together with the receiver resolved on readiness
    pub fn new(expected: usize) -> (InstallTracker, oneshot::Receiver<()>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut tracker = InstallTracker {
            expected,
            confirmed: HashSet::new(),
            ready: Some(ready_tx),
        };
        if expected == 0 {
            tracker.signal_ready();
        }
        (tracker, ready_rx)
    }

    /// Record one confirmation; returns true when this confirmation
    /// completed the installation
    pub fn confirm(&mut self, id: &str) -> bool {
        if !self.confirmed.insert(id.to_string()) {
            // Duplicate confirmation for the same dependency
            return false;
        }
        if self.confirmed.len() >= self.expected && self.ready.is_some() {
            self.signal_ready();
            return true;
        }
        false
    }

    /// Whether the readiness signal has fired
    pub fn is_ready(&self) -> bool {
        self.ready.is_none()
    }

    fn signal_ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_scripts_ready_immediately() {
        let (tracker, ready_rx) = InstallTracker::new(0);
        assert!(tracker.is_ready());
        ready_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_counts_distinct_confirmations() {
        let (mut tracker, ready_rx) = InstallTracker::new(2);
        assert!(!tracker.confirm("a"));
        // A duplicate does not advance the count
        assert!(!tracker.confirm("a"));
        assert!(!tracker.is_ready());
        assert!(tracker.confirm("b"));
        assert!(tracker.is_ready());
        ready_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_order_is_irrelevant() {
        let (mut tracker, ready_rx) = InstallTracker::new(3);
        // Confirmations arrive in reverse registration order
        assert!(!tracker.confirm("c"));
        assert!(!tracker.confirm("b"));
        assert!(tracker.confirm("a"));
        ready_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_confirmations_ignored() {
        let (mut tracker, _ready_rx) = InstallTracker::new(1);
        assert!(tracker.confirm("a"));
        assert!(!tracker.confirm("extra"));
    }
}
