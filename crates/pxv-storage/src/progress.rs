//! Load progress as an observable value.

use std::sync::Arc;

use pxv_core::LoadPhase;
use tokio::sync::watch;

/// Publishes [`LoadPhase`] updates for one full load.
///
/// Phases only move forward (`not_loaded → downloading → decrypting →
/// loaded`) and progress never decreases within a phase; out-of-order
/// reports are dropped.
#[derive(Clone)]
pub struct LoadProgress {
    tx: Arc<watch::Sender<LoadPhase>>,
}

impl LoadProgress {
    pub fn new() -> (Self, watch::Receiver<LoadPhase>) {
        let (tx, rx) = watch::channel(LoadPhase::NotLoaded);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Progress nobody is watching.
    pub fn detached() -> Self {
        Self::new().0
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadPhase> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> LoadPhase {
        *self.tx.borrow()
    }

    /// Publish `phase` if it moves forward. Returns whether it was accepted.
    pub fn report(&self, phase: LoadPhase) -> bool {
        self.tx.send_if_modified(|current| {
            let forward = phase.rank() > current.rank()
                || (phase.rank() == current.rank() && phase.progress() > current.progress());
            if forward {
                *current = phase;
            }
            forward
        })
    }
}

impl std::fmt::Debug for LoadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadProgress")
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_only_move_forward() {
        let (progress, rx) = LoadProgress::new();
        assert!(progress.report(LoadPhase::Downloading { progress: 0.5 }));
        assert!(!progress.report(LoadPhase::Downloading { progress: 0.2 }));
        assert!(progress.report(LoadPhase::Decrypting { progress: 0.1 }));
        assert!(!progress.report(LoadPhase::Downloading { progress: 1.0 }));
        assert!(progress.report(LoadPhase::Loaded));
        assert!(!progress.report(LoadPhase::NotLoaded));
        assert_eq!(*rx.borrow(), LoadPhase::Loaded);
    }

    #[test]
    fn test_detached_still_tracks_current() {
        let progress = LoadProgress::detached();
        progress.report(LoadPhase::Decrypting { progress: 0.3 });
        assert_eq!(progress.current(), LoadPhase::Decrypting { progress: 0.3 });
    }
}
