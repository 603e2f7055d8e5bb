//! Reference-counted coordination of the shared busy overlay.
//!
//! Concurrent operations each hold the overlay for their own duration; it
//! is shown on the first acquire and hidden when the last holder releases.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("overlay unavailable: {0}")]
pub struct OverlayError(pub String);

/// The host's busy indicator.
pub trait LoadingOverlay: Send + Sync {
    fn show(&self, title: &str) -> Result<(), OverlayError>;
    fn hide(&self) -> Result<(), OverlayError>;
}

pub struct LoadingCoordinator {
    overlay: Arc<dyn LoadingOverlay>,
    active: Mutex<usize>,
}

impl LoadingCoordinator {
    pub fn new(overlay: Arc<dyn LoadingOverlay>) -> Self {
        Self {
            overlay,
            active: Mutex::new(0),
        }
    }

    /// Take a hold on the overlay; it is released when the guard drops.
    pub fn acquire(self: &Arc<Self>, title: &str) -> LoadingGuard {
        let mut active = self.active.lock();
        *active += 1;
        if *active == 1 {
            if let Err(err) = self.overlay.show(title) {
                warn!(%err, "failed to show loading overlay");
            }
        }
        LoadingGuard {
            coordinator: Arc::clone(self),
        }
    }

    /// Drop one hold. Extra releases are clamped at zero.
    pub fn release(&self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            if let Err(err) = self.overlay.hide() {
                warn!(%err, "failed to hide loading overlay");
            }
        }
    }

    /// Number of holds currently outstanding.
    pub fn active(&self) -> usize {
        *self.active.lock()
    }
}

impl std::fmt::Debug for LoadingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingCoordinator")
            .field("active", &self.active())
            .finish()
    }
}

/// One outstanding hold on the overlay.
#[must_use = "dropping the guard releases the overlay immediately"]
pub struct LoadingGuard {
    coordinator: Arc<LoadingCoordinator>,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}
