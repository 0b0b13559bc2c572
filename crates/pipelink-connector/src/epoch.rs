use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A shared generation counter used to detect that an object died during a
/// callback it invoked itself.
///
/// Snapshot the epoch before invoking a callback that might destroy the
/// owner; compare after it returns and bail out if the epochs differ. The
/// cell is cheap to clone and safe to keep past the owner's destruction.
#[derive(Clone, Debug)]
pub struct EpochCell {
    generation: Arc<AtomicU64>,
}

impl EpochCell {
    pub fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The current generation.
    pub fn snapshot(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether a snapshot is still the current generation.
    pub fn is_current(&self, snapshot: u64) -> bool {
        self.snapshot() == snapshot
    }

    /// Advance the generation, invalidating all outstanding snapshots.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for EpochCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_survives_until_invalidated() {
        let epoch = EpochCell::new();
        let snap = epoch.snapshot();
        assert!(epoch.is_current(snap));

        epoch.invalidate();
        assert!(!epoch.is_current(snap));
        assert!(epoch.is_current(epoch.snapshot()));
    }

    #[test]
    fn clones_share_the_generation() {
        let epoch = EpochCell::new();
        let other = epoch.clone();
        let snap = other.snapshot();

        epoch.invalidate();
        assert!(!other.is_current(snap));
    }
}
