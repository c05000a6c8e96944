//! Release-hook lifecycle management

use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

type Hook = Box<dyn FnOnce() + Send>;

/// Ordered set of teardown callbacks registered during attach.
///
/// [`release`](ReleaseHooks::release) runs every hook once, in registration
/// order, then clears the set; idempotency is structural — a drained set has
/// nothing left to run, so a second release is a no-op. Hooks registered
/// after a release (re-attachment) run on the next release.
#[derive(Default)]
pub struct ReleaseHooks {
    hooks: Mutex<Vec<Hook>>,
}

impl ReleaseHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown callback.
    pub fn on_release(&self, hook: impl FnOnce() + Send + 'static) {
        self.guard().push(Box::new(hook));
    }

    /// Run every registered hook in order and clear the set.
    pub fn release(&self) {
        let hooks: Vec<Hook> = self.guard().drain(..).collect();
        if !hooks.is_empty() {
            debug!(count = hooks.len(), "running release hooks");
        }
        for hook in hooks {
            hook();
        }
    }

    /// Number of hooks currently registered.
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A hook that panicked mid-release poisons the set; the remaining hooks
    // still have to run on the next release, so recover the guard.
    fn guard(&self) -> MutexGuard<'_, Vec<Hook>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
