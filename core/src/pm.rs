//! # Power-Collapse Scheduling
//!
//! Debounced one-shot timer for the automatic power collapse. Every
//! `schedule()` supersedes the previous request by bumping a generation
//! counter. The timer side only fires a request whose generation is still
//! current, so a command written during the idle delay pushes the collapse
//! back instead of racing it.

use alloc::boxed::Box;

use spin::{Mutex, RwLock};

/// A pending collapse request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCollapse {
    /// Request generation
    pub generation: u64,
    /// Idle delay before firing
    pub delay_ms: u32,
}

/// What one collapse attempt ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmOutcome {
    /// Hardware powered down (or already down)
    Collapsed,
    /// Not possible yet, attempt rescheduled
    Rescheduled,
    /// Retry budget exhausted, fatal error raised
    Escalated,
    /// Attempt failed and was not rescheduled
    Failed,
}

#[derive(Debug, Default)]
struct PmState {
    generation: u64,
    pending: Option<PendingCollapse>,
}

type Notifier = Box<dyn Fn() + Send + Sync>;

/// Debounced collapse timer state
#[derive(Default)]
pub struct PmSchedule {
    state: Mutex<PmState>,
    notifier: RwLock<Option<Notifier>>,
}

impl core::fmt::Debug for PmSchedule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PmSchedule")
            .field("pending", &self.pending())
            .finish()
    }
}

impl PmSchedule {
    /// Create an idle schedule
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a collapse after `delay_ms`, replacing any pending request
    pub fn schedule(&self, delay_ms: u32) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.pending = Some(PendingCollapse {
                generation: state.generation,
                delay_ms,
            });
            state.generation
        };
        self.notify();
        generation
    }

    /// Drop any pending request
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            state.generation += 1;
            state.pending = None;
        }
        self.notify();
    }

    /// The current request, if any
    pub fn pending(&self) -> Option<PendingCollapse> {
        self.state.lock().pending
    }

    /// Claim the request `generation` for execution
    ///
    /// Fails when it was superseded or cancelled in the meantime.
    pub fn take(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        match state.pending {
            Some(p) if p.generation == generation => {
                state.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Install the wake-up hook of the timer thread
    pub fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.write() = Some(notifier);
    }

    /// Remove the wake-up hook
    pub fn clear_notifier(&self) {
        *self.notifier.write() = None;
    }

    fn notify(&self) {
        if let Some(n) = self.notifier.read().as_ref() {
            n();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_schedule_supersedes() {
        let pm = PmSchedule::new();
        let first = pm.schedule(1000);
        let second = pm.schedule(1000);
        assert!(second > first);
        assert!(!pm.take(first));
        assert!(pm.take(second));
        assert!(pm.pending().is_none());
    }

    #[test]
    fn test_cancel() {
        let pm = PmSchedule::new();
        let gen = pm.schedule(10);
        pm.cancel();
        assert!(pm.pending().is_none());
        assert!(!pm.take(gen));
    }

    #[test]
    fn test_notifier_called() {
        let pm = PmSchedule::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pm.set_notifier(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        pm.schedule(5);
        pm.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        pm.clear_notifier();
        pm.schedule(5);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
