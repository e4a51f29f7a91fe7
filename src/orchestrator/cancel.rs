//! Cooperative cancellation of a run.
//!
//! A fresh [`CancelSignal`] is created for every run and handed to the pool
//! drivers. Cancelling never kills work: drivers stop handing out new units,
//! forward a `cancel` notification to busy workers, and score files that end
//! while the signal is set as cancelled rather than failed.
//!
//! [`RunControl`] is the one place a run gets cancelled from. The
//! orchestrator and the run's RPC handler share it, so an interrupt and a
//! bail both move the phase to [`RunPhase::Cancelling`] and reach the same
//! listeners.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Where the orchestrator is in its run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Cancelling,
}

/// Why a run was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelReason {
    /// The user interrupted the run.
    KeyboardInput,
    /// The bail threshold was reached.
    TestFailure,
    /// The orchestrator is closing.
    Shutdown,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::KeyboardInput => "keyboard-input",
            CancelReason::TestFailure => "test-failure",
            CancelReason::Shutdown => "shutdown",
            CancelReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Cancellation token plus the reason it was triggered with.
///
/// Clones share state. The first reason wins.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers cancellation. Returns `false` if it was already triggered.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Completes once the signal is triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

pub type CancelListener = Box<dyn Fn(&CancelReason) + Send + Sync>;

/// Run phase, current signal and cancel listeners. Clones share state.
#[derive(Clone, Default)]
pub struct RunControl {
    inner: Arc<ControlInner>,
}

#[derive(Default)]
struct ControlInner {
    phase: Mutex<RunPhase>,
    signal: Mutex<CancelSignal>,
    listeners: Mutex<Vec<CancelListener>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RunPhase {
        *lock(&self.inner.phase)
    }

    /// Arms a fresh signal and enters [`RunPhase::Running`].
    pub fn begin(&self) -> CancelSignal {
        let mut phase = lock(&self.inner.phase);
        let signal = CancelSignal::new();
        *lock(&self.inner.signal) = signal.clone();
        *phase = RunPhase::Running;
        signal
    }

    /// Back to [`RunPhase::Idle`].
    pub fn finish(&self) {
        *lock(&self.inner.phase) = RunPhase::Idle;
    }

    pub fn on_cancel(&self, listener: impl Fn(&CancelReason) + Send + Sync + 'static) {
        lock(&self.inner.listeners).push(Box::new(listener));
    }

    /// Cancels the current run and notifies every listener.
    ///
    /// Returns `false` when no run is in progress or it was already
    /// cancelled; listeners are not called then.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut phase = lock(&self.inner.phase);
            if *phase != RunPhase::Running {
                return false;
            }
            if !lock(&self.inner.signal).cancel(reason.clone()) {
                return false;
            }
            *phase = RunPhase::Cancelling;
        }
        for listener in lock(&self.inner.listeners).iter() {
            listener(&reason);
        }
        true
    }
}

impl fmt::Debug for RunControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunControl")
            .field("phase", &self.phase())
            .field("listeners", &lock(&self.inner.listeners).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.cancel(CancelReason::TestFailure));
        assert!(!signal.clone().cancel(CancelReason::KeyboardInput));
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), Some(CancelReason::TestFailure));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_for_clones() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        signal.cancel(CancelReason::Shutdown);
        waiter.await.unwrap();
    }

    #[test]
    fn test_unknown_reason_deserializes() {
        let reason: CancelReason = serde_json::from_str("\"something-else\"").unwrap();
        assert_eq!(reason, CancelReason::Unknown);
        assert_eq!(CancelReason::KeyboardInput.to_string(), "keyboard-input");
    }

    #[test]
    fn test_control_cancels_only_running_runs_once() {
        let control = RunControl::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            let observer = control.clone();
            control.on_cancel(move |reason| {
                assert_eq!(*reason, CancelReason::TestFailure);
                assert_eq!(observer.phase(), RunPhase::Cancelling);
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(!control.cancel(CancelReason::TestFailure));

        let signal = control.begin();
        assert_eq!(control.phase(), RunPhase::Running);
        assert!(control.clone().cancel(CancelReason::TestFailure));
        assert!(!control.cancel(CancelReason::KeyboardInput));
        assert_eq!(signal.reason(), Some(CancelReason::TestFailure));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        control.finish();
        let next = control.begin();
        assert!(!next.is_cancelled());
    }
}
