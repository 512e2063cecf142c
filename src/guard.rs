//! Reentrancy guard
//!
//! When the instrumentation also rewrites code the tracer itself calls (maps,
//! locks, file IO, the logging subscriber), every bookkeeping step would
//! re-enter the tracer. [`ReentrancyGuard::with`] runs an operation only if the
//! calling thread is not already inside a guarded region of the same guard;
//! a nested attempt returns `None` immediately instead of recursing, blocking,
//! or failing.
//!
//! Two scopes are available:
//!
//! - [`GuardMode::PerThread`] tracks "already inside" per thread. Unrelated
//!   threads never wait on each other.
//! - [`GuardMode::Global`] is a single flag behind a mutex shared by all
//!   threads. The owning thread's re-entry is skipped; other threads wait for
//!   the (short) guarded region to end. This serializes all hook processing.

use crate::error::ConfigError;
use crate::thread::ThreadKey;
use serde::Deserialize;
use std::cell::RefCell;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

static NEXT_GUARD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Ids of the guards the current thread is inside of
    static ACTIVE: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Scope of mutual exclusion for guarded regions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    #[default]
    PerThread,
    Global,
}

impl FromStr for GuardMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_thread" => Ok(GuardMode::PerThread),
            "global" => Ok(GuardMode::Global),
            other => Err(ConfigError::UnknownGuard(other.to_string())),
        }
    }
}

/// Single-flight gate around the tracer's own operations
#[derive(Debug)]
pub struct ReentrancyGuard {
    id: u64,
    mode: GuardMode,
    /// Serializes guarded regions in [`GuardMode::Global`]
    lock: Mutex<()>,
    /// Thread currently holding `lock` (0 = none)
    owner: AtomicU64,
}

impl ReentrancyGuard {
    pub fn new(mode: GuardMode) -> Self {
        Self {
            id: NEXT_GUARD_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            lock: Mutex::new(()),
            owner: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Whether the calling thread is currently inside a region of this guard
    pub fn is_active(&self) -> bool {
        match self.mode {
            GuardMode::PerThread => self.active_here(),
            GuardMode::Global => self.owner.load(Ordering::Acquire) == ThreadKey::current().as_u64(),
        }
    }

    /// Run `op` unless this thread is already inside the guard
    pub fn with<R>(&self, op: impl FnOnce() -> R) -> Option<R> {
        match self.mode {
            GuardMode::PerThread => self.with_per_thread(op),
            GuardMode::Global => self.with_global(op),
        }
    }

    fn active_here(&self) -> bool {
        ACTIVE
            .try_with(|active| active.borrow().contains(&self.id))
            // Thread-locals already torn down: treat as inside, so nothing
            // is traced from thread destructors.
            .unwrap_or(true)
    }

    fn with_per_thread<R>(&self, op: impl FnOnce() -> R) -> Option<R> {
        let entered = ACTIVE
            .try_with(|active| {
                let mut active = active.borrow_mut();
                if active.contains(&self.id) {
                    false
                } else {
                    active.push(self.id);
                    true
                }
            })
            .unwrap_or(false);
        if !entered {
            return None;
        }

        let _exit = Exit(|| {
            let _ = ACTIVE.try_with(|active| {
                let mut active = active.borrow_mut();
                if let Some(pos) = active.iter().rposition(|id| *id == self.id) {
                    active.remove(pos);
                }
            });
        });
        Some(op())
    }

    fn with_global<R>(&self, op: impl FnOnce() -> R) -> Option<R> {
        let me = ThreadKey::current().as_u64();
        if self.owner.load(Ordering::Acquire) == me {
            return None;
        }

        let _lock = match self.lock.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.owner.store(me, Ordering::Release);
        let _exit = Exit(|| self.owner.store(0, Ordering::Release));
        Some(op())
    }
}

impl Default for ReentrancyGuard {
    fn default() -> Self {
        Self::new(GuardMode::default())
    }
}

/// Runs a closure on scope exit, including during unwinding
struct Exit<F: FnMut()>(F);

impl<F: FnMut()> Drop for Exit<F> {
    fn drop(&mut self) {
        (self.0)()
    }
}
