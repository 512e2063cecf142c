//! Thread identity and exit-time reaping
//!
//! Every thread that reaches the tracer is given a [`ThreadKey`]: a small,
//! process-unique number allocated on first use and cached in a thread-local.
//! The key is the "numeric thread id" used in log file names and in the
//! `thread=N` restriction option. Keys start at 1; 0 is reserved for the
//! shared ROOT frame, which belongs to no thread.
//!
//! Registries that hold per-thread state enlist themselves with the current
//! thread through [`on_exit`]. When the thread terminates, its thread-local
//! destructor calls back into every registry that is still alive, so state is
//! reclaimed without the registry ever keeping the thread alive.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a traced thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey(u64);

impl ThreadKey {
    /// Key carried by the shared ROOT frame
    pub const ROOT: ThreadKey = ThreadKey(0);

    /// Key of the calling thread, allocated on first use
    pub fn current() -> Self {
        KEY.with(|key| match key.get() {
            Some(k) => k,
            None => {
                let k = ThreadKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed));
                key.set(Some(k));
                k
            }
        })
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a traced thread as seen by event processors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub key: ThreadKey,
    pub name: String,
}

impl ThreadInfo {
    /// Describe the calling thread. Unnamed threads are reported as `unnamed`.
    pub fn current() -> Self {
        let name = std::thread::current()
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| "unnamed".to_string());
        Self {
            key: ThreadKey::current(),
            name,
        }
    }

    /// File name of this thread's trace log: `<name>_<key>`
    ///
    /// Path separators and whitespace in thread names are replaced so the
    /// result is always a single path component.
    pub fn log_file_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c == '/' || c == '\\' || c.is_whitespace() {
                    '_'
                } else {
                    c
                }
            })
            .collect();
        format!("{}_{}", name, self.key)
    }
}

/// Something that owns per-thread state and must drop it when a thread ends
pub trait ThreadReaper: Send + Sync {
    fn reap(&self, thread: ThreadKey);
}

/// Ask to be notified when the calling thread terminates
///
/// Only a weak reference is kept: a reaper that has already been dropped is
/// skipped.
pub fn on_exit(reaper: Weak<dyn ThreadReaper>) {
    // During thread teardown the list may already be destroyed; there is
    // nothing left to reap in that case.
    let _ = EXIT_HOOKS.try_with(|hooks| hooks.0.borrow_mut().push(reaper));
}

struct ExitHooks(RefCell<Vec<Weak<dyn ThreadReaper>>>);

impl Drop for ExitHooks {
    fn drop(&mut self) {
        let Some(key) = KEY.try_with(Cell::get).ok().flatten() else {
            return;
        };
        for reaper in self.0.get_mut().drain(..) {
            if let Some(reaper) = reaper.upgrade() {
                reaper.reap(key);
            }
        }
    }
}

thread_local! {
    static KEY: Cell<Option<ThreadKey>> = const { Cell::new(None) };
    static EXIT_HOOKS: ExitHooks = ExitHooks(RefCell::new(Vec::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_key_is_stable_within_thread() {
        assert_eq!(ThreadKey::current(), ThreadKey::current());
        assert_ne!(ThreadKey::current(), ThreadKey::ROOT);
    }

    #[test]
    fn test_keys_differ_across_threads() {
        let here = ThreadKey::current();
        let there = std::thread::spawn(ThreadKey::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_log_file_name_uses_name_and_key() {
        let info = std::thread::Builder::new()
            .name("worker 1/a".to_string())
            .spawn(ThreadInfo::current)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(info.log_file_name(), format!("worker_1_a_{}", info.key));
    }

    struct Recorder(Mutex<Vec<ThreadKey>>);

    impl ThreadReaper for Recorder {
        fn reap(&self, thread: ThreadKey) {
            self.0.lock().unwrap().push(thread);
        }
    }

    #[test]
    fn test_exit_hook_runs_when_thread_ends() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak = Arc::downgrade(&recorder);
        let weak: Weak<dyn ThreadReaper> = weak;

        let key = std::thread::spawn(move || {
            on_exit(weak);
            ThreadKey::current()
        })
        .join()
        .unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![key]);
    }

    #[test]
    fn test_dropped_reaper_is_skipped() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak = Arc::downgrade(&recorder);
        let weak: Weak<dyn ThreadReaper> = weak;
        drop(recorder);

        // Must not panic when the reaper is gone
        std::thread::spawn(move || on_exit(weak)).join().unwrap();
    }
}
