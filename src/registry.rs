//! Thread-to-state table
//!
//! Maps a [`ThreadKey`] to that thread's [`ContextStack`]. Each entry sits
//! behind its own mutex, which in practice is only ever locked by the owning
//! thread; the table lock itself is taken for writing only when a thread is
//! seen for the first time or reaped.
//!
//! The registry never keeps a thread alive. A thread that ends is reaped
//! automatically through [`crate::thread::on_exit`], and callers can reap
//! eagerly with [`ThreadRegistry::unregister`].

use crate::context_stack::ContextStack;
use crate::frame::FrameId;
use crate::thread::{self, ThreadInfo, ThreadKey, ThreadReaper};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

/// Shared handle to one thread's state
pub type ThreadState = Arc<Mutex<ContextStack>>;

type Listener = Box<dyn Fn(ThreadKey) + Send + Sync>;

#[derive(Default)]
struct Inner {
    states: RwLock<HashMap<ThreadKey, ThreadState>>,
    /// Last frame id of threads that unregistered while still running
    retired: Mutex<HashMap<ThreadKey, FrameId>>,
    on_reap: Option<Listener>,
}

impl Inner {
    fn remove(&self, thread: ThreadKey) -> Option<ThreadState> {
        let removed = match self.states.write() {
            Ok(mut states) => states.remove(&thread),
            Err(poisoned) => poisoned.into_inner().remove(&thread),
        };
        if removed.is_some() {
            if let Some(listener) = &self.on_reap {
                listener(thread);
            }
        }
        removed
    }

    fn retired(&self) -> MutexGuard<'_, HashMap<ThreadKey, FrameId>> {
        match self.retired.lock() {
            Ok(retired) => retired,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ThreadReaper for Inner {
    // The thread is gone for good; its key is never handed out again
    fn reap(&self, thread: ThreadKey) {
        self.remove(thread);
        self.retired().remove(&thread);
    }
}

/// Registry of per-thread stacks
#[derive(Clone, Default)]
pub struct ThreadRegistry {
    inner: Arc<Inner>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that calls `listener` after a thread's state is dropped
    pub fn with_reap_listener(listener: impl Fn(ThreadKey) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                states: RwLock::default(),
                retired: Mutex::default(),
                on_reap: Some(Box::new(listener)),
            }),
        }
    }

    /// State of the calling thread, created on first use
    ///
    /// The second value is `true` when this call created the state.
    pub fn current(&self) -> (ThreadState, bool) {
        let key = ThreadKey::current();
        if let Some(state) = self.get(key) {
            return (state, false);
        }

        let mut states = match self.inner.states.write() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Only this thread creates its own entry, but re-check under the
        // write lock so a single state object ever exists per key.
        if let Some(state) = states.get(&key) {
            return (state.clone(), false);
        }
        let stack = match self.inner.retired().remove(&key) {
            Some(last) => ContextStack::resume(ThreadInfo::current(), last),
            None => ContextStack::new(ThreadInfo::current()),
        };
        let state = Arc::new(Mutex::new(stack));
        states.insert(key, state.clone());
        drop(states);

        let inner = Arc::downgrade(&self.inner);
        let reaper: Weak<dyn ThreadReaper> = inner;
        thread::on_exit(reaper);
        (state, true)
    }

    /// State of `thread`, if it has one
    pub fn get(&self, thread: ThreadKey) -> Option<ThreadState> {
        let states = match self.inner.states.read() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        states.get(&thread).cloned()
    }

    /// Drop the state of `thread`; returns whether it existed
    ///
    /// The thread may still be running. If it registers again, its frame ids
    /// continue where they left off.
    pub fn unregister(&self, thread: ThreadKey) -> bool {
        let Some(state) = self.inner.remove(thread) else {
            return false;
        };
        let last = match state.lock() {
            Ok(stack) => stack.last_id(),
            Err(poisoned) => poisoned.into_inner().last_id(),
        };
        self.inner.retired().insert(thread, last);
        true
    }

    pub fn len(&self) -> usize {
        match self.inner.states.read() {
            Ok(states) => states.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("threads", &self.len())
            .finish()
    }
}
