//! RAII call scopes and panic-safe guarded regions
//!
//! This is the collaborator side of the hook protocol for Rust code that
//! calls the tracer by hand instead of through a rewriting front end.
//!
//! ```
//! use calltrace::frame::MethodKind;
//! use calltrace::processor::CollectingProcessor;
//! use calltrace::tracer::Tracer;
//! use std::panic::AssertUnwindSafe;
//! use std::sync::Arc;
//!
//! let tracer = Tracer::new(Arc::new(CollectingProcessor::new()));
//!
//! let outcome = tracer.guarded(AssertUnwindSafe(|| {
//!     let _run = tracer.enter("App", "run", MethodKind::StaticCall, 3);
//!     let _parse = tracer.enter("Parser", "parse", MethodKind::InstanceCall, 9);
//!     panic!("bad input");
//! }));
//!
//! assert!(outcome.is_err());
//! assert_eq!(tracer.depth(), Some(0));
//! ```
//!
//! A panic plays the role of an exception: the innermost open scope reports a
//! throw, the frames being unwound get no finish events, and the enclosing
//! [`Tracer::guarded`] region restores the stack to its entry snapshot.

use crate::frame::{ContextHandle, MethodKind};
use crate::tracer::Tracer;
use std::panic::{self, UnwindSafe};
use std::sync::Arc;

/// An open frame that is finished when dropped
#[must_use = "the frame is finished as soon as the scope is dropped"]
pub struct CallScope<'t> {
    tracer: &'t Tracer,
    frame: Option<ContextHandle>,
    // Set when the scope was opened by a destructor running during a panic
    entered_panicking: bool,
}

impl CallScope<'_> {
    /// The frame this scope opened, if the call was traced
    pub fn frame(&self) -> Option<&ContextHandle> {
        self.frame.as_ref()
    }
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };

        // A scope opened while already unwinding returns normally; only a
        // panic that started after entry leaves its frame.
        if self.entered_panicking || !std::thread::panicking() {
            self.tracer.on_call_finish();
            return;
        }

        // Only the frame the panic is leaving reports it; outer scopes see a
        // top that is deeper than their own frame and stay silent.
        let is_top = self
            .tracer
            .current_context()
            .is_some_and(|top| Arc::ptr_eq(&top, &frame));
        if is_top {
            self.tracer.on_throw();
        }
    }
}

impl std::fmt::Debug for CallScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallScope")
            .field("frame", &self.frame.as_ref().map(|frame| frame.id()))
            .finish()
    }
}

impl Tracer {
    /// Start a traced call that finishes when the returned scope is dropped
    pub fn enter(&self, owner: &str, method: &str, kind: MethodKind, line: i32) -> CallScope<'_> {
        CallScope {
            tracer: self,
            frame: self.on_call_start(owner, method, kind, line),
            entered_panicking: std::thread::panicking(),
        }
    }

    /// Run `f` as one traced call
    pub fn trace_call<R>(
        &self,
        owner: &str,
        method: &str,
        kind: MethodKind,
        line: i32,
        f: impl FnOnce() -> R,
    ) -> R {
        let _scope = self.enter(owner, method, kind, line);
        f()
    }

    /// Run `f` as a region whose panics are caught
    ///
    /// The current frame is captured on entry. If `f` panics, the stack is
    /// restored to it with [`Tracer::on_catch`] and the panic payload is
    /// returned.
    pub fn guarded<R>(&self, f: impl FnOnce() -> R + UnwindSafe) -> std::thread::Result<R> {
        let snapshot = self.current_context();
        panic::catch_unwind(f).map_err(|payload| {
            if let Some(snapshot) = &snapshot {
                self.on_catch(snapshot);
            }
            payload
        })
    }
}
