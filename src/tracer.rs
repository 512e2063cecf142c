//! Tracer facade
//!
//! [`Tracer`] is what the instrumentation calls. It owns the thread registry,
//! the reentrancy guard and the event processor, and implements the four
//! hooks:
//!
//! ```text
//! on_call_start ──► guard ──► thread stack: push ──────────► processor: call start
//! on_call_finish ─► guard ──► thread stack: pop ───────────► processor: call finish
//! on_throw ───────► guard ──► thread stack: peek ──────────► processor: throw
//! on_catch(S) ────► guard ──► thread stack: reset to S ────► processor: catch
//! ```
//!
//! # Exceptions
//!
//! A normal return pops exactly one frame. Unwinding skips the call-finish of
//! every frame between the throw site and the handler, so the stack is left
//! too deep. The collaborator captures [`Tracer::current_context`] when it
//! enters a region that may observe an exception and hands it to
//! [`Tracer::on_catch`] in the handler, which restores the stack in one step
//! regardless of how many frames were skipped.
//!
//! # Failure containment
//!
//! Hooks never fail and never panic on tracer defects. Underflows, foreign
//! snapshots and sink errors are logged with `tracing` and counted in
//! [`TracerStats`]; the traced program's control flow is never affected.

use crate::config::{MethodRef, ProcessorKind, TracerOptions};
use crate::context_stack::ContextStack;
use crate::error::{ConfigError, TraceError};
use crate::filter::CallFilter;
use crate::frame::{CallContext, ContextHandle, MethodKind};
use crate::guard::{GuardMode, ReentrancyGuard};
use crate::processor::{EventKind, EventProcessor, LogProcessor, NullProcessor};
use crate::registry::{ThreadRegistry, ThreadState};
use crate::thread::{ThreadInfo, ThreadKey};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, MutexGuard};

/// Counters describing what the tracer saw
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TracerStats {
    /// Threads whose state was created
    pub threads_seen: u64,
    /// Events handed to the processor
    pub events_emitted: u64,
    /// Call-finish or throw with no open frame
    pub underflows: u64,
    /// Catch with a snapshot from another thread
    pub foreign_snapshots: u64,
    /// Hook calls skipped because the thread was already inside the tracer
    pub reentrant_skips: u64,
    /// Processor errors (failed log opens or writes)
    pub sink_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    threads_seen: AtomicU64,
    events_emitted: AtomicU64,
    underflows: AtomicU64,
    foreign_snapshots: AtomicU64,
    reentrant_skips: AtomicU64,
    sink_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TracerStats {
        TracerStats {
            threads_seen: self.threads_seen.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            underflows: self.underflows.load(Ordering::Relaxed),
            foreign_snapshots: self.foreign_snapshots.load(Ordering::Relaxed),
            reentrant_skips: self.reentrant_skips.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }
}

const WINDOW_WAITING: u8 = 0;
const WINDOW_OPEN: u8 = 1;
const WINDOW_CLOSED: u8 = 2;

/// Process-wide capture window
///
/// Stack bookkeeping runs regardless of the window; only event delivery is
/// gated. The window opens at most once and closes at most once.
#[derive(Debug)]
struct CaptureWindow {
    start: Option<MethodRef>,
    end: Option<MethodRef>,
    state: AtomicU8,
}

impl CaptureWindow {
    fn new(start: Option<MethodRef>, end: Option<MethodRef>) -> Self {
        let state = if start.is_some() {
            WINDOW_WAITING
        } else {
            WINDOW_OPEN
        };
        Self {
            start,
            end,
            state: AtomicU8::new(state),
        }
    }

    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == WINDOW_OPEN
    }

    fn observe_start(&self, frame: &CallContext) {
        if let Some(start) = &self.start {
            if start.matches(frame.owner(), frame.method())
                && self
                    .state
                    .compare_exchange(WINDOW_WAITING, WINDOW_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                tracing::debug!("capture window opened at {}", frame.qualified_name());
            }
        }
    }

    fn observe_finish(&self, frame: &CallContext) {
        if let Some(end) = &self.end {
            if end.matches(frame.owner(), frame.method())
                && self
                    .state
                    .compare_exchange(WINDOW_OPEN, WINDOW_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                tracing::debug!("capture window closed after {}", frame.qualified_name());
            }
        }
    }
}

/// Call-graph tracer
pub struct Tracer {
    registry: ThreadRegistry,
    guard: ReentrancyGuard,
    processor: Arc<dyn EventProcessor>,
    filter: CallFilter,
    restrict_to: Option<u64>,
    window: CaptureWindow,
    counters: Arc<Counters>,
}

impl Tracer {
    /// Tracer with default settings reporting to `processor`
    pub fn new<P: EventProcessor + 'static>(processor: Arc<P>) -> Self {
        Self::builder().processor(processor).build()
    }

    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    /// Build a tracer, including its processor, from options
    pub fn from_options(options: &TracerOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        let processor: Arc<dyn EventProcessor> = match options.processor {
            ProcessorKind::Null => Arc::new(NullProcessor),
            ProcessorKind::Log => Arc::new(LogProcessor::new(&options.output_dir)),
        };

        Ok(Self::builder()
            .shared_processor(processor)
            .guard(options.guard)
            .filter(options.filter()?)
            .restrict_to_thread(options.restrict_to_thread)
            .capture(options.capture_start.clone(), options.capture_end.clone())
            .build())
    }

    /// Hook: a traced call is about to execute
    ///
    /// Returns the new frame, or `None` when the hook was skipped (another
    /// thread is selected, or the tracer is being re-entered).
    pub fn on_call_start(
        &self,
        owner: &str,
        method: &str,
        kind: MethodKind,
        line: i32,
    ) -> Option<ContextHandle> {
        if !self.traces_current_thread() {
            return None;
        }
        self.guarded_hook(|| {
            let state = self.thread_state();
            let mut stack = lock(&state);
            let frame = stack.push(owner, method, kind, line);
            self.window.observe_start(&frame);
            self.emit(stack.info(), EventKind::CallStart, &frame);
            frame
        })
    }

    /// Hook: the most recent traced call returned normally
    pub fn on_call_finish(&self) {
        if !self.traces_current_thread() {
            return;
        }
        self.guarded_hook(|| {
            let state = self.thread_state();
            let mut stack = lock(&state);
            // Report the frame while it is still the top, then unlink it
            let frame = stack.peek().clone();
            if !frame.is_root() {
                self.emit(stack.info(), EventKind::CallFinish, &frame);
            }
            match stack.pop() {
                Ok(_) => self.window.observe_finish(&frame),
                Err(err) => self.defect(&self.counters.underflows, err),
            }
        });
    }

    /// Hook: an exception is about to propagate out of the current frame
    ///
    /// The stack is left as it is; the handler's [`on_catch`](Self::on_catch)
    /// repairs it.
    pub fn on_throw(&self) {
        if !self.traces_current_thread() {
            return;
        }
        self.guarded_hook(|| {
            let state = self.thread_state();
            let stack = lock(&state);
            if stack.is_at_root() {
                let err = TraceError::StackUnderflow {
                    thread: stack.thread(),
                    hook: "throw",
                };
                self.defect(&self.counters.underflows, err);
                return;
            }
            self.emit(stack.info(), EventKind::Throw, stack.peek());
        });
    }

    /// Hook: a handler caught an exception; restore the stack to `snapshot`
    pub fn on_catch(&self, snapshot: &ContextHandle) {
        if !self.traces_current_thread() {
            return;
        }
        self.guarded_hook(|| {
            let state = self.thread_state();
            let mut stack = lock(&state);
            match stack.reset(snapshot.clone()) {
                Ok(()) => self.emit(stack.info(), EventKind::Catch, snapshot),
                Err(err) => self.defect(&self.counters.foreign_snapshots, err),
            }
        });
    }

    /// Current top frame of the calling thread, for use as a catch snapshot
    pub fn current_context(&self) -> Option<ContextHandle> {
        if !self.traces_current_thread() {
            return None;
        }
        self.guarded_hook(|| {
            let state = self.thread_state();
            let stack = lock(&state);
            stack.peek().clone()
        })
    }

    /// Number of open frames on the calling thread
    pub fn depth(&self) -> Option<usize> {
        self.current_context().map(|top| top.depth())
    }

    /// Whether the instrumentation should insert hooks for calls into `owner`
    pub fn should_trace(&self, owner: &str) -> bool {
        self.filter.should_trace(owner)
    }

    /// Drop the calling thread's state and close its sink
    ///
    /// Threads are also reaped automatically when they terminate; this lets a
    /// collaborator do it eagerly.
    pub fn thread_exited(&self) {
        let key = ThreadKey::current();
        if self.registry.unregister(key) {
            tracing::debug!("thread {} unregistered", key);
        }
    }

    /// Number of threads with live state
    pub fn thread_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> TracerStats {
        self.counters.snapshot()
    }

    pub fn guard_mode(&self) -> GuardMode {
        self.guard.mode()
    }

    fn traces_current_thread(&self) -> bool {
        self.restrict_to
            .map_or(true, |only| ThreadKey::current().as_u64() == only)
    }

    fn guarded_hook<R>(&self, hook: impl FnOnce() -> R) -> Option<R> {
        let result = self.guard.with(hook);
        if result.is_none() {
            Counters::bump(&self.counters.reentrant_skips);
        }
        result
    }

    fn thread_state(&self) -> ThreadState {
        let (state, created) = self.registry.current();
        if created {
            Counters::bump(&self.counters.threads_seen);
            tracing::debug!("tracing new thread {}", ThreadKey::current());
        }
        state
    }

    fn emit(&self, thread: &ThreadInfo, kind: EventKind, frame: &CallContext) {
        if !self.window.is_open() {
            return;
        }
        let delivered = match kind {
            EventKind::CallStart => self.processor.process_call_start(thread, frame),
            EventKind::CallFinish => self.processor.process_call_finish(thread, frame),
            EventKind::Throw => self.processor.process_throw_exception(thread, frame),
            EventKind::Catch => self.processor.process_catch_exception(thread, frame),
        };
        match delivered {
            Ok(()) => Counters::bump(&self.counters.events_emitted),
            Err(err) => self.defect(&self.counters.sink_failures, err),
        }
    }

    fn defect(&self, counter: &AtomicU64, err: TraceError) {
        Counters::bump(counter);
        tracing::warn!("{}", err);
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("registry", &self.registry)
            .field("guard", &self.guard.mode())
            .field("restrict_to", &self.restrict_to)
            .field("window", &self.window)
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock(state: &ThreadState) -> MutexGuard<'_, ContextStack> {
    match state.lock() {
        Ok(stack) => stack,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Assembles a [`Tracer`]
pub struct TracerBuilder {
    processor: Arc<dyn EventProcessor>,
    guard: GuardMode,
    filter: CallFilter,
    restrict_to: Option<u64>,
    capture_start: Option<MethodRef>,
    capture_end: Option<MethodRef>,
}

impl Default for TracerBuilder {
    fn default() -> Self {
        Self {
            processor: Arc::new(NullProcessor),
            guard: GuardMode::default(),
            filter: CallFilter::default(),
            restrict_to: None,
            capture_start: None,
            capture_end: None,
        }
    }
}

impl TracerBuilder {
    pub fn processor<P: EventProcessor + 'static>(self, processor: Arc<P>) -> Self {
        self.shared_processor(processor)
    }

    pub fn shared_processor(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn guard(mut self, mode: GuardMode) -> Self {
        self.guard = mode;
        self
    }

    pub fn filter(mut self, filter: CallFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Only trace the thread whose [`ThreadKey`] has this value
    pub fn restrict_to_thread(mut self, thread: Option<u64>) -> Self {
        self.restrict_to = thread;
        self
    }

    pub fn capture(mut self, start: Option<MethodRef>, end: Option<MethodRef>) -> Self {
        self.capture_start = start;
        self.capture_end = end;
        self
    }

    pub fn build(self) -> Tracer {
        let counters = Arc::new(Counters::default());
        let processor = self.processor;

        let reaped = processor.clone();
        let registry = ThreadRegistry::with_reap_listener(move |thread| {
            reaped.thread_exited(thread);
        });

        Tracer {
            registry,
            guard: ReentrancyGuard::new(self.guard),
            processor,
            filter: self.filter,
            restrict_to: self.restrict_to,
            window: CaptureWindow::new(self.capture_start, self.capture_end),
            counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{root, FrameId};
    use crate::processor::CollectingProcessor;

    fn tracer() -> (Tracer, Arc<CollectingProcessor>) {
        let collector = Arc::new(CollectingProcessor::new());
        (Tracer::new(collector.clone()), collector)
    }

    fn lines(collector: &CollectingProcessor) -> Vec<String> {
        collector
            .events_for(ThreadKey::current())
            .iter()
            .map(|e| e.to_string())
            .collect()
    }

    #[test]
    fn test_start_and_finish_scenario() {
        let (tracer, collector) = tracer();

        let foo = tracer
            .on_call_start("A", "foo", MethodKind::InstanceCall, 10)
            .unwrap();
        assert_eq!(foo.id(), FrameId::new(1));
        assert_eq!(foo.caller_id(), FrameId::ROOT);

        let bar = tracer
            .on_call_start("A", "bar", MethodKind::StaticCall, 12)
            .unwrap();
        assert_eq!(bar.id(), FrameId::new(2));
        assert_eq!(bar.caller_id(), FrameId::new(1));

        tracer.on_call_finish();
        assert!(Arc::ptr_eq(&tracer.current_context().unwrap(), &foo));

        tracer.on_call_finish();
        assert!(Arc::ptr_eq(&tracer.current_context().unwrap(), root()));

        assert_eq!(
            lines(&collector),
            vec![
                "+ 1 0 A.foo <root> 10",
                "+ 2 1 A.bar A.foo 12",
                "- 2 1 A.bar A.foo 12",
                "- 1 0 A.foo <root> 10",
            ]
        );
    }

    #[test]
    fn test_throw_then_catch_restores_snapshot() {
        let (tracer, collector) = tracer();
        let snapshot = tracer.current_context().unwrap();

        tracer.on_call_start("A", "foo", MethodKind::InstanceCall, 10);
        tracer.on_call_start("A", "bar", MethodKind::InstanceCall, 11);
        tracer.on_throw();
        assert_eq!(tracer.depth(), Some(2));

        tracer.on_catch(&snapshot);
        assert_eq!(tracer.depth(), Some(0));

        let kinds: Vec<EventKind> = collector
            .events_for(ThreadKey::current())
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::CallStart,
                EventKind::CallStart,
                EventKind::Throw,
                EventKind::Catch
            ]
        );
    }

    #[test]
    fn test_finish_at_root_is_counted_not_raised() {
        let (tracer, collector) = tracer();
        tracer.on_call_finish();
        tracer.on_throw();

        let stats = tracer.stats();
        assert_eq!(stats.underflows, 2);
        assert_eq!(stats.events_emitted, 0);
        assert!(collector.events().is_empty());
        assert_eq!(tracer.depth(), Some(0));
    }

    #[test]
    fn test_foreign_snapshot_is_ignored() {
        let tracer = Arc::new(Tracer::new(Arc::new(NullProcessor)));

        let other = tracer.clone();
        let foreign = std::thread::spawn(move || {
            other
                .on_call_start("B", "run", MethodKind::InstanceCall, 1)
                .unwrap()
        })
        .join()
        .unwrap();

        tracer.on_call_start("A", "foo", MethodKind::InstanceCall, 1);
        tracer.on_catch(&foreign);

        assert_eq!(tracer.depth(), Some(1));
        assert_eq!(tracer.stats().foreign_snapshots, 1);
    }

    #[test]
    fn test_restricted_to_other_thread_is_noop() {
        let collector = Arc::new(CollectingProcessor::new());
        let tracer = Tracer::builder()
            .processor(collector.clone())
            .restrict_to_thread(Some(u64::MAX))
            .build();

        assert!(tracer
            .on_call_start("A", "foo", MethodKind::InstanceCall, 1)
            .is_none());
        tracer.on_call_finish();
        assert!(tracer.current_context().is_none());
        assert_eq!(tracer.thread_count(), 0);
        assert!(collector.events().is_empty());
    }

    #[test]
    fn test_restricted_to_this_thread_traces() {
        let tracer = Tracer::builder()
            .restrict_to_thread(Some(ThreadKey::current().as_u64()))
            .build();
        assert!(tracer
            .on_call_start("A", "foo", MethodKind::InstanceCall, 1)
            .is_some());
        assert_eq!(tracer.depth(), Some(1));
    }

    #[test]
    fn test_capture_window() {
        let collector = Arc::new(CollectingProcessor::new());
        let tracer = Tracer::builder()
            .processor(collector.clone())
            .capture(
                Some("App.run".parse().unwrap()),
                Some("App.stop".parse().unwrap()),
            )
            .build();

        tracer.on_call_start("App", "init", MethodKind::StaticCall, 1);
        tracer.on_call_finish();
        tracer.on_call_start("App", "run", MethodKind::StaticCall, 2);
        tracer.on_call_start("App", "stop", MethodKind::StaticCall, 3);
        tracer.on_call_finish();
        tracer.on_call_finish();
        tracer.on_call_start("App", "run", MethodKind::StaticCall, 4);

        assert_eq!(
            lines(&collector),
            vec![
                "+ 2 0 App.run <root> 2",
                "+ 3 2 App.stop App.run 3",
                "- 3 2 App.stop App.run 3",
            ]
        );
        // Bookkeeping continued outside the window
        assert_eq!(tracer.depth(), Some(1));
    }

    #[test]
    fn test_from_options_uses_filter() {
        let options = TracerOptions {
            exclude: vec!["^com/generated/".to_string()],
            ..TracerOptions::default()
        };
        let tracer = Tracer::from_options(&options).unwrap();
        assert!(tracer.should_trace("com/example/App"));
        assert!(!tracer.should_trace("com/generated/Stub"));
        assert!(!tracer.should_trace("java/lang/String"));
    }

    #[test]
    fn test_from_options_rejects_invalid() {
        let options = TracerOptions {
            restrict_to_thread: Some(0),
            ..TracerOptions::default()
        };
        assert!(Tracer::from_options(&options).is_err());
    }

    #[test]
    fn test_thread_exited_drops_state_but_keeps_ids() {
        let (tracer, collector) = tracer();
        tracer.on_call_start("A", "foo", MethodKind::InstanceCall, 1);
        tracer.on_call_finish();
        assert_eq!(tracer.thread_count(), 1);

        tracer.thread_exited();
        assert_eq!(tracer.thread_count(), 0);

        // A later hook starts over from ROOT; ids keep increasing
        let again = tracer
            .on_call_start("A", "bar", MethodKind::InstanceCall, 2)
            .unwrap();
        assert_eq!(again.id(), FrameId::new(2));
        assert_eq!(again.caller_id(), FrameId::ROOT);
        assert_eq!(tracer.stats().threads_seen, 2);
        assert_eq!(
            lines(&collector),
            vec![
                "+ 1 0 A.foo <root> 1",
                "- 1 0 A.foo <root> 1",
                "+ 2 0 A.bar <root> 2",
            ]
        );
    }

    #[test]
    fn test_finish_reports_frame_before_unlinking() {
        let (tracer, collector) = tracer();
        let foo = tracer
            .on_call_start("A", "foo", MethodKind::InstanceCall, 1)
            .unwrap();
        tracer.on_call_finish();

        let events = collector.events_for(ThreadKey::current());
        assert_eq!(events[1].kind, EventKind::CallFinish);
        assert_eq!(events[1].frame_id, foo.id());
        assert_eq!(tracer.depth(), Some(0));
    }
}
