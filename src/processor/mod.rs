//! Event processors
//!
//! The tracer reports four kinds of events to an [`EventProcessor`]: a call
//! started, a call finished normally, an exception is about to leave a frame,
//! and a handler restored the stack. Processors are injected when the tracer
//! is built; the default [`NullProcessor`] discards everything.
//!
//! - [`NullProcessor`]: no-op
//! - [`LogProcessor`]: one line per event into a per-thread file
//! - [`CollectingProcessor`]: keeps events in memory (embedding, tests)

mod log;

pub use self::log::LogProcessor;

use crate::error::Result;
use crate::frame::{root, CallContext, FrameId};
use crate::thread::{ThreadInfo, ThreadKey};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// What happened to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CallStart,
    CallFinish,
    Throw,
    Catch,
}

impl EventKind {
    /// Direction marker used in the log format
    pub fn marker(self) -> char {
        match self {
            EventKind::CallStart => '+',
            EventKind::CallFinish => '-',
            EventKind::Throw => '*',
            EventKind::Catch => '!',
        }
    }

    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            '+' => Some(EventKind::CallStart),
            '-' => Some(EventKind::CallFinish),
            '*' => Some(EventKind::Throw),
            '!' => Some(EventKind::Catch),
            _ => None,
        }
    }
}

/// One formatted trace record
///
/// Renders as the log line
/// `<marker> <frameId> <callerId> <owner>.<method> <callerOwner>.<callerMethod> <line>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub kind: EventKind,
    pub frame_id: FrameId,
    pub caller_id: FrameId,
    pub callee: String,
    pub caller: String,
    pub line: i32,
}

impl TraceEvent {
    /// Describe `context` and its caller
    ///
    /// ROOT has no caller; it is described as its own caller.
    pub fn new(kind: EventKind, context: &CallContext) -> Self {
        let caller = context.parent().unwrap_or_else(|| root());
        Self {
            kind,
            frame_id: context.id(),
            caller_id: context.caller_id(),
            callee: context.qualified_name(),
            caller: caller.qualified_name(),
            line: context.line(),
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.kind.marker(),
            self.frame_id,
            self.caller_id,
            self.callee,
            self.caller,
            self.line
        )
    }
}

/// Failure to read a log line back into a [`TraceEvent`]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseEventError {
    #[error("expected 6 fields, found {0}")]
    FieldCount(usize),

    #[error("unknown event marker '{0}'")]
    Marker(String),

    #[error("invalid number '{0}'")]
    Number(String),
}

impl FromStr for TraceEvent {
    type Err = ParseEventError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(ParseEventError::FieldCount(fields.len()));
        }

        let mut marker = fields[0].chars();
        let kind = match (marker.next(), marker.next()) {
            (Some(c), None) => EventKind::from_marker(c),
            _ => None,
        }
        .ok_or_else(|| ParseEventError::Marker(fields[0].to_string()))?;

        let id = |s: &str| {
            s.parse::<u64>()
                .map(FrameId::new)
                .map_err(|_| ParseEventError::Number(s.to_string()))
        };

        Ok(Self {
            kind,
            frame_id: id(fields[1])?,
            caller_id: id(fields[2])?,
            callee: fields[3].to_string(),
            caller: fields[4].to_string(),
            line: fields[5]
                .parse()
                .map_err(|_| ParseEventError::Number(fields[5].to_string()))?,
        })
    }
}

/// Receiver of call events
///
/// Called on the traced thread, inside the tracer's reentrancy guard. An
/// error is contained by the tracer: it is logged and counted, never handed
/// to the traced program.
pub trait EventProcessor: Send + Sync {
    fn process_call_start(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()>;

    fn process_call_finish(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()>;

    /// `context` is the frame the exception is leaving
    fn process_throw_exception(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()>;

    /// `context` is the frame the stack was restored to
    fn process_catch_exception(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()>;

    /// Release whatever is held for `thread`
    fn thread_exited(&self, _thread: ThreadKey) {}
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProcessor;

impl EventProcessor for NullProcessor {
    fn process_call_start(&self, _thread: &ThreadInfo, _context: &CallContext) -> Result<()> {
        Ok(())
    }

    fn process_call_finish(&self, _thread: &ThreadInfo, _context: &CallContext) -> Result<()> {
        Ok(())
    }

    fn process_throw_exception(&self, _thread: &ThreadInfo, _context: &CallContext) -> Result<()> {
        Ok(())
    }

    fn process_catch_exception(&self, _thread: &ThreadInfo, _context: &CallContext) -> Result<()> {
        Ok(())
    }
}

/// Keeps every event in memory, tagged with its thread
#[derive(Debug, Default)]
pub struct CollectingProcessor {
    events: Mutex<Vec<(ThreadKey, TraceEvent)>>,
}

impl CollectingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, thread: &ThreadInfo, kind: EventKind, context: &CallContext) {
        let event = TraceEvent::new(kind, context);
        match self.events.lock() {
            Ok(mut events) => events.push((thread.key, event)),
            Err(poisoned) => poisoned.into_inner().push((thread.key, event)),
        }
    }

    /// All events recorded so far, in arrival order
    pub fn events(&self) -> Vec<(ThreadKey, TraceEvent)> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events recorded on one thread, in that thread's order
    pub fn events_for(&self, thread: ThreadKey) -> Vec<TraceEvent> {
        self.events()
            .into_iter()
            .filter(|(key, _)| *key == thread)
            .map(|(_, event)| event)
            .collect()
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<(ThreadKey, TraceEvent)> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl EventProcessor for CollectingProcessor {
    fn process_call_start(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()> {
        self.push(thread, EventKind::CallStart, context);
        Ok(())
    }

    fn process_call_finish(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()> {
        self.push(thread, EventKind::CallFinish, context);
        Ok(())
    }

    fn process_throw_exception(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()> {
        self.push(thread, EventKind::Throw, context);
        Ok(())
    }

    fn process_catch_exception(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()> {
        self.push(thread, EventKind::Catch, context);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MethodKind;
    use std::sync::Arc;

    fn foo() -> Arc<CallContext> {
        Arc::new(CallContext::new(
            FrameId::new(1),
            ThreadKey::current(),
            "A",
            "foo",
            MethodKind::InstanceCall,
            10,
            root().clone(),
        ))
    }

    #[test]
    fn test_event_line_format() {
        let foo = foo();
        let bar = CallContext::new(
            FrameId::new(2),
            ThreadKey::current(),
            "A",
            "bar",
            MethodKind::StaticCall,
            12,
            foo.clone(),
        );

        assert_eq!(
            TraceEvent::new(EventKind::CallStart, &foo).to_string(),
            "+ 1 0 A.foo <root> 10"
        );
        assert_eq!(
            TraceEvent::new(EventKind::CallFinish, &bar).to_string(),
            "- 2 1 A.bar A.foo 12"
        );
        assert_eq!(
            TraceEvent::new(EventKind::Throw, &bar).to_string(),
            "* 2 1 A.bar A.foo 12"
        );
    }

    #[test]
    fn test_catch_at_root_describes_root() {
        assert_eq!(
            TraceEvent::new(EventKind::Catch, root()).to_string(),
            "! 0 0 <root> <root> -1"
        );
    }

    #[test]
    fn test_parse_log_line() {
        let event: TraceEvent = "- 2 1 A.bar A.foo 12".parse().unwrap();
        assert_eq!(event.kind, EventKind::CallFinish);
        assert_eq!(event.frame_id, FrameId::new(2));
        assert_eq!(event.caller_id, FrameId::new(1));
        assert_eq!(event.callee, "A.bar");
        assert_eq!(event.caller, "A.foo");
        assert_eq!(event.line, 12);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert_eq!(
            "+ 1 0 A.foo".parse::<TraceEvent>(),
            Err(ParseEventError::FieldCount(4))
        );
        assert_eq!(
            "? 1 0 A.foo <root> 1".parse::<TraceEvent>(),
            Err(ParseEventError::Marker("?".to_string()))
        );
        assert_eq!(
            "+ x 0 A.foo <root> 1".parse::<TraceEvent>(),
            Err(ParseEventError::Number("x".to_string()))
        );
    }

    #[test]
    fn test_event_serializes_to_json() {
        let json = serde_json::to_value(TraceEvent::new(EventKind::CallStart, &foo())).unwrap();
        assert_eq!(json["kind"], "call_start");
        assert_eq!(json["frame_id"], 1);
        assert_eq!(json["caller"], "<root>");
    }

    #[test]
    fn test_null_processor_accepts_everything() {
        let info = ThreadInfo::current();
        let foo = foo();
        let null = NullProcessor;
        assert!(null.process_call_start(&info, &foo).is_ok());
        assert!(null.process_call_finish(&info, &foo).is_ok());
        assert!(null.process_throw_exception(&info, &foo).is_ok());
        assert!(null.process_catch_exception(&info, &foo).is_ok());
    }

    #[test]
    fn test_collecting_processor_records_in_order() {
        let info = ThreadInfo::current();
        let foo = foo();
        let collector = CollectingProcessor::new();
        collector.process_call_start(&info, &foo).unwrap();
        collector.process_throw_exception(&info, &foo).unwrap();
        collector.process_catch_exception(&info, root()).unwrap();

        let kinds: Vec<EventKind> = collector
            .events_for(info.key)
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::CallStart, EventKind::Throw, EventKind::Catch]
        );

        assert_eq!(collector.take().len(), 3);
        assert!(collector.events().is_empty());
    }
}
