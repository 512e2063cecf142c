//! Error types for the tracing runtime and its configuration
//!
//! Runtime errors never reach the traced program: the [`Tracer`](crate::tracer::Tracer)
//! hooks convert every [`TraceError`] into a diagnostic log line and a defect
//! counter. They are still typed so that lower layers (the context stack, the
//! sinks) can be tested on their own.

use crate::frame::FrameId;
use crate::thread::ThreadKey;
use thiserror::Error;

/// Defects detected while maintaining a thread's call stack or writing its log
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("stack underflow on thread {thread}: {hook} observed with no open frame")]
    StackUnderflow { thread: ThreadKey, hook: &'static str },

    #[error("snapshot frame {frame} belongs to thread {owner}, restored on thread {thread}")]
    ForeignSnapshot {
        frame: FrameId,
        owner: ThreadKey,
        thread: ThreadKey,
    },

    #[error("cannot open trace sink {path}: {source}")]
    SinkOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("trace sink write failed: {0}")]
    SinkWrite(#[from] std::io::Error),
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, TraceError>;

/// Errors raised while parsing or validating tracer options
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("option '{0}' requires a value (expected {0}=VALUE)")]
    MissingValue(String),

    #[error("invalid thread id '{0}': expected a positive integer")]
    InvalidThread(String),

    #[error("unknown processor '{0}' (expected 'null' or 'log')")]
    UnknownProcessor(String),

    #[error("unknown guard mode '{0}' (expected 'per_thread' or 'global')")]
    UnknownGuard(String),

    #[error("invalid method marker '{0}': expected Owner.method")]
    InvalidMarker(String),

    #[error("invalid exclude pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
