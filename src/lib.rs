//! Calltrace - call-graph tracing runtime
//!
//! This library reconstructs, per thread, the live call stack of a running
//! program from hook calls placed at method entry, normal exit, exception
//! throw, and exception catch points, and reports every call event to a
//! pluggable processor (for example one log file per thread).

pub mod agent;
pub mod config;
pub mod context_stack;
pub mod error;
pub mod filter;
pub mod frame;
pub mod guard;
pub mod processor;
pub mod registry;
pub mod scope;
pub mod thread;
pub mod tracer;

pub use crate::frame::{CallContext, ContextHandle, MethodKind};
pub use crate::tracer::{Tracer, TracerStats};
