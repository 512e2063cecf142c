//! Per-thread context stack
//!
//! [`ContextStack`] is the mutable part of a thread's tracer state: the frame
//! id sequence and the pointer to the current top frame. Frames themselves are
//! immutable ([`CallContext`]); the stack only moves its top pointer.

use crate::error::{Result, TraceError};
use crate::frame::{root, CallContext, ContextHandle, FrameId, FrameIdGenerator, MethodKind};
use crate::thread::{ThreadInfo, ThreadKey};
use std::sync::Arc;

/// Live call stack of one thread
#[derive(Debug)]
pub struct ContextStack {
    info: ThreadInfo,
    ids: FrameIdGenerator,
    top: ContextHandle,
}

impl ContextStack {
    /// Empty stack (top = ROOT) owned by `info.key`
    pub fn new(info: ThreadInfo) -> Self {
        Self {
            info,
            ids: FrameIdGenerator::new(),
            top: root().clone(),
        }
    }

    /// Empty stack whose id sequence continues after `last`
    ///
    /// Used when a thread that is still running registers again, so its ids
    /// keep increasing.
    pub fn resume(info: ThreadInfo, last: FrameId) -> Self {
        Self {
            info,
            ids: FrameIdGenerator::resume_after(last),
            top: root().clone(),
        }
    }

    pub fn thread(&self) -> ThreadKey {
        self.info.key
    }

    pub fn info(&self) -> &ThreadInfo {
        &self.info
    }

    /// Allocate a frame id and push a new frame on top of the current one
    pub fn push(
        &mut self,
        owner: &str,
        method: &str,
        kind: MethodKind,
        line: i32,
    ) -> ContextHandle {
        let id = self.ids.next_id();
        let frame = Arc::new(CallContext::new(
            id,
            self.info.key,
            owner,
            method,
            kind,
            line,
            self.top.clone(),
        ));
        self.top = frame.clone();
        frame
    }

    /// Pop the top frame and return it
    ///
    /// Fails with [`TraceError::StackUnderflow`] when the stack is already at
    /// ROOT; the stack is left untouched in that case.
    pub fn pop(&mut self) -> Result<ContextHandle> {
        let parent = match self.top.parent() {
            Some(parent) => parent.clone(),
            None => {
                return Err(TraceError::StackUnderflow {
                    thread: self.info.key,
                    hook: "call finish",
                })
            }
        };
        Ok(std::mem::replace(&mut self.top, parent))
    }

    pub fn peek(&self) -> &ContextHandle {
        &self.top
    }

    /// Move the top pointer back to a previously captured snapshot
    ///
    /// The snapshot must be ROOT or a frame created by this thread.
    pub fn reset(&mut self, snapshot: ContextHandle) -> Result<()> {
        if !snapshot.is_root() && snapshot.thread() != self.info.key {
            return Err(TraceError::ForeignSnapshot {
                frame: snapshot.id(),
                owner: snapshot.thread(),
                thread: self.info.key,
            });
        }
        self.top = snapshot;
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.top.depth()
    }

    pub fn is_at_root(&self) -> bool {
        self.top.is_root()
    }

    /// Last frame id handed out on this thread
    pub fn last_id(&self) -> FrameId {
        self.ids.last()
    }
}
