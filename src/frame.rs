//! Call frames and frame identity
//!
//! A [`CallContext`] records one traced invocation. Contexts form a singly
//! linked chain from the top of a thread's stack down to the shared [`root`]
//! frame. Once built, a context never changes: pushing a new frame links a new
//! record on top, popping simply moves the thread's top pointer back to the
//! parent. Snapshots are therefore just clones of the `Arc` handle.
//!
//! ```text
//!   stack top ──► [id 3, caller 2] ──► [id 2, caller 1] ──► [id 1, caller 0] ──► ROOT (id 0)
//!                                                                                 ▲
//!   other thread top ──► [id 1, caller 0] ────────────────────────────────────────┘
//! ```
//!
//! Frame ids come from a per-thread [`FrameIdGenerator`]. They are strictly
//! increasing within one thread and start at 1; 0 is reserved for ROOT. Ids
//! from different threads are unrelated.

use crate::thread::ThreadKey;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Frame identifier, unique within its thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FrameId(u64);

impl FrameId {
    pub const ROOT: FrameId = FrameId(0);

    pub const fn new(id: u64) -> Self {
        FrameId(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-thread frame id sequence
///
/// The counter starts at 0 and is incremented before each id is handed out,
/// so the first frame on a thread is id 1.
#[derive(Debug, Default)]
pub struct FrameIdGenerator {
    last: u64,
}

impl FrameIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue a sequence whose last handed-out id was `last`
    pub fn resume_after(last: FrameId) -> Self {
        Self { last: last.0 }
    }

    pub fn next_id(&mut self) -> FrameId {
        self.last += 1;
        FrameId(self.last)
    }

    /// Last id handed out (ROOT if none yet)
    pub fn last(&self) -> FrameId {
        FrameId(self.last)
    }
}

/// Shape of the instruction or expression that performed a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSite {
    /// Dispatch through a receiver's class
    Virtual,
    /// Dispatch through an interface
    Interface,
    /// Direct call of a constructor, private or super method
    Special,
    /// Call with no receiver
    Static,
    /// Call resolved at run time (lambdas, bootstrap methods)
    Dynamic,
}

/// Classification of a traced routine, used for log readability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Root,
    Constructor,
    StaticInitializer,
    InstanceCall,
    StaticCall,
    DynamicCall,
}

impl MethodKind {
    /// Name the platform uses for constructors
    pub const CONSTRUCTOR_NAME: &'static str = "<init>";
    /// Name the platform uses for static initializers
    pub const STATIC_INITIALIZER_NAME: &'static str = "<clinit>";

    /// Derive the kind from the called method's name and the call-site shape
    ///
    /// Constructor and static-initializer names win over the call site,
    /// since both are reached through special or implicit dispatch.
    pub fn classify(method_name: &str, site: CallSite) -> Self {
        match method_name {
            Self::CONSTRUCTOR_NAME => MethodKind::Constructor,
            Self::STATIC_INITIALIZER_NAME => MethodKind::StaticInitializer,
            _ => match site {
                CallSite::Virtual | CallSite::Interface | CallSite::Special => {
                    MethodKind::InstanceCall
                }
                CallSite::Static => MethodKind::StaticCall,
                CallSite::Dynamic => MethodKind::DynamicCall,
            },
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodKind::Root => "root",
            MethodKind::Constructor => "constructor",
            MethodKind::StaticInitializer => "static initializer",
            MethodKind::InstanceCall => "instance method",
            MethodKind::StaticCall => "static method",
            MethodKind::DynamicCall => "dynamic call",
        };
        f.write_str(name)
    }
}

/// Source line of a call site, if known
///
/// Stored as the raw value handed over by the instrumentation; negative
/// numbers (conventionally -1) mean unknown.
pub const UNKNOWN_LINE: i32 = -1;

/// Immutable record of one call frame
pub struct CallContext {
    id: FrameId,
    caller_id: FrameId,
    thread: ThreadKey,
    owner: String,
    method: String,
    kind: MethodKind,
    line: i32,
    depth: usize,
    parent: Option<Arc<CallContext>>,
}

/// Shared handle to a call frame, also used as a catch snapshot
pub type ContextHandle = Arc<CallContext>;

/// Method name carried by the ROOT frame
pub const ROOT_METHOD: &str = "<root>";

static ROOT: OnceLock<ContextHandle> = OnceLock::new();

/// The process-wide ROOT frame every thread's stack starts from
pub fn root() -> &'static ContextHandle {
    ROOT.get_or_init(|| {
        Arc::new(CallContext {
            id: FrameId::ROOT,
            caller_id: FrameId::ROOT,
            thread: ThreadKey::ROOT,
            owner: String::new(),
            method: ROOT_METHOD.to_string(),
            kind: MethodKind::Root,
            line: UNKNOWN_LINE,
            depth: 0,
            parent: None,
        })
    })
}

impl CallContext {
    /// Build a frame on top of `parent`
    pub fn new(
        id: FrameId,
        thread: ThreadKey,
        owner: impl Into<String>,
        method: impl Into<String>,
        kind: MethodKind,
        line: i32,
        parent: ContextHandle,
    ) -> Self {
        Self {
            id,
            caller_id: parent.id,
            thread,
            owner: owner.into(),
            method: method.into(),
            kind,
            line,
            depth: parent.depth + 1,
            parent: Some(parent),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn caller_id(&self) -> FrameId {
        self.caller_id
    }

    /// Thread that created this frame ([`ThreadKey::ROOT`] for ROOT)
    pub fn thread(&self) -> ThreadKey {
        self.thread
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn line(&self) -> i32 {
        self.line
    }

    /// Number of parent links between this frame and ROOT
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Enclosing frame; `None` only for ROOT
    pub fn parent(&self) -> Option<&ContextHandle> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// `owner.method`, or just `method` for routines without an owner
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.owner, &self.method)
    }

    /// Iterate from this frame down to (and including) ROOT
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors { next: Some(self) }
    }
}

/// Render a routine name as a single whitespace-free log token
pub fn qualified_name(owner: &str, method: &str) -> String {
    match (owner.is_empty(), method.is_empty()) {
        (true, true) => "<dynamic>".to_string(),
        (true, false) => method.to_string(),
        (false, true) => format!("{}.<dynamic>", owner),
        (false, false) => format!("{}.{}", owner, method),
    }
}

impl fmt::Debug for CallContext {
    // The parent chain is summarized by its depth; printing it in full would
    // repeat every ancestor.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("id", &self.id)
            .field("caller_id", &self.caller_id)
            .field("thread", &self.thread)
            .field("name", &self.qualified_name())
            .field("kind", &self.kind)
            .field("line", &self.line)
            .field("depth", &self.depth)
            .finish()
    }
}

pub struct Ancestors<'a> {
    next: Option<&'a CallContext>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a CallContext;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent.as_deref();
        Some(current)
    }
}

impl Drop for CallContext {
    // Unlink iteratively: a thread that leaks a very deep stack would
    // otherwise overflow the native stack when the chain is released.
    fn drop(&mut self) {
        let mut next = self.parent.take();
        while let Some(parent) = next {
            match Arc::try_unwrap(parent) {
                Ok(mut ctx) => next = ctx.parent.take(),
                Err(_) => break,
            }
        }
    }
}
