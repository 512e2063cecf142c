//! Per-thread log files
//!
//! [`LogProcessor`] writes one line per event (see [`TraceEvent`]) into a file
//! named `<thread name>_<thread key>` inside its output directory. The file is
//! created on the thread's first event and kept open until the thread exits;
//! every line is flushed as soon as it is written, so a crash loses nothing
//! that was already reported.
//!
//! A thread whose sink was closed with `thread_exited` while it kept running
//! reopens the same file in append mode; only the first open of a thread's
//! file truncates it.
//!
//! If a thread's file cannot be created or written, recording stops for that
//! thread only. The failure is returned once so the tracer can count it;
//! later events on that thread are dropped silently.

use super::{EventKind, EventProcessor, TraceEvent};
use crate::error::{Result, TraceError};
use crate::frame::CallContext;
use crate::thread::{ThreadInfo, ThreadKey};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

enum Sink {
    Open(LineWriter<File>),
    Disabled,
}

type SharedSink = Arc<Mutex<Sink>>;

/// Writes trace lines to one file per thread
pub struct LogProcessor {
    dir: PathBuf,
    sinks: RwLock<HashMap<ThreadKey, SharedSink>>,
    /// Threads whose file has been created by this processor
    created: Mutex<HashSet<ThreadKey>>,
}

impl LogProcessor {
    /// Log into files under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sinks: RwLock::new(HashMap::new()),
            created: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `thread`
    pub fn log_path(&self, thread: &ThreadInfo) -> PathBuf {
        self.dir.join(thread.log_file_name())
    }

    /// Whether `thread` currently has an open log file
    pub fn is_open(&self, thread: ThreadKey) -> bool {
        self.existing(thread)
            .map(|sink| matches!(*lock(&sink), Sink::Open(_)))
            .unwrap_or(false)
    }

    fn existing(&self, thread: ThreadKey) -> Option<SharedSink> {
        let sinks = match self.sinks.read() {
            Ok(sinks) => sinks,
            Err(poisoned) => poisoned.into_inner(),
        };
        sinks.get(&thread).cloned()
    }

    /// Sink of `thread`, opening its file on first use
    fn sink(&self, thread: &ThreadInfo) -> Result<SharedSink> {
        if let Some(sink) = self.existing(thread.key) {
            return Ok(sink);
        }

        let path = self.log_path(thread);
        let (sink, opened) = match self.open(thread.key, &path) {
            Ok(file) => (Sink::Open(LineWriter::new(file)), Ok(())),
            Err(source) => {
                tracing::warn!(
                    "disabling trace log for thread {}: cannot open {}: {}",
                    thread.key,
                    path.display(),
                    source
                );
                (
                    Sink::Disabled,
                    Err(TraceError::SinkOpen {
                        path: path.display().to_string(),
                        source,
                    }),
                )
            }
        };

        let sink = Arc::new(Mutex::new(sink));
        let mut sinks = match self.sinks.write() {
            Ok(sinks) => sinks,
            Err(poisoned) => poisoned.into_inner(),
        };
        sinks.insert(thread.key, sink.clone());
        drop(sinks);

        opened.map(|()| sink)
    }

    /// Truncate on the first open for `thread`, append afterwards
    fn open(&self, thread: ThreadKey, path: &Path) -> std::io::Result<File> {
        let first = match self.created.lock() {
            Ok(mut created) => created.insert(thread),
            Err(poisoned) => poisoned.into_inner().insert(thread),
        };
        let mut options = OpenOptions::new();
        options.create(true);
        if first {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        options.open(path)
    }

    fn write(&self, thread: &ThreadInfo, kind: EventKind, context: &CallContext) -> Result<()> {
        let sink = self.sink(thread)?;
        let mut sink = lock(&sink);
        let Sink::Open(writer) = &mut *sink else {
            return Ok(());
        };

        let line = TraceEvent::new(kind, context);
        if let Err(err) = writeln!(writer, "{}", line).and_then(|()| writer.flush()) {
            tracing::warn!(
                "disabling trace log for thread {} after write failure: {}",
                thread.key,
                err
            );
            *sink = Sink::Disabled;
            return Err(TraceError::SinkWrite(err));
        }
        Ok(())
    }
}

fn lock(sink: &SharedSink) -> std::sync::MutexGuard<'_, Sink> {
    match sink.lock() {
        Ok(sink) => sink,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl EventProcessor for LogProcessor {
    fn process_call_start(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()> {
        self.write(thread, EventKind::CallStart, context)
    }

    fn process_call_finish(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()> {
        self.write(thread, EventKind::CallFinish, context)
    }

    fn process_throw_exception(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()> {
        self.write(thread, EventKind::Throw, context)
    }

    fn process_catch_exception(&self, thread: &ThreadInfo, context: &CallContext) -> Result<()> {
        self.write(thread, EventKind::Catch, context)
    }

    fn thread_exited(&self, thread: ThreadKey) {
        let removed = match self.sinks.write() {
            Ok(mut sinks) => sinks.remove(&thread),
            Err(poisoned) => poisoned.into_inner().remove(&thread),
        };
        if let Some(sink) = removed {
            if let Sink::Open(writer) = &mut *lock(&sink) {
                let _ = writer.flush();
            }
        }
    }
}

impl std::fmt::Debug for LogProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogProcessor").field("dir", &self.dir).finish()
    }
}
