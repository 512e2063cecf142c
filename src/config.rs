//! Tracer options
//!
//! Options come from either a TOML file or the compact agent option string
//! handed over by the instrumentation front end:
//!
//! ```text
//! debug:includeInternalCalls:thread=3:captureStart=App.run:captureEnd=App.shutdown:processor=log:outputDir=/tmp/trace
//! ```
//!
//! # Example calltrace.toml
//!
//! ```toml
//! include_internal_calls = false
//! restrict_to_thread = 3
//! capture_start = "App.run"
//! capture_end = "App.shutdown"
//! processor = "log"
//! output_dir = "/tmp/trace"
//! guard = "per_thread"
//! exclude = ["^org/slf4j/"]
//! ```

use crate::error::ConfigError;
use crate::filter::{CallFilter, DEFAULT_INTERNAL_PREFIXES};
use crate::guard::GuardMode;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Event processor selected by the options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    #[default]
    Null,
    Log,
}

impl FromStr for ProcessorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "null" => Ok(ProcessorKind::Null),
            "log" => Ok(ProcessorKind::Log),
            other => Err(ConfigError::UnknownProcessor(other.to_string())),
        }
    }
}

/// A routine named as `Owner.method`
///
/// The owner is everything before the last `.`, so package-qualified owners
/// such as `com.example.App.run` work. A bare name without a dot matches that
/// method on any owner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct MethodRef {
    pub owner: Option<String>,
    pub method: String,
}

impl MethodRef {
    pub fn matches(&self, owner: &str, method: &str) -> bool {
        self.method == method && self.owner.as_deref().map_or(true, |o| o == owner)
    }
}

impl FromStr for MethodRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidMarker(s.to_string());
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        match s.rsplit_once('.') {
            Some((owner, method)) if !owner.is_empty() && !method.is_empty() => Ok(Self {
                owner: Some(owner.to_string()),
                method: method.to_string(),
            }),
            Some(_) => Err(invalid()),
            None => Ok(Self {
                owner: None,
                method: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for MethodRef {
    type Error = ConfigError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{}.{}", owner, self.method),
            None => f.write_str(&self.method),
        }
    }
}

/// Everything that configures a [`Tracer`](crate::tracer::Tracer)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerOptions {
    /// Enable diagnostic logging to stderr
    pub debug: bool,
    /// Trace calls into platform and tracer-internal namespaces
    pub include_internal_calls: bool,
    /// Only trace the thread with this key
    pub restrict_to_thread: Option<u64>,
    /// Start emitting events at the first call to this routine
    pub capture_start: Option<MethodRef>,
    /// Stop emitting events once the first call to this routine returns
    pub capture_end: Option<MethodRef>,
    pub processor: ProcessorKind,
    /// Directory for per-thread log files
    pub output_dir: PathBuf,
    pub guard: GuardMode,
    /// Namespaces excluded unless `include_internal_calls` is set
    pub internal_prefixes: Vec<String>,
    /// Owners matching any of these regexes are never traced
    pub exclude: Vec<String>,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            debug: false,
            include_internal_calls: false,
            restrict_to_thread: None,
            capture_start: None,
            capture_end: None,
            processor: ProcessorKind::Null,
            output_dir: PathBuf::from("."),
            guard: GuardMode::PerThread,
            internal_prefixes: DEFAULT_INTERNAL_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            exclude: Vec::new(),
        }
    }
}

impl TracerOptions {
    /// Load options from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml_str(&content).with_context(|| format!("Invalid options in {}", path.display()))
    }

    /// Load options from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let options: Self = toml::from_str(content).context("Failed to parse TOML")?;
        options.validate()?;
        Ok(options)
    }

    /// Parse the colon-separated agent option string
    ///
    /// Flags: `debug`, `includeInternalCalls`. Valued options: `thread=N`,
    /// `captureStart=M`, `captureEnd=M`, `processor=null|log`, `outputDir=D`,
    /// `guard=per_thread|global`, `exclude=REGEX` (repeatable). Unknown parts
    /// are ignored.
    pub fn parse_agent_options(options: &str) -> std::result::Result<Self, ConfigError> {
        let mut parsed = Self::default();

        for part in options.split(':').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = match part.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (part, None),
            };
            let required = || value.ok_or_else(|| ConfigError::MissingValue(name.to_string()));

            match name {
                "debug" => parsed.debug = true,
                "includeInternalCalls" => parsed.include_internal_calls = true,
                "thread" => {
                    let raw = required()?;
                    let id = raw
                        .parse::<u64>()
                        .map_err(|_| ConfigError::InvalidThread(raw.to_string()))?;
                    parsed.restrict_to_thread = Some(id);
                }
                "captureStart" => parsed.capture_start = Some(required()?.parse()?),
                "captureEnd" => parsed.capture_end = Some(required()?.parse()?),
                "processor" => parsed.processor = required()?.parse()?,
                "outputDir" => parsed.output_dir = PathBuf::from(required()?),
                "guard" => parsed.guard = required()?.parse()?,
                "exclude" => parsed.exclude.push(required()?.to_string()),
                other => tracing::debug!("ignoring unknown agent option '{}'", other),
            }
        }

        parsed.validate()?;
        Ok(parsed)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.restrict_to_thread == Some(0) {
            return Err(ConfigError::InvalidThread("0".to_string()));
        }
        self.filter().map(|_| ())
    }

    /// Instrumentation filter described by these options
    pub fn filter(&self) -> std::result::Result<CallFilter, ConfigError> {
        CallFilter::new(
            self.include_internal_calls,
            &self.internal_prefixes,
            &self.exclude,
        )
    }
}
