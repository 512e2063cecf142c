//! Namespace filtering for instrumentation decisions
//!
//! The hook-insertion side asks [`CallFilter::should_trace`] whether calls
//! into a routine's owner should get hooks at all. Filtering has to happen
//! there, not inside the hooks: skipping a call-start while still receiving
//! its call-finish would break the stack pairing.
//!
//! Two rules apply:
//! - Platform and tracer-internal namespaces are excluded unless
//!   `include_internal_calls` is set
//! - Owners matching any user `exclude` regex are always excluded

use crate::error::ConfigError;
use regex::Regex;

/// Namespaces treated as internal by default
///
/// Owners are compared with `.` normalized to `/`, so `java.util.Map` and
/// `java/util/Map` both match `java/`.
pub const DEFAULT_INTERNAL_PREFIXES: &[&str] = &[
    "java/",
    "javax/",
    "jdk/",
    "sun/",
    "com/sun/",
    "std::",
    "core::",
    "alloc::",
    "calltrace::",
];

/// Decides which routines are instrumented
#[derive(Debug, Clone)]
pub struct CallFilter {
    include_internal: bool,
    internal_prefixes: Vec<String>,
    exclude: Vec<Regex>,
}

impl CallFilter {
    /// Filter that traces everything
    pub fn all() -> Self {
        Self {
            include_internal: true,
            internal_prefixes: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Build a filter from option values
    pub fn new<S: AsRef<str>>(
        include_internal: bool,
        internal_prefixes: &[S],
        exclude: &[S],
    ) -> Result<Self, ConfigError> {
        let exclude = exclude
            .iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|err| ConfigError::InvalidPattern {
                    pattern: pattern.as_ref().to_string(),
                    reason: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            include_internal,
            internal_prefixes: internal_prefixes
                .iter()
                .map(|p| normalize(p.as_ref()))
                .collect(),
            exclude,
        })
    }

    /// Whether calls into `owner` should be traced
    pub fn should_trace(&self, owner: &str) -> bool {
        if !self.include_internal && self.is_internal(owner) {
            return false;
        }
        !self.exclude.iter().any(|re| re.is_match(owner))
    }

    /// Whether `owner` lives in an internal namespace
    pub fn is_internal(&self, owner: &str) -> bool {
        let owner = normalize(owner);
        self.internal_prefixes
            .iter()
            .any(|prefix| owner.starts_with(prefix.as_str()))
    }
}

impl Default for CallFilter {
    fn default() -> Self {
        Self {
            include_internal: false,
            internal_prefixes: DEFAULT_INTERNAL_PREFIXES
                .iter()
                .map(|p| normalize(p))
                .collect(),
            exclude: Vec::new(),
        }
    }
}

fn normalize(name: &str) -> String {
    // `::` separators are kept intact; only single dots are package separators
    if name.contains("::") {
        name.to_string()
    } else {
        name.replace('.', "/")
    }
}
