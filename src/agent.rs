//! Process-wide tracer
//!
//! A hook-insertion front end that rewrites arbitrary code cannot thread a
//! `&Tracer` through it. Instead it installs one tracer for the process and
//! emits calls to the free functions in this module. Until a tracer is
//! installed every hook is a no-op.
//!
//! `install_from_env` reads the agent option string from `CALLTRACE_OPTIONS`,
//! or a TOML file named by `CALLTRACE_CONFIG`.

use crate::config::TracerOptions;
use crate::frame::{ContextHandle, MethodKind};
use crate::tracer::Tracer;
use anyhow::{Context, Result};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the agent option string
pub const OPTIONS_ENV: &str = "CALLTRACE_OPTIONS";

/// Environment variable naming a TOML options file
pub const CONFIG_ENV: &str = "CALLTRACE_CONFIG";

static TRACER: OnceLock<Tracer> = OnceLock::new();

/// Install `tracer` as the process-wide tracer
///
/// Only the first install wins; a later one hands its tracer back.
pub fn install(tracer: Tracer) -> std::result::Result<(), Tracer> {
    TRACER.set(tracer)
}

/// Build a tracer from the environment and install it
pub fn install_from_env() -> Result<&'static Tracer> {
    let options = options_from_env()?;
    init_tracing(options.debug);

    let tracer = Tracer::from_options(&options).context("Invalid tracer options")?;
    tracing::debug!("installing tracer: {:?}", options);
    install(tracer).map_err(|_| anyhow::anyhow!("A tracer is already installed"))?;
    self::tracer().context("Tracer missing after install")
}

fn options_from_env() -> Result<TracerOptions> {
    if let Ok(agent_options) = std::env::var(OPTIONS_ENV) {
        return TracerOptions::parse_agent_options(&agent_options)
            .with_context(|| format!("Failed to parse {}", OPTIONS_ENV));
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return TracerOptions::from_file(path);
    }
    Ok(TracerOptions::default())
}

/// Directive used for debug output when `RUST_LOG` is unset or invalid
const DEBUG_DIRECTIVE: &str = "calltrace=debug";

/// Initialize tracing subscriber for debug output
///
/// Does nothing unless `debug` is set, or when a subscriber is already
/// installed. `RUST_LOG` selects the levels; without it only this crate's
/// debug output is shown.
pub fn init_tracing(debug: bool) {
    if debug {
        let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(debug_filter(rust_log.as_deref()))
            .with_writer(std::io::stderr)
            .try_init();
    }
}

fn debug_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEBUG_DIRECTIVE))
}

/// The installed tracer, if any
pub fn tracer() -> Option<&'static Tracer> {
    TRACER.get()
}

pub fn is_installed() -> bool {
    TRACER.get().is_some()
}

/// See [`Tracer::on_call_start`]
pub fn call_start(owner: &str, method: &str, kind: MethodKind, line: i32) -> Option<ContextHandle> {
    tracer().and_then(|t| t.on_call_start(owner, method, kind, line))
}

/// See [`Tracer::on_call_finish`]
pub fn call_finish() {
    if let Some(t) = tracer() {
        t.on_call_finish();
    }
}

/// See [`Tracer::on_throw`]
pub fn throw() {
    if let Some(t) = tracer() {
        t.on_throw();
    }
}

/// See [`Tracer::on_catch`]
pub fn catch(snapshot: &ContextHandle) {
    if let Some(t) = tracer() {
        t.on_catch(snapshot);
    }
}

pub fn current_context() -> Option<ContextHandle> {
    tracer().and_then(Tracer::current_context)
}

/// Whether calls into `owner` should be instrumented; `true` before install
pub fn should_trace(owner: &str) -> bool {
    tracer().map_or(true, |t| t.should_trace(owner))
}

pub fn thread_exited() {
    if let Some(t) = tracer() {
        t.thread_exited();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Nothing in the library's unit tests installs a tracer
    #[test]
    fn test_hooks_before_install_are_noops() {
        assert!(!is_installed());
        assert!(call_start("A", "foo", MethodKind::InstanceCall, 1).is_none());
        call_finish();
        throw();
        assert!(current_context().is_none());
        catch(crate::frame::root());
        thread_exited();
        assert!(should_trace("java/lang/String"));
        assert!(!is_installed());
    }

    #[test]
    fn test_init_tracing_disabled_is_harmless() {
        init_tracing(false);
    }

    #[test]
    fn test_debug_filter_honours_rust_log() {
        assert_eq!(debug_filter(Some("warn")).to_string(), "warn");
        assert_eq!(
            debug_filter(Some("calltrace::tracer=trace")).to_string(),
            "calltrace::tracer=trace"
        );
    }

    #[test]
    fn test_debug_filter_defaults_to_crate_debug() {
        assert_eq!(debug_filter(None).to_string(), DEBUG_DIRECTIVE);
        assert_eq!(debug_filter(Some("[")).to_string(), DEBUG_DIRECTIVE);
    }
}
