//! Logging infrastructure - structured tracing throughout the engine
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels per module
//! - Zero-cost when disabled
//! - Span-based performance tracking
//! - Console and file output

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();
/// Keeps the non-blocking file writer alive for the process lifetime
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
    /// Enable performance tracking
    pub track_performance: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
            track_performance: cfg!(debug_assertions),
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // DYNFFI_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("DYNFFI_LOG_LEVEL") {
            config.level = match level_str.to_lowercase().as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" => Level::WARN,
                "error" => Level::ERROR,
                _ => Level::INFO,
            };
        }

        if let Ok(path) = std::env::var("DYNFFI_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("DYNFFI_LOG_JSON").is_ok();
        config.show_spans = std::env::var("DYNFFI_LOG_SPANS").is_ok();

        if let Ok(val) = std::env::var("DYNFFI_LOG_PERF") {
            config.track_performance = val == "1" || val.to_lowercase() == "true";
        }

        config
    }

    /// Create high-performance config (minimal logging)
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
            track_performance: false,
        }
    }

    /// Create debug config (verbose logging)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            file_output: true,
            log_path: Some("dynffi.log".to_string()),
            json_format: false,
            show_spans: true,
            track_performance: true,
        }
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("dynffi={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let console = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_span_events(span_events.clone())
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(io::stderr)
                .with_span_events(span_events.clone())
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .boxed()
        };

        let file = match (config.file_output, config.log_path.as_deref()) {
            (true, Some(path)) => {
                let path = Path::new(path);
                let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
                let appender = tracing_appender::rolling::never(
                    directory.unwrap_or_else(|| Path::new(".")),
                    path.file_name().unwrap_or_else(|| "dynffi.log".as_ref()),
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let _ = FILE_GUARD.set(guard);

                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_span_events(span_events)
                        .boxed(),
                )
            }
            _ => None,
        };

        // Another subscriber may already be installed by the host
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .with(file)
            .try_init();
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Engine-specific logging functions
// ============================================================================

/// Log type definition
pub fn log_type_defined(name: &str, kind: &str, size: usize) {
    use tracing::debug;
    debug!(
        event = "type_defined",
        name = name,
        kind = kind,
        size_bytes = size,
        "Type defined"
    );
}

/// Log arena acquisition
#[inline]
pub fn log_arena_acquired(index: Option<usize>, temporary: bool) {
    use tracing::trace;
    trace!(
        event = "arena_acquired",
        resident_index = ?index,
        temporary = temporary,
        "Arena acquired"
    );
}

/// Log arena release
#[inline]
pub fn log_arena_released(temporary: bool, heap_used: usize, stack_high_water: usize) {
    use tracing::trace;
    trace!(
        event = "arena_released",
        temporary = temporary,
        heap_used_bytes = heap_used,
        stack_high_water_bytes = stack_high_water,
        "Arena released"
    );
}

/// Log arena pool exhaustion
pub fn log_arena_exhausted(outstanding: usize) {
    use tracing::warn;
    warn!(
        event = "arena_exhausted",
        outstanding_temporaries = outstanding,
        "Too many asynchronous calls are running"
    );
}

/// Log FFI function call
pub fn log_ffi_call(fn_name: &str, arg_count: usize) {
    use tracing::debug;
    debug!(
        event = "ffi_call",
        function = fn_name,
        args = arg_count,
        "FFI function called"
    );
}

/// Log FFI function return
pub fn log_ffi_return(fn_name: &str) {
    use tracing::trace;
    trace!(
        event = "ffi_return",
        function = fn_name,
        "FFI function returned"
    );
}

/// Log FFI error
pub fn log_ffi_error(fn_name: &str, error: &str) {
    use tracing::error;
    error!(
        event = "ffi_error",
        function = fn_name,
        error = error,
        "FFI function error"
    );
}

/// Log trampoline registration
pub fn log_trampoline_registered(slot: usize, address: usize, transient: bool) {
    use tracing::debug;
    debug!(
        event = "trampoline_registered",
        slot = slot,
        address = format_args!("{:#x}", address),
        transient = transient,
        "Trampoline bound"
    );
}

/// Log trampoline release
pub fn log_trampoline_unregistered(slot: usize) {
    use tracing::debug;
    debug!(
        event = "trampoline_unregistered",
        slot = slot,
        "Trampoline released"
    );
}

/// Log callback relay
#[inline]
pub fn log_relay(slot: usize, cross_thread: bool) {
    use tracing::trace;
    trace!(
        event = "relay",
        slot = slot,
        cross_thread = cross_thread,
        "Callback relayed"
    );
}

/// Log invocation of a stale or unbound trampoline
pub fn log_stale_trampoline(slot: usize, reason: &str) {
    use tracing::error;
    error!(
        event = "stale_trampoline",
        slot = slot,
        reason = reason,
        "Trampoline invoked outside of its registration"
    );
}

/// Log finalizer run
#[inline]
pub fn log_disposal(type_name: &str, address: usize) {
    use tracing::trace;
    trace!(
        event = "disposal",
        type_name = type_name,
        address = format_args!("{:#x}", address),
        "Disposable value finalized"
    );
}

/// Log async call lifecycle
pub fn log_async(fn_name: &str, phase: &str) {
    use tracing::debug;
    debug!(
        event = "async_call",
        function = fn_name,
        phase = phase,
        "Async call state changed"
    );
}

/// Performance tracking utilities
/// Native call timing
pub mod perf {
    use std::fmt::Display;
    use std::time::Instant;
    use tracing::{debug, Level};

    /// Time a native call; the guard logs its signature and duration on drop
    ///
    /// The signature is only rendered when debug events are enabled.
    #[must_use]
    pub fn track(signature: &dyn Display) -> CallTimer {
        CallTimer {
            signature: tracing::enabled!(Level::DEBUG).then(|| signature.to_string()),
            start: Instant::now(),
        }
    }

    pub struct CallTimer {
        signature: Option<String>,
        start: Instant,
    }

    impl CallTimer {
        pub fn signature(&self) -> Option<&str> {
            self.signature.as_deref()
        }
    }

    impl Drop for CallTimer {
        fn drop(&mut self) {
            if let Some(signature) = &self.signature {
                debug!(
                    signature = %signature,
                    duration_us = self.start.elapsed().as_micros() as u64,
                    "native call timed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.file_output);

        let perf_config = LogConfig::performance();
        assert_eq!(perf_config.level, Level::ERROR);

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
    }

    #[test]
    fn test_init_idempotent() {
        init_with_config(LogConfig::performance());
        init_with_config(LogConfig::performance()); // Should not panic
        assert!(is_initialized());
    }

    #[test]
    fn test_call_timer_skips_rendering_below_debug() {
        struct Loud;
        impl std::fmt::Display for Loud {
            fn fmt(&self, _: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                panic!("rendered without a debug subscriber")
            }
        }

        let subscriber = tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().finish();
        tracing::subscriber::with_default(subscriber, || {
            let timer = perf::track(&Loud);
            assert!(timer.signature().is_none());
        });
    }

    #[test]
    fn test_call_timer_keeps_signature_when_enabled() {
        let subscriber = tracing_subscriber::fmt().with_max_level(Level::DEBUG).with_test_writer().finish();
        tracing::subscriber::with_default(subscriber, || {
            let timer = perf::track(&"int32_t add(int32_t, int32_t)");
            assert_eq!(timer.signature(), Some("int32_t add(int32_t, int32_t)"));
        });
    }
}
