use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

/// Switches to debug level when set to `true`.
const ENV_DEBUG: &str = "EVENTHUBS_DEBUG";
/// `json` (default) or `text`.
const ENV_LOG_FORMAT: &str = "EVENTHUBS_LOG_FORMAT";

/// The generator logs every tick at debug level, which drowns the batch logs.
const DEBUG_DIRECTIVE: &str = "debug,eventhubs_core::client::generator=info";
const DEFAULT_DIRECTIVE: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TracingConfig {
    format: LogFormat,
    default_directives: &'static str,
}

impl TracingConfig {
    fn from_env() -> Self {
        Self::from_values(
            std::env::var(ENV_DEBUG).ok().as_deref(),
            std::env::var(ENV_LOG_FORMAT).ok().as_deref(),
        )
    }

    /// Debug mode defaults to text output, an explicit format always wins.
    fn from_values(debug: Option<&str>, format: Option<&str>) -> Self {
        let debug_mode = debug.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        let format = match format.map(|f| f.trim().to_ascii_lowercase()).as_deref() {
            Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            _ if debug_mode => LogFormat::Text,
            _ => LogFormat::Json,
        };
        Self {
            format,
            default_directives: if debug_mode {
                DEBUG_DIRECTIVE
            } else {
                DEFAULT_DIRECTIVE
            },
        }
    }

    /// RUST_LOG replaces the default directives entirely.
    fn filter(&self) -> EnvFilter {
        let directives = std::env::var(EnvFilter::DEFAULT_ENV)
            .unwrap_or_else(|_| self.default_directives.to_string());
        EnvFilter::builder()
            .with_default_directive(Level::INFO.into())
            .parse_lossy(directives)
    }

    fn layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        match self.format {
            LogFormat::Text => fmt::layer().boxed(),
            LogFormat::Json => fmt::layer()
                .with_ansi(false)
                .json()
                .flatten_event(true)
                .boxed(),
        }
    }
}

/// Routes panics into `tracing` so they reach the same log stream as the batch logs. Location and
/// thread are recorded as fields; the backtrace is only attached when one was captured.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop unless RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    let location = panic_info.location().map_or_else(
        || "<unknown>".to_string(),
        |l| format!("{}:{}:{}", l.file(), l.line(), l.column()),
    );
    let payload = panic_message(panic_info.payload());

    if backtrace.status() == BacktraceStatus::Captured {
        tracing::error!(thread, %location, %backtrace, "Panicked: {payload}");
    } else {
        tracing::error!(thread, %location, "Panicked: {payload}");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

pub fn register() {
    let config = TracingConfig::from_env();
    tracing_subscriber::registry()
        .with(config.filter())
        .with(config.layer())
        .init();

    std::panic::set_hook(Box::new(report_panic));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_json_at_info() {
        let config = TracingConfig::from_values(None, None);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.default_directives, DEFAULT_DIRECTIVE);

        let config = TracingConfig::from_values(Some("false"), None);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.default_directives, DEFAULT_DIRECTIVE);
    }

    #[test]
    fn test_debug_mode() {
        let config = TracingConfig::from_values(Some(" TRUE "), None);
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.default_directives, DEBUG_DIRECTIVE);

        // an explicit format is kept in debug mode
        let config = TracingConfig::from_values(Some("true"), Some("json"));
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.default_directives, DEBUG_DIRECTIVE);
    }

    #[test]
    fn test_explicit_format() {
        assert_eq!(
            TracingConfig::from_values(None, Some("Text")).format,
            LogFormat::Text
        );
        assert_eq!(
            TracingConfig::from_values(None, Some("yaml")).format,
            LogFormat::Json
        );
    }

    #[test]
    fn test_directives_parse() {
        for directive in [DEFAULT_DIRECTIVE, DEBUG_DIRECTIVE] {
            assert!(
                EnvFilter::builder().parse(directive).is_ok(),
                "invalid directive {directive}"
            );
        }
    }

    #[test]
    fn test_panic_message() {
        let static_str: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(static_str.as_ref()), "boom");
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(owned.as_ref()), "owned boom");
        let other: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(other.as_ref()), "<non-string panic payload>");
    }
}
