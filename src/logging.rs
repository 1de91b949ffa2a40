use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_LEVEL_ENV: &str = "DSTREAM_LOG_LEVEL";
pub const LOG_JSON_ENV: &str = "DSTREAM_LOG_JSON";

/// Resolves the log level from the CLI flag, then `DSTREAM_LOG_LEVEL`.
///
/// Returns `None` when neither is set so that `RUST_LOG` can take over.
pub fn resolve_level(flag: Option<&str>) -> Option<String> {
    flag.map(str::to_string)
        .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
        .map(|l| l.trim().to_lowercase())
        .filter(|l| matches!(l.as_str(), "trace" | "debug" | "info" | "warn" | "error"))
}

/// JSON output is on when requested on the command line or via `DSTREAM_LOG_JSON`.
pub fn resolve_json(flag: bool) -> bool {
    flag || std::env::var(LOG_JSON_ENV)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

pub fn init(level: Option<&str>, json: bool) {
    let env_filter = match resolve_level(level) {
        Some(level) => EnvFilter::new(format!("dstream={},warn", level)),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dstream=info,warn")),
    };

    let fmt_layer = if resolve_json(json) {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    // stdout is reserved for provider data and console output.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_wins_and_is_normalized() {
        assert_eq!(resolve_level(Some("DEBUG")).as_deref(), Some("debug"));
        assert_eq!(resolve_level(Some("loud")), None);
    }

    #[test]
    fn test_json_flag() {
        assert!(resolve_json(true));
    }
}
