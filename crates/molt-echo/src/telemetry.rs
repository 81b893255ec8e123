//! Structured logging for the echo server.
//!
//! Filter precedence: `RUST_LOG`, then `MOLT_LOG_LEVEL` (a bare level or a
//! full filter directive), then the built-in default.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn default_filter() -> EnvFilter {
    EnvFilter::new("info,molt=debug,molt_echo=debug")
}

/// Directives from the first of `RUST_LOG` and `MOLT_LOG_LEVEL` that is set
/// and not blank.
fn configured_directives() -> Option<String> {
    let set = |var: &str| std::env::var(var).ok().filter(|v| !v.trim().is_empty());
    set("RUST_LOG").or_else(|| set("MOLT_LOG_LEVEL").map(|v| expand_level(&v)))
}

/// A bare level applies to our crates as well as the default; anything else
/// is passed through as a directive string.
fn expand_level(value: &str) -> String {
    let value = value.trim();
    match value.parse::<LevelFilter>() {
        Ok(level) if !value.is_empty() => format!("{level},molt={level},molt_echo={level}"),
        _ => value.to_string(),
    }
}

fn build_log_filter() -> EnvFilter {
    configured_directives()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(default_filter)
}

/// Install the global subscriber: JSON lines on stdout, or plain text when
/// `pretty` is set.
pub fn init(pretty: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = build_log_filter();

    if pretty {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    }

    tracing::info!(pid = std::process::id(), "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_level_covers_our_crates() {
        assert_eq!(expand_level(" warn "), "warn,molt=warn,molt_echo=warn");
        assert_eq!(expand_level("DEBUG"), "debug,molt=debug,molt_echo=debug");
    }

    #[test]
    fn test_directives_pass_through() {
        assert_eq!(expand_level("info,molt=trace"), "info,molt=trace");
        assert_eq!(expand_level("molt_echo=off"), "molt_echo=off");
    }

    #[test]
    fn test_empty_level_is_ignored() {
        assert_eq!(expand_level("  "), "");
    }
}
