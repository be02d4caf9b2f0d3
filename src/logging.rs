use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "funding_scraper.log";
const DEFAULT_DIRECTIVE: &str = "funding_scraper=info";

/// Install the global subscriber: human-readable console output plus a
/// daily-rolling JSON file under `logs/`. The returned guard flushes the
/// file writer when dropped, so the caller must hold it for the process
/// lifetime.
pub fn init_logging() -> WorkerGuard {
    let _ = std::fs::create_dir_all(LOG_DIR);

    let file_appender = tracing_appender::rolling::daily(LOG_DIR, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter_from(std::env::var("RUST_LOG").ok().as_deref()))
        .with(fmt::layer().json().with_writer(file_writer))
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();

    guard
}

/// `RUST_LOG` replaces the built-in directive entirely when set; an unset or
/// unparseable value falls back to crate-level info.
fn filter_from(env_directive: Option<&str>) -> EnvFilter {
    env_directive
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_env_falls_back_to_crate_info() {
        assert_eq!(filter_from(None).to_string(), DEFAULT_DIRECTIVE);
    }

    #[test]
    fn env_directive_replaces_the_default() {
        assert_eq!(filter_from(Some("debug")).to_string(), "debug");
    }

    #[test]
    fn unparseable_env_directive_falls_back() {
        assert_eq!(
            filter_from(Some("not==a=filter")).to_string(),
            DEFAULT_DIRECTIVE
        );
    }
}
