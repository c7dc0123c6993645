use std::env;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, Logging};

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             warmcache=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             warmcache=TRACE"
        }
    }
}

/// Installs a global `tracing` subscriber according to `config`.
///
/// The `RUST_LOG` environment variable takes precedence over the configured level. Returns
/// `false` if a global subscriber was already installed, in which case nothing changes.
pub fn init_logging(config: &Logging) -> bool {
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.level).to_string());

    let fmt_layer = {
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true);

        match (config.format, console::user_attended()) {
            (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
            (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
                layer.compact().with_ansi(false).boxed()
            }
            (LogFormat::Json, _) => layer
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        }
    }
    .with_filter(EnvFilter::new(&rust_log));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_mutes_dependencies() {
        assert_eq!(get_rust_log(LevelFilter::OFF), "");
        assert_eq!(get_rust_log(LevelFilter::DEBUG), "INFO,warmcache=DEBUG");
        assert!(EnvFilter::try_new(get_rust_log(LevelFilter::TRACE)).is_ok());
    }
}
