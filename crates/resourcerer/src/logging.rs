use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, Logging};

/// Maps a configured level to filter directives for our own crates.
///
/// Dependencies stay at `INFO` unless everything is turned down.
fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             resourcerer=DEBUG,\
             resourcerer_stress=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             resourcerer=TRACE,\
             resourcerer_stress=TRACE"
        }
    }
}

/// Resolves the effective format, deciding [`LogFormat::Auto`] by whether a user is attached.
fn effective_format(format: LogFormat, attended: bool) -> LogFormat {
    match (format, attended) {
        (LogFormat::Auto, true) => LogFormat::Pretty,
        (LogFormat::Auto, false) => LogFormat::Simplified,
        (format, _) => format,
    }
}

/// Installs the global subscriber for the given logging configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Errors are reported to Sentry as events,
/// `WARN` and `INFO` records are kept as breadcrumbs.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Logging) {
    if config.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.level).to_owned());

    let fmt_layer = {
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true);

        match effective_format(config.format, console::user_attended()) {
            LogFormat::Json => layer
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
            LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
            LogFormat::Pretty | LogFormat::Auto => layer.pretty().boxed(),
        }
    }
    .with_filter(EnvFilter::new(&rust_log));

    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .init();
}
