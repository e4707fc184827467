//! Tracing subscriber setup for services running listener containers.
//!
//! - `LOG_FORMAT=json` selects JSON output, anything else human-readable text.
//! - `RUST_LOG` selects the filter, `info` when unset or invalid.
//!
//! Every dispatched message is processed inside an `sqs_message` span (or
//! `sqs_batch` in batch mode) carrying the queue name and message id, so
//! events logged by listeners inherit those fields.

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber.
///
/// Does nothing when a global subscriber was already installed.
pub fn init_logging(service_name: &str) {
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let installed = if json {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .flatten_event(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    };

    match installed {
        Ok(()) => tracing::info!(service = service_name, json, "Logging initialized"),
        Err(_) => tracing::debug!(service = service_name, "Global subscriber already installed"),
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
