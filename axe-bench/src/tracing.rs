//! Logging setup.
//!
//! Modules pull the event macros in through [`prelude`] so the crate has a
//! single place to swap or extend them.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod prelude {
    pub use ::tracing::{debug, error, info, trace, warn};
}

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber.
///
/// Logs go to journald when running as a systemd unit (`JOURNAL_STREAM` is
/// set) and to stdout otherwise. `RUST_LOG` overrides the default filter.
pub fn init_journald_or_stdout() {
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(layer)
                    .init();
                return;
            }
            Err(e) => eprintln!("Failed to connect to journald ({e}), logging to stdout"),
        }
    }

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::LocalTime::rfc_3339()),
        )
        .init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
