//! Logging setup
//!
//! Structured logging via `tracing`: pretty output in debug builds, JSON in
//! release builds. The filter is taken from `RUST_LOG` when set; otherwise
//! the `DEBUG` configuration toggle decides between `debug` and `info`
//! defaults.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber
/// (tests initialize repeatedly).
pub fn init(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    #[cfg(debug_assertions)]
    {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(true);
        init(false);
    }
}
