//! Process-wide logging setup and the small helpers used across the relay.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise the relay logs at `info`, or `debug`
/// with `verbose`. Calling this more than once is a no-op.
pub fn init(verbose: bool) {
    INIT.call_once(|| {
        let default_level = if verbose {
            "assistant_relay=debug,tower_http=debug"
        } else {
            "assistant_relay=info"
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

pub fn debug(message: impl AsRef<str>) {
    tracing::debug!("{}", message.as_ref());
}

pub fn info(message: impl AsRef<str>) {
    tracing::info!("{}", message.as_ref());
}

pub fn warn(message: impl AsRef<str>) {
    tracing::warn!("{}", message.as_ref());
}

pub fn error(message: impl AsRef<str>) {
    tracing::error!("{}", message.as_ref());
}
