//! Logging for the receiver.
//!
//! Build with `--features tracing` to route events through the `tracing`
//! crate. Without the feature every macro below expands to nothing, so the
//! datagram path pays no formatting cost in production builds.

/// Installs a `tracing-subscriber` registry writing to stderr.
///
/// The filter comes from `RUST_LOG` and falls back to `iqrx=trace`. Safe to
/// call from the daemon's `main` or once per test binary; a no-op when the
/// `tracing` feature is disabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("iqrx=trace"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! silent {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use silent as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use silent as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use silent as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use silent as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use silent as warn;
