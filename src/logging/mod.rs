//! Logging setup
//!
//! Human-readable logs go to stderr through tracing-subscriber. The
//! default level is INFO; `--verbose` raises to DEBUG and `--quiet`
//! drops to WARN. `RUST_LOG` overrides everything.

use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Verbosity adjustment: -1 for quiet, 0 for normal, +1 for verbose
    pub verbosity: i8,
}

impl LogConfig {
    fn min_level(&self) -> Level {
        match self.verbosity {
            v if v < 0 => Level::WARN,
            0 => Level::INFO,
            _ => Level::DEBUG,
        }
    }
}

/// Initialize the logging subsystem.
pub fn init(verbose: bool, quiet: bool) {
    let config = LogConfig {
        verbosity: if quiet {
            -1
        } else if verbose {
            1
        } else {
            0
        },
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(config.min_level().into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();
}
