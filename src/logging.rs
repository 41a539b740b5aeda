//! Structured logging setup for the binary.
//!
//! Library code only emits `tracing` events and spans; whoever embeds it decides
//! where they go. The CLI installs a `fmt` subscriber here.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter for a `-v` count. `RUST_LOG` takes precedence when set.
pub fn filter_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn,certdist=info",
        1 => "info,certdist=debug",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(verbose: u8) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()?;
    Ok(())
}
