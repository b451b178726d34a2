//! Tracing subscriber setup.
//!
//! Diagnostics go to stderr so command output on stdout stays clean for
//! piping. `RUST_LOG` overrides the level chosen by `--verbose`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_logging(verbose: bool) {
    let default_level = if verbose {
        "knowbase=debug,info"
    } else {
        "knowbase=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .compact();

    // A second init (tests, embedding in another binary) is not an error.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
