//! Stderr tracing subscriber for the `wikilabel` binary.
//!
//! Filter priority, highest first: `WIKILABEL_LOG`, `RUST_LOG`, the `-v`/`-q`
//! flags, then `warn`.

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "WIKILABEL_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    pub const fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::WARN,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Install the global subscriber. Call once, before config loading.
pub fn init_subscriber(verbosity: Verbosity) {
    let filter = build_env_filter(verbosity, |key| std::env::var(key).ok());
    let use_ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_target(false);

    if verbosity == Verbosity::Verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.with_timer(fmt::time::uptime()))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.without_time().compact())
            .init();
    }
}

fn build_env_filter<F>(verbosity: Verbosity, lookup_env: F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    // An unparseable directive falls through to the next source.
    for key in [LOG_ENV, "RUST_LOG"] {
        if let Some(directives) = lookup_env(key)
            && let Ok(filter) = EnvFilter::try_new(&directives)
        {
            return filter;
        }
    }

    let level = verbosity.default_level();
    let directive = if verbosity == Verbosity::Verbose {
        format!("{level},wikilabel_core=debug,wikilabel=debug")
    } else {
        level.to_string()
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}
