//! Log output for the `drive-fs` binary.
//!
//! The filter comes from `DRIVE_FS_LOG`, then `RUST_LOG`, then defaults to `info`. Where the
//! lines go depends on how the process runs:
//!
//! - interactive with the default filter: compact lines drawn above progress spinners,
//! - interactive with an explicit filter: plain lines with span enter and close events,
//! - daemonized: plain lines without ANSI colors, since stderr is usually a file by then.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

const FILTER_VAR: &str = "DRIVE_FS_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Spinners,
    Plain,
    Detached,
}

/// Subscriber setup, chosen once at startup.
pub struct Logging {
    output: Output,
    filter: EnvFilter,
}

impl Logging {
    /// Pick the filter and output style from the environment.
    pub fn from_env() -> Self {
        match EnvFilter::try_from_env(FILTER_VAR).or_else(|_| EnvFilter::try_from_default_env()) {
            Ok(filter) => Self::new(filter, Output::Plain),
            Err(_) => Self::new(EnvFilter::new("info"), Output::Spinners),
        }
    }

    fn new(filter: EnvFilter, output: Output) -> Self {
        Self { output, filter }
    }

    /// Drop terminal decorations when the process detaches from its terminal.
    #[must_use]
    pub fn detached(self, detached: bool) -> Self {
        if detached {
            Self::new(self.filter, Output::Detached)
        } else {
            self
        }
    }

    /// Install the global subscriber. Fails if one is already installed.
    pub fn install(self) -> Result<(), TryInitError> {
        let Self { output, filter } = self;
        match output {
            Output::Detached => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .finish()
                .try_init(),
            Output::Plain => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
                .finish()
                .try_init(),
            Output::Spinners => {
                let spinners = IndicatifLayer::new();
                let lines = tracing_subscriber::fmt::layer()
                    .with_writer(spinners.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact();
                tracing_subscriber::registry()
                    .with(filter)
                    .with(lines)
                    .with(spinners)
                    .try_init()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detaching_overrides_either_terminal_style() {
        for output in [Output::Spinners, Output::Plain] {
            let logging = Logging::new(EnvFilter::new("debug"), output).detached(true);
            assert_eq!(logging.output, Output::Detached);
        }
    }

    #[test]
    fn staying_attached_keeps_the_chosen_style() {
        let logging = Logging::new(EnvFilter::new("debug"), Output::Plain).detached(false);
        assert_eq!(logging.output, Output::Plain);
        assert_eq!(logging.filter.to_string(), "debug");
    }
}
