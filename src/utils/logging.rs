use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_FILTER: &str = "info";

/// Filter from `RUST_LOG`, else `default_filter`, else `info`.
pub fn build_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Targets stay visible so `audit` events can be
/// told apart from ordinary logs.
pub fn init(default_filter: &str) -> Result<(), TryInitError> {
    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(build_filter(default_filter))
        .with(fmt_layer)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_default_falls_back() {
        // only meaningful when RUST_LOG is unset, which is the case under cargo test by default
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(build_filter("audit=loud").to_string(), DEFAULT_FILTER);
            assert_eq!(build_filter("debug").to_string(), "debug");
        }
    }
}
