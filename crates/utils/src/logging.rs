//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Maps the driver-style numeric log level (`-1` debug, `0` info,
/// `1` warning, `2` error, `3` critical) onto a tracing level filter.
pub fn level_from_verbosity(level: i8) -> filter::LevelFilter {
    match level {
        i8::MIN..=-1 => filter::LevelFilter::DEBUG,
        0 => filter::LevelFilter::INFO,
        1 => filter::LevelFilter::WARN,
        _ => filter::LevelFilter::ERROR,
    }
}

/// initiate the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init(default_level: filter::LevelFilter) {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_from_verbosity(-1), filter::LevelFilter::DEBUG);
        assert_eq!(level_from_verbosity(0), filter::LevelFilter::INFO);
        assert_eq!(level_from_verbosity(1), filter::LevelFilter::WARN);
        assert_eq!(level_from_verbosity(2), filter::LevelFilter::ERROR);
        assert_eq!(level_from_verbosity(3), filter::LevelFilter::ERROR);
    }
}
