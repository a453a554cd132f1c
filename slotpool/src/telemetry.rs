//! Tracing subscriber setup for binaries and tests embedding slotpool.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Environment variable selecting the slotpool log level when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "SLOTPOOL_LOG";

/// Level used when `SLOTPOOL_LOG` is unset or unparseable.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::WARN;

fn base_level(raw: Option<&str>) -> LevelFilter {
    let Some(raw) = raw.map(str::trim) else {
        return DEFAULT_LEVEL;
    };
    if raw.eq_ignore_ascii_case("warning") {
        return LevelFilter::WARN;
    }
    raw.parse().unwrap_or(DEFAULT_LEVEL)
}

fn default_directives(level: LevelFilter) -> String {
    let level = level.to_string().to_ascii_lowercase();
    format!("slotpool={level},slotpool_process={level}")
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise `SLOTPOOL_LOG` picks the level for the
/// slotpool crates (`trace` through `error`, or `off`; default `warn`).
/// `LOG_FORMAT=json` switches to JSON lines. Safe to call more than once:
/// later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
        EnvFilter::new(default_directives(level))
    };

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}
