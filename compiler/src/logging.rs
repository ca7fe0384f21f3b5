//! Logging setup for the escjit optimizer
//!
//! Output goes through the `log` facade and is printed by `env_logger`.
//!
//! - `warn!` methods left unoptimized after an internal failure
//! - `info!` per-method transform statistics
//! - `debug!` per-candidate decisions and callee summaries
//! - `trace!` per-node escape state changes
//!
//! `RUST_LOG` filters apply on top of the level picked on the command line:
//!
//! ```bash
//! escjit -vv opt module.json
//! RUST_LOG=compiler::ir::escape::monitors=debug escjit opt module.json
//! RUST_LOG=compiler::ir::escape::propagate=trace escjit demo sum-of-fields
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging at `level`. Only the first call has an effect.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .parse_env("RUST_LOG")
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    short_target(record.target()),
                    record.args()
                )
            })
            .init();
    });
}

/// Level for a count of `-v` flags on the command line
pub fn level_for_verbosity(count: u8) -> LevelFilter {
    match count {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Logging for tests; quiet unless `RUST_LOG` asks for more
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .parse_env("RUST_LOG")
        .is_test(true)
        .try_init();
}

/// `compiler::ir::escape::monitors` is printed as `escape::monitors`
fn short_target(target: &str) -> &str {
    target.strip_prefix("compiler::ir::").unwrap_or(target)
}
