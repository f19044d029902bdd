//! Structured logging setup, following the teacher's CLI `run()` pattern:
//! `RUST_LOG` wins if set, otherwise a verbosity count picks a fallback
//! filter scoped to this crate and its binary.

use tracing_subscriber::EnvFilter;

/// Verbosity as counted by `-v`/`--verbose`: 0 = critical-only, 1 = warn,
/// 2 = info, 3+ = debug. Matches §6's CLI verbosity table.
pub fn level_for_verbosity(count: u8) -> &'static str {
    match count {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

/// Installs the global `tracing` subscriber. Safe to call at most once per
/// process; the bulk-mount CLI and the interactive shell both call it at
/// startup before touching the `Parser`.
pub fn init(verbosity: u8) {
    let level = level_for_verbosity(verbosity);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("imagemounter={level},imount={level}"))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_expected_levels() {
        assert_eq!(level_for_verbosity(0), "error");
        assert_eq!(level_for_verbosity(1), "warn");
        assert_eq!(level_for_verbosity(2), "info");
        assert_eq!(level_for_verbosity(3), "debug");
        assert_eq!(level_for_verbosity(9), "debug");
    }
}
