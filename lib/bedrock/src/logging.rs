//! Structured logging facade. Components take an `Into<Option<&Logger>>`
//! and fall back to a discarding root so library code never has to care
//! whether logging is wired up.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::Config;

/// A root logger that drops everything. Handy default for tests and
/// embedded use.
#[inline]
pub fn null_logger() -> Logger {
    Logger::root(Discard, o!())
}

/// Build a root logger from a TOML snippet understood by `sloggers`
/// (type/level/destination).
pub fn from_toml(config: &str) -> Result<Logger, String> {
    let config: sloggers::LoggerConfig =
        serdeconv::from_toml_str(config).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// Terminal logger at the given level, for the driver binary.
pub fn term_logger(level: &str) -> Result<Logger, String> {
    from_toml(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_logger_is_usable() {
        let log = null_logger();
        info!(log, "nothing to see"; "context" => "test");
    }

    #[test]
    fn test_from_toml() {
        let log = term_logger("debug").unwrap();
        debug!(log, "logger built"; "context" => "test");
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(from_toml("type = \"no-such-sink\"").is_err());
    }
}
