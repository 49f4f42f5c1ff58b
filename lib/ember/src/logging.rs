use slog::Logger;
use sloggers::{Config, LoggerConfig};

/// Builds a logger from a TOML logger description (type, level, destination etc.).
/// Panics on a malformed description since there is nowhere to report the problem yet.
pub fn from_toml_str(config: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(config).expect("Malformed logger configuration");
    config.build_logger().expect("Failed to construct logger")
}

/// Default logger for processes that don't carry their own logging section.
pub fn init() -> Logger {
    from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
}
