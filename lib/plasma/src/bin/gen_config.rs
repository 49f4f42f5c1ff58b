use ember::logging;
use plasma::config::CommConfig;
use slog::info;

/// Prints the default comm configuration as TOML, for seeding deployment files.
fn main() {
    let log = logging::init();
    let toml = serdeconv::to_toml_string(&CommConfig::default()).expect("Error serializing configuration");
    info!(log, "Generated default comm configuration");
    println!("{}", toml);
}
