use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MAX_MSG_LENGTH: usize = 1024 * 1024;
pub const DEFAULT_RETRY_INTERVAL_MILLIS: u64 = 15_000;

/// Tunables for the communications layer, loadable from a TOML file.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CommConfig {
    /// Upper bound on the size of a single inbound message, in bytes.
    pub max_msg_length: usize,
    /// When set, malformed inbound JSON is answered with a diagnostic reply
    /// instead of being silently dropped.
    pub send_debug_replies: bool,
    /// Delay between outbound connection attempts.
    pub retry_interval_millis: u64,
}

impl Default for CommConfig {
    fn default() -> CommConfig {
        CommConfig {
            max_msg_length: DEFAULT_MAX_MSG_LENGTH,
            send_debug_replies: false,
            retry_interval_millis: DEFAULT_RETRY_INTERVAL_MILLIS,
        }
    }
}

impl CommConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> CommConfig {
        serdeconv::from_toml_file(path.as_ref()).expect("Error loading the comm configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let config = CommConfig::default();
        assert_eq!(config.max_msg_length, 1024 * 1024);
        assert!(!config.send_debug_replies);
        assert_eq!(config.retry_interval_millis, 15_000);
    }

    #[test]
    fn toml_round_trip() {
        let toml = serdeconv::to_toml_string(&CommConfig::default()).unwrap();
        let parsed: CommConfig = serdeconv::from_toml_str(&toml).unwrap();
        assert_eq!(parsed.max_msg_length, DEFAULT_MAX_MSG_LENGTH);
    }
}
