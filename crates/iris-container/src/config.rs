use serde::Deserialize;
use serde::Serialize;

/// Lowest port considered when binding to a random port.
pub const RANDOM_PORT_RANGE_START: u16 = 35536;

/// Service container bind and lifecycle configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind the container's listener to.
    #[serde(default = "Config::default_host")]
    pub host: String,

    /// Port to bind to; a random port in `[35536, 65536)` is picked when unset.
    #[serde(default)]
    pub port: Option<u16>,

    /// Number of additional bind attempts after the first `AddrInUse`.
    #[serde(default = "Config::default_max_retries")]
    pub max_retries: u32,

    /// Delay between bind retries, in milliseconds.
    #[serde(default = "Config::default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Advertise installed services with the coordinator-backed registry on `start`.
    #[serde(default = "Config::default_register")]
    pub register: bool,
}

impl Config {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_max_retries() -> u32 {
        3
    }

    fn default_retry_delay_ms() -> u64 {
        100
    }

    fn default_register() -> bool {
        true
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: Config::default_host(),
            port: None,
            max_retries: Config::default_max_retries(),
            retry_delay_ms: Config::default_retry_delay_ms(),
            register: Config::default_register(),
        }
    }
}
