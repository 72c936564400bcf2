use std::path::PathBuf;

use crate::config::Config;

const HOSTWATCH_HOSTNAME: &str = "HOSTWATCH_HOSTNAME";

const HOSTWATCH_LISTEN_PORT: &str = "HOSTWATCH_LISTEN_PORT";

const HOSTWATCH_CONFIG: &str = "HOSTWATCH_CONFIG";

const DEFAULT_LISTEN_PORT: u16 = 10050;

const DEFAULT_CONFIG_PATH: &str = "./hostwatch.json";

pub fn get_default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

pub fn get_hostname() -> Option<String> {
    std::env::var(HOSTWATCH_HOSTNAME)
        .ok()
        .filter(|name| !name.is_empty())
}

pub fn get_listen_port() -> Option<u16> {
    std::env::var(HOSTWATCH_LISTEN_PORT)
        .ok()
        .and_then(|port| port.parse().ok())
}

/// Explicit path first, then `HOSTWATCH_CONFIG`, then the default location
pub fn get_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var(HOSTWATCH_CONFIG).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Apply `HOSTWATCH_*` overrides on top of a loaded configuration
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(hostname) = get_hostname() {
        config.hostname = Some(hostname);
    }
    if let Some(port) = get_listen_port() {
        config.listen_port = port;
    }
}

/// Host name reported to the server when none is configured
pub fn system_hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}
