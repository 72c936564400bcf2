use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, level_filters::LevelFilter, trace};

use crate::access::{AccessGate, Permission, RuleError, RuleSource};
use crate::address::{Address, AddressError, DEFAULT_ACTIVE_PORT, parse_server_active};
use crate::protocol::frame::DEFAULT_MAX_MESSAGE_SIZE;
use crate::protocol::tls::{CertificateContext, PskCredentials, default_psk_backend};
use crate::protocol::{TlsContexts, TlsError, TlsMode, TlsRegistry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file \"{path}\": {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid \"{field}\" value \"{value}\": {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid \"server_active\": {0}")]
    ServerActive(#[from] AddressError),

    #[error(transparent)]
    AccessRules(#[from] RuleError),

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] TlsError),
}

/// One entry of `access_rules`: `{"allow": "<pattern>"}` or `{"deny": "<pattern>"}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRuleConfig {
    Allow(String),
    Deny(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Reported host name; the OS host name when unset
    pub hostname: Option<String>,
    pub host_metadata: Option<String>,
    pub host_interface: Option<String>,

    /// Peers allowed to request passive checks
    #[serde(default)]
    pub server: Vec<String>,
    #[serde(default)]
    pub server_active: String,

    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,
    #[serde(default = "crate::util::get_default_listen_port")]
    pub listen_port: u16,
    /// `0` disables the passive listener
    #[serde(default = "default_start_agents")]
    pub start_agents: u32,

    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_refresh_active_checks")]
    pub refresh_active_checks: u64,
    #[serde(default = "default_buffer_send")]
    pub buffer_send: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Defaults to ten times `buffer_size`
    pub buffer_capacity: Option<usize>,

    #[serde(default)]
    pub enable_persistent_buffer: bool,
    #[serde(default = "default_persistent_buffer_file")]
    pub persistent_buffer_file: PathBuf,
    #[serde(default = "default_persistent_buffer_period")]
    pub persistent_buffer_period: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,

    #[serde(default)]
    pub access_rules: Vec<AccessRuleConfig>,
    #[serde(default)]
    pub plugin_capacity: HashMap<String, u32>,

    #[serde(default = "default_tls_connect")]
    pub tls_connect: TlsMode,
    #[serde(default = "default_tls_accept")]
    pub tls_accept: Vec<TlsMode>,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub tls_psk_identity: Option<String>,
    pub tls_psk_file: Option<PathBuf>,

    #[serde(default = "default_debug_level")]
    pub debug_level: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: None,
            host_metadata: None,
            host_interface: None,
            server: Vec::new(),
            server_active: String::new(),
            listen_ip: default_listen_ip(),
            listen_port: crate::util::get_default_listen_port(),
            start_agents: default_start_agents(),
            timeout: default_timeout(),
            refresh_active_checks: default_refresh_active_checks(),
            buffer_send: default_buffer_send(),
            buffer_size: default_buffer_size(),
            buffer_capacity: None,
            enable_persistent_buffer: false,
            persistent_buffer_file: default_persistent_buffer_file(),
            persistent_buffer_period: default_persistent_buffer_period(),
            max_message_size: default_max_message_size(),
            access_rules: Vec::new(),
            plugin_capacity: HashMap::new(),
            tls_connect: default_tls_connect(),
            tls_accept: default_tls_accept(),
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            tls_psk_identity: None,
            tls_psk_file: None,
            debug_level: default_debug_level(),
        }
    }
}

fn default_listen_ip() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_start_agents() -> u32 {
    3
}

fn default_timeout() -> u64 {
    3
}

fn default_refresh_active_checks() -> u64 {
    5
}

fn default_buffer_send() -> u64 {
    5
}

fn default_buffer_size() -> usize {
    100
}

fn default_persistent_buffer_file() -> PathBuf {
    PathBuf::from("./hostwatch-buffer.db")
}

fn default_persistent_buffer_period() -> u64 {
    60 * 60
}

fn default_max_message_size() -> u64 {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_tls_connect() -> TlsMode {
    TlsMode::Unencrypted
}

fn default_tls_accept() -> Vec<TlsMode> {
    vec![TlsMode::Unencrypted]
}

fn default_debug_level() -> u8 {
    3
}

fn check_range<T>(field: &'static str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(ConfigError::Invalid {
            field,
            value: value.to_string(),
            reason: format!("must be between {min} and {max}"),
        });
    }
    Ok(())
}

impl Config {
    /// Check every knob; the first problem is reported with its field name
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("timeout", self.timeout, 1, 30)?;
        check_range("refresh_active_checks", self.refresh_active_checks, 1, 86_400)?;
        check_range("buffer_send", self.buffer_send, 1, 3_600)?;
        check_range("buffer_size", self.buffer_size, 2, 65_535)?;
        if let Some(capacity) = self.buffer_capacity {
            if capacity < self.buffer_size {
                return Err(ConfigError::Invalid {
                    field: "buffer_capacity",
                    value: capacity.to_string(),
                    reason: "must not be smaller than buffer_size".to_string(),
                });
            }
        }
        check_range("persistent_buffer_period", self.persistent_buffer_period, 60, 365 * 86_400)?;
        check_range("max_message_size", self.max_message_size, 1024, 1 << 30)?;
        check_range("debug_level", self.debug_level, 0, 5)?;

        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() || hostname.len() > 128 {
                return Err(ConfigError::Invalid {
                    field: "hostname",
                    value: hostname.clone(),
                    reason: "must be 1 to 128 characters long".to_string(),
                });
            }
        }

        for (plugin, capacity) in &self.plugin_capacity {
            if *capacity == 0 {
                return Err(ConfigError::Invalid {
                    field: "plugin_capacity",
                    value: format!("{plugin}: {capacity}"),
                    reason: "capacity must be at least 1".to_string(),
                });
            }
        }

        if self.tls_accept.is_empty() {
            return Err(ConfigError::Invalid {
                field: "tls_accept",
                value: "[]".to_string(),
                reason: "at least one connection type must be accepted".to_string(),
            });
        }
        let uses = |mode| self.tls_connect == mode || self.tls_accept.contains(&mode);
        if uses(TlsMode::Cert)
            && (self.tls_ca_file.is_none() || self.tls_cert_file.is_none() || self.tls_key_file.is_none())
        {
            return Err(ConfigError::Invalid {
                field: "tls_cert_file",
                value: String::new(),
                reason: "certificate mode needs tls_ca_file, tls_cert_file and tls_key_file".to_string(),
            });
        }
        if uses(TlsMode::Psk) && (self.tls_psk_identity.is_none() || self.tls_psk_file.is_none()) {
            return Err(ConfigError::Invalid {
                field: "tls_psk_file",
                value: String::new(),
                reason: "PSK mode needs tls_psk_identity and tls_psk_file".to_string(),
            });
        }

        self.server_clusters()?;
        Ok(())
    }

    pub fn server_clusters(&self) -> Result<Vec<Vec<Address>>, ConfigError> {
        Ok(parse_server_active(&self.server_active, DEFAULT_ACTIVE_PORT)?)
    }

    /// Split `access_rules` into allow and deny lists, keeping declaration lines
    pub fn rule_sources(&self) -> (Vec<RuleSource>, Vec<RuleSource>) {
        let mut allow = Vec::new();
        let mut deny = Vec::new();
        for (index, rule) in self.access_rules.iter().enumerate() {
            match rule {
                AccessRuleConfig::Allow(pattern) => allow.push(RuleSource::new(index + 1, pattern)),
                AccessRuleConfig::Deny(pattern) => deny.push(RuleSource::new(index + 1, pattern)),
            }
        }
        (allow, deny)
    }

    pub fn access_gate(&self) -> Result<AccessGate, ConfigError> {
        let gate = AccessGate::new();
        let (allow, deny) = self.rule_sources();
        gate.load_rules(&allow, &deny)?;
        trace!(
            "loaded {} access rules ({} {}, {} {})",
            gate.snapshot().len(),
            allow.len(),
            Permission::Allow,
            deny.len(),
            Permission::Deny
        );
        Ok(gate)
    }

    /// Load certificate and PSK material for the configured modes
    pub fn tls_contexts(&self) -> Result<TlsContexts, ConfigError> {
        let mut contexts = TlsContexts::default();

        if let (Some(ca), Some(cert), Some(key)) =
            (&self.tls_ca_file, &self.tls_cert_file, &self.tls_key_file)
        {
            contexts.certificate = Some(CertificateContext::from_files(ca, cert, key)?);
        }
        if let (Some(identity), Some(file)) = (&self.tls_psk_identity, &self.tls_psk_file) {
            contexts.psk = Some(Arc::new(PskCredentials::from_file(identity.clone(), file)?));
            contexts.psk_backend = default_psk_backend();
        }

        Ok(contexts)
    }

    /// Swap in this configuration's access rules and TLS material
    ///
    /// Nothing is replaced unless both load; readers keep using the
    /// previous snapshots until the swap.
    pub fn apply_reloadable(&self, gate: &AccessGate, tls: &TlsRegistry) -> Result<(), ConfigError> {
        let contexts = self.tls_contexts()?;
        let (allow, deny) = self.rule_sources();
        gate.load_rules(&allow, &deny)?;
        tls.reload(contexts);
        debug!("reloaded {} access rules and TLS contexts", gate.snapshot().len());
        Ok(())
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity.unwrap_or(self.buffer_size * 10)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// `debug_level` as a tracing filter
    pub fn level_filter(&self) -> LevelFilter {
        match self.debug_level {
            0 => LevelFilter::OFF,
            1 => LevelFilter::ERROR,
            2 => LevelFilter::WARN,
            3 => LevelFilter::INFO,
            4 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: Config = serde_json::from_str(&file_content)?;
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}
