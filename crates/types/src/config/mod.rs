// Path: crates/types/src/config/mod.rs

//! Shared configuration structures for the herd daemons.
//!
//! Config files are TOML maps at `<config_dir>/master`, `<config_dir>/minion`,
//! and `<config_dir>/syndic`. `HERD_CONFIG_DIR` overrides the directory; a
//! missing file yields pure defaults so a fresh host can start with nothing
//! but the binary.

use crate::error::{CoreError, InternalError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default publish-channel port.
pub const DEFAULT_PUBLISH_PORT: u16 = 4505;
/// Default request-channel port.
pub const DEFAULT_REQUEST_PORT: u16 = 4506;
/// Default loopback control-channel port.
pub const DEFAULT_CONTROL_PORT: u16 = 4507;

/// The environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "HERD_CONFIG_DIR";

/// Resolves the configuration directory.
pub fn config_dir() -> PathBuf {
    std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/herd"))
}

fn read_config<T: serde::de::DeserializeOwned + Default>(
    explicit: Option<&Path>,
    name: &str,
) -> Result<T, CoreError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => config_dir().join(name),
    };
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| InternalError::Io(format!("read {}: {}", path.display(), e)))?;
    toml::from_str(&raw)
        .map_err(|e| InternalError::Io(format!("parse {}: {}", path.display(), e)).into())
}

/// TLS settings for the master's listening channels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsServerConfig {
    /// PEM certificate chain presented to minions.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
    /// CA bundle used to verify client certificates.
    #[serde(default)]
    pub ca: Option<PathBuf>,
    /// Refuse connections without a valid client certificate.
    #[serde(default)]
    pub require_client_cert: bool,
}

/// TLS settings for a connecting minion or syndic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsClientConfig {
    /// Extra CA bundle trusted in addition to the standard trust store.
    #[serde(default)]
    pub ca: Option<PathBuf>,
    /// Client certificate chain, for client-certificate mode.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// Client private key.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// Master daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Address the publish and request channels bind to.
    pub interface: String,
    /// Publish-channel port.
    pub publish_port: u16,
    /// Request-channel port.
    pub ret_port: u16,
    /// Control-channel port; always bound to 127.0.0.1.
    pub control_port: u16,
    /// PKI directory holding the master keypair and minion key states.
    pub pki_dir: PathBuf,
    /// Cache directory holding the persistent job cache.
    pub cache_dir: PathBuf,
    /// Root served by the file-fetch backend.
    pub file_root: PathBuf,
    /// RSA modulus size for the master identity, 2048 or 4096.
    pub key_size: usize,
    /// Maximum wire frame size in bytes.
    pub max_frame_size: usize,
    /// Seconds to wait for returns before closing a job.
    pub gather_job_timeout_secs: u64,
    /// Hours a closed job stays in the cache.
    pub keep_jobs_hours: u64,
    /// Request-channel deadline in seconds.
    pub request_timeout_secs: u64,
    /// Event-bus ring capacity.
    pub event_buffer: usize,
    /// Accept keys on first contact without an operator. Test rigs only.
    pub auto_accept: bool,
    /// Named target groups, values are compound expressions.
    pub nodegroups: HashMap<String, String>,
    /// Optional TLS for both listening channels.
    pub tls: Option<TlsServerConfig>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            publish_port: DEFAULT_PUBLISH_PORT,
            ret_port: DEFAULT_REQUEST_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            pki_dir: PathBuf::from("/etc/herd/pki/master"),
            cache_dir: PathBuf::from("/var/cache/herd/master"),
            file_root: PathBuf::from("/srv/herd"),
            key_size: 4096,
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE,
            gather_job_timeout_secs: 10,
            keep_jobs_hours: 24,
            request_timeout_secs: 60,
            event_buffer: 10_000,
            auto_accept: false,
            nodegroups: HashMap::new(),
            tls: None,
        }
    }
}

impl MasterConfig {
    /// Loads the master config from `path`, or `<config_dir>/master`.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        read_config(path, "master")
    }
}

/// Minion daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MinionConfig {
    /// This minion's identity. Falls back to the `HOSTNAME` environment
    /// variable, then to `"minion"`.
    pub id: Option<String>,
    /// Ordered master list; the minion connects to the first responsive
    /// entry and fails over on transport loss.
    pub masters: Vec<String>,
    /// Master publish-channel port.
    pub publish_port: u16,
    /// Master request-channel port.
    pub master_port: u16,
    /// PKI directory holding this minion's keypair and the pinned master key.
    pub pki_dir: PathBuf,
    /// Local cache directory.
    pub cache_dir: PathBuf,
    /// Preseeded SHA-256 fingerprint of the master public key. When set,
    /// the first-seen master key must match before it is pinned.
    pub master_finger: Option<String>,
    /// Pin the master key on first successful verification. Disabling this
    /// makes an unpinned master fatal.
    pub trust_on_first_use: bool,
    /// RSA modulus size for the minion identity.
    pub key_size: usize,
    /// Maximum wire frame size in bytes.
    pub max_frame_size: usize,
    /// Concurrent job executions.
    pub worker_pool: usize,
    /// Queued publications beyond the pool; overflow rejects the oldest.
    pub job_queue: usize,
    /// Return submission attempts before dropping.
    pub return_retries: u32,
    /// Backoff cap for return retries, seconds.
    pub return_backoff_cap_secs: u64,
    /// Liveness beat interval, seconds.
    pub heartbeat_secs: u64,
    /// Initial wait between auth retries while pending, seconds.
    pub acceptance_wait_secs: u64,
    /// Cap for the pending-retry backoff, seconds.
    pub acceptance_wait_cap_secs: u64,
    /// Request-channel deadline, seconds.
    pub request_timeout_secs: u64,
    /// Statically configured grains merged over the collected ones.
    pub grains: Map<String, Value>,
    /// Optional TLS for both channels.
    pub tls: Option<TlsClientConfig>,
}

impl Default for MinionConfig {
    fn default() -> Self {
        Self {
            id: None,
            masters: vec!["127.0.0.1".to_string()],
            publish_port: DEFAULT_PUBLISH_PORT,
            master_port: DEFAULT_REQUEST_PORT,
            pki_dir: PathBuf::from("/etc/herd/pki/minion"),
            cache_dir: PathBuf::from("/var/cache/herd/minion"),
            master_finger: None,
            trust_on_first_use: true,
            key_size: 4096,
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE,
            worker_pool: 4,
            job_queue: 128,
            return_retries: 5,
            return_backoff_cap_secs: 30,
            heartbeat_secs: 60,
            acceptance_wait_secs: 10,
            acceptance_wait_cap_secs: 60,
            request_timeout_secs: 60,
            grains: Map::new(),
            tls: None,
        }
    }
}

impl MinionConfig {
    /// Loads the minion config from `path`, or `<config_dir>/minion`.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        read_config(path, "minion")
    }

    /// Resolves the effective minion identity.
    pub fn resolved_id(&self) -> crate::MinionId {
        let id = self
            .id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "minion".to_string());
        crate::MinionId::new(id)
    }
}

/// Syndic daemon configuration: a master role downstream and a minion role
/// upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyndicConfig {
    /// The downstream master role.
    pub master: MasterConfig,
    /// The upstream minion role (identity, upstream master list, keys).
    pub upstream: MinionConfig,
    /// Seconds to aggregate downstream returns before forwarding a
    /// composite return upstream.
    pub forward_wait_secs: u64,
}

impl Default for SyndicConfig {
    fn default() -> Self {
        Self {
            master: MasterConfig::default(),
            upstream: MinionConfig::default(),
            forward_wait_secs: 5,
        }
    }
}

impl SyndicConfig {
    /// Loads the syndic config from `path`, or `<config_dir>/syndic`.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        read_config(path, "syndic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.publish_port, 4505);
        assert_eq!(cfg.gather_job_timeout_secs, 10);
        assert_eq!(cfg.keep_jobs_hours, 24);
        assert!(!cfg.auto_accept);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let raw = r#"
            interface = "127.0.0.1"
            publish_port = 5505

            [nodegroups]
            web = "L@m1,m2 or G@role:web"
        "#;
        let cfg: MasterConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.interface, "127.0.0.1");
        assert_eq!(cfg.publish_port, 5505);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.ret_port, 4506);
        assert_eq!(cfg.nodegroups["web"], "L@m1,m2 or G@role:web");
    }

    #[test]
    fn test_minion_grains_from_toml() {
        let raw = r#"
            id = "m1"
            masters = ["10.0.0.1", "10.0.0.2"]

            [grains]
            role = "web"
        "#;
        let cfg: MinionConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.resolved_id().as_str(), "m1");
        assert_eq!(cfg.masters.len(), 2);
        assert_eq!(cfg.grains["role"], serde_json::json!("web"));
    }
}
