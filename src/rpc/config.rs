//! Client configuration
//!
//! Settings come from a JSON file, a properties map (short keys or keys
//! prefixed with `com.perforce.p4java.`), or code. Credential file locations
//! fall back to `P4TICKETS`/`P4TRUST` and then to per-platform defaults.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::auth_file::{AuthStore, LockPolicy, write_replace};
use super::tickets::TicketStore;
use super::trust::TrustStore;

/// Prefix accepted in front of every property key
pub const PROPERTY_PREFIX: &str = "com.perforce.p4java.";

/// Environment variable naming the tickets file
pub const TICKETS_ENV: &str = "P4TICKETS";

/// Environment variable naming the trust file
pub const TRUST_ENV: &str = "P4TRUST";

/// Configuration for connections and credential stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Tickets file (default: `P4TICKETS`, then the platform default)
    pub ticket_path: Option<PathBuf>,

    /// Trust file (default: `P4TRUST`, then the platform default)
    pub trust_path: Option<PathBuf>,

    /// Lock retry budget for both credential files
    pub lock: LockPolicy,

    /// Keep tickets and fingerprints in memory instead of files
    pub use_memory_stores: bool,

    /// Program name reported to the server
    pub program_name: String,

    /// Program version reported to the server
    pub program_version: String,

    /// Application name sent in the protocol record
    pub application_name: Option<String>,

    /// Advertise streams support
    pub enable_streams: bool,

    /// Ask the server for progress indicators
    pub enable_progress: bool,

    /// Drop informational messages from results
    pub quiet_mode: bool,

    /// Accept command names outside the usual lowercase form
    pub relax_cmd_name_checks: bool,

    /// User name
    pub user: Option<String>,

    /// Client workspace name
    pub client: Option<String>,

    /// Client name sent when none is configured
    pub unset_client_name: String,

    /// User name sent when none is configured
    pub unset_user_name: String,

    /// Charset for non-metadata text (`none` for non-unicode servers)
    pub charset: Option<String>,

    /// Socket read/write timeout in milliseconds; 0 disables it
    pub socket_timeout_ms: u64,

    /// Install fingerprints of unknown servers without asking
    pub auto_accept_trust: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ticket_path: None,
            trust_path: None,
            lock: LockPolicy::default(),
            use_memory_stores: false,
            program_name: "p4rpc".to_string(),
            program_version: crate::VERSION.to_string(),
            application_name: None,
            enable_streams: true,
            enable_progress: false,
            quiet_mode: false,
            relax_cmd_name_checks: false,
            user: None,
            client: None,
            unset_client_name: "p4rpc_unset_client".to_string(),
            unset_user_name: "nouser".to_string(),
            charset: None,
            socket_timeout_ms: 30_000,
            auto_accept_trust: false,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, value: &str, current: T) -> T {
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(key, value, "ignoring malformed property value");
            current
        }
    }
}

fn parse_flag(key: &str, value: &str, current: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => true,
        "false" | "no" | "0" | "off" => false,
        _ => {
            warn!(key, value, "ignoring malformed boolean property");
            current
        }
    }
}

impl RpcConfig {
    /// Apply a properties map on top of the defaults.
    ///
    /// Unknown keys are ignored. Malformed values keep the default and are
    /// logged.
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        config.apply_properties(props);
        config
    }

    /// Apply a properties map on top of the current values.
    pub fn apply_properties(&mut self, props: &HashMap<String, String>) {
        for (raw_key, value) in props {
            let key = raw_key.strip_prefix(PROPERTY_PREFIX).unwrap_or(raw_key);
            match key {
                "ticketPath" => self.ticket_path = Some(PathBuf::from(value)),
                "trustPath" => self.trust_path = Some(PathBuf::from(value)),
                "authFileLockTry" => self.lock.tries = parse_or(key, value, self.lock.tries),
                "authFileLockWait" => self.lock.wait_ms = parse_or(key, value, self.lock.wait_ms),
                "authFileLockDelay" => self.lock.delay_ms = parse_or(key, value, self.lock.delay_ms),
                "useAuthMemoryStore" => {
                    self.use_memory_stores = parse_flag(key, value, self.use_memory_stores)
                }
                "programName" | "progName" => self.program_name = value.clone(),
                "programVersion" | "progVersion" => self.program_version = value.clone(),
                "applicationName" => self.application_name = Some(value.clone()),
                "enableStreams" => self.enable_streams = parse_flag(key, value, self.enable_streams),
                "enableProgress" => {
                    self.enable_progress = parse_flag(key, value, self.enable_progress)
                }
                "quietMode" => self.quiet_mode = parse_flag(key, value, self.quiet_mode),
                "relaxCmdNameChecks" => {
                    self.relax_cmd_name_checks = parse_flag(key, value, self.relax_cmd_name_checks)
                }
                "userName" => self.user = Some(value.clone()),
                "clientName" => self.client = Some(value.clone()),
                "unsetClientName" => self.unset_client_name = value.clone(),
                "unsetUserName" => self.unset_user_name = value.clone(),
                "charset" => self.charset = Some(value.clone()),
                "sockSoTimeout" => {
                    self.socket_timeout_ms = parse_or(key, value, self.socket_timeout_ms)
                }
                "autoAcceptTrust" => {
                    self.auto_accept_trust = parse_flag(key, value, self.auto_accept_trust)
                }
                _ => {}
            }
        }
    }

    /// Socket timeout, or `None` when disabled
    pub fn socket_timeout(&self) -> Option<Duration> {
        (self.socket_timeout_ms > 0).then(|| Duration::from_millis(self.socket_timeout_ms))
    }

    /// Resolved tickets file path
    pub fn ticket_file(&self) -> PathBuf {
        resolve_path(self.ticket_path.as_deref(), TICKETS_ENV, ".p4tickets", "p4tickets.txt")
    }

    /// Resolved trust file path
    pub fn trust_file(&self) -> PathBuf {
        resolve_path(self.trust_path.as_deref(), TRUST_ENV, ".p4trust", "p4trust.txt")
    }

    /// Build the trust and ticket stores this configuration describes.
    pub fn open_stores(&self) -> (TrustStore, TicketStore) {
        if self.use_memory_stores {
            (
                TrustStore::new(AuthStore::memory()),
                TicketStore::new(AuthStore::memory()),
            )
        } else {
            (
                TrustStore::new(AuthStore::file(self.trust_file(), self.lock)),
                TicketStore::new(AuthStore::file(self.ticket_file(), self.lock)),
            )
        }
    }

    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Save as JSON, atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).context("Failed to serialize config")?;
        write_replace(path, &data, false)
            .with_context(|| format!("Failed to write config file: {:?}", path))
    }
}

fn resolve_path(explicit: Option<&Path>, env_var: &str, unix_name: &str, windows_name: &str) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = std::env::var_os(env_var).filter(|value| !value.is_empty()) {
        return PathBuf::from(path);
    }
    let name = if cfg!(windows) { windows_name } else { unix_name };
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn short_and_prefixed_keys_apply() {
        let config = RpcConfig::from_properties(&props(&[
            ("ticketPath", "/tmp/tickets"),
            ("com.perforce.p4java.authFileLockTry", "7"),
            ("progName", "builder"),
            ("com.perforce.p4java.quietMode", "true"),
            ("somethingElse", "ignored"),
        ]));
        assert_eq!(config.ticket_file(), PathBuf::from("/tmp/tickets"));
        assert_eq!(config.lock.tries, 7);
        assert_eq!(config.program_name, "builder");
        assert!(config.quiet_mode);
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = RpcConfig::from_properties(&props(&[
            ("authFileLockWait", "soon"),
            ("enableStreams", "maybe"),
        ]));
        assert_eq!(config.lock.wait_ms, LockPolicy::default().wait_ms);
        assert!(config.enable_streams);
    }

    #[test]
    fn json_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("p4rpc.json");
        let config = RpcConfig {
            trust_path: Some(temp.path().join("trust")),
            socket_timeout_ms: 0,
            ..RpcConfig::default()
        };
        config.save(&path).expect("save");
        let loaded = RpcConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
        assert!(loaded.socket_timeout().is_none());
    }

    #[test]
    fn save_replaces_existing_file_and_leaves_no_temp() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("p4rpc.json");
        RpcConfig::default().save(&path).expect("first save");
        let config = RpcConfig {
            program_name: "builder".to_string(),
            ..RpcConfig::default()
        };
        config.save(&path).expect("second save");

        assert_eq!(RpcConfig::load(&path).expect("load").program_name, "builder");
        let names: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("p4rpc.json")]);
        assert!(!fs::metadata(&path).expect("metadata").permissions().readonly());
    }

    #[test]
    fn memory_stores_have_no_files() {
        let config = RpcConfig {
            use_memory_stores: true,
            ..RpcConfig::default()
        };
        let (trust, tickets) = config.open_stores();
        assert!(trust.store().path().is_none());
        assert!(tickets.store().path().is_none());
    }
}
