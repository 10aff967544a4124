//! INI configuration for a registry node.
//!
//! One file, three sections: `node` (role, pid file, control port), `couchdb`
//! (DocDB port, tenant prefix, connect retries) and `log` (output, level).
//! Everything has a default, so an empty file is a valid contributor
//! configuration.

use std::{net::Ipv4Addr, path::Path, path::PathBuf, str::FromStr, sync::Arc};

use config::FileFormat;
use serde::Deserialize;

use crate::peers::{PeerInfo, PeerType};

/// The recognized log levels.
pub const LOG_LEVELS: [&str; 5] = ["debug", "info", "warning", "error", "critical"];

/// Errors from loading or validating the configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read or parsed.
    #[error("failed to read configuration")]
    Read {
        /// Parser-level cause.
        #[source]
        error: config::ConfigError,
    },
    /// The file parsed but carries an unusable value.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

/// Top-level node configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// The `node` section.
    pub node: NodeSection,
    /// The `couchdb` section.
    pub couchdb: CouchdbSection,
    /// The `log` section.
    pub log: LogSection,
}

/// The `node` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Role of this node.
    #[serde(rename = "type")]
    pub peer_type: PeerType,
    /// Pid file path, or the literal `none`.
    pub pid_file: String,
    /// Port of the HTTP control surface; absent disables it.
    pub control_port: Option<u16>,
    /// Comma-separated `host:port` list of statically known peers.
    pub fixed_peers: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            peer_type: PeerType::Contributor,
            pid_file: "/var/run/ers_daemon.pid".to_string(),
            control_port: None,
            fixed_peers: String::new(),
        }
    }
}

/// The `couchdb` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CouchdbSection {
    /// DocDB listener port.
    pub port: u16,
    /// Tenant tag advertised on discovery.
    pub prefix: String,
    /// Connection attempts at startup, one second apart.
    pub tries: u32,
}

impl Default for CouchdbSection {
    fn default() -> Self {
        Self {
            port: 5984,
            prefix: "ers".to_string(),
            tries: 10,
        }
    }
}

/// The `log` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// `stdout`, `syslog`, or an absolute file path.
    pub output: String,
    /// One of [`LOG_LEVELS`].
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            output: "stdout".to_string(),
            level: "info".to_string(),
        }
    }
}

impl LogSection {
    /// Install the global tracing subscriber described by this section.
    ///
    /// `syslog` is accepted and routed to stdout; log transport is owned by
    /// the process supervisor in this build.
    pub fn init(&self) -> anyhow::Result<()> {
        let filter = tracing_subscriber::EnvFilter::new(match self.level.as_str() {
            "warning" => "warn",
            "critical" => "error",
            level => level,
        });
        match self.output.as_str() {
            "stdout" | "syslog" => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
            path => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .init();
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load and validate the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::new(
                &path.as_ref().to_string_lossy(),
                FileFormat::Ini,
            ))
            .build()
            .map_err(|error| ConfigError::Read { error })?;
        let cfg: Config = raw
            .try_deserialize()
            .map_err(|error| ConfigError::Read { error })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.couchdb.tries < 1 {
            return Err(ConfigError::Invalid {
                reason: "couchdb.tries must be at least 1".to_string(),
            });
        }
        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(ConfigError::Invalid {
                reason: format!("unknown log level `{}`", self.log.level),
            });
        }
        for entry in self.fixed_peer_entries() {
            if entry.split_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                return Err(ConfigError::Invalid {
                    reason: format!("fixed peer `{entry}` is not host:port"),
                });
            }
        }
        Ok(())
    }

    /// The pid file path, unless disabled with the literal `none`.
    pub fn pid_path(&self) -> Option<PathBuf> {
        match self.node.pid_file.as_str() {
            "none" | "" => None,
            path => Some(PathBuf::from(path)),
        }
    }

    /// URL of the local DocDB.
    pub fn local_docdb_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.couchdb.port)
    }

    /// The statically configured peers.
    pub fn fixed_peers(&self) -> Vec<PeerInfo> {
        self.fixed_peer_entries()
            .filter_map(|entry| {
                let (host, port) = entry.split_once(':')?;
                Some(PeerInfo {
                    service_name: format!("fixed:{entry}"),
                    host: host.to_string(),
                    ipv4: host.parse::<Ipv4Addr>().ok(),
                    port: port.parse().ok()?,
                    prefix: self.couchdb.prefix.clone(),
                    peer_type: PeerType::Contributor,
                })
            })
            .collect()
    }

    fn fixed_peer_entries(&self) -> impl Iterator<Item = &str> {
        self.node
            .fixed_peers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = config::Config::builder()
            .add_source(config::File::from_str(s, FileFormat::Ini))
            .build()
            .map_err(|error| ConfigError::Read { error })?;
        let cfg: Config = raw
            .try_deserialize()
            .map_err(|error| ConfigError::Read { error })?;
        cfg.validate()?;
        Ok(cfg)
    }
}
