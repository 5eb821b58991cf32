//! Node configuration.
//!
//! The configuration file is TOML. It is read into a raw record where every
//! field is optional, then validated at the boundary into [`NodeConfig`].
//! Validation reports every problem at once, so an operator fixes the file
//! in one pass instead of rerunning once per missing field.
//!
//! Nothing downstream reads the environment or the file again: components
//! receive the parts of [`NodeConfig`] they need.

use crate::bundle::generator::DEFAULT_CERTUTIL_PATH;
use crate::bundle::{validate_file_name, DEFAULT_BUNDLE_FILE_NAME};
use crate::identity::{NodeIdentity, Role};
use crate::retry::{Backoff, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default distribution port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_WORK_DIR: &str = "/var/lib/trustseed";
const DEFAULT_SESSION_TIMEOUT: &str = "10m";
const DEFAULT_BACKOFF: &str = "5s";
const DEFAULT_MAX_BACKOFF: &str = "60s";
const DEFAULT_REQUEST_TIMEOUT: &str = "30s";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration:\n  - {}", .problems.join("\n  - "))]
    Invalid { problems: Vec<String> },

    #[error("failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Raw (file) representation
// ---------------------------------------------------------------------------

/// Configuration exactly as written in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub node: RawNode,
    pub bundle: RawBundle,
    pub distribution: RawDistribution,
    pub retrieval: RawRetrieval,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawNode {
    pub cluster_name: Option<String>,
    pub node_name: Option<String>,
    pub role: Option<String>,
    pub seed_hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawBundle {
    pub file_name: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub generator: Option<String>,
    pub certutil: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawDistribution {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub session_timeout: Option<String>,
    pub stop_after_fetches: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawRetrieval {
    pub max_attempts: Option<u32>,
    pub backoff: Option<String>,
    pub strategy: Option<String>,
    pub max_backoff: Option<String>,
    pub request_timeout: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Validated representation
// ---------------------------------------------------------------------------

/// Which generator backend the Authority uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorKind {
    Certutil { program: PathBuf },
    Builtin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSettings {
    pub file_name: String,
    /// Directory the search engine reads its configuration from.
    pub config_dir: PathBuf,
    /// Authority: generation and serving root. Follower: staging area.
    pub work_dir: PathBuf,
    pub owner: String,
    pub group: String,
    pub generator: GeneratorKind,
}

impl BundleSettings {
    /// Final location of the installed bundle.
    pub fn install_path(&self) -> PathBuf {
        self.config_dir.join(&self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionSettings {
    pub bind: SocketAddr,
    pub session_timeout: Option<Duration>,
    pub stop_after_fetches: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalSettings {
    pub policy: RetryPolicy,
    pub request_timeout: Duration,
}

/// Validated node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub identity: NodeIdentity,
    pub seed_hosts: Vec<String>,
    pub bundle: BundleSettings,
    pub distribution: DistributionSettings,
    pub retrieval: RetrievalSettings,
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        raw.validate()
    }

    /// URL a Follower polls for the bundle: the first seed host on the
    /// distribution port.
    pub fn source_url(&self) -> Option<String> {
        let host = self.seed_hosts.first()?;
        Some(bundle_url(
            host,
            self.distribution.bind.port(),
            &self.bundle.file_name,
        ))
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(role: Role) -> String {
        let seed_hosts = match role {
            Role::Authority => "# seed_hosts = [\"10.0.0.10\", \"10.0.0.11\"]",
            Role::Follower => "seed_hosts = [\"10.0.0.10\"]",
        };

        format!(
            r#"# trustseed node configuration
#
# The Authority generates the shared transport bundle and serves it over
# plain HTTP for a bounded session. Followers poll the first seed host until
# the bundle is retrievable, then install it.
#
# The distribution endpoint has no authentication and no encryption. Only
# run a bootstrap on a trusted network segment.

[node]
cluster_name = "search-cluster"
node_name = "node-1"
role = "{role}"
# Followers fetch from the first entry
{seed_hosts}

[bundle]
file_name = "{file_name}"
config_dir = "/etc/elasticsearch"
work_dir = "{work_dir}"
owner = "elasticsearch"
# group = "elasticsearch"     # defaults to owner
# generator: "certutil" (external tool) or "builtin"
generator = "certutil"
certutil = "{certutil}"

[distribution]
bind_address = "0.0.0.0"
port = {port}
# Session ends after this long even if Followers are still missing
session_timeout = "{session_timeout}"
# stop_after_fetches = 2

[retrieval]
max_attempts = {max_attempts}
backoff = "{backoff}"
# "fixed" or "exponential" (exponential uses jitter, capped at max_backoff)
strategy = "fixed"
max_backoff = "{max_backoff}"
request_timeout = "{request_timeout}"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/trustseed.log"
"#,
            role = role,
            seed_hosts = seed_hosts,
            file_name = DEFAULT_BUNDLE_FILE_NAME,
            work_dir = DEFAULT_WORK_DIR,
            certutil = DEFAULT_CERTUTIL_PATH,
            port = DEFAULT_PORT,
            session_timeout = DEFAULT_SESSION_TIMEOUT,
            max_attempts = DEFAULT_MAX_ATTEMPTS,
            backoff = DEFAULT_BACKOFF,
            max_backoff = DEFAULT_MAX_BACKOFF,
            request_timeout = DEFAULT_REQUEST_TIMEOUT,
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(config_path: &Path, role: Role) -> Result<(), ConfigError> {
        let contents = Self::generate_default_toml(role);
        let write_err = |source| ConfigError::Write {
            path: config_path.to_path_buf(),
            source,
        };

        // Create parent directory if needed
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        fs::write(config_path, contents).map_err(write_err)?;

        Ok(())
    }
}

impl RawConfig {
    /// Validate every field, collecting all problems before failing.
    pub fn validate(self) -> Result<NodeConfig, ConfigError> {
        let mut problems = Vec::new();

        let cluster_name = required(&mut problems, "node.cluster_name", self.node.cluster_name);
        let node_name = required(&mut problems, "node.node_name", self.node.node_name);
        let role = required(&mut problems, "node.role", self.node.role).and_then(|role| {
            role.parse::<Role>()
                .map_err(|e| problems.push(format!("node.role: {}", e)))
                .ok()
        });

        let seed_hosts: Vec<String> = self
            .node
            .seed_hosts
            .into_iter()
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
            .collect();
        if role == Some(Role::Follower) && seed_hosts.is_empty() {
            problems.push("node.seed_hosts: a follower needs at least one seed host".to_string());
        }
        for host in seed_hosts.iter().filter(|host| host.contains("://")) {
            problems.push(format!(
                "node.seed_hosts: '{}' must be a host or host:port, not a URL",
                host
            ));
        }

        let file_name = self
            .bundle
            .file_name
            .unwrap_or_else(|| DEFAULT_BUNDLE_FILE_NAME.to_string());
        if let Err(e) = validate_file_name(&file_name) {
            problems.push(format!("bundle.file_name: {}", e));
        }

        let config_dir = required(&mut problems, "bundle.config_dir", self.bundle.config_dir);
        let owner = required(&mut problems, "bundle.owner", self.bundle.owner);
        let group = self.bundle.group.or_else(|| owner.clone());
        let work_dir = self
            .bundle
            .work_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));

        let generator = match self.bundle.generator.as_deref().unwrap_or("certutil") {
            "certutil" => Some(GeneratorKind::Certutil {
                program: self
                    .bundle
                    .certutil
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CERTUTIL_PATH)),
            }),
            "builtin" => Some(GeneratorKind::Builtin),
            other => {
                problems.push(format!(
                    "bundle.generator: unknown generator '{}' (expected 'certutil' or 'builtin')",
                    other
                ));
                None
            }
        };

        let bind_ip = match self.distribution.bind_address.as_deref() {
            None => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            Some(addr) => addr
                .parse::<IpAddr>()
                .map_err(|e| problems.push(format!("distribution.bind_address: {}", e)))
                .ok(),
        };
        let port = self.distribution.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            problems.push("distribution.port: must be non-zero".to_string());
        }
        let session_timeout = duration(
            &mut problems,
            "distribution.session_timeout",
            self.distribution.session_timeout.as_deref(),
            DEFAULT_SESSION_TIMEOUT,
        );
        if self.distribution.stop_after_fetches == Some(0) {
            problems.push("distribution.stop_after_fetches: must be at least 1".to_string());
        }

        let max_attempts = self.retrieval.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            problems.push("retrieval.max_attempts: must be at least 1".to_string());
        }
        let backoff = duration(
            &mut problems,
            "retrieval.backoff",
            self.retrieval.backoff.as_deref(),
            DEFAULT_BACKOFF,
        );
        let max_backoff = duration(
            &mut problems,
            "retrieval.max_backoff",
            self.retrieval.max_backoff.as_deref(),
            DEFAULT_MAX_BACKOFF,
        );
        let request_timeout = duration(
            &mut problems,
            "retrieval.request_timeout",
            self.retrieval.request_timeout.as_deref(),
            DEFAULT_REQUEST_TIMEOUT,
        );
        let exponential = match self.retrieval.strategy.as_deref().unwrap_or("fixed") {
            "fixed" => Some(false),
            "exponential" => Some(true),
            other => {
                problems.push(format!(
                    "retrieval.strategy: unknown strategy '{}' (expected 'fixed' or 'exponential')",
                    other
                ));
                None
            }
        };

        if let Err(e) = self
            .logging
            .level
            .parse::<tracing_subscriber::filter::LevelFilter>()
        {
            problems.push(format!("logging.level: {}", e));
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid { problems });
        }

        // Every Option below is Some once `problems` is empty.
        match (
            cluster_name,
            node_name,
            role,
            config_dir,
            owner,
            group,
            generator,
            bind_ip,
            session_timeout,
            backoff,
            max_backoff,
            request_timeout,
            exponential,
        ) {
            (
                Some(cluster_name),
                Some(node_name),
                Some(role),
                Some(config_dir),
                Some(owner),
                Some(group),
                Some(generator),
                Some(bind_ip),
                Some(session_timeout),
                Some(backoff),
                Some(max_backoff),
                Some(request_timeout),
                Some(exponential),
            ) => {
                let backoff = if exponential {
                    Backoff::Exponential {
                        initial: backoff,
                        max: max_backoff,
                        jitter: true,
                    }
                } else {
                    Backoff::Fixed(backoff)
                };

                Ok(NodeConfig {
                    identity: NodeIdentity::new(role, node_name, cluster_name),
                    seed_hosts,
                    bundle: BundleSettings {
                        file_name,
                        config_dir,
                        work_dir,
                        owner,
                        group,
                        generator,
                    },
                    distribution: DistributionSettings {
                        bind: SocketAddr::new(bind_ip, port),
                        session_timeout: Some(session_timeout),
                        stop_after_fetches: self.distribution.stop_after_fetches,
                    },
                    retrieval: RetrievalSettings {
                        policy: RetryPolicy {
                            max_attempts,
                            backoff,
                        },
                        request_timeout,
                    },
                    logging: self.logging,
                })
            }
            _ => Err(ConfigError::Invalid {
                problems: vec!["configuration incomplete".to_string()],
            }),
        }
    }
}

fn required<T: Blank>(problems: &mut Vec<String>, field: &str, value: Option<T>) -> Option<T> {
    let value = value.filter(|v| !v.is_blank());
    if value.is_none() {
        problems.push(format!("{}: missing", field));
    }
    value
}

/// Present-but-empty values count as missing.
trait Blank {
    fn is_blank(&self) -> bool;
}

impl Blank for String {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Blank for PathBuf {
    fn is_blank(&self) -> bool {
        self.as_os_str().is_empty()
    }
}

fn duration(
    problems: &mut Vec<String>,
    field: &str,
    value: Option<&str>,
    default: &str,
) -> Option<Duration> {
    humantime::parse_duration(value.unwrap_or(default))
        .map_err(|e| problems.push(format!("{}: {}", field, e)))
        .ok()
}

/// Build the distribution URL for a seed host entry.
///
/// Seed entries may carry a transport port (`host:9300`) which is not the
/// distribution port, so only the host part is kept. IPv6 literals are
/// bracketed.
pub fn bundle_url(seed_host: &str, port: u16, file_name: &str) -> String {
    let host = seed_host_name(seed_host);
    if host.contains(':') {
        format!("http://[{}]:{}/{}", host, port, file_name)
    } else {
        format!("http://{}:{}/{}", host, port, file_name)
    }
}

fn seed_host_name(seed_host: &str) -> &str {
    let seed_host = seed_host.trim();

    // [v6]:port or [v6]
    if let Some(rest) = seed_host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }

    // Bare IPv6 literal
    if seed_host.parse::<std::net::Ipv6Addr>().is_ok() {
        return seed_host;
    }

    match seed_host.rsplit_once(':') {
        Some((host, _port)) => host,
        None => seed_host,
    }
}

/// Default config file location (`<config dir>/trustseed/config.toml`).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trustseed")
        .join("config.toml")
}
