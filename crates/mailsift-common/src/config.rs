//! Configuration for mailsift

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "MAILSIFT_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Milter listener and session handling
    #[serde(default)]
    pub milter: MilterConfig,

    /// Verdict thresholds and module groups
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Header insertion templates applied at end of message
    #[serde(default)]
    pub headers: Vec<HeaderTemplate>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Persistence configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Built-in checker modules
    #[serde(default)]
    pub modules: ModulesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            milter: MilterConfig::default(),
            scoring: ScoringConfig::default(),
            headers: Vec::new(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            modules: ModulesConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname of the MTA this filter runs for
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Milter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilterConfig {
    /// Listen address: `inet:host:port` or `unix:/path/to/socket`
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Compute and log verdicts but always tell the MTA to continue
    #[serde(default)]
    pub noop: bool,

    /// Re-raise panics caught at callback boundaries (diagnostics only)
    #[serde(default)]
    pub propagate_panics: bool,

    /// Client networks that always receive Permit
    #[serde(default)]
    pub allow_list: Vec<IpNet>,

    /// Sessions connected longer than this are evicted by the pruner
    #[serde(default = "default_session_max_age")]
    pub session_max_age_secs: u64,

    /// Interval between prune sweeps
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,

    /// Maximum time a single module check may take
    #[serde(default = "default_module_timeout")]
    pub module_timeout_ms: u64,
}

impl Default for MilterConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            noop: false,
            propagate_panics: false,
            allow_list: Vec::new(),
            session_max_age_secs: default_session_max_age(),
            prune_interval_secs: default_prune_interval(),
            module_timeout_ms: default_module_timeout(),
        }
    }
}

impl MilterConfig {
    /// Whether a client address falls inside the allow-list
    pub fn is_allow_listed(&self, ip: IpAddr) -> bool {
        self.allow_list.iter().any(|net| net.contains(&ip))
    }
}

fn default_listen() -> String {
    "inet:127.0.0.1:8890".to_string()
}

fn default_session_max_age() -> u64 {
    15 * 60
}

fn default_prune_interval() -> u64 {
    60
}

fn default_module_timeout() -> u64 {
    30_000
}

/// Scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Weighted reject score at which a message is rejected
    #[serde(default = "default_reject_threshold")]
    pub reject_threshold: f64,

    /// Weighted tempfail + reject score at which a message is deferred
    #[serde(default = "default_tempfail_threshold")]
    pub tempfail_threshold: f64,

    /// Per-bucket running score that stops collecting further results
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: f64,

    /// Reject score at which `%{spamFlag}` expands to YES
    #[serde(default = "default_spam_flag_threshold")]
    pub spam_flag_threshold: f64,

    /// Penalty score attached to a failed module check
    #[serde(default = "default_error_score")]
    pub error_score: f64,

    /// Module groups whose scores are rescaled together
    #[serde(default)]
    pub groups: Vec<ModuleGroupConfig>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            reject_threshold: default_reject_threshold(),
            tempfail_threshold: default_tempfail_threshold(),
            breaker_threshold: default_breaker_threshold(),
            spam_flag_threshold: default_spam_flag_threshold(),
            error_score: default_error_score(),
            groups: Vec::new(),
        }
    }
}

fn default_reject_threshold() -> f64 {
    5.0
}

fn default_tempfail_threshold() -> f64 {
    5.0
}

fn default_breaker_threshold() -> f64 {
    25.0
}

fn default_spam_flag_threshold() -> f64 {
    5.0
}

fn default_error_score() -> f64 {
    25.0
}

/// A named group of modules sharing one total weight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleGroupConfig {
    /// Group name (for logging)
    pub name: String,

    /// Total weight of the group
    pub weight: f64,

    /// Member module name to relative weight
    #[serde(default)]
    pub members: BTreeMap<String, f64>,
}

/// Header insertion template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderTemplate {
    /// Header name
    pub key: String,

    /// Value with `%{...}` placeholders
    pub value: String,

    /// Remove existing occurrences before inserting
    #[serde(default)]
    pub unique: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persist finalized sessions and messages
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSON-lines file receiving the records
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Pending records held before new ones are dropped
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_storage_path(),
            queue_size: default_queue_size(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/mailsift/messages.jsonl")
}

fn default_queue_size() -> usize {
    1024
}

/// Built-in module configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModulesConfig {
    #[serde(default)]
    pub rspamd: RspamdModuleConfig,

    #[serde(default)]
    pub rules: RulesModuleConfig,

    #[serde(default)]
    pub recipients: RecipientsModuleConfig,

    #[serde(default)]
    pub quotas: QuotasModuleConfig,
}

/// rspamd module configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RspamdModuleConfig {
    #[serde(default)]
    pub enabled: bool,

    /// rspamd HTTP endpoint (default: http://localhost:11333)
    #[serde(default = "default_rspamd_url")]
    pub url: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_rspamd_timeout")]
    pub timeout_ms: u64,

    /// Password for rspamd (if configured)
    pub password: Option<String>,
}

impl Default for RspamdModuleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_rspamd_url(),
            timeout_ms: default_rspamd_timeout(),
            password: None,
        }
    }
}

fn default_rspamd_url() -> String {
    "http://localhost:11333".to_string()
}

fn default_rspamd_timeout() -> u64 {
    5000
}

/// Rule module configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesModuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Load the built-in rule set in addition to `rules`
    #[serde(default = "default_true")]
    pub default_rules: bool,

    /// Summed rule score at which the module suggests Reject
    #[serde(default = "default_rules_reject_score")]
    pub reject_score: f64,

    /// Additional rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for RulesModuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rules: true,
            reject_score: default_rules_reject_score(),
            rules: Vec::new(),
        }
    }
}

fn default_rules_reject_score() -> f64 {
    10.0
}

/// A content rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name/identifier
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Where the pattern applies
    #[serde(rename = "type")]
    pub rule_type: RuleType,

    /// Regex, header name or length depending on type
    pub pattern: String,

    /// Score added on match (positive = spam, negative = ham)
    pub score: f64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Type of content rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Match pattern in any header line
    Header,
    /// Match pattern in body
    Body,
    /// Match the From header
    From,
    /// Match the Subject header
    Subject,
    /// Header must be present
    HasHeader,
    /// Header must be absent
    MissingHeader,
    /// Body no longer than the given length
    BodyLength,
    /// URL pattern anywhere in the message
    Url,
}

/// Recipient gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientsModuleConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Domains this MTA accepts mail for; empty accepts all
    #[serde(default)]
    pub accepted_domains: Vec<String>,

    /// Addresses that are always rejected
    #[serde(default)]
    pub reject: Vec<String>,

    /// Reply text for rejected recipients
    #[serde(default = "default_recipient_message")]
    pub message: String,
}

impl Default for RecipientsModuleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            accepted_domains: Vec::new(),
            reject: Vec::new(),
            message: default_recipient_message(),
        }
    }
}

fn default_recipient_message() -> String {
    "Recipient address rejected".to_string()
}

/// Sender quota configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotasModuleConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Messages a sender may pass within the window
    #[serde(default = "default_quota_max")]
    pub max_messages: u32,

    /// Window length in seconds
    #[serde(default = "default_quota_window")]
    pub window_secs: u64,

    /// Score attached when the quota is exceeded
    #[serde(default = "default_quota_score")]
    pub score: f64,

    /// Reply text when the quota is exceeded
    #[serde(default = "default_quota_message")]
    pub message: String,
}

impl Default for QuotasModuleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_messages: default_quota_max(),
            window_secs: default_quota_window(),
            score: default_quota_score(),
            message: default_quota_message(),
        }
    }
}

fn default_quota_max() -> u32 {
    100
}

fn default_quota_window() -> u64 {
    3600
}

fn default_quota_score() -> f64 {
    10.0
}

fn default_quota_message() -> String {
    "Sending quota exceeded, try again later".to_string()
}

impl Config {
    /// Load configuration from a TOML file, with `MAILSIFT__` environment
    /// overrides layered on top
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("MAILSIFT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Locate the configuration file
    pub fn locate() -> crate::Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }

        let paths = [
            PathBuf::from("./mailsift.toml"),
            PathBuf::from("/etc/mailsift/mailsift.toml"),
        ];

        paths
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| crate::Error::Config("No configuration file found".to_string()))
    }

    /// Check values serde cannot enforce
    pub fn validate(&self) -> crate::Result<()> {
        let scoring = &self.scoring;
        for (name, value) in [
            ("reject_threshold", scoring.reject_threshold),
            ("tempfail_threshold", scoring.tempfail_threshold),
            ("breaker_threshold", scoring.breaker_threshold),
            ("spam_flag_threshold", scoring.spam_flag_threshold),
            ("error_score", scoring.error_score),
        ] {
            if !value.is_finite() {
                return Err(crate::Error::Config(format!(
                    "scoring.{name} must be a finite number"
                )));
            }
        }

        for group in &scoring.groups {
            if !group.weight.is_finite() || group.weight < 0.0 {
                return Err(crate::Error::Config(format!(
                    "group '{}' has invalid weight {}",
                    group.name, group.weight
                )));
            }
            if let Some((module, weight)) = group
                .members
                .iter()
                .find(|(_, w)| !w.is_finite() || **w < 0.0)
            {
                return Err(crate::Error::Config(format!(
                    "group '{}' member '{}' has invalid weight {}",
                    group.name, module, weight
                )));
            }
        }

        for header in &self.headers {
            if header.key.trim().is_empty() {
                return Err(crate::Error::Config(
                    "header template with empty key".to_string(),
                ));
            }
        }

        if self.milter.session_max_age_secs == 0 {
            return Err(crate::Error::Config(
                "milter.session_max_age_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Shared, reloadable configuration.
///
/// Sessions capture `current()` at connect time; a later `reload()` only
/// affects sessions created afterwards.
pub struct ConfigHandle {
    source: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

impl ConfigHandle {
    /// Wrap a fixed configuration
    pub fn new(config: Config) -> Self {
        Self {
            source: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Load from a file and remember it for reloads
    pub fn load(path: PathBuf) -> crate::Result<Self> {
        let config = Config::from_file(&path)?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(Self {
            source: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Snapshot of the active configuration
    pub fn current(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the active configuration
    pub fn replace(&self, config: Config) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    /// Re-read the source file; the old snapshot stays active on error
    pub fn reload(&self) -> crate::Result<()> {
        let path = self
            .source
            .as_ref()
            .ok_or_else(|| crate::Error::Config("configuration has no source file".to_string()))?;

        let config = Config::from_file(path)?;
        self.replace(config);
        info!(path = %path.display(), "Configuration reloaded");
        Ok(())
    }
}
