// SPDX-License-Identifier: MIT OR Apache-2.0
//! cordon-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Configuration loading and validation for the Cordon agent and its policy
//! chain. Both files are YAML on disk; every load runs semantic validation
//! and can additionally surface advisory [`ConfigWarning`]s.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found or unreadable.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid YAML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// TLS is not configured: the agent will speak plain HTTP.
    InsecureTransport,
    /// A default timeout is unusually large.
    LargeTimeout {
        /// Timeout value in seconds.
        secs: u64,
    },
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::InsecureTransport => {
                write!(
                    f,
                    "tls_cert_file/tls_key_file are empty: the agent will serve PLAIN HTTP; \
                     never expose this beyond a development loopback"
                )
            }
            ConfigWarning::LargeTimeout { secs } => {
                write!(f, "default_timeout_seconds is unusually large ({secs}s)")
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

/// Maximum allowed default timeout in seconds (24 hours).
const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Threshold above which a timeout generates a warning.
const LARGE_TIMEOUT_THRESHOLD: u64 = 3_600;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "CORDON_";

// ---------------------------------------------------------------------------
// Agent configuration
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for a Cordon agent.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AgentConfig {
    /// TCP port to bind (1..=65535).
    pub port: u16,

    /// Path to the PEM certificate chain; empty means dev-mode plain HTTP.
    #[serde(default)]
    pub tls_cert_file: String,

    /// Path to the PEM private key; empty means dev-mode plain HTTP.
    #[serde(default)]
    pub tls_key_file: String,

    /// Shared HMAC secret used to verify signed jobs. Required, non-empty.
    pub hmac_secret: String,

    /// Controller identities allowed to submit jobs. Required, non-empty.
    pub allowed_controllers: Vec<String>,

    /// Size of the worker pool (>= 1).
    #[serde(default = "AgentConfig::default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Images jobs may request; empty means any.
    #[serde(default)]
    pub allowed_images: Vec<String>,

    /// Image used when a job does not request one.
    #[serde(default = "AgentConfig::default_image")]
    pub default_image: String,

    /// Container UID hint.
    #[serde(default = "AgentConfig::default_run_as")]
    pub run_as_user: u32,

    /// Container GID hint.
    #[serde(default = "AgentConfig::default_run_as")]
    pub run_as_group: u32,

    /// Default CPU limit in cores.
    #[serde(default = "AgentConfig::default_cpu_limit")]
    pub default_cpu_limit: f64,

    /// Default memory limit in bytes.
    #[serde(default = "AgentConfig::default_memory_limit")]
    pub default_memory_limit: u64,

    /// Default execution timeout in seconds.
    #[serde(default = "AgentConfig::default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    /// Path of the audit SQLite database.
    #[serde(default = "AgentConfig::default_audit_db_path")]
    pub audit_db_path: String,

    /// Path of the approval SQLite database.
    #[serde(default = "AgentConfig::default_approval_db_path")]
    pub approval_db_path: String,
}

impl AgentConfig {
    fn default_max_concurrent_jobs() -> usize {
        4
    }
    fn default_image() -> String {
        "alpine:latest".into()
    }
    fn default_run_as() -> u32 {
        1000
    }
    fn default_cpu_limit() -> f64 {
        0.5
    }
    fn default_memory_limit() -> u64 {
        256 * 1024 * 1024
    }
    fn default_timeout_seconds() -> u64 {
        300
    }
    fn default_audit_db_path() -> String {
        "cordon-audit.db".into()
    }
    fn default_approval_db_path() -> String {
        "cordon-approvals.db".into()
    }

    /// Whether TLS material is configured.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        !self.tls_cert_file.is_empty() && !self.tls_key_file.is_empty()
    }

    /// Semantic validation; collects every problem instead of stopping at
    /// the first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] listing every failure.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if self.port == 0 {
            reasons.push("port must be in 1..=65535".to_string());
        }
        if self.hmac_secret.is_empty() {
            reasons.push("hmac_secret must not be empty".to_string());
        }
        if self.allowed_controllers.is_empty() {
            reasons.push("allowed_controllers must not be empty".to_string());
        }
        if self.allowed_controllers.iter().any(String::is_empty) {
            reasons.push("allowed_controllers entries must not be empty".to_string());
        }
        if self.max_concurrent_jobs == 0 {
            reasons.push("max_concurrent_jobs must be >= 1".to_string());
        }
        if self.default_cpu_limit <= 0.0 {
            reasons.push("default_cpu_limit must be positive".to_string());
        }
        if self.default_memory_limit == 0 {
            reasons.push("default_memory_limit must be positive".to_string());
        }
        if self.default_timeout_seconds == 0 || self.default_timeout_seconds > MAX_TIMEOUT_SECS {
            reasons.push(format!(
                "default_timeout_seconds must be in 1..={MAX_TIMEOUT_SECS}"
            ));
        }
        if self.tls_cert_file.is_empty() != self.tls_key_file.is_empty() {
            reasons.push(
                "tls_cert_file and tls_key_file must be set together or both empty".to_string(),
            );
        }
        if !self.allowed_images.is_empty() && !self.allowed_images.contains(&self.default_image) {
            reasons.push(format!(
                "default_image {:?} is not in allowed_images",
                self.default_image
            ));
        }

        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }

        if !self.tls_enabled() {
            warnings.push(ConfigWarning::InsecureTransport);
        }
        if self.default_timeout_seconds > LARGE_TIMEOUT_THRESHOLD {
            warnings.push(ConfigWarning::LargeTimeout {
                secs: self.default_timeout_seconds,
            });
        }
        if self.allowed_images.is_empty() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "allowed_images".into(),
                hint: "any image can be requested; list the images you trust".into(),
            });
        }

        Ok(warnings)
    }
}

// ---------------------------------------------------------------------------
// Policy configuration
// ---------------------------------------------------------------------------

/// Approval-policy section of the policy file.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ApprovalPolicy {
    /// Require human approval for high-risk candidates.
    #[serde(default)]
    pub require_approval_high_risk: bool,
    /// Require human approval for destructive candidates.
    #[serde(default)]
    pub require_approval_destructive: bool,
    /// Confirmation message used when no check supplies a stronger one.
    #[serde(default = "ApprovalPolicy::default_message")]
    pub default_message: String,
}

impl ApprovalPolicy {
    fn default_message() -> String {
        "this operation requires explicit approval before execution".into()
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            require_approval_high_risk: false,
            require_approval_destructive: false,
            default_message: Self::default_message(),
        }
    }
}

/// Secrets section: extra redaction patterns registered at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretsPolicy {
    /// Additional whole-match redaction patterns.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

/// Sandbox-defaults section: overrides applied to every job.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SandboxPolicy {
    /// Override the default image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Override the default CPU limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f64>,
    /// Override the default memory limit in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    /// Override the default timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Policy configuration loaded into the check chain.
///
/// Patterns are POSIX-extended regular expressions applied to the raw
/// command string; every pattern must compile at load time, and a failure
/// is fatal.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PolicyConfig {
    /// Commands must match at least one entry when non-empty.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Additional denylist entries, composed with the built-in set.
    #[serde(default)]
    pub denylist: Vec<String>,
    /// Approval-policy settings.
    #[serde(default)]
    pub approval: ApprovalPolicy,
    /// Secrets settings.
    #[serde(default)]
    pub secrets: SecretsPolicy,
    /// Sandbox defaults.
    #[serde(default)]
    pub sandbox: SandboxPolicy,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })
}

/// Parse a YAML string into an [`AgentConfig`] (no validation).
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] on malformed YAML.
pub fn parse_agent_config(content: &str) -> Result<AgentConfig, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Parse a YAML string into a [`PolicyConfig`] (no validation).
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] on malformed YAML.
pub fn parse_policy_config(content: &str) -> Result<PolicyConfig, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Load, env-override, and validate an [`AgentConfig`] from a YAML file.
///
/// Returns the config together with any advisory warnings.
///
/// # Errors
///
/// Returns [`ConfigError`] for unreadable files, malformed YAML, or
/// semantic validation failures.
pub fn load_agent_config(path: &Path) -> Result<(AgentConfig, Vec<ConfigWarning>), ConfigError> {
    let mut config = parse_agent_config(&read_file(path)?)?;
    apply_env_overrides(&mut config);
    let warnings = config.validate()?;
    Ok((config, warnings))
}

/// Load a [`PolicyConfig`] from a YAML file.
///
/// Pattern compilation happens in the check chain; this only parses.
///
/// # Errors
///
/// Returns [`ConfigError`] for unreadable files or malformed YAML.
pub fn load_policy_config(path: &Path) -> Result<PolicyConfig, ConfigError> {
    parse_policy_config(&read_file(path)?)
}

/// Apply `CORDON_*` environment overrides on top of a parsed config.
///
/// Supported: `CORDON_PORT`, `CORDON_HMAC_SECRET`, `CORDON_AUDIT_DB_PATH`,
/// `CORDON_APPROVAL_DB_PATH`, `CORDON_MAX_CONCURRENT_JOBS`.
pub fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(port) = std::env::var(format!("{ENV_PREFIX}PORT")) {
        if let Ok(port) = port.parse::<u16>() {
            config.port = port;
        }
    }
    if let Ok(secret) = std::env::var(format!("{ENV_PREFIX}HMAC_SECRET")) {
        config.hmac_secret = secret;
    }
    if let Ok(path) = std::env::var(format!("{ENV_PREFIX}AUDIT_DB_PATH")) {
        config.audit_db_path = path;
    }
    if let Ok(path) = std::env::var(format!("{ENV_PREFIX}APPROVAL_DB_PATH")) {
        config.approval_db_path = path;
    }
    if let Ok(n) = std::env::var(format!("{ENV_PREFIX}MAX_CONCURRENT_JOBS")) {
        if let Ok(n) = n.parse::<usize>() {
            config.max_concurrent_jobs = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_AGENT_YAML: &str = r"
port: 8443
hmac_secret: shared-secret
allowed_controllers:
  - ctl-1
";

    fn minimal_agent() -> AgentConfig {
        parse_agent_config(MINIMAL_AGENT_YAML).unwrap()
    }

    // -----------------------------------------------------------------------
    // Agent config parsing
    // -----------------------------------------------------------------------

    #[test]
    fn minimal_agent_config_parses_with_defaults() {
        let config = minimal_agent();
        assert_eq!(config.port, 8443);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.default_image, "alpine:latest");
        assert_eq!(config.run_as_user, 1000);
        assert_eq!(config.default_timeout_seconds, 300);
        assert!(!config.tls_enabled());
    }

    #[test]
    fn full_agent_config_parses() {
        let yaml = r"
port: 9000
tls_cert_file: /etc/cordon/tls.crt
tls_key_file: /etc/cordon/tls.key
hmac_secret: s
allowed_controllers: [ctl-1, ctl-2]
max_concurrent_jobs: 8
allowed_images: ['alpine:latest', 'ubuntu:24.04']
default_image: 'ubuntu:24.04'
run_as_user: 1001
run_as_group: 1001
default_cpu_limit: 2.0
default_memory_limit: 1073741824
default_timeout_seconds: 120
audit_db_path: /var/lib/cordon/audit.db
approval_db_path: /var/lib/cordon/approvals.db
";
        let config = parse_agent_config(yaml).unwrap();
        assert!(config.tls_enabled());
        assert_eq!(config.allowed_controllers.len(), 2);
        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.default_memory_limit, 1 << 30);
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = parse_agent_config("port: [not-a-port").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn valid_config_yields_insecure_warning_without_tls() {
        let warnings = minimal_agent().validate().unwrap();
        assert!(warnings.contains(&ConfigWarning::InsecureTransport));
    }

    #[test]
    fn empty_secret_fails_validation() {
        let mut config = minimal_agent();
        config.hmac_secret.clear();
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("hmac_secret")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn empty_controllers_fails_validation() {
        let mut config = minimal_agent();
        config.allowed_controllers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_workers_fails_validation() {
        let mut config = minimal_agent();
        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mismatched_tls_pair_fails_validation() {
        let mut config = minimal_agent();
        config.tls_cert_file = "/etc/cordon/tls.crt".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_collects_every_reason() {
        let mut config = minimal_agent();
        config.hmac_secret.clear();
        config.allowed_controllers.clear();
        config.max_concurrent_jobs = 0;
        match config.validate().unwrap_err() {
            ConfigError::ValidationError { reasons } => assert_eq!(reasons.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn large_timeout_warns_but_passes() {
        let mut config = minimal_agent();
        config.default_timeout_seconds = 7_200;
        let warnings = config.validate().unwrap();
        assert!(warnings.contains(&ConfigWarning::LargeTimeout { secs: 7_200 }));
    }

    #[test]
    fn oversized_timeout_fails() {
        let mut config = minimal_agent();
        config.default_timeout_seconds = MAX_TIMEOUT_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_image_must_be_in_allowed_images() {
        let mut config = minimal_agent();
        config.allowed_images = vec!["ubuntu:24.04".into()];
        assert!(config.validate().is_err());

        config.allowed_images.push(config.default_image.clone());
        assert!(config.validate().is_ok());
    }

    // -----------------------------------------------------------------------
    // Policy config
    // -----------------------------------------------------------------------

    #[test]
    fn empty_policy_config_defaults() {
        let policy = parse_policy_config("{}").unwrap();
        assert!(policy.allowlist.is_empty());
        assert!(policy.denylist.is_empty());
        assert!(!policy.approval.require_approval_high_risk);
        assert!(policy.secrets.extra_patterns.is_empty());
    }

    #[test]
    fn full_policy_config_parses() {
        let yaml = r"
allowlist:
  - '^echo .*'
  - '^ls( .*)?$'
denylist:
  - 'docker +system +prune'
approval:
  require_approval_high_risk: true
  require_approval_destructive: true
  default_message: 'sign-off required'
secrets:
  extra_patterns:
    - 'corp-[0-9a-f]{16}'
sandbox:
  image: 'ubuntu:24.04'
  timeout_seconds: 60
";
        let policy = parse_policy_config(yaml).unwrap();
        assert_eq!(policy.allowlist.len(), 2);
        assert_eq!(policy.denylist.len(), 1);
        assert!(policy.approval.require_approval_high_risk);
        assert_eq!(policy.approval.default_message, "sign-off required");
        assert_eq!(policy.sandbox.image.as_deref(), Some("ubuntu:24.04"));
        assert_eq!(policy.sandbox.timeout_seconds, Some(60));
    }

    // -----------------------------------------------------------------------
    // File loading
    // -----------------------------------------------------------------------

    #[test]
    fn load_agent_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL_AGENT_YAML.as_bytes()).unwrap();
        let (config, warnings) = load_agent_config(file.path()).unwrap();
        assert_eq!(config.port, 8443);
        assert!(!warnings.is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load_agent_config(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
