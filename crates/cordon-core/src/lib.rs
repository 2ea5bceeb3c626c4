// SPDX-License-Identifier: MIT OR Apache-2.0
//! cordon-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for Cordon: the types that cross the wire between
//! controllers and agents, the audit and approval records, and the canonical
//! serialization every signature is computed over.
//!
//! If you only take one dependency, take this one.

/// Check-chain verdicts and execution context.
pub mod check;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

/// Current protocol version embedded in wire messages.
pub const PROTOCOL_VERSION: &str = "cordon/v1";

/// Exit code reserved for sandbox timeouts.
pub const EXIT_TIMEOUT: i64 = 124;

/// Sentinel exit code for infrastructure failures (container create/start
/// errors, unreachable daemon). Distinct from anything a shell can return.
pub const EXIT_INFRA: i64 = -1;

/// Serde helper for `Duration` as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_secs().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs: u64 = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Risk and candidate metadata
// ---------------------------------------------------------------------------

/// Coarse risk classification supplied by the candidate translator and
/// consulted by the approval policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Read-only or trivially reversible.
    Safe,
    /// Mutates state but is recoverable.
    Medium,
    /// Destructive or hard to reverse.
    High,
}

impl RiskLevel {
    /// Stable string form used in audit rows.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Parse the stable string form back into a level.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safe" => Some(Self::Safe),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Structured description of a command candidate, produced by translation
/// and carried opaquely to the check chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CandidateMetadata {
    /// Risk classification for the approval policy.
    #[serde(default = "CandidateMetadata::default_risk")]
    pub risk_level: RiskLevel,

    /// Whether the command destroys data (triggers pre-run snapshots and
    /// the destructive-ops approval policy).
    #[serde(default)]
    pub destructive: bool,

    /// Filesystem paths the command is expected to touch.
    #[serde(default)]
    pub affected_paths: Vec<String>,

    /// Network endpoints the command is expected to reach.
    #[serde(default)]
    pub network_targets: Vec<String>,
}

impl CandidateMetadata {
    fn default_risk() -> RiskLevel {
        RiskLevel::Safe
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Safe
    }
}

// ---------------------------------------------------------------------------
// JobPayload / SignedJob
// ---------------------------------------------------------------------------

/// The authoritative description of one unit of work.
///
/// This is what gets canonically serialized and signed; any field change
/// after signing invalidates the signature.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobPayload {
    /// Opaque unique job identifier. Doubles as the idempotency key: an
    /// agent rejects a second admission under the same id.
    pub job_id: String,

    /// The natural-language prompt that produced this command. Audit-only.
    pub prompt: String,

    /// The exact shell string to execute.
    pub command: String,

    /// Candidate risk/destructiveness metadata for the check chain.
    #[serde(default)]
    pub candidate_metadata: CandidateMetadata,

    /// Open key→value bag contributed by plugins, carried opaquely.
    #[serde(default)]
    pub plugin_metadata: BTreeMap<String, serde_json::Value>,

    /// Coarse permission labels (e.g. `git:write`) enforced by the chain.
    #[serde(default)]
    pub required_scopes: BTreeSet<String>,

    /// Optional opaque pre-run backup descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_metadata: Option<String>,

    /// Absolute Unix seconds after which the job is no longer valid.
    pub ttl: i64,

    /// Unix seconds at which the controller issued the job.
    pub timestamp: i64,

    /// Identifier of the originating controller, matched against the
    /// agent's allowlist at admission.
    pub controller_id: String,
}

/// A [`JobPayload`] plus its HMAC signature and algorithm tag.
///
/// Invariant: the payload bytes used to verify must be byte-identical to
/// those used to sign; both sides use [`canonical_json`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SignedJob {
    /// The signed payload.
    pub payload: JobPayload,

    /// Signature algorithm tag (currently always `hmac-sha256`).
    pub algorithm: String,

    /// Hex-encoded MAC over the canonical payload bytes.
    pub signature: String,
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

/// Agent-local lifecycle state of an admitted job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted and queued; also the parked state during an approval wait.
    Pending,
    /// Executing in a sandbox.
    Running,
    /// Sandbox finished (any exit code, including timeout's 124).
    Completed,
    /// Infrastructure error, cancellation, or approval rejection.
    Failed,
    /// Denied by the check chain; no sandbox was started.
    Rejected,
}

impl JobStatus {
    /// Returns `true` if this status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Failed, Self::Rejected],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed | Self::Rejected => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

// ---------------------------------------------------------------------------
// Log frames
// ---------------------------------------------------------------------------

/// Which output stream a [`LogFrame`] carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A single unit of log output on a job's streaming channel.
///
/// Exactly one frame per job has `final = true`; it is the last frame on the
/// channel, after which the channel closes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LogFrame {
    /// Job this frame belongs to.
    pub job_id: String,
    /// When the frame was produced.
    pub timestamp: DateTime<Utc>,
    /// Stream discriminator.
    pub stream: StreamKind,
    /// Output bytes (UTF-8, lossily converted when needed).
    pub data: String,
    /// Marks the last frame of the job.
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl LogFrame {
    /// An output frame for the given stream.
    #[must_use]
    pub fn output(job_id: impl Into<String>, stream: StreamKind, data: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            timestamp: Utc::now(),
            stream,
            data: data.into(),
            is_final: false,
        }
    }

    /// The terminating frame for a job.
    #[must_use]
    pub fn terminal(job_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            timestamp: Utc::now(),
            stream: StreamKind::Stdout,
            data: data.into(),
            is_final: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Job result
// ---------------------------------------------------------------------------

/// The outcome of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobResult {
    /// Job identifier.
    pub job_id: String,
    /// Terminal status.
    pub status: JobStatus,
    /// Short sandbox identifier (first 12 hex chars of the container id),
    /// empty when no sandbox was started.
    pub sandbox_id: String,
    /// Process exit code; [`EXIT_TIMEOUT`] for timeouts, [`EXIT_INFRA`] for
    /// infrastructure failures.
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// When execution started.
    pub start_time: DateTime<Utc>,
    /// When execution finished.
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Error description for failures and timeouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque pre-run snapshot descriptor, when one was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

// ---------------------------------------------------------------------------
// Sandbox options
// ---------------------------------------------------------------------------

/// Default container image.
pub const DEFAULT_IMAGE: &str = "alpine:latest";
/// Default CPU limit in cores.
pub const DEFAULT_CPU_LIMIT: f64 = 0.5;
/// Default memory limit in bytes (256 MiB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 256 * 1024 * 1024;
/// Default PID ceiling.
pub const DEFAULT_PIDS_LIMIT: i64 = 64;
/// Default execution timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Default working directory inside the sandbox.
pub const DEFAULT_WORKING_DIR: &str = "/workspace";

/// A bind mount into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MountSpec {
    /// Host path.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl MountSpec {
    /// Render as a Docker bind string (`source:target[:ro]`).
    #[must_use]
    pub fn to_bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Resource and isolation settings for one sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SandboxOptions {
    /// Container image reference.
    pub image: String,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Bind mounts.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Whether the container gets the default bridge network.
    #[serde(default)]
    pub network_access: bool,
    /// CPU limit in cores.
    pub cpu_limit: f64,
    /// Memory limit in bytes.
    pub memory_limit: u64,
    /// PID ceiling.
    pub pids_limit: i64,
    /// Wall-clock execution timeout.
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub timeout: Duration,
    /// Mount the root filesystem read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            working_dir: DEFAULT_WORKING_DIR.to_string(),
            mounts: vec![],
            network_access: false,
            cpu_limit: DEFAULT_CPU_LIMIT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            pids_limit: DEFAULT_PIDS_LIMIT,
            timeout: DEFAULT_TIMEOUT,
            read_only: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// Lifecycle state of an approval request. Transitions away from `Pending`
/// are one-way and terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved by a reviewer.
    Approved,
    /// Rejected by a reviewer.
    Rejected,
}

impl ApprovalStatus {
    /// Stable string form used in the store.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Parse the stable string form back into a status.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One approval request, gating a high-risk or destructive execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Approval {
    /// Store-assigned row id (0 before insertion).
    pub id: i64,
    /// The job/run this approval gates.
    pub run_id: String,
    /// Originating prompt, for reviewer context.
    pub prompt: String,
    /// The command awaiting approval.
    pub command: String,
    /// Candidate risk level.
    pub risk_level: RiskLevel,
    /// Scopes the job requested.
    #[serde(default)]
    pub required_scopes: BTreeSet<String>,
    /// Plugin metadata carried for reviewer context.
    #[serde(default)]
    pub plugin_metadata: BTreeMap<String, serde_json::Value>,
    /// Who asked for the execution.
    pub requested_by: String,
    /// When the request was filed.
    pub requested_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: ApprovalStatus,
    /// Reviewer who approved, if approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// When the approval was granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// Reviewer who rejected, if rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    /// When the rejection happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    /// Reviewer-supplied rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// The typed confirmation string the reviewer must echo.
    pub confirmation: String,
    /// Free-text note attached on approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_note: Option<String>,
}

// ---------------------------------------------------------------------------
// Audit rows
// ---------------------------------------------------------------------------

/// One append-only audit row describing an execution attempt.
///
/// `selected_command`, `stdout`, and `stderr` are stored post-redaction;
/// the store redacts on write and callers must not pre-redact.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunRecord {
    /// Store-assigned row id (0 before insertion).
    pub id: i64,
    /// When the attempt happened.
    pub timestamp: DateTime<Utc>,
    /// The requesting principal (controller id or user name).
    pub user: String,
    /// Originating prompt.
    pub prompt: String,
    /// The command that was selected for execution.
    pub selected_command: String,
    /// Short sandbox id, empty when no sandbox was started.
    pub sandbox_id: String,
    /// Exit code, when executed.
    pub exit_code: i64,
    /// Captured stdout (redacted on write).
    pub stdout: String,
    /// Captured stderr (redacted on write).
    pub stderr: String,
    /// Candidate risk level.
    pub risk_level: RiskLevel,
    /// Opaque snapshot descriptor, when one was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    /// Whether a sandbox actually ran (false for denials and auth failures).
    pub executed: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Row insertion time (assigned by the store).
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors + canonical serialization
// ---------------------------------------------------------------------------

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for signing and hashing.
///
/// Not a full JCS implementation, but stable for our types:
/// - keys are sorted (serde_json's Map is a BTreeMap by default)
/// - integers serialize without decimal points
/// - no insignificant whitespace
///
/// Both controller and agent must use this exact encoder; any divergence is
/// a signature failure.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for constructing [`JobPayload`]s ergonomically.
///
/// # Examples
///
/// ```
/// use cordon_core::{JobPayloadBuilder, RiskLevel};
///
/// let payload = JobPayloadBuilder::new("echo hello")
///     .prompt("print a greeting")
///     .controller_id("ctl-1")
///     .risk_level(RiskLevel::Safe)
///     .build();
///
/// assert_eq!(payload.command, "echo hello");
/// assert!(payload.ttl > payload.timestamp);
/// ```
#[derive(Debug)]
pub struct JobPayloadBuilder {
    job_id: Option<String>,
    prompt: String,
    command: String,
    candidate_metadata: CandidateMetadata,
    plugin_metadata: BTreeMap<String, serde_json::Value>,
    required_scopes: BTreeSet<String>,
    snapshot_metadata: Option<String>,
    ttl: Option<i64>,
    timestamp: Option<i64>,
    controller_id: String,
}

/// Default validity window applied when the builder is not given a TTL.
const DEFAULT_TTL_SECS: i64 = 600;

impl JobPayloadBuilder {
    /// Create a new builder for the given command string.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            job_id: None,
            prompt: String::new(),
            command: command.into(),
            candidate_metadata: CandidateMetadata::default(),
            plugin_metadata: BTreeMap::new(),
            required_scopes: BTreeSet::new(),
            snapshot_metadata: None,
            ttl: None,
            timestamp: None,
            controller_id: "controller".into(),
        }
    }

    /// Set an explicit job id (defaults to a fresh UUID).
    #[must_use]
    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Set the originating prompt.
    #[must_use]
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Set the originating controller id.
    #[must_use]
    pub fn controller_id(mut self, id: impl Into<String>) -> Self {
        self.controller_id = id.into();
        self
    }

    /// Set the candidate risk level.
    #[must_use]
    pub fn risk_level(mut self, level: RiskLevel) -> Self {
        self.candidate_metadata.risk_level = level;
        self
    }

    /// Mark the candidate as destructive.
    #[must_use]
    pub fn destructive(mut self, destructive: bool) -> Self {
        self.candidate_metadata.destructive = destructive;
        self
    }

    /// Replace the full candidate metadata.
    #[must_use]
    pub fn candidate_metadata(mut self, meta: CandidateMetadata) -> Self {
        self.candidate_metadata = meta;
        self
    }

    /// Add a required scope.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scopes.insert(scope.into());
        self
    }

    /// Add a plugin metadata entry.
    #[must_use]
    pub fn plugin_metadata(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.plugin_metadata.insert(key.into(), value);
        self
    }

    /// Attach an opaque snapshot descriptor.
    #[must_use]
    pub fn snapshot_metadata(mut self, descriptor: impl Into<String>) -> Self {
        self.snapshot_metadata = Some(descriptor.into());
        self
    }

    /// Set an explicit issuance timestamp (Unix seconds).
    #[must_use]
    pub fn timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Set an explicit absolute TTL (Unix seconds).
    #[must_use]
    pub fn ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Consume the builder and produce a [`JobPayload`].
    ///
    /// Unset timestamp defaults to now; unset TTL defaults to
    /// timestamp + 600 s.
    #[must_use]
    pub fn build(self) -> JobPayload {
        let timestamp = self.timestamp.unwrap_or_else(|| Utc::now().timestamp());
        JobPayload {
            job_id: self.job_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            prompt: self.prompt,
            command: self.command,
            candidate_metadata: self.candidate_metadata,
            plugin_metadata: self.plugin_metadata,
            required_scopes: self.required_scopes,
            snapshot_metadata: self.snapshot_metadata,
            ttl: self.ttl.unwrap_or(timestamp + DEFAULT_TTL_SECS),
            timestamp,
            controller_id: self.controller_id,
        }
    }
}
