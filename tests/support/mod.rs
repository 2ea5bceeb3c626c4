// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared harness for the end-to-end scenario tests: an in-process agent
//! with the scripted sandbox, plus signing and polling helpers.
#![allow(dead_code)]

use cordon_agent::worker::spawn_workers;
use cordon_agent::{AppState, build_app};
use cordon_approval::ApprovalStore;
use cordon_audit::AuditStore;
use cordon_codec::sign;
use cordon_config::{AgentConfig, PolicyConfig, parse_agent_config, parse_policy_config};
use cordon_core::{JobPayload, JobPayloadBuilder, SignedJob};
use cordon_policy::CheckChain;
use cordon_policy::builtin::register_builtins;
use cordon_policy::plugin::PluginRegistry;
use cordon_redact::SecretRedactor;
use cordon_sandbox::mock::MockSandbox;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const SECRET: &[u8] = b"e2e-shared-secret";
pub const CONTROLLER: &str = "ctl-e2e";

/// Agent config for the scenarios: known secret/controller, 1 s timeout.
pub fn agent_config(max_concurrent_jobs: usize) -> AgentConfig {
    let mut config = parse_agent_config(&format!(
        r"
port: 8443
hmac_secret: e2e-shared-secret
allowed_controllers:
  - {CONTROLLER}
max_concurrent_jobs: {max_concurrent_jobs}
"
    ))
    .unwrap();
    config.default_timeout_seconds = 1;
    config
}

/// Policy requiring approval for high-risk and destructive candidates.
pub fn approval_policy() -> PolicyConfig {
    parse_policy_config(
        r"
approval:
  require_approval_high_risk: true
  require_approval_destructive: true
",
    )
    .unwrap()
}

/// Build a full agent around the scripted sandbox and serve it on a
/// random loopback port. Returns the state, the bound address, and a
/// handle onto the mock for call assertions.
pub async fn start_agent(
    mock: MockSandbox,
    policy: PolicyConfig,
    max_concurrent_jobs: usize,
) -> (Arc<AppState>, SocketAddr, Arc<MockSandbox>) {
    let registry = PluginRegistry::new();
    register_builtins(&registry);
    let chain = CheckChain::new(&policy, Arc::new(registry)).unwrap();
    let audit = AuditStore::open_in_memory(SecretRedactor::new()).unwrap();
    let approvals = ApprovalStore::open_in_memory().unwrap();

    let mock = Arc::new(mock);
    let sandbox: Arc<dyn cordon_sandbox::Sandbox> = Arc::clone(&mock) as Arc<dyn cordon_sandbox::Sandbox>;
    let config = agent_config(max_concurrent_jobs);
    let (state, queue_rx) = AppState::new(config, chain, audit, approvals, sandbox);
    spawn_workers(Arc::clone(&state), queue_rx, max_concurrent_jobs);

    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr, mock)
}

/// A fresh, correctly-signed job for `command`.
pub fn signed_job(command: &str) -> SignedJob {
    sign(payload(command), SECRET).unwrap()
}

/// An unsigned payload pre-wired for the e2e controller.
pub fn payload(command: &str) -> JobPayload {
    JobPayloadBuilder::new(command)
        .prompt(format!("run: {command}"))
        .controller_id(CONTROLLER)
        .build()
}

/// Submit a signed job, returning the HTTP response.
pub async fn submit(addr: SocketAddr, job: &SignedJob) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/jobs"))
        .json(job)
        .send()
        .await
        .unwrap()
}

/// Poll until the job reaches a terminal status, returning the final body.
pub async fn wait_terminal(addr: SocketAddr, job_id: &str) -> serde_json::Value {
    let client = reqwest::Client::new();
    for _ in 0..400 {
        let body: serde_json::Value = client
            .get(format!("http://{addr}/api/v1/jobs/{job_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if let Some(status) = body["status"].as_str() {
            if ["completed", "failed", "rejected"].contains(&status) {
                return body;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

/// Current status string of a job.
pub async fn status_of(addr: SocketAddr, job_id: &str) -> String {
    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("http://{addr}/api/v1/jobs/{job_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["status"].as_str().unwrap_or_default().to_string()
}
