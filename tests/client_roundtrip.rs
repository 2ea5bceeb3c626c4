// SPDX-License-Identifier: MIT OR Apache-2.0
//! Controller-client roundtrip against an in-process agent: sign, submit,
//! poll, and observe the no-retry-on-4xx contract.

mod support;

use cordon_client::{AgentClient, ClientError, RetryPolicy};
use cordon_config::PolicyConfig;
use cordon_core::JobStatus;
use cordon_sandbox::mock::{MockSandbox, Script};
use std::time::Duration;
use support::{SECRET, payload, start_agent};

fn client(addr: std::net::SocketAddr) -> AgentClient {
    AgentClient::new(format!("http://{addr}"), SECRET.to_vec()).with_retry(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    })
}

#[tokio::test]
async fn submit_and_poll_through_the_client() {
    let mock = MockSandbox::new();
    mock.script(Script::ok("echo client", "client says hi\n"));
    let (_state, addr, _mock) = start_agent(mock, PolicyConfig::default(), 2).await;

    let client = client(addr);
    let receipt = client.submit(payload("echo client")).await.unwrap();
    assert_eq!(receipt.status, JobStatus::Pending);

    let mut last = None;
    for _ in 0..200 {
        let view = client.job_status(&receipt.job_id).await.unwrap();
        if view.status.is_terminal() {
            last = Some(view);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let view = last.expect("job never finished");
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.result.unwrap().stdout, "client says hi\n");
}

#[tokio::test]
async fn duplicate_submission_is_not_retried() {
    let (_state, addr, _mock) =
        start_agent(MockSandbox::new(), PolicyConfig::default(), 2).await;

    let client = client(addr);
    let signed = cordon_client::sign_job(payload("echo twice"), SECRET).unwrap();
    client.submit_signed(&signed).await.unwrap();

    // The identical signed job hits the idempotency key; a 409 is terminal,
    // not retried.
    let err = client.submit_signed(&signed).await.unwrap_err();
    match err {
        ClientError::Rejected { status, .. } => assert_eq!(status, 409),
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_agent_exhausts_retries() {
    // Nothing listens on this port; transport errors burn the full budget.
    let client = AgentClient::new("http://127.0.0.1:1", SECRET.to_vec()).with_retry(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
    });
    let err = client.health().await.unwrap_err();
    assert!(matches!(err, ClientError::Exhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn client_health_check() {
    let (_state, addr, _mock) =
        start_agent(MockSandbox::new(), PolicyConfig::default(), 2).await;
    let health = client(addr).health().await.unwrap();
    assert_eq!(health["status"], "healthy");
}
