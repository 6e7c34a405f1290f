mod common;

use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use common::{free_addr, harness, wait_for_job};
use vmbackd::core::models::{JobState, ScheduleDefinition};
use vmbackd::core::orchestrator::DaemonStatus;
use vmbackd::rpc::methods::NOT_FOUND;
use vmbackd::rpc::{ClientError, RpcClient, RpcServer};

/// Serve `orchestrator` on a fresh port and wait until it accepts calls.
async fn serve(orchestrator: vmbackd::core::Orchestrator) -> (RpcClient, CancellationToken) {
    let addr = free_addr();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        let server = RpcServer::new(orchestrator, addr);
        server.serve(token).await.unwrap();
    });

    let client = RpcClient::new(addr);
    timeout(Duration::from_secs(5), async {
        loop {
            if client.call_no_params::<DaemonStatus>("daemon.status").await.is_ok() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("RPC server did not come up");

    (client, shutdown)
}

#[tokio::test]
async fn schedule_lifecycle_over_rpc() {
    let h = harness().await;
    let (client, shutdown) = serve(h.orchestrator.clone()).await;

    let added: ScheduleDefinition = client
        .call(
            "schedules.add",
            Some(json!({
                "name": "nightly web",
                "vms": ["web01"],
                "cadence": { "kind": "daily", "time": "02:00" },
                "mode": "incremental",
                "enabled": true,
            })),
        )
        .await
        .unwrap();
    assert!(added.next_run.is_some());

    let listed: Vec<ScheduleDefinition> = client.call_no_params("schedules.list").await.unwrap();
    assert_eq!(listed, vec![added.clone()]);

    let disabled: ScheduleDefinition = client
        .call("schedules.disable", Some(json!({ "id": added.id })))
        .await
        .unwrap();
    assert!(!disabled.enabled);

    let removed: ScheduleDefinition = client
        .call("schedules.remove", Some(json!({ "id": added.id })))
        .await
        .unwrap();
    assert_eq!(removed.id, added.id);

    let missing = client
        .call::<ScheduleDefinition>("schedules.get", Some(json!({ "id": added.id })))
        .await;
    match missing {
        Err(ClientError::Rpc(e)) => {
            assert_eq!(e.code, NOT_FOUND);
            assert_eq!(e.kind(), Some("schedule_not_found"));
        }
        other => panic!("expected not found, got {:?}", other),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn run_job_over_rpc() {
    let h = harness().await;
    let (client, shutdown) = serve(h.orchestrator.clone()).await;

    let started: Value = client
        .call(
            "jobs.run",
            Some(json!({ "vms": ["db01"], "mode": "full" })),
        )
        .await
        .unwrap();
    let job_id = started["job_id"].as_str().unwrap().to_string();

    let job = wait_for_job(&h.orchestrator, &job_id).await;
    assert_eq!(job.state, JobState::Succeeded);

    let fetched: vmbackd::core::models::JobStatus = client
        .call("jobs.get", Some(json!({ "id": job_id })))
        .await
        .unwrap();
    assert_eq!(fetched.id, job_id);

    shutdown.cancel();
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let h = harness().await;
    let (client, shutdown) = serve(h.orchestrator.clone()).await;

    match client.call_no_params::<Value>("schedules.pause").await {
        Err(ClientError::Rpc(e)) => assert_eq!(e.code, -32601),
        other => panic!("expected method not found, got {:?}", other),
    }

    shutdown.cancel();
}
