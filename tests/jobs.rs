mod common;

use std::time::Duration;

use common::{harness, harness_with, harness_with_engine, wait_for_job};
use tokio::time::timeout;
use vmbackd::core::error::Error;
use vmbackd::core::models::{BackupMode, BackupSummary, JobRequest, JobState, VmOutcome};
use vmbackd::core::transfer_engine::SimulatedEngine;

fn request(vms: &[&str], mode: BackupMode) -> JobRequest {
    JobRequest {
        vms: vms.iter().map(|vm| vm.to_string()).collect(),
        mode,
        dry_run: false,
        use_snapshots: true,
    }
}

#[tokio::test]
async fn failed_snapshot_fails_only_that_vm() {
    let h = harness().await;
    h.hypervisor.fail_snapshots_for("web01");

    let job_id = h
        .orchestrator
        .run_now(request(&["web01", "db01"], BackupMode::Incremental))
        .await
        .unwrap();
    let job = wait_for_job(&h.orchestrator, &job_id).await;

    assert_eq!(job.state, JobState::Failed);
    assert!(job.schedule_id.is_none());
    assert_eq!(job.results.len(), 2);

    match &job.results[0] {
        VmOutcome::Failed(failure) => {
            assert_eq!(failure.vm, "web01");
            assert!(failure.error.contains("snapshot"));
        }
        other => panic!("expected web01 to fail, got {:?}", other),
    }
    match &job.results[1] {
        VmOutcome::Succeeded(backup) => {
            assert_eq!(backup.vm, "db01");
            assert!(backup.transferred_bytes > 0);
        }
        other => panic!("expected db01 to succeed, got {:?}", other),
    }

    // Only db01 reached the backup host.
    assert!(h.engine.sent().iter().all(|req| req.vm == "db01"));
}

#[tokio::test]
async fn finished_jobs_land_in_history() {
    let h = harness().await;

    let ok = h
        .orchestrator
        .run_now(request(&["web01"], BackupMode::Full))
        .await
        .unwrap();
    wait_for_job(&h.orchestrator, &ok).await;

    let failed = h
        .orchestrator
        .run_now(request(&["ghost"], BackupMode::Full))
        .await
        .unwrap();
    wait_for_job(&h.orchestrator, &failed).await;

    // The history write follows the registry update; give it a moment.
    let history = timeout(Duration::from_secs(5), async {
        loop {
            let history = h.orchestrator.history(10, 0).await.unwrap();
            if history.len() == 2 {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("history was not written");

    assert_eq!(history[0].id, failed);
    assert_eq!(history[1].id, ok);

    let stats = h.orchestrator.statistics().await.unwrap();
    assert_eq!(stats.total_jobs, 2);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 1);
    assert!(stats.last_success.is_some());
}

#[tokio::test]
async fn run_now_rejects_empty_vm_set() {
    let h = harness().await;
    let result = h
        .orchestrator
        .run_now(request(&[], BackupMode::Incremental))
        .await;

    assert!(matches!(result, Err(Error::Config(_))));
    assert!(h.orchestrator.list_jobs().await.is_empty());
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = harness().await;
    assert!(matches!(
        h.orchestrator.get_job("missing").await,
        Err(Error::JobNotFound(_))
    ));
}

#[tokio::test]
async fn hung_snapshot_is_bounded_by_timeout() {
    let h = harness_with(|config| config.snapshot_timeout_secs = 1).await;
    h.hypervisor.hang_snapshots_for("web01");

    let job_id = h
        .orchestrator
        .run_now(request(&["web01"], BackupMode::Full))
        .await
        .unwrap();
    let job = wait_for_job(&h.orchestrator, &job_id).await;

    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let h = harness().await;
    let mut req = request(&["web01", "db01"], BackupMode::Incremental);
    req.dry_run = true;

    let job_id = h.orchestrator.run_now(req).await.unwrap();
    let job = wait_for_job(&h.orchestrator, &job_id).await;

    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.dry_run);
    assert!(h.engine.sent().is_empty());
    assert!(h.hypervisor.snapshots("web01").is_empty());
}

#[tokio::test]
async fn lists_vms_from_the_hypervisor() {
    let h = harness().await;
    let names: Vec<String> = h
        .orchestrator
        .list_vms()
        .await
        .unwrap()
        .into_iter()
        .map(|vm| vm.name)
        .collect();
    assert_eq!(names, vec!["db01".to_string(), "web01".to_string()]);
}

#[tokio::test]
async fn status_reports_schedules_and_jobs() {
    let h = harness().await;
    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.schedules, 0);
    assert_eq!(status.active_jobs, 0);
    assert!(status.simulation);
    assert!(status.next_run.is_none());
}

#[tokio::test]
async fn failed_transfer_cleans_up_its_snapshot() {
    let h = harness().await;
    h.engine.fail_vm("web01");

    let job_id = h
        .orchestrator
        .run_now(request(&["web01"], BackupMode::Incremental))
        .await
        .unwrap();
    let job = wait_for_job(&h.orchestrator, &job_id).await;

    assert_eq!(job.state, JobState::Failed);
    match &job.results[0] {
        VmOutcome::Failed(failure) => {
            assert!(failure.error.contains("simulated transfer failure"));
            assert!(failure.snapshot.is_some());
        }
        other => panic!("expected web01 to fail, got {:?}", other),
    }
    assert!(h.hypervisor.snapshots("web01").is_empty());
    assert_eq!(h.hypervisor.deleted().len(), 1);
}

#[tokio::test]
async fn overlapping_jobs_on_one_vm_run_one_after_the_other() {
    let engine = SimulatedEngine::with_delay(Duration::from_millis(100));
    let h = harness_with_engine(engine, |_| {}).await;

    let first = h
        .orchestrator
        .run_now(request(&["web01"], BackupMode::Incremental))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .run_now(request(&["web01"], BackupMode::Incremental))
        .await
        .unwrap();

    let first = wait_for_job(&h.orchestrator, &first).await;
    let second = wait_for_job(&h.orchestrator, &second).await;

    assert_eq!(first.state, JobState::Succeeded);
    assert_eq!(second.state, JobState::Succeeded);
    assert_eq!(h.engine.peak_concurrency("web01"), 1);
    assert_eq!(h.engine.finalized().len(), 2);
    assert!(h.hypervisor.snapshots("web01").is_empty());
}

#[tokio::test]
async fn every_backed_up_vm_gets_a_summary() {
    let h = harness().await;

    let job_id = h
        .orchestrator
        .run_now(request(&["web01", "db01"], BackupMode::Full))
        .await
        .unwrap();
    let job = wait_for_job(&h.orchestrator, &job_id).await;
    assert_eq!(job.state, JobState::Succeeded);

    let mut summaries: Vec<BackupSummary> = h
        .engine
        .uploads()
        .iter()
        .map(|upload| {
            assert!(upload.remote_path.ends_with("/backup_summary.json"));
            serde_json::from_slice(&upload.contents).unwrap()
        })
        .collect();
    summaries.sort_by(|a, b| a.vm.cmp(&b.vm));

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].vm, "db01");
    assert_eq!(summaries[1].vm, "web01");
    assert!(summaries.iter().all(|s| s.job_id == job_id));
    assert!(summaries.iter().all(|s| s.job_vms == vec!["web01", "db01"]));
}

#[tokio::test]
async fn failing_pre_backup_hook_is_reported_but_not_fatal() {
    let h = harness_with(|config| config.hooks.pre_backup = Some("false".into())).await;

    let job_id = h
        .orchestrator
        .run_now(request(&["web01"], BackupMode::Full))
        .await
        .unwrap();
    let job = wait_for_job(&h.orchestrator, &job_id).await;

    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.warnings.len(), 1);
    assert!(job.warnings[0].contains("pre-backup hook"));
    assert_eq!(h.engine.sent().len(), 2);
}
