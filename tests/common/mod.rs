#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{sleep, timeout};

use vmbackd::adapters::SimulatedHypervisor;
use vmbackd::config::AppConfig;
use vmbackd::context::AppContext;
use vmbackd::core::cadence::ScheduleZone;
use vmbackd::core::models::JobStatus;
use vmbackd::core::transfer_engine::{SimulatedEngine, TransferEngineType};
use vmbackd::core::Orchestrator;
use vmbackd::db;
use vmbackd::store::ScheduleStore;

pub struct Harness {
    pub dir: TempDir,
    pub hypervisor: SimulatedHypervisor,
    pub engine: SimulatedEngine,
    pub orchestrator: Orchestrator,
}

pub fn test_config(dir: &TempDir) -> AppConfig {
    AppConfig {
        schedules_file: dir.path().join("schedules.json"),
        database_file: dir.path().join("history.db"),
        poll_interval_secs: 1,
        simulation: true,
        timezone: ScheduleZone::Utc,
        transfer_engine: TransferEngineType::Simulated,
        snapshot_timeout_secs: 5,
        ..AppConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    harness_with_engine(SimulatedEngine::default(), tweak).await
}

pub async fn harness_with_engine(
    engine: SimulatedEngine,
    tweak: impl FnOnce(&mut AppConfig),
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    tweak(&mut config);

    let hypervisor = SimulatedHypervisor::new();
    hypervisor.add_vm("web01", true);
    hypervisor.add_vm("db01", true);

    let store = ScheduleStore::open(&config.schedules_file)
        .await
        .expect("open store");
    let conn = db::init_in_memory().await.expect("history db");
    let ctx = AppContext::new(
        config,
        conn,
        store,
        Arc::new(hypervisor.clone()),
        Arc::new(engine.clone()),
    );

    Harness {
        dir,
        hypervisor,
        engine,
        orchestrator: Orchestrator::new(ctx),
    }
}

pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr")
}

/// Wait until the scheduler has at least one job in flight.
pub async fn wait_for_dispatch(orchestrator: &Orchestrator) {
    timeout(Duration::from_secs(5), async {
        while orchestrator.scheduler().in_flight() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("nothing was dispatched in time")
}

/// Wait until the registry reports `id` as finished.
pub async fn wait_for_job(orchestrator: &Orchestrator, id: &str) -> JobStatus {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(job) = orchestrator.get_job(id).await {
                if job.state.is_finished() {
                    return job;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

/// Wait until no scheduled job is still recording its outcome.
pub async fn wait_until_idle(orchestrator: &Orchestrator) {
    timeout(Duration::from_secs(5), async {
        while orchestrator.scheduler().in_flight() > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scheduled jobs did not finish in time")
}
