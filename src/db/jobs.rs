use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::models::{BackupMode, JobState, JobStatus, VmOutcome};

/// A finished job as read back from the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub id: String,
    pub schedule_id: Option<String>,
    pub mode: BackupMode,
    pub dry_run: bool,
    pub state: JobState,
    pub vms: Vec<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub transferred_bytes: u64,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<VmOutcome>,
}

/// Aggregates over every recorded job except dry runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupStatistics {
    pub total_jobs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub transferred_bytes: u64,
    pub average_duration_secs: Option<f64>,
    pub last_success: Option<DateTime<Utc>>,
}

struct JobRow {
    id: String,
    schedule_id: Option<String>,
    mode: String,
    dry_run: bool,
    state: String,
    vms: String,
    error: Option<String>,
    warnings: String,
    transferred_bytes: i64,
    queued_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    results: Vec<String>,
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp in job history: {}", value))?
        .with_timezone(&Utc))
}

/// Append a finished job and its per-VM results.
pub async fn record(conn: &Connection, job: &JobStatus) -> Result<()> {
    let vms = serde_json::to_string(&job.vms)?;
    let warnings = serde_json::to_string(&job.warnings)?;
    let results = job
        .results
        .iter()
        .map(|outcome| {
            let snapshot = match outcome {
                VmOutcome::Succeeded(backup) => backup.snapshot.clone(),
                VmOutcome::Failed(failure) => failure.snapshot.clone(),
            };
            let status = if outcome.is_success() {
                "succeeded"
            } else {
                "failed"
            };
            Ok((
                outcome.vm().to_string(),
                status,
                snapshot,
                outcome.transferred_bytes() as i64,
                serde_json::to_string(outcome)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let transferred: u64 = job.results.iter().map(VmOutcome::transferred_bytes).sum();
    let job_id = job.id.clone();
    let schedule_id = job.schedule_id.clone();
    let mode = job.mode.as_str();
    let dry_run = job.dry_run;
    let state = job.state.as_str();
    let error = job.error.clone();
    let queued_at = timestamp(&job.queued_at);
    let started_at = job.started_at.as_ref().map(timestamp);
    let finished_at = job.finished_at.as_ref().map(timestamp);

    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO jobs (id, schedule_id, mode, dry_run, state, vms, error, warnings,
                transferred_bytes, queued_at, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                error = excluded.error,
                warnings = excluded.warnings,
                transferred_bytes = excluded.transferred_bytes,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at",
            params![
                &job_id,
                &schedule_id,
                mode,
                dry_run,
                state,
                &vms,
                &error,
                &warnings,
                transferred as i64,
                &queued_at,
                &started_at,
                &finished_at
            ],
        )?;

        tx.execute("DELETE FROM job_vm_results WHERE job_id = ?1", params![&job_id])?;
        for (position, (vm, status, snapshot, bytes, detail)) in results.iter().enumerate() {
            tx.execute(
                "INSERT INTO job_vm_results (job_id, position, vm, status, snapshot, transferred_bytes, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![&job_id, position as i64, vm, status, snapshot, bytes, detail],
            )?;
        }

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .context("Failed to record job history")?;

    Ok(())
}

/// Finished jobs, most recent first.
pub async fn list(conn: &Connection, limit: u32, offset: u32) -> Result<Vec<JobHistoryEntry>> {
    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT id, schedule_id, mode, dry_run, state, vms, error, warnings,
                        transferred_bytes, queued_at, started_at, finished_at
                 FROM jobs
                 ORDER BY queued_at DESC, id DESC
                 LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt
                .query_map(params![limit, offset], |row| {
                    Ok(JobRow {
                        id: row.get(0)?,
                        schedule_id: row.get(1)?,
                        mode: row.get(2)?,
                        dry_run: row.get(3)?,
                        state: row.get(4)?,
                        vms: row.get(5)?,
                        error: row.get(6)?,
                        warnings: row.get(7)?,
                        transferred_bytes: row.get(8)?,
                        queued_at: row.get(9)?,
                        started_at: row.get(10)?,
                        finished_at: row.get(11)?,
                        results: Vec::new(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut detail = c.prepare(
                "SELECT detail FROM job_vm_results WHERE job_id = ?1 ORDER BY position",
            )?;
            for row in &mut rows {
                row.results = detail
                    .query_map(params![&row.id], |r| r.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
            }

            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .context("Failed to read job history")?;

    rows.into_iter().map(decode_row).collect()
}

fn decode_row(row: JobRow) -> Result<JobHistoryEntry> {
    Ok(JobHistoryEntry {
        mode: row.mode.parse()?,
        state: serde_json::from_value(serde_json::Value::String(row.state))?,
        vms: serde_json::from_str(&row.vms)?,
        warnings: serde_json::from_str(&row.warnings)?,
        transferred_bytes: row.transferred_bytes.max(0) as u64,
        queued_at: parse_timestamp(&row.queued_at)?,
        started_at: row.started_at.as_deref().map(parse_timestamp).transpose()?,
        finished_at: row.finished_at.as_deref().map(parse_timestamp).transpose()?,
        results: row
            .results
            .iter()
            .map(|detail| serde_json::from_str(detail))
            .collect::<Result<_, _>>()?,
        id: row.id,
        schedule_id: row.schedule_id,
        dry_run: row.dry_run,
        error: row.error,
    })
}

pub async fn stats(conn: &Connection) -> Result<BackupStatistics> {
    let (total, succeeded, failed, bytes, average, last) = conn
        .call(|c| {
            c.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(state = 'succeeded'), 0),
                        COALESCE(SUM(state = 'failed'), 0),
                        COALESCE(SUM(transferred_bytes), 0),
                        AVG((julianday(finished_at) - julianday(started_at)) * 86400.0),
                        MAX(CASE WHEN state = 'succeeded' THEN finished_at END)
                 FROM jobs
                 WHERE dry_run = 0",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
        })
        .await
        .context("Failed to compute job statistics")?;

    Ok(BackupStatistics {
        total_jobs: total.max(0) as u64,
        succeeded: succeeded.max(0) as u64,
        failed: failed.max(0) as u64,
        transferred_bytes: bytes.max(0) as u64,
        average_duration_secs: average,
        last_success: last.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{JobRequest, VmBackup, VmFailure};
    use chrono::{TimeDelta, TimeZone};

    fn finished(id: &str, minute: u32, state: JobState, results: Vec<VmOutcome>) -> JobStatus {
        let request = JobRequest {
            vms: results.iter().map(|r| r.vm().to_string()).collect(),
            mode: BackupMode::Incremental,
            dry_run: false,
            use_snapshots: true,
        };
        let queued = Utc.with_ymd_and_hms(2025, 7, 31, 2, minute, 0).unwrap();
        let mut job = JobStatus::queued(id.to_string(), Some("sched".to_string()), &request);
        job.queued_at = queued;
        job.started_at = Some(queued);
        job.finished_at = Some(queued + TimeDelta::seconds(90));
        job.state = state;
        job.results = results;
        job
    }

    fn ok(vm: &str, bytes: u64) -> VmOutcome {
        VmOutcome::Succeeded(VmBackup {
            vm: vm.to_string(),
            snapshot: Some("backup-20250731-020000".to_string()),
            snapshot_retained: false,
            transferred_bytes: bytes,
            paths: vec![format!("/backups/{}/latest/images/{}.qcow2", vm, vm)],
            warnings: vec![],
        })
    }

    fn failed(vm: &str) -> VmOutcome {
        VmOutcome::Failed(VmFailure {
            vm: vm.to_string(),
            snapshot: None,
            error: "snapshot failed".to_string(),
            failed_at: Utc.with_ymd_and_hms(2025, 7, 31, 2, 0, 1).unwrap(),
        })
    }

    #[tokio::test]
    async fn records_and_lists_newest_first() {
        let conn = crate::db::init_in_memory().await.unwrap();
        let first = finished("job-1", 0, JobState::Succeeded, vec![ok("web01", 100)]);
        let mut second = finished(
            "job-2",
            5,
            JobState::Failed,
            vec![failed("db01"), ok("web01", 50)],
        );
        second.warnings = vec!["post-backup hook /usr/local/bin/notify exited with 1".to_string()];
        record(&conn, &first).await.unwrap();
        record(&conn, &second).await.unwrap();

        let history = list(&conn, 10, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "job-2");
        assert_eq!(history[0].results, second.results);
        assert_eq!(history[0].transferred_bytes, 50);
        assert_eq!(history[0].warnings, second.warnings);
        assert!(history[1].warnings.is_empty());
        assert_eq!(history[1].finished_at, first.finished_at);

        let page = list(&conn, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "job-1");
    }

    #[tokio::test]
    async fn statistics_summarize_history() {
        let conn = crate::db::init_in_memory().await.unwrap();
        let first = finished("job-1", 0, JobState::Succeeded, vec![ok("web01", 100)]);
        let second = finished("job-2", 5, JobState::Failed, vec![failed("db01")]);
        record(&conn, &first).await.unwrap();
        record(&conn, &second).await.unwrap();

        let stats = stats(&conn).await.unwrap();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.transferred_bytes, 100);
        let average = stats.average_duration_secs.unwrap();
        assert!((average - 90.0).abs() < 0.5);
        assert_eq!(stats.last_success, first.finished_at);
    }

    #[tokio::test]
    async fn empty_history_has_zero_statistics() {
        let conn = crate::db::init_in_memory().await.unwrap();
        let stats = stats(&conn).await.unwrap();
        assert_eq!(stats, BackupStatistics::default());
    }
}
