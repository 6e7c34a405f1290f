//! Remote directory layout for backup generations.
//!
//! Per VM under the remote root:
//! - incremental: `latest/`, hard-linked against the previous `latest/`, which
//!   becomes `previous/`; older generations move to `archive/<generation>/`
//! - full: `full-<generation>/`
//! - snapshot: nothing is transferred
//!
//! Data is always written into `<target>.partial/` first. Generations are
//! rotated and the staging directory renamed into place only once every
//! transfer succeeded, so a failed run never becomes a link source.

use chrono::{DateTime, Utc};

use super::models::{BackupMode, job_tag};

/// Where one VM's data goes for one job, and what has to happen remotely
/// before and after the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPlan {
    pub vm: String,
    pub mode: BackupMode,
    /// Directory receiving this run's data while it is being transferred.
    pub staging_dir: String,
    /// Directory the staged data is published as.
    pub target_dir: String,
    /// Newest complete generation to hard-link unchanged files against.
    pub link_dest: Option<String>,
    /// Generation moves applied at publish time, in order, each only if its
    /// source exists.
    pub rotations: Vec<Rotation>,
    /// Archive directory pruned down to `keep_archives` entries after publishing.
    pub prune: Option<Prune>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prune {
    pub dir: String,
    pub keep: usize,
}

impl DestinationPlan {
    pub fn transfers_data(&self) -> bool {
        self.mode != BackupMode::Snapshot
    }

    pub fn disk_dir(&self) -> String {
        format!("{}/images", self.staging_dir)
    }

    pub fn config_dir(&self) -> String {
        format!("{}/config", self.staging_dir)
    }

    /// Where a path written under the staging directory ends up once published.
    pub fn published_path(&self, staged: &str) -> String {
        match staged.strip_prefix(&self.staging_dir) {
            Some(rest) => format!("{}{}", self.target_dir, rest),
            None => staged.to_string(),
        }
    }
}

pub fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Name of the generation job `job_id` produces. Sorts by start time.
pub fn generation_name(started_at: DateTime<Utc>, job_id: &str) -> String {
    format!("{}_{}", stamp(started_at), job_tag(job_id))
}

pub fn plan_destination(
    remote_root: &str,
    vm: &str,
    mode: BackupMode,
    started_at: DateTime<Utc>,
    job_id: &str,
    keep_archives: usize,
) -> DestinationPlan {
    let vm_root = format!("{}/{}", remote_root.trim_end_matches('/'), vm);
    let generation = generation_name(started_at, job_id);

    let plan = |target_dir: String,
                link_dest: Option<String>,
                rotations: Vec<Rotation>,
                prune: Option<Prune>| DestinationPlan {
        vm: vm.to_string(),
        mode,
        staging_dir: format!("{}.partial", target_dir),
        target_dir,
        link_dest,
        rotations,
        prune,
    };

    match mode {
        BackupMode::Incremental => {
            let latest = format!("{}/latest", vm_root);
            let previous = format!("{}/previous", vm_root);
            let archive = format!("{}/archive", vm_root);
            plan(
                latest.clone(),
                Some(latest.clone()),
                vec![
                    Rotation {
                        from: previous.clone(),
                        to: format!("{}/{}", archive, generation),
                    },
                    Rotation {
                        from: latest,
                        to: previous,
                    },
                ],
                Some(Prune {
                    dir: archive,
                    keep: keep_archives,
                }),
            )
        }
        BackupMode::Full => plan(
            format!("{}/full-{}", vm_root, generation),
            None,
            Vec::new(),
            None,
        ),
        BackupMode::Snapshot => plan(
            format!("{}/snapshot-{}", vm_root, generation),
            None,
            Vec::new(),
            None,
        ),
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shell script that clears leftovers of an earlier failed run and creates
/// the staging directories. Runs on the backup host before any transfer.
pub fn preparation_script(plan: &DestinationPlan) -> String {
    [
        "set -e".to_string(),
        format!("rm -rf {}", shell_quote(&plan.staging_dir)),
        format!(
            "mkdir -p {} {}",
            shell_quote(&plan.disk_dir()),
            shell_quote(&plan.config_dir())
        ),
    ]
    .join("\n")
}

/// Shell script that rotates generations, publishes the staging directory as
/// the target and prunes old archives. Runs after every transfer succeeded.
pub fn finalize_script(plan: &DestinationPlan) -> String {
    let mut lines = vec!["set -e".to_string()];

    for rotation in &plan.rotations {
        let parent = rotation
            .to
            .rsplit_once('/')
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_else(|| ".".to_string());
        lines.push(format!(
            "if [ -d {from} ]; then mkdir -p {parent} && mv {from} {to}; fi",
            from = shell_quote(&rotation.from),
            parent = shell_quote(&parent),
            to = shell_quote(&rotation.to),
        ));
    }

    lines.push(format!(
        "mv {} {}",
        shell_quote(&plan.staging_dir),
        shell_quote(&plan.target_dir)
    ));

    if let Some(prune) = &plan.prune {
        lines.push(format!(
            "if [ -d {dir} ]; then ls -1d {dir}/*/ 2>/dev/null | sort | head -n -{keep} | xargs -r rm -rf; fi",
            dir = shell_quote(&prune.dir),
            keep = prune.keep,
        ));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = "0198a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b";

    fn started() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-07-31T02:00:05Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn incremental_stages_then_rotates_generations() {
        let plan = plan_destination("/srv/backup/", "web", BackupMode::Incremental, started(), JOB, 30);
        assert_eq!(plan.staging_dir, "/srv/backup/web/latest.partial");
        assert_eq!(plan.target_dir, "/srv/backup/web/latest");
        assert_eq!(plan.link_dest.as_deref(), Some("/srv/backup/web/latest"));
        assert_eq!(
            plan.rotations,
            vec![
                Rotation {
                    from: "/srv/backup/web/previous".into(),
                    to: "/srv/backup/web/archive/2025-07-31_02-00-05_2e3f4a5b".into(),
                },
                Rotation {
                    from: "/srv/backup/web/latest".into(),
                    to: "/srv/backup/web/previous".into(),
                },
            ]
        );
        assert_eq!(plan.prune.as_ref().unwrap().keep, 30);
        assert_eq!(plan.disk_dir(), "/srv/backup/web/latest.partial/images");
    }

    #[test]
    fn full_is_timestamped_and_independent() {
        let plan = plan_destination("/srv/backup", "db", BackupMode::Full, started(), JOB, 30);
        assert_eq!(plan.target_dir, "/srv/backup/db/full-2025-07-31_02-00-05_2e3f4a5b");
        assert!(plan.link_dest.is_none());
        assert!(plan.rotations.is_empty());
        assert!(plan.transfers_data());
    }

    #[test]
    fn jobs_in_the_same_second_get_distinct_generations() {
        let first = plan_destination("/srv/backup", "db", BackupMode::Full, started(), JOB, 30);
        let second = plan_destination("/srv/backup", "db", BackupMode::Full, started(), "job-2", 30);
        assert_ne!(first.target_dir, second.target_dir);
        assert_ne!(first.staging_dir, second.staging_dir);
    }

    #[test]
    fn snapshot_mode_moves_no_data() {
        let plan = plan_destination("/srv/backup", "db", BackupMode::Snapshot, started(), JOB, 30);
        assert!(!plan.transfers_data());
    }

    #[test]
    fn staged_paths_map_to_published_paths() {
        let plan = plan_destination("/srv/backup", "web", BackupMode::Incremental, started(), JOB, 3);
        assert_eq!(
            plan.published_path("/srv/backup/web/latest.partial/images/web.qcow2"),
            "/srv/backup/web/latest/images/web.qcow2"
        );
        assert_eq!(plan.published_path("/elsewhere/x"), "/elsewhere/x");
    }

    #[test]
    fn preparation_only_touches_the_staging_directory() {
        let plan = plan_destination("/srv/it's", "vm", BackupMode::Incremental, started(), JOB, 3);
        let script = preparation_script(&plan);
        assert!(script.starts_with("set -e"));
        assert!(script.contains(r"rm -rf '/srv/it'\''s/vm/latest.partial'"));
        assert!(!script.contains("mv "));
        assert!(script.ends_with(r"'/srv/it'\''s/vm/latest.partial/config'"));
    }

    #[test]
    fn finalize_rotates_before_publishing_and_prunes_last() {
        let plan = plan_destination("/srv/backup", "vm", BackupMode::Incremental, started(), JOB, 3);
        let script = finalize_script(&plan);
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "set -e");
        assert!(lines[1].contains("mv '/srv/backup/vm/previous' '/srv/backup/vm/archive/"));
        assert!(lines[2].contains("mv '/srv/backup/vm/latest' '/srv/backup/vm/previous'"));
        assert_eq!(
            lines[3],
            "mv '/srv/backup/vm/latest.partial' '/srv/backup/vm/latest'"
        );
        assert!(lines[4].contains("head -n -3"));
    }
}
