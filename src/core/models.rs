use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::ConfigurationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// Only changed data, unchanged content hard-linked to the previous generation
    Incremental,
    /// Complete, timestamped, independent copy
    Full,
    /// Hypervisor snapshot only, nothing transferred
    Snapshot,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "incremental" => Ok(Self::Incremental),
            "full" => Ok(Self::Full),
            "snapshot" => Ok(Self::Snapshot),
            _ => Err(ConfigurationError::UnknownMode(s.to_string())),
        }
    }
}

/// Wall-clock time of day with minute precision, persisted as "HH:MM".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::InvalidTimeOfDay(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.parse().map_err(|_| invalid())?;
        let minute: u32 = minute.parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0.hour(), self.0.minute())
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Weekdays are persisted as lowercase English names ("sunday").
mod weekday_name {
    use chrono::Weekday;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(day: &Weekday, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(super::weekday_str(*day))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Weekday, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_weekday(&raw).map_err(serde::de::Error::custom)
    }
}

fn weekday_str(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn parse_weekday(raw: &str) -> Result<Weekday, ConfigurationError> {
    raw.trim()
        .parse::<Weekday>()
        .map_err(|_| ConfigurationError::InvalidWeekday(raw.to_string()))
}

/// Recurrence rule of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Cadence {
    Daily {
        time: TimeOfDay,
    },
    Weekly {
        #[serde(with = "weekday_name")]
        weekday: Weekday,
        time: TimeOfDay,
    },
    Monthly {
        /// Days past the end of a shorter month clamp to its last day.
        day: u8,
        time: TimeOfDay,
    },
}

impl Cadence {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Daily { .. } => "daily",
            Self::Weekly { .. } => "weekly",
            Self::Monthly { .. } => "monthly",
        }
    }

    pub fn time(&self) -> TimeOfDay {
        match self {
            Self::Daily { time } | Self::Weekly { time, .. } | Self::Monthly { time, .. } => *time,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Self::Monthly { day, .. } = self {
            if !(1..=31).contains(day) {
                return Err(ConfigurationError::InvalidDayOfMonth(i64::from(*day)));
            }
        }
        Ok(())
    }

    /// Parse the textual form used on the command line:
    /// daily `02:00`, weekly `sunday:03:00`, monthly `15:04:00` (day:hour:minute).
    pub fn parse(kind: &str, text: &str) -> Result<Self, ConfigurationError> {
        let text = text.trim();
        let cadence = match kind.trim().to_lowercase().as_str() {
            "daily" => Self::Daily {
                time: text.parse()?,
            },
            "weekly" => {
                let (day, time) = text.split_once(':').ok_or_else(|| {
                    ConfigurationError::MalformedCadence {
                        kind: "weekly",
                        value: text.to_string(),
                    }
                })?;
                Self::Weekly {
                    weekday: parse_weekday(day)?,
                    time: time.parse()?,
                }
            }
            "monthly" => {
                let (day, time) = text.split_once(':').ok_or_else(|| {
                    ConfigurationError::MalformedCadence {
                        kind: "monthly",
                        value: text.to_string(),
                    }
                })?;
                let day: i64 = day
                    .trim()
                    .parse()
                    .map_err(|_| ConfigurationError::MalformedCadence {
                        kind: "monthly",
                        value: text.to_string(),
                    })?;
                if !(1..=31).contains(&day) {
                    return Err(ConfigurationError::InvalidDayOfMonth(day));
                }
                Self::Monthly {
                    day: day as u8,
                    time: time.parse()?,
                }
            }
            other => return Err(ConfigurationError::UnknownCadence(other.to_string())),
        };
        cadence.validate()?;
        Ok(cadence)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily { time } => write!(f, "{}", time),
            Self::Weekly { weekday, time } => write!(f, "{}:{}", weekday_str(*weekday), time),
            Self::Monthly { day, time } => write!(f, "{}:{}", day, time),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    #[default]
    None,
    Success,
    Failure,
}

/// A persisted recurring backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleDefinition {
    pub id: String,
    pub name: String,
    pub vms: Vec<String>,
    pub cadence: Cadence,
    pub mode: BackupMode,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: RunOutcome,
    pub last_error: Option<String>,
    pub last_job_id: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
}

impl ScheduleDefinition {
    /// Enabled and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|next| next <= now)
    }

    /// Checks the invariants a definition must satisfy before it is persisted.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_name(&self.name)?;
        validate_vms(&self.vms)?;
        self.cadence.validate()
    }
}

/// Request to create a schedule. The id and derived fields are assigned on add.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub vms: Vec<String>,
    pub cadence: Cadence,
    pub mode: BackupMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewSchedule {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_name(&self.name)?;
        validate_vms(&self.vms)?;
        self.cadence.validate()
    }
}

/// Partial edit of an existing schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vms: Option<Vec<String>>,
    #[serde(default)]
    pub cadence: Option<Cadence>,
    #[serde(default)]
    pub mode: Option<BackupMode>,
}

pub(crate) fn validate_name(name: &str) -> Result<(), ConfigurationError> {
    if name.trim().is_empty() {
        return Err(ConfigurationError::EmptyName);
    }
    Ok(())
}

pub(crate) fn validate_vms(vms: &[String]) -> Result<(), ConfigurationError> {
    if vms.is_empty() {
        return Err(ConfigurationError::EmptyVmSet);
    }
    if vms.iter().any(|vm| vm.trim().is_empty()) {
        return Err(ConfigurationError::BlankVmName);
    }
    Ok(())
}

/// Removes duplicate VM names while keeping first-seen order.
pub(crate) fn dedup_vms(vms: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    vms.into_iter()
        .map(|vm| vm.trim().to_string())
        .filter(|vm| seen.insert(vm.clone()))
        .collect()
}

/// Short per-job token used in names created on the hypervisor and the
/// backup host, so two jobs started in the same second never collide.
pub fn job_tag(job_id: &str) -> String {
    let compact: Vec<char> = job_id.chars().filter(char::is_ascii_alphanumeric).collect();
    let start = compact.len().saturating_sub(8);
    compact[start..].iter().collect::<String>().to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// What a single job should back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub vms: Vec<String>,
    pub mode: BackupMode,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_enabled")]
    pub use_snapshots: bool,
}

impl JobRequest {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_vms(&self.vms)
    }
}

/// Successful backup of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmBackup {
    pub vm: String,
    /// Snapshot taken for this backup, if any.
    pub snapshot: Option<String>,
    /// Whether the snapshot is still present on the hypervisor.
    pub snapshot_retained: bool,
    pub transferred_bytes: u64,
    pub paths: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmFailure {
    pub vm: String,
    pub snapshot: Option<String>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of backing up a single VM within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VmOutcome {
    Succeeded(VmBackup),
    Failed(VmFailure),
}

impl VmOutcome {
    pub fn vm(&self) -> &str {
        match self {
            Self::Succeeded(backup) => &backup.vm,
            Self::Failed(failure) => &failure.vm,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn transferred_bytes(&self) -> u64 {
        match self {
            Self::Succeeded(backup) => backup.transferred_bytes,
            Self::Failed(_) => 0,
        }
    }
}

/// Manifest written next to each VM's published backup on the backup host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub job_id: String,
    pub vm: String,
    pub mode: BackupMode,
    /// Every VM the job was asked to back up.
    pub job_vms: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot: Option<String>,
    pub transferred_bytes: u64,
    pub files: Vec<String>,
    pub warnings: Vec<String>,
}

impl BackupSummary {
    pub const FILE_NAME: &'static str = "backup_summary.json";
}

/// Aggregate of per-VM outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub state: JobState,
    pub error: Option<String>,
    pub outcomes: Vec<VmOutcome>,
    /// Job-level problems that did not fail the job, such as a failing hook.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl JobResult {
    /// Reduce per-VM outcomes into the job's overall state: succeeded only if
    /// every VM succeeded.
    pub fn from_outcomes(outcomes: Vec<VmOutcome>) -> Self {
        let failures: Vec<String> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                VmOutcome::Failed(failure) => Some(format!("{}: {}", failure.vm, failure.error)),
                VmOutcome::Succeeded(_) => None,
            })
            .collect();

        if outcomes.is_empty() {
            return Self {
                state: JobState::Failed,
                error: Some("no VMs were backed up".to_string()),
                outcomes,
                warnings: Vec::new(),
            };
        }

        if failures.is_empty() {
            Self {
                state: JobState::Succeeded,
                error: None,
                outcomes,
                warnings: Vec::new(),
            }
        } else {
            Self {
                state: JobState::Failed,
                error: Some(format!(
                    "{} of {} VMs failed: {}",
                    failures.len(),
                    outcomes.len(),
                    failures.join("; ")
                )),
                outcomes,
                warnings: Vec::new(),
            }
        }
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.outcomes.iter().map(VmOutcome::transferred_bytes).sum()
    }
}

/// Lifecycle record of a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub schedule_id: Option<String>,
    pub vms: Vec<String>,
    pub mode: BackupMode,
    pub dry_run: bool,
    pub state: JobState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub results: Vec<VmOutcome>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl JobStatus {
    pub fn queued(id: String, schedule_id: Option<String>, request: &JobRequest) -> Self {
        Self {
            id,
            schedule_id,
            vms: request.vms.clone(),
            mode: request.mode,
            dry_run: request.dry_run,
            state: JobState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            results: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        let start = self.started_at?;
        let end = self.finished_at?;
        Some((end - start).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup(vm: &str) -> VmOutcome {
        VmOutcome::Succeeded(VmBackup {
            vm: vm.to_string(),
            snapshot: None,
            snapshot_retained: false,
            transferred_bytes: 10,
            paths: vec![],
            warnings: vec![],
        })
    }

    fn failure(vm: &str) -> VmOutcome {
        VmOutcome::Failed(VmFailure {
            vm: vm.to_string(),
            snapshot: None,
            error: "boom".to_string(),
            failed_at: Utc::now(),
        })
    }

    #[test]
    fn parse_cadence_text_forms() {
        assert_eq!(
            Cadence::parse("daily", "02:00").unwrap(),
            Cadence::Daily {
                time: TimeOfDay::new(2, 0).unwrap()
            }
        );
        assert_eq!(
            Cadence::parse("weekly", "sunday:03:00").unwrap(),
            Cadence::Weekly {
                weekday: Weekday::Sun,
                time: TimeOfDay::new(3, 0).unwrap()
            }
        );
        assert_eq!(
            Cadence::parse("monthly", "31:04:00").unwrap(),
            Cadence::Monthly {
                day: 31,
                time: TimeOfDay::new(4, 0).unwrap()
            }
        );
    }

    #[test]
    fn cadence_display_matches_parse_input() {
        for (kind, text) in [("daily", "02:00"), ("weekly", "sunday:03:00"), ("monthly", "15:04:30")] {
            assert_eq!(Cadence::parse(kind, text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn rejects_out_of_range_month_days() {
        assert_eq!(
            Cadence::parse("monthly", "0:04:00"),
            Err(ConfigurationError::InvalidDayOfMonth(0))
        );
        assert_eq!(
            Cadence::parse("monthly", "-3:04:00"),
            Err(ConfigurationError::InvalidDayOfMonth(-3))
        );
        assert_eq!(
            Cadence::parse("monthly", "32:04:00"),
            Err(ConfigurationError::InvalidDayOfMonth(32))
        );
    }

    #[test]
    fn rejects_bad_times_and_kinds() {
        assert!(Cadence::parse("daily", "24:00").is_err());
        assert!(Cadence::parse("daily", "12:60").is_err());
        assert!(Cadence::parse("daily", "noon").is_err());
        assert!(Cadence::parse("weekly", "funday:03:00").is_err());
        assert!(matches!(
            Cadence::parse("hourly", "10"),
            Err(ConfigurationError::UnknownCadence(_))
        ));
    }

    #[test]
    fn cadence_json_shape() {
        let cadence = Cadence::parse("weekly", "friday:22:15").unwrap();
        let json = serde_json::to_value(&cadence).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "weekly", "weekday": "friday", "time": "22:15"})
        );
        let back: Cadence = serde_json::from_value(json).unwrap();
        assert_eq!(back, cadence);
    }

    #[test]
    fn new_schedule_requires_vms() {
        let schedule = NewSchedule {
            name: "nightly".to_string(),
            vms: vec![],
            cadence: Cadence::parse("daily", "02:00").unwrap(),
            mode: BackupMode::Incremental,
            enabled: true,
        };
        assert_eq!(schedule.validate(), Err(ConfigurationError::EmptyVmSet));
    }

    #[test]
    fn reducer_fails_job_when_any_vm_fails() {
        let result = JobResult::from_outcomes(vec![failure("a"), backup("b")]);
        assert_eq!(result.state, JobState::Failed);
        assert!(result.error.as_deref().unwrap().contains("a: boom"));
        assert!(result.outcomes[1].is_success());
        assert_eq!(result.transferred_bytes(), 10);
    }

    #[test]
    fn reducer_succeeds_when_all_vms_succeed() {
        let result = JobResult::from_outcomes(vec![backup("a"), backup("b")]);
        assert_eq!(result.state, JobState::Succeeded);
        assert!(result.error.is_none());
    }

    #[test]
    fn job_tag_uses_the_random_tail_of_the_id() {
        assert_eq!(job_tag("0198a1b2-c3d4-7e5f-8a9b-0c1d2e3F4a5B"), "2e3f4a5b");
        assert_eq!(job_tag("job-1"), "job1");
        assert_ne!(
            job_tag("0198a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b"),
            job_tag("0198a1b2-c3d4-7e5f-8a9b-0c1d99999999")
        );
    }

    #[test]
    fn dedup_keeps_first_seen_order() {
        let vms = dedup_vms(vec!["b".into(), "a".into(), " b ".into()]);
        assert_eq!(vms, vec!["b".to_string(), "a".to_string()]);
    }
}
