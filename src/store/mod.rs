//! Durable schedule collection.
//!
//! Schedules live in one versioned JSON document keyed by schedule id. Saves
//! write a sibling temporary file, sync it and rename it over the document,
//! so a crash mid-write leaves the previous version readable.
//!
//! All read-modify-write goes through [`ScheduleStore::lock`], which
//! serializes writers for the duration of the returned [`ScheduleTxn`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::core::error::{Error, StoreError};
use crate::core::models::ScheduleDefinition;

pub const DOCUMENT_VERSION: u32 = 1;

pub type Schedules = BTreeMap<String, ScheduleDefinition>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleDocument {
    version: u32,
    #[serde(default)]
    schedules: Schedules,
}

pub struct ScheduleStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl ScheduleStore {
    /// Open the store and validate the existing document. A missing document
    /// is an empty collection; a malformed one is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            writer: Mutex::new(()),
        };

        let schedules = store.load().await?;
        info!(
            path = %store.path.display(),
            count = schedules.len(),
            "Schedule store opened"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Schedules, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Schedules::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        decode(&self.path, &bytes)
    }

    pub async fn save(&self, schedules: &Schedules) -> Result<(), StoreError> {
        let document = ScheduleDocument {
            version: DOCUMENT_VERSION,
            schedules: schedules.clone(),
        };
        let json = serde_json::to_vec_pretty(&document).map_err(StoreError::Encode)?;

        let tmp_path = self.path.with_extension("json.tmp");
        let io_err = |source| StoreError::Io {
            path: tmp_path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut file = fs::File::create(&tmp_path).await.map_err(io_err)?;
        file.write_all(&json).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;

        debug!(path = %self.path.display(), count = schedules.len(), "Schedules saved");
        Ok(())
    }

    /// Enter the single-writer section and load the current collection.
    pub async fn lock(&self) -> Result<ScheduleTxn<'_>, StoreError> {
        let guard = self.writer.lock().await;
        let schedules = self.load().await?;
        Ok(ScheduleTxn {
            store: self,
            _guard: guard,
            schedules,
        })
    }

    pub async fn get(&self, id: &str) -> Result<ScheduleDefinition, Error> {
        self.load()
            .await?
            .remove(id)
            .ok_or_else(|| Error::ScheduleNotFound(id.to_string()))
    }

    pub async fn upsert(&self, def: ScheduleDefinition) -> Result<(), StoreError> {
        let mut txn = self.lock().await?;
        txn.insert(def);
        txn.commit().await
    }

    pub async fn remove(&self, id: &str) -> Result<ScheduleDefinition, Error> {
        let mut txn = self.lock().await?;
        let removed = txn
            .remove(id)
            .ok_or_else(|| Error::ScheduleNotFound(id.to_string()))?;
        txn.commit().await?;
        Ok(removed)
    }
}

/// A loaded copy of the collection, held while the writer lock is held.
/// Changes are only persisted by [`ScheduleTxn::commit`].
pub struct ScheduleTxn<'a> {
    store: &'a ScheduleStore,
    _guard: MutexGuard<'a, ()>,
    schedules: Schedules,
}

impl ScheduleTxn<'_> {
    pub fn get(&self, id: &str) -> Option<&ScheduleDefinition> {
        self.schedules.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ScheduleDefinition> {
        self.schedules.get_mut(id)
    }

    pub fn insert(&mut self, def: ScheduleDefinition) {
        self.schedules.insert(def.id.clone(), def);
    }

    pub fn remove(&mut self, id: &str) -> Option<ScheduleDefinition> {
        self.schedules.remove(id)
    }

    pub fn schedules(&self) -> &Schedules {
        &self.schedules
    }

    pub fn schedules_mut(&mut self) -> &mut Schedules {
        &mut self.schedules
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.store.save(&self.schedules).await
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Schedules, StoreError> {
    #[derive(Deserialize)]
    struct Version {
        version: u32,
    }

    let Version { version } =
        serde_json::from_slice(bytes).map_err(|source| StoreError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    if version != DOCUMENT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: version,
            expected: DOCUMENT_VERSION,
        });
    }

    let document: ScheduleDocument =
        serde_json::from_slice(bytes).map_err(|source| StoreError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    for (key, def) in &document.schedules {
        if key != &def.id {
            return Err(StoreError::Corrupt {
                id: key.clone(),
                reason: format!("entry is keyed by '{}' but has id '{}'", key, def.id),
            });
        }
        def.validate().map_err(|e| StoreError::Corrupt {
            id: key.clone(),
            reason: e.to_string(),
        })?;
    }

    Ok(document.schedules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{BackupMode, Cadence, RunOutcome, TimeOfDay};
    use chrono::{TimeZone, Utc, Weekday};

    fn schedule(id: &str) -> ScheduleDefinition {
        ScheduleDefinition {
            id: id.to_string(),
            name: format!("nightly {}", id),
            vms: vec!["web01".to_string(), "db01".to_string()],
            cadence: Cadence::Weekly {
                weekday: Weekday::Sun,
                time: TimeOfDay::new(3, 0).unwrap(),
            },
            mode: BackupMode::Incremental,
            enabled: true,
            created_at: Utc.with_ymd_and_hms(2025, 7, 30, 10, 0, 0).unwrap(),
            last_run: Some(Utc.with_ymd_and_hms(2025, 7, 27, 3, 0, 4).unwrap()),
            last_outcome: RunOutcome::Failure,
            last_error: Some("1 of 2 VMs failed: db01: boom".to_string()),
            last_job_id: Some("job-1".to_string()),
            next_run: Some(Utc.with_ymd_and_hms(2025, 8, 3, 3, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn missing_document_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::open(dir.path().join("schedules.json"))
            .await
            .unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_and_load_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::open(dir.path().join("state/schedules.json"))
            .await
            .unwrap();

        let def = schedule("a");
        store.upsert(def.clone()).await.unwrap();

        let reopened = ScheduleStore::open(store.path()).await.unwrap();
        assert_eq!(reopened.get("a").await.unwrap(), def);
        assert!(!dir.path().join("state/schedules.json.tmp").exists());
    }

    #[tokio::test]
    async fn remove_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::open(dir.path().join("schedules.json"))
            .await
            .unwrap();
        assert!(matches!(
            store.remove("nope").await,
            Err(Error::ScheduleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn txn_changes_are_dropped_without_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::open(dir.path().join("schedules.json"))
            .await
            .unwrap();
        store.upsert(schedule("a")).await.unwrap();

        {
            let mut txn = store.lock().await.unwrap();
            txn.remove("a");
        }

        assert!(store.get("a").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_truncated_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        std::fs::write(&path, br#"{"version":1,"schedules":{"a":{"id":"a""#).unwrap();

        assert!(matches!(
            ScheduleStore::open(&path).await,
            Err(StoreError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        std::fs::write(&path, br#"{"version":7,"schedules":{}}"#).unwrap();

        assert!(matches!(
            ScheduleStore::open(&path).await,
            Err(StoreError::UnsupportedVersion { found: 7, .. })
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        let mut value = serde_json::to_value(ScheduleDocument {
            version: DOCUMENT_VERSION,
            schedules: Schedules::from([("a".to_string(), schedule("a"))]),
        })
        .unwrap();
        value["schedules"]["a"]["retries"] = serde_json::json!(3);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(matches!(
            ScheduleStore::open(&path).await,
            Err(StoreError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_entries_with_empty_vm_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        let mut def = schedule("a");
        def.vms.clear();
        let doc = ScheduleDocument {
            version: DOCUMENT_VERSION,
            schedules: Schedules::from([("a".to_string(), def)]),
        };
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        assert!(matches!(
            ScheduleStore::open(&path).await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
