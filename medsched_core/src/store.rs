//! Schedule persistence with file locking.
//!
//! The orchestrator only sees the [`ScheduleStore`] trait. [`JsonScheduleStore`]
//! keeps every schedule in one JSON document, rewritten atomically under an
//! exclusive lock.

use crate::lock::FileLock;
use crate::{Error, MedicationId, MedicationSchedule, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Persisted schedule state consumed by the orchestrator
pub trait ScheduleStore: Send + Sync {
    /// Exclusive scheduling scope for one medication, released on drop
    type Lease;

    fn lease(&self, id: MedicationId) -> Result<Self::Lease>;

    /// Load a schedule, `Error::NotFound` if absent
    fn load(&self, id: MedicationId) -> Result<MedicationSchedule>;

    /// Increment the dose count if the stored version still equals
    /// `expected_version`. Returns the new count.
    fn advance_dose_count(&self, id: MedicationId, expected_version: u64) -> Result<u32>;

    /// Mark the schedule inactive
    fn close(&self, id: MedicationId) -> Result<()>;

    /// Active schedules with auto-scheduling enabled
    fn list_auto_scheduled(&self) -> Result<Vec<MedicationId>>;
}

/// On-disk document
#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleBook {
    #[serde(default)]
    schedules: BTreeMap<MedicationId, MedicationSchedule>,
}

/// JSON file store: `<dir>/schedules.json`, locks under `<dir>/locks/`
#[derive(Debug, Clone)]
pub struct JsonScheduleStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl JsonScheduleStore {
    pub fn new(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("schedules.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join("locks").join("schedules.lock")
    }

    fn lease_path(&self, id: MedicationId) -> PathBuf {
        self.dir.join("locks").join(format!("medication-{}.lock", id))
    }

    fn read_book(path: &Path) -> Result<ScheduleBook> {
        if !path.exists() {
            return Ok(ScheduleBook::default());
        }
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(ScheduleBook::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    /// Atomically replace the document via temp file + rename
    fn write_book(&self, book: &ScheduleBook) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let temp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, book)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(self.path()).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn read(&self) -> Result<ScheduleBook> {
        let _lock = FileLock::shared(&self.lock_path(), self.lock_timeout)?;
        Self::read_book(&self.path())
    }

    /// Load-modify-save under the exclusive lock
    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ScheduleBook) -> Result<T>,
    {
        let _lock = FileLock::exclusive(&self.lock_path(), self.lock_timeout)?;
        let mut book = Self::read_book(&self.path())?;
        let out = f(&mut book)?;
        self.write_book(&book)?;
        Ok(out)
    }

    /// Create a schedule or edit its plan.
    ///
    /// An edit never changes `current_dose_count`; the stored count wins over
    /// whatever the caller passed. Returns the stored record.
    pub fn save_plan(&self, schedule: &MedicationSchedule) -> Result<MedicationSchedule> {
        let saved = self.update(|book| {
            let mut record = schedule.clone();
            match book.schedules.get(&schedule.id) {
                Some(existing) => {
                    record.current_dose_count = existing.current_dose_count;
                    record.version = existing.version + 1;
                }
                None => record.version = 1,
            }
            book.schedules.insert(record.id, record.clone());
            Ok(record)
        })?;
        tracing::info!(
            "Saved plan for medication {} (version {})",
            saved.id,
            saved.version
        );
        Ok(saved)
    }

    /// Every stored schedule, ordered by id
    pub fn list(&self) -> Result<Vec<MedicationSchedule>> {
        Ok(self.read()?.schedules.into_values().collect())
    }
}

impl ScheduleStore for JsonScheduleStore {
    type Lease = FileLock;

    fn lease(&self, id: MedicationId) -> Result<FileLock> {
        FileLock::exclusive(&self.lease_path(id), self.lock_timeout)
    }

    fn load(&self, id: MedicationId) -> Result<MedicationSchedule> {
        self.read()?
            .schedules
            .remove(&id)
            .ok_or(Error::NotFound(id))
    }

    fn advance_dose_count(&self, id: MedicationId, expected_version: u64) -> Result<u32> {
        let count = self.update(|book| {
            let record = book.schedules.get_mut(&id).ok_or(Error::NotFound(id))?;
            if record.version != expected_version {
                return Err(Error::VersionConflict {
                    id,
                    expected: expected_version,
                    found: record.version,
                });
            }
            record.current_dose_count += 1;
            record.version += 1;
            Ok(record.current_dose_count)
        })?;
        tracing::debug!("Advanced dose count of medication {} to {}", id, count);
        Ok(count)
    }

    fn close(&self, id: MedicationId) -> Result<()> {
        self.update(|book| {
            let record = book.schedules.get_mut(&id).ok_or(Error::NotFound(id))?;
            if record.is_active {
                record.is_active = false;
                record.version += 1;
            }
            Ok(())
        })?;
        tracing::info!("Closed schedule for medication {}", id);
        Ok(())
    }

    fn list_auto_scheduled(&self) -> Result<Vec<MedicationId>> {
        Ok(self
            .read()?
            .schedules
            .values()
            .filter(|s| s.is_active && s.auto_schedule)
            .map(|s| s.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn store(dir: &Path) -> JsonScheduleStore {
        JsonScheduleStore::new(dir, Duration::from_millis(500))
    }

    fn schedule(id: MedicationId) -> MedicationSchedule {
        MedicationSchedule::new(
            id,
            10,
            "Amoxicilina",
            "250mg",
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        )
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path());

        let saved = store.save_plan(&schedule(1)).unwrap();
        assert_eq!(saved.version, 1);

        let loaded = store.load(1).unwrap();
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path());

        assert!(matches!(store.load(42), Err(Error::NotFound(42))));
    }

    #[test]
    fn test_advance_checks_version() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path());
        store.save_plan(&schedule(1)).unwrap();

        assert_eq!(store.advance_dose_count(1, 1).unwrap(), 1);

        let stale = store.advance_dose_count(1, 1);
        assert!(matches!(
            stale,
            Err(Error::VersionConflict {
                expected: 1,
                found: 2,
                ..
            })
        ));
        assert_eq!(store.load(1).unwrap().current_dose_count, 1);
    }

    #[test]
    fn test_plan_edit_preserves_dose_count() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path());
        store.save_plan(&schedule(1)).unwrap();
        store.advance_dose_count(1, 1).unwrap();

        let mut edited = schedule(1);
        edited.dosage = "500mg".into();
        edited.current_dose_count = 0;
        let saved = store.save_plan(&edited).unwrap();

        assert_eq!(saved.current_dose_count, 1);
        assert_eq!(saved.version, 3);
        assert_eq!(store.load(1).unwrap().dosage, "500mg");
    }

    #[test]
    fn test_close_and_auto_schedule_listing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path());

        let mut auto = schedule(1);
        auto.auto_schedule = true;
        store.save_plan(&auto).unwrap();
        store.save_plan(&schedule(2)).unwrap();
        let mut other = schedule(3);
        other.auto_schedule = true;
        store.save_plan(&other).unwrap();

        assert_eq!(store.list_auto_scheduled().unwrap(), vec![1, 3]);

        store.close(3).unwrap();
        assert!(!store.load(3).unwrap().is_active);
        assert_eq!(store.list_auto_scheduled().unwrap(), vec![1]);
    }

    #[test]
    fn test_lease_is_exclusive_per_medication() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonScheduleStore::new(temp_dir.path(), Duration::from_millis(30));

        let _held = store.lease(1).unwrap();
        assert!(matches!(store.lease(1), Err(Error::Timeout(_))));
        assert!(store.lease(2).is_ok());
    }

    #[test]
    fn test_corrupted_document_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path());
        std::fs::write(store.path(), "{ invalid json }").unwrap();

        assert!(matches!(store.load(1), Err(Error::Json(_))));
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = store(temp_dir.path());
        store.save_plan(&schedule(1)).unwrap();

        let extras: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "schedules.json" && e.file_name() != "locks")
            .collect();
        assert!(
            extras.is_empty(),
            "Expected only schedules.json and locks/, found extras: {:?}",
            extras
        );
    }
}
