//! Reminder/calendar sink.
//!
//! Reminders are keyed by a deterministic dedup key (medication id + due
//! date), so emitting the same dose twice never creates a second entry.
//! [`JsonlReminderSink`] stores one JSON reminder per line.

use crate::lock::FileLock;
use crate::{Error, MedicationId, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Deterministic identity of a reminder: `medication-<id>@<date>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(medication_id: MedicationId, due_date: NaiveDate) -> Self {
        Self(format!("medication-{}@{}", medication_id, due_date.format("%Y-%m-%d")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the orchestrator asks the sink to show
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub medication_id: MedicationId,
    pub pet_id: u64,
    pub title: String,
    pub description: String,
    pub dosage: String,
    pub dose_index: u32,
}

/// A stored reminder entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    pub dedup_key: DedupKey,
    pub due_date: NaiveDate,
    #[serde(flatten)]
    pub payload: ReminderPayload,
    pub created_at: DateTime<Utc>,
}

/// Result of an upsert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Reminder sink trait. `upsert_reminder` must be idempotent per key.
pub trait ReminderSink: Send + Sync {
    fn upsert_reminder(
        &self,
        key: &DedupKey,
        due_date: NaiveDate,
        payload: &ReminderPayload,
    ) -> Result<UpsertOutcome>;

    fn reminders_for(&self, medication_id: MedicationId) -> Result<Vec<Reminder>>;

    /// Remove a reminder; returns whether one was present
    fn retract(&self, key: &DedupKey) -> Result<bool>;
}

/// One line of the reminder file
#[derive(Debug)]
enum Entry {
    Parsed(Reminder),
    /// Kept verbatim so that rewrites never drop data
    Unparsed(String),
}

/// JSONL-based reminder sink with file locking
#[derive(Debug, Clone)]
pub struct JsonlReminderSink {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonlReminderSink {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("jsonl.lock")
    }

    /// Ensure the parent directory exists
    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Read all reminders under a shared lock
    pub fn read_all(&self) -> Result<Vec<Reminder>> {
        let _lock = FileLock::shared(&self.lock_path(), self.lock_timeout)?;
        Ok(read_entries(&self.path)?
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Parsed(reminder) => Some(reminder),
                Entry::Unparsed(_) => None,
            })
            .collect())
    }

    /// Append one line (new key)
    fn append(&self, reminder: &Reminder) -> Result<()> {
        self.ensure_parent_dir()?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(reminder)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);
        file.sync_all()?;
        Ok(())
    }

    /// Replace the whole file atomically
    fn rewrite(&self, entries: &[Entry]) -> Result<()> {
        self.ensure_parent_dir()?;
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Other("reminder path missing parent".into()))?;

        let temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            for entry in entries {
                match entry {
                    Entry::Parsed(reminder) => serde_json::to_writer(&mut writer, reminder)?,
                    Entry::Unparsed(line) => writer.write_all(line.as_bytes())?,
                }
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

impl ReminderSink for JsonlReminderSink {
    fn upsert_reminder(
        &self,
        key: &DedupKey,
        due_date: NaiveDate,
        payload: &ReminderPayload,
    ) -> Result<UpsertOutcome> {
        let _lock = FileLock::exclusive(&self.lock_path(), self.lock_timeout)?;
        let mut entries = read_entries(&self.path)?;

        let existing = entries.iter_mut().find_map(|entry| match entry {
            Entry::Parsed(r) if &r.dedup_key == key => Some(r),
            _ => None,
        });
        match existing {
            Some(existing) if existing.due_date == due_date && &existing.payload == payload => {
                tracing::debug!("Reminder {} already present", key);
                Ok(UpsertOutcome::Unchanged)
            }
            Some(existing) => {
                existing.due_date = due_date;
                existing.payload = payload.clone();
                self.rewrite(&entries)?;
                tracing::info!("Updated reminder {}", key);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let reminder = Reminder {
                    id: Uuid::new_v4(),
                    dedup_key: key.clone(),
                    due_date,
                    payload: payload.clone(),
                    created_at: Utc::now(),
                };
                self.append(&reminder)?;
                tracing::info!("Created reminder {} ({})", key, payload.dosage);
                Ok(UpsertOutcome::Created)
            }
        }
    }

    fn reminders_for(&self, medication_id: MedicationId) -> Result<Vec<Reminder>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.payload.medication_id == medication_id)
            .collect())
    }

    fn retract(&self, key: &DedupKey) -> Result<bool> {
        let _lock = FileLock::exclusive(&self.lock_path(), self.lock_timeout)?;
        let mut entries = read_entries(&self.path)?;

        let before = entries.len();
        entries.retain(|entry| !matches!(entry, Entry::Parsed(r) if &r.dedup_key == key));
        if entries.len() == before {
            return Ok(false);
        }

        self.rewrite(&entries)?;
        tracing::info!("Retracted reminder {}", key);
        Ok(true)
    }
}

/// Read every line of a JSONL file; the caller holds the lock
fn read_entries(path: &Path) -> Result<Vec<Entry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Reminder>(&line) {
            Ok(reminder) => entries.push(Entry::Parsed(reminder)),
            Err(e) => {
                tracing::warn!("Failed to parse reminder at line {}: {}", line_num + 1, e);
                entries.push(Entry::Unparsed(line));
            }
        }
    }

    tracing::debug!("Read {} reminder lines from {:?}", entries.len(), path);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn payload(medication_id: MedicationId, dosage: &str, dose_index: u32) -> ReminderPayload {
        ReminderPayload {
            medication_id,
            pet_id: 5,
            title: "Meloxicam".into(),
            description: format!("Medication: Meloxicam\nDosage: {}", dosage),
            dosage: dosage.into(),
            dose_index,
        }
    }

    fn sink(dir: &Path) -> JsonlReminderSink {
        JsonlReminderSink::new(dir.join("reminders.jsonl"), Duration::from_millis(500))
    }

    fn find(sink: &JsonlReminderSink, key: &DedupKey) -> Option<Reminder> {
        sink.read_all()
            .unwrap()
            .into_iter()
            .find(|r| &r.dedup_key == key)
    }

    #[test]
    fn test_dedup_key_format() {
        let key = DedupKey::new(12, date(2026, 3, 5));
        assert_eq!(key.as_str(), "medication-12@2026-03-05");
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sink = sink(temp_dir.path());
        let key = DedupKey::new(1, date(2026, 3, 5));

        let first = sink
            .upsert_reminder(&key, date(2026, 3, 5), &payload(1, "1mg", 1))
            .unwrap();
        let second = sink
            .upsert_reminder(&key, date(2026, 3, 5), &payload(1, "1mg", 1))
            .unwrap();

        assert_eq!(first, UpsertOutcome::Created);
        assert_eq!(second, UpsertOutcome::Unchanged);
        assert_eq!(sink.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_updates_changed_payload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sink = sink(temp_dir.path());
        let key = DedupKey::new(1, date(2026, 3, 5));

        sink.upsert_reminder(&key, date(2026, 3, 5), &payload(1, "1mg", 1))
            .unwrap();
        let outcome = sink
            .upsert_reminder(&key, date(2026, 3, 5), &payload(1, "1.5mg", 1))
            .unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated);
        let stored = find(&sink, &key).unwrap();
        assert_eq!(stored.payload.dosage, "1.5mg");
        assert_eq!(sink.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_retract_and_filter_by_medication() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sink = sink(temp_dir.path());
        let a = DedupKey::new(1, date(2026, 3, 5));
        let b = DedupKey::new(2, date(2026, 3, 5));

        sink.upsert_reminder(&a, date(2026, 3, 5), &payload(1, "1mg", 1))
            .unwrap();
        sink.upsert_reminder(&b, date(2026, 3, 5), &payload(2, "1mg", 1))
            .unwrap();

        assert_eq!(sink.reminders_for(1).unwrap().len(), 1);
        assert!(sink.retract(&a).unwrap());
        assert!(!sink.retract(&a).unwrap());
        assert!(find(&sink, &a).is_none());
        assert!(find(&sink, &b).is_some());
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(sink(temp_dir.path()).read_all().unwrap().is_empty());
    }

    #[test]
    fn test_skips_corrupted_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sink = sink(temp_dir.path());
        let key = DedupKey::new(1, date(2026, 3, 5));
        sink.upsert_reminder(&key, date(2026, 3, 5), &payload(1, "1mg", 1))
            .unwrap();

        let mut contents = std::fs::read_to_string(sink.path()).unwrap();
        contents.push_str("{ not json\n");
        std::fs::write(sink.path(), contents).unwrap();

        assert_eq!(sink.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_rewrites_keep_corrupted_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sink = sink(temp_dir.path());
        let a = DedupKey::new(1, date(2026, 3, 5));
        let b = DedupKey::new(2, date(2026, 3, 5));
        sink.upsert_reminder(&a, date(2026, 3, 5), &payload(1, "1mg", 1))
            .unwrap();

        let mut contents = std::fs::read_to_string(sink.path()).unwrap();
        contents.push_str("{ not json\n");
        std::fs::write(sink.path(), contents).unwrap();
        sink.upsert_reminder(&b, date(2026, 3, 5), &payload(2, "1mg", 1))
            .unwrap();

        let updated = sink
            .upsert_reminder(&a, date(2026, 3, 5), &payload(1, "2mg", 1))
            .unwrap();
        assert_eq!(updated, UpsertOutcome::Updated);
        assert!(sink.retract(&b).unwrap());

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("2mg"));
        assert_eq!(lines[1], "{ not json");
        assert_eq!(sink.read_all().unwrap().len(), 1);
    }
}
