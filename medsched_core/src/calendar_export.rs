//! CSV export of scheduled reminders for calendar import.

use crate::reminders::{JsonlReminderSink, Reminder};
use crate::Result;
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    id: String,
    dedup_key: String,
    medication_id: u64,
    pet_id: u64,
    due_date: String,
    title: String,
    dosage: String,
    dose_index: u32,
    created_at: String,
}

impl From<&Reminder> for CsvRow {
    fn from(reminder: &Reminder) -> Self {
        CsvRow {
            id: reminder.id.to_string(),
            dedup_key: reminder.dedup_key.to_string(),
            medication_id: reminder.payload.medication_id,
            pet_id: reminder.payload.pet_id,
            due_date: reminder.due_date.format("%Y-%m-%d").to_string(),
            title: reminder.payload.title.clone(),
            dosage: reminder.payload.dosage.clone(),
            dose_index: reminder.payload.dose_index,
            created_at: reminder.created_at.to_rfc3339(),
        }
    }
}

/// Write every reminder in the sink to `csv_path`, ordered by due date.
///
/// The CSV is written to a temp file, synced, then renamed over the
/// destination. Returns the number of rows written.
pub fn export_reminders_csv(sink: &JsonlReminderSink, csv_path: &Path) -> Result<usize> {
    let mut reminders = sink.read_all()?;
    reminders.sort_by(|a, b| {
        a.due_date
            .cmp(&b.due_date)
            .then(a.payload.medication_id.cmp(&b.payload.medication_id))
    });

    let dir = match csv_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let temp = tempfile::NamedTempFile::new_in(&dir)?;
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(true)
            .from_writer(temp.as_file());
        for reminder in &reminders {
            writer.serialize(CsvRow::from(reminder))?;
        }
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(csv_path)
        .map_err(|e| crate::Error::Io(e.error))?;

    tracing::info!("Exported {} reminders to {:?}", reminders.len(), csv_path);
    Ok(reminders.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminders::{DedupKey, ReminderPayload, ReminderSink};
    use chrono::NaiveDate;
    use std::time::Duration;

    #[test]
    fn test_export_orders_by_due_date() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sink = JsonlReminderSink::new(
            temp_dir.path().join("reminders.jsonl"),
            Duration::from_millis(500),
        );

        for (id, day) in [(1u64, 20u32), (2, 10)] {
            let due = NaiveDate::from_ymd_opt(2026, 4, day).unwrap();
            let payload = ReminderPayload {
                medication_id: id,
                pet_id: 9,
                title: "Cefalexina".into(),
                description: "Medication: Cefalexina\nDosage: 300mg".into(),
                dosage: "300mg".into(),
                dose_index: 1,
            };
            sink.upsert_reminder(&DedupKey::new(id, due), due, &payload)
                .unwrap();
        }

        let csv_path = temp_dir.path().join("export/reminders.csv");
        let count = export_reminders_csv(&sink, &csv_path).unwrap();
        assert_eq!(count, 2);

        let contents = std::fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,dedup_key,medication_id"));
        assert!(lines[1].contains("2026-04-10"));
        assert!(lines[2].contains("2026-04-20"));
    }

    #[test]
    fn test_export_empty_sink_creates_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sink = JsonlReminderSink::new(
            temp_dir.path().join("reminders.jsonl"),
            Duration::from_millis(500),
        );

        let csv_path = temp_dir.path().join("reminders.csv");
        assert_eq!(export_reminders_csv(&sink, &csv_path).unwrap(), 0);
        assert!(csv_path.exists());
    }
}
