#![forbid(unsafe_code)]

//! Core domain model and scheduling logic for medsched.
//!
//! This crate provides:
//! - Domain types (medication schedules, scheduled doses)
//! - Periodicity resolution (daily, weekly, monthly, custom intervals)
//! - Dosage progression (increase/decrease toward a target)
//! - Schedule orchestration with exactly-once reminders
//! - Persistence (JSON schedule store, JSONL reminders, CSV calendar export)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod lock;
pub mod periodicity;
pub mod dosage;
pub mod store;
pub mod reminders;
pub mod calendar_export;
pub mod orchestrator;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use periodicity::{next_date, upcoming_dates, PeriodicityError, PeriodicityRule};
pub use dosage::{dosage_at_index, dosage_preview, has_reached_target, DosageError, ProgressionRule};
pub use store::{JsonScheduleStore, ScheduleStore};
pub use reminders::{DedupKey, JsonlReminderSink, Reminder, ReminderPayload, ReminderSink};
pub use calendar_export::export_reminders_csv;
pub use orchestrator::{plan_next_dose, RetryPolicy, ScheduleOrchestrator, SweepReport, UpcomingDose};
