//! Core domain types for the medication scheduling engine.
//!
//! This module defines:
//! - The persisted medication schedule record
//! - Periodicity and progression enums as stored
//! - The result of a scheduling call

use crate::dosage::ProgressionRule;
use crate::periodicity::{PeriodicityError, PeriodicityRule};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a pet medication record
pub type MedicationId = u64;

// ============================================================================
// Stored Enums
// ============================================================================

/// Periodicity type as stored on the schedule record
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeriodicityKind {
    #[default]
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl std::fmt::Display for PeriodicityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Direction of a titration plan
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DosageProgression {
    #[default]
    Stable,
    Increase,
    Decrease,
}

// ============================================================================
// Schedule Record
// ============================================================================

/// One active pet medication with its periodicity and progression plan.
///
/// Only the fields required by `periodicity` are consulted; the others are
/// kept as entered and ignored.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MedicationSchedule {
    pub id: MedicationId,
    pub pet_id: u64,
    pub name: String,

    /// Base dosage, e.g. "50mg" or "2 comprimidos"
    pub dosage: String,
    /// Free-text intra-day frequency such as "12h"
    #[serde(default)]
    pub frequency: Option<String>,

    #[serde(default)]
    pub periodicity: PeriodicityKind,
    #[serde(default)]
    pub custom_interval: Option<u32>,
    #[serde(default)]
    pub week_days: Option<BTreeSet<u8>>,
    #[serde(default)]
    pub month_days: Option<BTreeSet<u8>>,

    #[serde(default)]
    pub dosage_progression: DosageProgression,
    #[serde(default)]
    pub progression_rate: Option<String>,
    #[serde(default)]
    pub progression_interval: Option<u32>,
    #[serde(default)]
    pub target_dosage: Option<String>,

    #[serde(default)]
    pub current_dose_count: u32,

    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,

    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub auto_schedule: bool,
    #[serde(default)]
    pub notes: Option<String>,

    /// Optimistic concurrency version, bumped on every store mutation
    #[serde(default)]
    pub version: u64,
}

fn default_true() -> bool {
    true
}

impl MedicationSchedule {
    /// A daily, stable schedule starting on `start_date`
    pub fn new(
        id: MedicationId,
        pet_id: u64,
        name: impl Into<String>,
        dosage: impl Into<String>,
        start_date: NaiveDate,
    ) -> Self {
        Self {
            id,
            pet_id,
            name: name.into(),
            dosage: dosage.into(),
            frequency: None,
            periodicity: PeriodicityKind::Daily,
            custom_interval: None,
            week_days: None,
            month_days: None,
            dosage_progression: DosageProgression::Stable,
            progression_rate: None,
            progression_interval: None,
            target_dosage: None,
            current_dose_count: 0,
            start_date,
            end_date: None,
            is_active: true,
            auto_schedule: false,
            notes: None,
            version: 0,
        }
    }

    /// Build the tagged periodicity rule, validating the fields its type requires
    pub fn periodicity_rule(&self) -> std::result::Result<PeriodicityRule, PeriodicityError> {
        PeriodicityRule::from_fields(
            self.periodicity,
            self.custom_interval,
            self.week_days.as_ref(),
            self.month_days.as_ref(),
        )
    }

    /// The progression plan attached to this schedule
    pub fn progression_rule(&self) -> ProgressionRule {
        ProgressionRule {
            progression: self.dosage_progression,
            rate: self.progression_rate.clone(),
            interval: self.progression_interval,
            target: self.target_dosage.clone(),
        }
    }

    /// Whether the treatment window has ended before `today`
    pub fn has_ended(&self, today: NaiveDate) -> bool {
        self.end_date.is_some_and(|end| end < today)
    }
}

// ============================================================================
// Scheduling Result
// ============================================================================

/// The outcome of one `schedule_next` call
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduledDose {
    pub medication_id: MedicationId,
    pub next_date: NaiveDate,
    pub dosage: String,
    /// Dose index the dosage was computed for
    pub dose_index: u32,
    pub dedup_key: String,
    /// False when the same due date had already been scheduled
    pub newly_scheduled: bool,
}
