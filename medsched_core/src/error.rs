//! Error types for the medsched_core library.

use crate::dosage::DosageError;
use crate::periodicity::PeriodicityError;
use crate::types::MedicationId;
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for medsched_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No schedule is stored under this medication id
    #[error("Medication {0} not found")]
    NotFound(MedicationId),

    /// Treatment window ended or the medication was deactivated
    #[error("Schedule for medication {id} is closed: {reason}")]
    ScheduleClosed { id: MedicationId, reason: String },

    /// Periodicity rule is missing or has invalid fields for its type
    #[error("Invalid schedule configuration: {0}")]
    InvalidScheduleConfiguration(#[from] PeriodicityError),

    /// Dosage, progression rate or target could not be interpreted
    #[error("Invalid dosage expression: {0}")]
    InvalidDosageExpression(#[from] DosageError),

    /// Optimistic version check failed on the schedule record
    #[error("Version conflict on medication {id}: expected {expected}, found {found}")]
    VersionConflict {
        id: MedicationId,
        expected: u64,
        found: u64,
    },

    /// A lock or collaborator call did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Transient failures persisted past the retry budget
    #[error("Scheduling medication {id} failed after {attempts} attempt(s), try again: {source}")]
    SchedulingFailed {
        id: MedicationId,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the orchestrator may retry the failed collaborator call.
    ///
    /// Only store and sink failures qualify. Configuration errors from the
    /// pure components are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::VersionConflict { .. } | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Errors that require correcting the stored plan rather than retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidScheduleConfiguration(_) | Error::InvalidDosageExpression(_)
        )
    }
}
