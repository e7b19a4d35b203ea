//! Schedule orchestration: one dose at a time, exactly once.
//!
//! `schedule_next` runs as a single unit of work per medication:
//! 1. Serialize on the medication (in-process mutex + store lease)
//! 2. Load the schedule, reject closed treatments
//! 3. Resolve the next date and the dosage for the next dose index
//! 4. Emit one reminder under a deterministic dedup key
//! 5. Advance the dose count with an optimistic version check
//!
//! If step 5 cannot commit, the reminder from step 4 is retracted. A reminder
//! left behind by an interrupted call is adopted on the next call.

use crate::periodicity::{self, upcoming_dates, PeriodicityError, PeriodicityRule};
use crate::reminders::{DedupKey, Reminder, ReminderPayload, ReminderSink};
use crate::store::ScheduleStore;
use crate::{dosage, Error, MedicationId, MedicationSchedule, Result, ScheduledDose};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// How transient store/sink failures are retried
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl From<&crate::config::SchedulingConfig> for RetryPolicy {
    fn from(config: &crate::config::SchedulingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Date and dosage of the next dose, before anything is persisted
#[derive(Clone, Debug, PartialEq)]
pub struct DosePlan {
    pub next_date: NaiveDate,
    pub dosage: String,
    pub dose_index: u32,
}

/// Next dose date as seen from `today`.
///
/// Before the treatment starts, the start date itself is the first
/// candidate.
fn next_dose_date(
    schedule: &MedicationSchedule,
    rule: &PeriodicityRule,
    today: NaiveDate,
) -> std::result::Result<NaiveDate, PeriodicityError> {
    if today < schedule.start_date {
        periodicity::first_date_on_or_after(schedule.start_date, rule)
    } else {
        periodicity::next_date(today, rule)
    }
}

/// Compute the next dose of a schedule without side effects
pub fn plan_next_dose(schedule: &MedicationSchedule, today: NaiveDate) -> Result<DosePlan> {
    let rule = schedule.periodicity_rule()?;
    let next_date = next_dose_date(schedule, &rule, today)?;

    let dose_index = schedule.current_dose_count.saturating_add(1);
    let dosage = dosage::dosage_at_index(&schedule.dosage, &schedule.progression_rule(), dose_index)?;

    Ok(DosePlan {
        next_date,
        dosage,
        dose_index,
    })
}

/// One upcoming dose in a preview
#[derive(Clone, Debug, PartialEq)]
pub struct UpcomingDose {
    pub date: NaiveDate,
    pub dose_index: u32,
    pub dosage: String,
    /// Progression has reached its target by this dose
    pub target_reached: bool,
}

/// Outcome of a sweep over auto-scheduled medications
#[derive(Debug, Default)]
pub struct SweepReport {
    pub scheduled: Vec<ScheduledDose>,
    pub closed: Vec<MedicationId>,
    pub failed: Vec<(MedicationId, Error)>,
}

impl SweepReport {
    pub fn newly_scheduled(&self) -> usize {
        self.scheduled.iter().filter(|d| d.newly_scheduled).count()
    }
}

/// Coordinates the schedule store and the reminder sink
pub struct ScheduleOrchestrator<S, R> {
    store: S,
    sink: R,
    retry: RetryPolicy,
    locks: Mutex<HashMap<MedicationId, Arc<Mutex<()>>>>,
}

impl<S: ScheduleStore, R: ReminderSink> ScheduleOrchestrator<S, R> {
    pub fn new(store: S, sink: R) -> Self {
        Self {
            store,
            sink,
            retry: RetryPolicy::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &R {
        &self.sink
    }

    fn medication_lock(&self, id: MedicationId) -> Arc<Mutex<()>> {
        let mut table = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        table.entry(id).or_default().clone()
    }

    /// Forget the mutex of `id` once no other caller holds or waits on it
    fn release_medication_lock(&self, id: MedicationId, lock: Arc<Mutex<()>>) {
        let mut table = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one here
        if Arc::strong_count(&lock) == 2 {
            table.remove(&id);
        }
    }

    /// Schedule the next dose of a medication.
    ///
    /// Calling again for the same due date returns the committed dose with
    /// `newly_scheduled == false` and changes nothing.
    pub fn schedule_next(&self, id: MedicationId, today: NaiveDate) -> Result<ScheduledDose> {
        let lock = self.medication_lock(id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.schedule_locked(id, today)
        };
        self.release_medication_lock(id, lock);
        result
    }

    fn schedule_locked(&self, id: MedicationId, today: NaiveDate) -> Result<ScheduledDose> {
        let _lease = self.retrying(id, "lease", || self.store.lease(id))?;

        let schedule = self.retrying(id, "load", || self.store.load(id))?;
        self.ensure_open(&schedule, today)?;

        let plan = plan_next_dose(&schedule, today)?;
        if let Some(end) = schedule.end_date {
            if plan.next_date > end {
                return Err(Error::ScheduleClosed {
                    id,
                    reason: format!("next dose {} falls after end date {}", plan.next_date, end),
                });
            }
        }
        tracing::debug!(
            "Planned dose {} of medication {} on {}: {}",
            plan.dose_index,
            id,
            plan.next_date,
            plan.dosage
        );

        let key = DedupKey::new(id, plan.next_date);
        if let Some(existing) = self.reconcile(&schedule, &key)? {
            tracing::info!("Medication {} already scheduled for {}", id, existing.due_date);
            return Ok(ScheduledDose {
                medication_id: id,
                next_date: existing.due_date,
                dosage: existing.payload.dosage,
                dose_index: existing.payload.dose_index,
                dedup_key: key.to_string(),
                newly_scheduled: false,
            });
        }

        let payload = reminder_payload(&schedule, &plan);
        let outcome = self.retrying(id, "upsert reminder", || {
            self.sink.upsert_reminder(&key, plan.next_date, &payload)
        })?;
        tracing::debug!("Reminder {} upsert outcome: {:?}", key, outcome);

        match self.commit_dose(&schedule) {
            Ok(count) => tracing::info!(
                "Scheduled medication {} on {} ({}), dose count now {}",
                id,
                plan.next_date,
                plan.dosage,
                count
            ),
            Err(err) => self.compensate(id, &key, plan.dose_index, err)?,
        }

        Ok(ScheduledDose {
            medication_id: id,
            next_date: plan.next_date,
            dosage: plan.dosage,
            dose_index: plan.dose_index,
            dedup_key: key.to_string(),
            newly_scheduled: true,
        })
    }

    /// Fail with `ScheduleClosed` for deactivated or ended treatments
    fn ensure_open(&self, schedule: &MedicationSchedule, today: NaiveDate) -> Result<()> {
        if !schedule.is_active {
            return Err(Error::ScheduleClosed {
                id: schedule.id,
                reason: "medication is deactivated".into(),
            });
        }

        if let Some(end) = schedule.end_date.filter(|_| schedule.has_ended(today)) {
            if let Err(e) = self.retrying(schedule.id, "close", || self.store.close(schedule.id)) {
                tracing::warn!("Failed to close ended schedule {}: {}", schedule.id, e);
            }
            return Err(Error::ScheduleClosed {
                id: schedule.id,
                reason: format!("treatment ended on {}", end),
            });
        }

        Ok(())
    }

    /// Clean up reminders that no committed dose accounts for.
    ///
    /// Returns the reminder under `key` when its dose is already committed.
    fn reconcile(&self, schedule: &MedicationSchedule, key: &DedupKey) -> Result<Option<Reminder>> {
        let id = schedule.id;
        let reminders = self.retrying(id, "list reminders", || self.sink.reminders_for(id))?;

        let mut current = None;
        for reminder in reminders {
            let committed = reminder.payload.dose_index <= schedule.current_dose_count;
            if &reminder.dedup_key == key {
                if committed {
                    current = Some(reminder);
                } else {
                    tracing::warn!(
                        "Adopting reminder {} left by an interrupted call",
                        reminder.dedup_key
                    );
                }
            } else if !committed {
                tracing::warn!("Retracting orphaned reminder {}", reminder.dedup_key);
                self.retrying(id, "retract orphan", || self.sink.retract(&reminder.dedup_key))?;
            }
        }
        Ok(current)
    }

    /// Advance the counter, re-reading the version after plan edits
    fn commit_dose(&self, schedule: &MedicationSchedule) -> Result<u32> {
        let id = schedule.id;
        let mut version = schedule.version;
        let mut attempts = 0;

        self.retrying(id, "advance dose count", || {
            attempts += 1;
            match self.store.advance_dose_count(id, version) {
                Err(conflict @ Error::VersionConflict { .. }) => {
                    let current = self.store.load(id)?;
                    if current.current_dose_count != schedule.current_dose_count {
                        return Err(Error::SchedulingFailed {
                            id,
                            attempts,
                            source: Box::new(conflict),
                        });
                    }
                    // Plan edit: counter untouched, retry against the new version
                    version = current.version;
                    Err(conflict)
                }
                other => other,
            }
        })
    }

    /// Undo the reminder of a dose whose counter advance failed.
    ///
    /// Returns `Ok` only when the store turns out to hold the advance after all.
    fn compensate(&self, id: MedicationId, key: &DedupKey, dose_index: u32, err: Error) -> Result<()> {
        match self.store.load(id) {
            Ok(current) if current.current_dose_count >= dose_index => {
                tracing::warn!(
                    "Dose count of medication {} committed despite error: {}",
                    id,
                    err
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not re-read medication {}: {}", id, e),
        }

        match self.retrying(id, "retract reminder", || self.sink.retract(key)) {
            Ok(_) => tracing::warn!("Retracted reminder {} after failed commit: {}", key, err),
            Err(e) => tracing::error!(
                "Reminder {} left without dose count advance, next call will adopt it: {}",
                key,
                e
            ),
        }
        Err(err)
    }

    /// Run `op`, retrying transient failures per the retry policy
    fn retrying<T, F>(&self, id: MedicationId, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        "{} for medication {} failed (attempt {}/{}): {}",
                        what,
                        id,
                        attempt,
                        max_attempts,
                        e
                    );
                    thread::sleep(self.retry.backoff);
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(Error::SchedulingFailed {
                        id,
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Schedule every active medication with auto-scheduling enabled
    pub fn sweep(&self, today: NaiveDate) -> Result<SweepReport> {
        let ids = self.store.list_auto_scheduled()?;
        tracing::info!("Sweeping {} auto-scheduled medications for {}", ids.len(), today);

        let mut report = SweepReport::default();
        for id in ids {
            match self.schedule_next(id, today) {
                Ok(dose) => report.scheduled.push(dose),
                Err(Error::ScheduleClosed { reason, .. }) => {
                    tracing::info!("Medication {} closed: {}", id, reason);
                    report.closed.push(id);
                }
                Err(e) => {
                    tracing::warn!("Failed to schedule medication {}: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }

        tracing::info!(
            "Sweep done: {} scheduled ({} new), {} closed, {} failed",
            report.scheduled.len(),
            report.newly_scheduled(),
            report.closed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// The next `count` doses of a medication, without any mutation
    pub fn preview(&self, id: MedicationId, today: NaiveDate, count: usize) -> Result<Vec<UpcomingDose>> {
        let schedule = self.store.load(id)?;
        let rule = schedule.periodicity_rule()?;
        let progression = schedule.progression_rule();

        let mut dates = Vec::with_capacity(count);
        if count > 0 {
            let first = next_dose_date(&schedule, &rule, today)?;
            dates.push(first);
            dates.extend(upcoming_dates(first, &rule, count - 1)?);
        }
        let dosages = dosage::dosage_preview(
            &schedule.dosage,
            &progression,
            schedule.current_dose_count,
            u32::try_from(count).unwrap_or(u32::MAX),
        )?;

        dates
            .into_iter()
            .zip(dosages)
            .take_while(|(date, _)| schedule.end_date.map_or(true, |end| *date <= end))
            .map(|(date, dose)| -> Result<UpcomingDose> {
                let target_reached =
                    dosage::has_reached_target(&schedule.dosage, &progression, dose.dose_index)?;
                Ok(UpcomingDose {
                    date,
                    dose_index: dose.dose_index,
                    dosage: dose.dosage,
                    target_reached,
                })
            })
            .collect()
    }
}

fn reminder_payload(schedule: &MedicationSchedule, plan: &DosePlan) -> ReminderPayload {
    let mut description = format!("Medication: {}\nDosage: {}", schedule.name, plan.dosage);
    if let Some(frequency) = &schedule.frequency {
        description.push_str(&format!("\nFrequency: {}", frequency));
    }

    ReminderPayload {
        medication_id: schedule.id,
        pet_id: schedule.pet_id,
        title: schedule.name.clone(),
        description,
        dosage: plan.dosage.clone(),
        dose_index: plan.dose_index,
    }
}
