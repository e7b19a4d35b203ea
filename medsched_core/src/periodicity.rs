//! Next-dose date resolution for periodicity rules.
//!
//! Supported rules:
//! - Daily: every calendar day
//! - Weekly: selected weekdays (0 = Sunday .. 6 = Saturday)
//! - Monthly: selected days of the month (1..=31), months lacking the day are skipped
//! - Custom: a fixed interval in days
//!
//! Everything here is pure; the reference date is always passed in.

use crate::types::PeriodicityKind;
use chrono::{Datelike, Days, NaiveDate};
use std::collections::BTreeSet;
use std::fmt;

/// Longest gap between two occurrences of any valid month day
/// (day 31 from May 31 to Jul 31 is 61 days).
const MONTHLY_SCAN_DAYS: u64 = 62;

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A periodicity rule that cannot produce a next date
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeriodicityError {
    #[error("{periodicity} periodicity requires `{field}`")]
    MissingField {
        periodicity: PeriodicityKind,
        field: &'static str,
    },

    #[error("`{field}` must not be empty")]
    EmptySet { field: &'static str },

    #[error("`{field}` contains {value}, expected {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u8,
        min: u8,
        max: u8,
    },

    #[error("`custom_interval` must be at least 1 day")]
    ZeroInterval,

    #[error("no eligible date after {0} within the supported calendar range")]
    Exhausted(NaiveDate),
}

/// Which calendar dates are valid administration dates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodicityRule {
    Daily,
    Weekly { week_days: BTreeSet<u8> },
    Monthly { month_days: BTreeSet<u8> },
    Custom { interval_days: u32 },
}

impl PeriodicityRule {
    /// Build a rule from the flat stored fields.
    ///
    /// Only the field matching `kind` is read. Sets are validated here so
    /// that call sites never deal with raw values.
    pub fn from_fields(
        kind: PeriodicityKind,
        custom_interval: Option<u32>,
        week_days: Option<&BTreeSet<u8>>,
        month_days: Option<&BTreeSet<u8>>,
    ) -> Result<Self, PeriodicityError> {
        let rule = match kind {
            PeriodicityKind::Daily => PeriodicityRule::Daily,
            PeriodicityKind::Custom => PeriodicityRule::Custom {
                interval_days: custom_interval.ok_or(PeriodicityError::MissingField {
                    periodicity: kind,
                    field: "custom_interval",
                })?,
            },
            PeriodicityKind::Weekly => PeriodicityRule::Weekly {
                week_days: week_days
                    .ok_or(PeriodicityError::MissingField {
                        periodicity: kind,
                        field: "week_days",
                    })?
                    .clone(),
            },
            PeriodicityKind::Monthly => PeriodicityRule::Monthly {
                month_days: month_days
                    .ok_or(PeriodicityError::MissingField {
                        periodicity: kind,
                        field: "month_days",
                    })?
                    .clone(),
            },
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn kind(&self) -> PeriodicityKind {
        match self {
            PeriodicityRule::Daily => PeriodicityKind::Daily,
            PeriodicityRule::Weekly { .. } => PeriodicityKind::Weekly,
            PeriodicityRule::Monthly { .. } => PeriodicityKind::Monthly,
            PeriodicityRule::Custom { .. } => PeriodicityKind::Custom,
        }
    }

    /// Whether a treatment window opening on `date` gives a dose that day.
    ///
    /// Interval rules are anchored on the opening day; set rules only admit
    /// matching days.
    pub fn admits(&self, date: NaiveDate) -> bool {
        match self {
            PeriodicityRule::Daily | PeriodicityRule::Custom { .. } => true,
            PeriodicityRule::Weekly { week_days } => {
                week_days.contains(&(date.weekday().num_days_from_sunday() as u8))
            }
            PeriodicityRule::Monthly { month_days } => month_days.contains(&(date.day() as u8)),
        }
    }

    /// Check the structural requirements of the rule
    pub fn validate(&self) -> Result<(), PeriodicityError> {
        match self {
            PeriodicityRule::Daily => Ok(()),
            PeriodicityRule::Custom { interval_days } => {
                if *interval_days == 0 {
                    Err(PeriodicityError::ZeroInterval)
                } else {
                    Ok(())
                }
            }
            PeriodicityRule::Weekly { week_days } => validate_set(week_days, "week_days", 0, 6),
            PeriodicityRule::Monthly { month_days } => {
                validate_set(month_days, "month_days", 1, 31)
            }
        }
    }
}

fn validate_set(
    set: &BTreeSet<u8>,
    field: &'static str,
    min: u8,
    max: u8,
) -> Result<(), PeriodicityError> {
    if set.is_empty() {
        return Err(PeriodicityError::EmptySet { field });
    }
    match set.iter().find(|v| **v < min || **v > max) {
        Some(&value) => Err(PeriodicityError::OutOfRange {
            field,
            value,
            min,
            max,
        }),
        None => Ok(()),
    }
}

impl fmt::Display for PeriodicityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodicityRule::Daily => write!(f, "Daily"),
            PeriodicityRule::Weekly { week_days } => {
                let names: Vec<&str> = week_days
                    .iter()
                    .filter_map(|d| WEEKDAY_NAMES.get(*d as usize).copied())
                    .collect();
                write!(f, "Weekly: {}", names.join(", "))
            }
            PeriodicityRule::Monthly { month_days } => {
                let days: Vec<String> = month_days.iter().map(|d| d.to_string()).collect();
                write!(f, "Monthly: days {}", days.join(", "))
            }
            PeriodicityRule::Custom { interval_days: 1 } => write!(f, "Every day"),
            PeriodicityRule::Custom { interval_days } => {
                write!(f, "Every {} days", interval_days)
            }
        }
    }
}

/// Compute the first eligible date strictly after `reference`
pub fn next_date(reference: NaiveDate, rule: &PeriodicityRule) -> Result<NaiveDate, PeriodicityError> {
    rule.validate()?;

    let next = match rule {
        PeriodicityRule::Daily => reference.checked_add_days(Days::new(1)),
        PeriodicityRule::Custom { interval_days } => {
            reference.checked_add_days(Days::new(u64::from(*interval_days)))
        }
        PeriodicityRule::Weekly { week_days } => scan_forward(reference, 7, |d| {
            week_days.contains(&(d.weekday().num_days_from_sunday() as u8))
        }),
        PeriodicityRule::Monthly { month_days } => {
            scan_forward(reference, MONTHLY_SCAN_DAYS, |d| {
                month_days.contains(&(d.day() as u8))
            })
        }
    };

    let next = next.ok_or(PeriodicityError::Exhausted(reference))?;
    tracing::debug!("Next {} date after {}: {}", rule.kind(), reference, next);
    Ok(next)
}

/// First eligible date of a window opening on `start`, which may be `start` itself
pub fn first_date_on_or_after(
    start: NaiveDate,
    rule: &PeriodicityRule,
) -> Result<NaiveDate, PeriodicityError> {
    rule.validate()?;
    if rule.admits(start) {
        Ok(start)
    } else {
        next_date(start, rule)
    }
}

/// Walk day by day from `reference + 1` for at most `limit` days
fn scan_forward<F>(reference: NaiveDate, limit: u64, matches: F) -> Option<NaiveDate>
where
    F: Fn(NaiveDate) -> bool,
{
    (1..=limit)
        .map_while(|offset| reference.checked_add_days(Days::new(offset)))
        .find(|d| matches(*d))
}

/// The next `count` eligible dates after `reference`, in order
pub fn upcoming_dates(
    reference: NaiveDate,
    rule: &PeriodicityRule,
    count: usize,
) -> Result<Vec<NaiveDate>, PeriodicityError> {
    let mut dates = Vec::with_capacity(count);
    let mut cursor = reference;
    for _ in 0..count {
        cursor = next_date(cursor, rule)?;
        dates.push(cursor);
    }
    Ok(dates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn weekly(days: &[u8]) -> PeriodicityRule {
        PeriodicityRule::Weekly {
            week_days: days.iter().copied().collect(),
        }
    }

    fn monthly(days: &[u8]) -> PeriodicityRule {
        PeriodicityRule::Monthly {
            month_days: days.iter().copied().collect(),
        }
    }

    #[test]
    fn test_daily_adds_one_day() {
        let next = next_date(date(2026, 12, 31), &PeriodicityRule::Daily).unwrap();
        assert_eq!(next, date(2027, 1, 1));
    }

    #[test]
    fn test_custom_adds_interval() {
        let rule = PeriodicityRule::Custom { interval_days: 10 };
        assert_eq!(next_date(date(2026, 2, 25), &rule).unwrap(), date(2026, 3, 7));
    }

    #[test]
    fn test_weekly_thursday_to_friday() {
        // 2026-10-15 is a Thursday
        let thursday = date(2026, 10, 15);
        assert_eq!(thursday.weekday(), Weekday::Thu);

        let next = next_date(thursday, &weekly(&[1, 3, 5])).unwrap();
        assert_eq!(next, date(2026, 10, 16));
        assert_eq!(next.weekday(), Weekday::Fri);
    }

    #[test]
    fn test_weekly_wraps_to_next_week() {
        // Friday -> Monday
        let next = next_date(date(2026, 10, 16), &weekly(&[1, 3, 5])).unwrap();
        assert_eq!(next, date(2026, 10, 19));
    }

    #[test]
    fn test_weekly_same_weekday_is_a_week_later() {
        let sunday = date(2026, 10, 18);
        assert_eq!(next_date(sunday, &weekly(&[0])).unwrap(), date(2026, 10, 25));
    }

    #[test]
    fn test_window_opening_day_counts_when_admitted() {
        // 2026-05-01 is a Friday
        let opening = date(2026, 5, 1);
        assert_eq!(
            first_date_on_or_after(opening, &PeriodicityRule::Daily).unwrap(),
            opening
        );
        assert_eq!(
            first_date_on_or_after(opening, &PeriodicityRule::Custom { interval_days: 14 }).unwrap(),
            opening
        );
        assert_eq!(first_date_on_or_after(opening, &weekly(&[5])).unwrap(), opening);
        assert_eq!(
            first_date_on_or_after(opening, &weekly(&[1])).unwrap(),
            date(2026, 5, 4)
        );
        assert_eq!(
            first_date_on_or_after(opening, &monthly(&[15])).unwrap(),
            date(2026, 5, 15)
        );
    }

    #[test]
    fn test_first_date_rejects_invalid_rule() {
        assert_eq!(
            first_date_on_or_after(date(2026, 5, 1), &weekly(&[])),
            Err(PeriodicityError::EmptySet { field: "week_days" })
        );
    }

    #[test]
    fn test_monthly_skips_february_for_day_31() {
        let next = next_date(date(2026, 1, 31), &monthly(&[31])).unwrap();
        assert_eq!(next, date(2026, 3, 31));
    }

    #[test]
    fn test_monthly_day_29_in_leap_year() {
        assert_eq!(
            next_date(date(2028, 1, 29), &monthly(&[29])).unwrap(),
            date(2028, 2, 29)
        );
        assert_eq!(
            next_date(date(2027, 1, 29), &monthly(&[29])).unwrap(),
            date(2027, 3, 29)
        );
    }

    #[test]
    fn test_monthly_picks_earliest_of_several_days() {
        let rule = monthly(&[1, 15]);
        assert_eq!(next_date(date(2026, 3, 1), &rule).unwrap(), date(2026, 3, 15));
        assert_eq!(next_date(date(2026, 3, 15), &rule).unwrap(), date(2026, 4, 1));
    }

    #[test]
    fn test_monthly_day_31_longest_gap() {
        assert_eq!(
            next_date(date(2026, 5, 31), &monthly(&[31])).unwrap(),
            date(2026, 7, 31)
        );
    }

    #[test]
    fn test_invalid_rules_are_not_computable() {
        let reference = date(2026, 1, 1);
        assert_eq!(
            next_date(reference, &weekly(&[])),
            Err(PeriodicityError::EmptySet { field: "week_days" })
        );
        assert!(matches!(
            next_date(reference, &weekly(&[7])),
            Err(PeriodicityError::OutOfRange { value: 7, .. })
        ));
        assert!(matches!(
            next_date(reference, &monthly(&[0])),
            Err(PeriodicityError::OutOfRange { value: 0, .. })
        ));
        assert_eq!(
            next_date(reference, &PeriodicityRule::Custom { interval_days: 0 }),
            Err(PeriodicityError::ZeroInterval)
        );
    }

    #[test]
    fn test_from_fields_requires_matching_field() {
        let err = PeriodicityRule::from_fields(PeriodicityKind::Weekly, Some(3), None, None);
        assert_eq!(
            err,
            Err(PeriodicityError::MissingField {
                periodicity: PeriodicityKind::Weekly,
                field: "week_days",
            })
        );

        let err = PeriodicityRule::from_fields(PeriodicityKind::Custom, None, None, None);
        assert!(err.unwrap_err().to_string().contains("custom_interval"));
    }

    #[test]
    fn test_upcoming_dates() {
        let dates = upcoming_dates(date(2026, 10, 15), &weekly(&[1, 3, 5]), 4).unwrap();
        assert_eq!(
            dates,
            vec![
                date(2026, 10, 16),
                date(2026, 10, 19),
                date(2026, 10, 21),
                date(2026, 10, 23)
            ]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(weekly(&[5, 1, 3]).to_string(), "Weekly: Mon, Wed, Fri");
        assert_eq!(monthly(&[15, 1]).to_string(), "Monthly: days 1, 15");
        assert_eq!(
            PeriodicityRule::Custom { interval_days: 3 }.to_string(),
            "Every 3 days"
        );
    }

    fn any_date() -> impl Strategy<Value = NaiveDate> {
        (0i64..40_000).prop_map(|offset| date(1990, 1, 1) + chrono::Duration::days(offset))
    }

    proptest! {
        #[test]
        fn prop_daily_is_plus_one(d in any_date()) {
            prop_assert_eq!(next_date(d, &PeriodicityRule::Daily).unwrap(), d + chrono::Duration::days(1));
        }

        #[test]
        fn prop_custom_is_plus_interval(d in any_date(), n in 1u32..400) {
            let rule = PeriodicityRule::Custom { interval_days: n };
            prop_assert_eq!(next_date(d, &rule).unwrap(), d + chrono::Duration::days(i64::from(n)));
        }

        #[test]
        fn prop_weekly_is_earliest_match(
            d in any_date(),
            days in proptest::collection::btree_set(0u8..7, 1..7),
        ) {
            let rule = PeriodicityRule::Weekly { week_days: days.clone() };
            let next = next_date(d, &rule).unwrap();
            let gap = (next - d).num_days();
            prop_assert!((1..=7).contains(&gap));
            prop_assert!(days.contains(&(next.weekday().num_days_from_sunday() as u8)));
            for offset in 1..gap {
                let between = d + chrono::Duration::days(offset);
                prop_assert!(!days.contains(&(between.weekday().num_days_from_sunday() as u8)));
            }
        }

        #[test]
        fn prop_monthly_is_earliest_match(
            d in any_date(),
            days in proptest::collection::btree_set(1u8..=31, 1..5),
        ) {
            let rule = PeriodicityRule::Monthly { month_days: days.clone() };
            let next = next_date(d, &rule).unwrap();
            prop_assert!(next > d);
            prop_assert!(days.contains(&(next.day() as u8)));
            let mut between = d + chrono::Duration::days(1);
            while between < next {
                prop_assert!(!days.contains(&(between.day() as u8)));
                between = between + chrono::Duration::days(1);
            }
        }
    }
}
