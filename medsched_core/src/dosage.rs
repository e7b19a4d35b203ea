//! Dosage progression for titrated treatments.
//!
//! A dosage is written as `<number><unit>` ("50mg", "2 comprimidos").
//! Progression rules:
//! - Stable: the base dosage is returned as entered
//! - Increase / Decrease: one step every `interval` doses, by a percentage
//!   of the running value (compounding) or by an absolute amount
//! - An optional target caps an increase or floors a decrease
//!
//! Discrete forms (tablets, drops, ...) round to whole units, everything
//! else to one decimal.

use crate::types::DosageProgression;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

static DISCRETE_UNITS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "comprimido",
        "comprimidos",
        "cápsula",
        "cápsulas",
        "capsula",
        "capsulas",
        "gota",
        "gotas",
        "unidade",
        "unidades",
        "sachê",
        "sachês",
        "sache",
        "saches",
        "pipeta",
        "pipetas",
        "tablet",
        "tablets",
        "capsule",
        "capsules",
        "pill",
        "pills",
        "drop",
        "drops",
        "unit",
        "units",
        "sachet",
        "sachets",
        "pipette",
        "pipettes",
    ]
    .into_iter()
    .collect()
});

/// A dosage, rate or target that cannot be used for progression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DosageError {
    #[error("`{field}` has no leading amount: {input:?}")]
    Malformed { field: &'static str, input: String },

    #[error("`{field}` unit {found:?} does not match dosage unit {expected:?}")]
    UnitMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("`{field}` is required when the dosage progresses")]
    MissingField { field: &'static str },

    #[error("`progression_interval` must be at least 1 dose")]
    ZeroInterval,
}

// ============================================================================
// Dosage Expressions
// ============================================================================

/// A parsed `<number><unit>` dosage
#[derive(Debug, Clone, PartialEq)]
pub struct DosageExpression {
    pub value: f64,
    pub unit: String,
    /// Whether a space separated the amount from the unit
    spaced: bool,
}

impl DosageExpression {
    /// Parse an expression, naming `field` in the error
    pub fn parse(input: &str, field: &'static str) -> Result<Self, DosageError> {
        let malformed = || DosageError::Malformed {
            field,
            input: input.to_string(),
        };

        let trimmed = input.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (amount, rest) = trimmed.split_at(split);

        if amount.is_empty() {
            return Err(malformed());
        }
        let value: f64 = amount.parse().map_err(|_| malformed())?;

        Ok(Self {
            value,
            unit: rest.trim().to_string(),
            spaced: rest.starts_with(char::is_whitespace),
        })
    }

    /// Unit comparison is case-insensitive
    pub fn same_unit(&self, unit: &str) -> bool {
        self.unit.to_lowercase() == unit.to_lowercase()
    }

    /// Tablets, drops and similar forms that cannot be split
    pub fn is_discrete(&self) -> bool {
        DISCRETE_UNITS.contains(self.unit.to_lowercase().as_str())
    }

    fn with_value(&self, value: f64) -> Self {
        Self {
            value,
            unit: self.unit.clone(),
            spaced: self.spaced,
        }
    }
}

impl FromStr for DosageExpression {
    type Err = DosageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, "dosage")
    }
}

impl fmt::Display for DosageExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let amount = format_amount(round_amount(self.value, self.is_discrete()));
        if self.unit.is_empty() {
            write!(f, "{}", amount)
        } else if self.spaced {
            write!(f, "{} {}", amount, self.unit)
        } else {
            write!(f, "{}{}", amount, self.unit)
        }
    }
}

fn round_amount(value: f64, discrete: bool) -> f64 {
    let rounded = if discrete {
        value.round()
    } else {
        (value * 10.0).round() / 10.0
    };
    // Normalise -0.0
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.1}", value)
    }
}

// ============================================================================
// Progression Rules
// ============================================================================

/// Step size of a progression
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressionRate {
    /// Percentage of the running value per step
    Percent(f64),
    /// Fixed amount per step, in the dosage unit
    Absolute(DosageExpression),
}

impl ProgressionRate {
    pub fn parse(input: &str) -> Result<Self, DosageError> {
        let trimmed = input.trim();
        match trimmed.strip_suffix('%') {
            Some(percent) => {
                let parsed = DosageExpression::parse(percent, "progression_rate")?;
                if !parsed.unit.is_empty() {
                    return Err(DosageError::Malformed {
                        field: "progression_rate",
                        input: input.to_string(),
                    });
                }
                Ok(ProgressionRate::Percent(parsed.value))
            }
            None => Ok(ProgressionRate::Absolute(DosageExpression::parse(
                trimmed,
                "progression_rate",
            )?)),
        }
    }
}

/// The titration plan of a schedule, as stored
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressionRule {
    pub progression: DosageProgression,
    /// "10%" or an absolute amount such as "5mg"
    pub rate: Option<String>,
    /// Doses between two progression steps
    pub interval: Option<u32>,
    pub target: Option<String>,
}

impl ProgressionRule {
    pub fn stable() -> Self {
        Self::default()
    }

    pub fn new(progression: DosageProgression, rate: &str, interval: u32) -> Self {
        Self {
            progression,
            rate: Some(rate.to_string()),
            interval: Some(interval),
            target: None,
        }
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }
}

/// A progression rule checked against its base dosage
struct ResolvedPlan {
    base: DosageExpression,
    increasing: bool,
    rate: ProgressionRate,
    interval: u32,
    target: Option<f64>,
}

impl ResolvedPlan {
    /// Returns `None` for stable plans
    fn resolve(base: &DosageExpression, rule: &ProgressionRule) -> Result<Option<Self>, DosageError> {
        let increasing = match rule.progression {
            DosageProgression::Stable => return Ok(None),
            DosageProgression::Increase => true,
            DosageProgression::Decrease => false,
        };

        let rate = rule
            .rate
            .as_deref()
            .ok_or(DosageError::MissingField {
                field: "progression_rate",
            })
            .and_then(ProgressionRate::parse)?;

        if let ProgressionRate::Absolute(delta) = &rate {
            if !delta.unit.is_empty() && !base.same_unit(&delta.unit) {
                return Err(DosageError::UnitMismatch {
                    field: "progression_rate",
                    expected: base.unit.clone(),
                    found: delta.unit.clone(),
                });
            }
        }

        let interval = rule.interval.ok_or(DosageError::MissingField {
            field: "progression_interval",
        })?;
        if interval == 0 {
            return Err(DosageError::ZeroInterval);
        }

        let target = match rule.target.as_deref() {
            Some(raw) => {
                let target = DosageExpression::parse(raw, "target_dosage")?;
                if !target.unit.is_empty() && !base.same_unit(&target.unit) {
                    return Err(DosageError::UnitMismatch {
                        field: "target_dosage",
                        expected: base.unit.clone(),
                        found: target.unit,
                    });
                }
                Some(target.value)
            }
            None => None,
        };

        Ok(Some(Self {
            base: base.clone(),
            increasing,
            rate,
            interval,
            target,
        }))
    }

    fn steps(&self, dose_index: u32) -> u32 {
        dose_index / self.interval
    }

    /// Unrounded value at `dose_index`, clamped to the target
    fn value_at(&self, dose_index: u32) -> f64 {
        let steps = self.steps(dose_index);
        let base = self.base.value;

        let raw = match (&self.rate, self.increasing) {
            (ProgressionRate::Percent(p), true) => base * (1.0 + p / 100.0).powf(f64::from(steps)),
            (ProgressionRate::Percent(p), false) => {
                base * (1.0 - p / 100.0).max(0.0).powf(f64::from(steps))
            }
            (ProgressionRate::Absolute(delta), true) => base + f64::from(steps) * delta.value,
            (ProgressionRate::Absolute(delta), false) => base - f64::from(steps) * delta.value,
        };
        let raw = raw.max(0.0);

        match self.bound() {
            Some(bound) if self.increasing => raw.min(bound),
            Some(bound) => raw.max(bound),
            None => raw,
        }
    }

    /// The effective clamp. A target already behind the base holds the dose at base.
    fn bound(&self) -> Option<f64> {
        self.target.map(|target| {
            if self.increasing {
                target.max(self.base.value)
            } else {
                target.min(self.base.value)
            }
        })
    }

    fn dosage_at(&self, dose_index: u32) -> DosageExpression {
        let discrete = self.base.is_discrete();
        let mut value = round_amount(self.value_at(dose_index), discrete);

        // Rounding must not carry the dose past the target
        if let Some(bound) = self.bound() {
            let step = if discrete { 1.0 } else { 0.1 };
            if self.increasing && value > bound {
                value = round_amount(value - step, discrete);
            } else if !self.increasing && value < bound {
                value = round_amount(value + step, discrete);
            }
        }

        self.base.with_value(value)
    }
}

/// Dosage to administer at `dose_index` under `rule`.
///
/// The base dosage is validated even for stable plans; a malformed entry is
/// an error, never a silent fallback.
pub fn dosage_at_index(
    base_dosage: &str,
    rule: &ProgressionRule,
    dose_index: u32,
) -> Result<String, DosageError> {
    let base = DosageExpression::parse(base_dosage, "dosage")?;

    let Some(plan) = ResolvedPlan::resolve(&base, rule)? else {
        return Ok(base_dosage.to_string());
    };

    if plan.steps(dose_index) == 0 {
        return Ok(base_dosage.to_string());
    }

    let dosage = plan.dosage_at(dose_index).to_string();
    tracing::debug!(
        "Dosage at index {} ({} steps): {} -> {}",
        dose_index,
        plan.steps(dose_index),
        base_dosage,
        dosage
    );
    Ok(dosage)
}

/// One row of a dosage preview
#[derive(Debug, Clone, PartialEq)]
pub struct DosePreview {
    pub dose_index: u32,
    pub dosage: String,
}

/// Dosages the next `count` scheduling calls would produce
pub fn dosage_preview(
    base_dosage: &str,
    rule: &ProgressionRule,
    current_dose_count: u32,
    count: u32,
) -> Result<Vec<DosePreview>, DosageError> {
    (1..=count)
        .map(|offset| {
            let dose_index = current_dose_count.saturating_add(offset);
            dosage_at_index(base_dosage, rule, dose_index).map(|dosage| DosePreview {
                dose_index,
                dosage,
            })
        })
        .collect()
}

/// Whether progression has completed by `dose_index`
pub fn has_reached_target(
    base_dosage: &str,
    rule: &ProgressionRule,
    dose_index: u32,
) -> Result<bool, DosageError> {
    let base = DosageExpression::parse(base_dosage, "dosage")?;
    let Some(plan) = ResolvedPlan::resolve(&base, rule)? else {
        return Ok(false);
    };
    let Some(bound) = plan.bound() else {
        return Ok(false);
    };

    let value = plan.value_at(dose_index);
    Ok(if plan.increasing {
        value >= bound
    } else {
        value <= bound
    })
}
