use std::fmt;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::evaluation::error::NormalizationError;
use crate::evaluation::normalize::{
    CodeRule, normalize_amount, normalize_code, normalize_date, normalize_text, text_similarity,
};
use crate::schema::{FIELD_COUNT, Field, FieldKind, FieldSpec, NumberFormat, RawValue};

// Slack for binary floating point when applying the money epsilon.
const FLOAT_SLACK: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    TruePositive,
    FalsePositive,
    FalseNegative,
    TrueNegative,
    WrongValue,
}

impl VerdictKind {
    pub fn is_correct(self) -> bool {
        matches!(self, Self::TruePositive | Self::TrueNegative)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TruePositive => "true_positive",
            Self::FalsePositive => "false_positive",
            Self::FalseNegative => "false_negative",
            Self::TrueNegative => "true_negative",
            Self::WrongValue => "wrong_value",
        }
    }

    fn from_presence(expected: bool, actual: bool) -> Option<Self> {
        match (expected, actual) {
            (false, false) => Some(Self::TrueNegative),
            (false, true) => Some(Self::FalsePositive),
            (true, false) => Some(Self::FalseNegative),
            (true, true) => None,
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value after canonicalization, kept on the verdict for diagnostics.
/// `Unparsed` holds the raw text of a present value that failed to
/// normalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CanonicalValue {
    Date(NaiveDate),
    Amount(f64),
    Code(String),
    Text(String),
    Unparsed(String),
}

impl fmt::Display for CanonicalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Self::Amount(amount) => write!(f, "{amount:.2}"),
            Self::Code(value) | Self::Text(value) | Self::Unparsed(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldVerdict {
    pub field: Field,
    pub kind: VerdictKind,
    pub expected: Option<CanonicalValue>,
    pub actual: Option<CanonicalValue>,
    /// Fuzzy fields only; retained even when below threshold.
    #[serde(default)]
    pub similarity: Option<f64>,
    /// Why a present value could not be normalized.
    #[serde(default)]
    pub note: Option<String>,
}

/// Compiled comparison behavior for one field kind.
#[derive(Debug, Clone)]
pub enum FieldRule {
    Date,
    Money { epsilon: f64 },
    ExactCode(CodeRule),
    FuzzyText { threshold: f64 },
}

impl FieldRule {
    pub fn compile(kind: &FieldKind) -> Result<Self> {
        let rule = match kind {
            FieldKind::Date => Self::Date,
            FieldKind::Money { epsilon } => {
                if !epsilon.is_finite() || *epsilon < 0.0 {
                    bail!("money epsilon must be a non-negative number, got {epsilon}");
                }
                Self::Money { epsilon: *epsilon }
            }
            FieldKind::ExactCode {
                pattern,
                strip_chars,
                aliases,
            } => {
                let rule = CodeRule::new(pattern.as_deref(), strip_chars, aliases)
                    .with_context(|| {
                        format!("invalid code pattern: {}", pattern.as_deref().unwrap_or(""))
                    })?;
                Self::ExactCode(rule)
            }
            FieldKind::FuzzyText { threshold } => {
                if !(0.0..=1.0).contains(threshold) {
                    bail!("fuzzy threshold must lie within [0, 1], got {threshold}");
                }
                Self::FuzzyText {
                    threshold: *threshold,
                }
            }
        };
        Ok(rule)
    }

    /// Classifies one field. Null handling runs before any type-specific
    /// logic; for codes a value failing its pattern counts as null. A present
    /// value that fails to normalize yields `WrongValue`, never an error.
    pub fn compare(
        &self,
        field: Field,
        expected: Option<&RawValue>,
        actual: Option<&RawValue>,
        format: Option<NumberFormat>,
    ) -> FieldVerdict {
        let expected_canonical = expected.and_then(|value| self.canonicalize(value, format));
        let actual_canonical = actual.and_then(|value| self.canonicalize(value, format));

        let mut verdict = FieldVerdict {
            field,
            kind: VerdictKind::TrueNegative,
            expected: expected_canonical.clone().map(Canonical::into_value),
            actual: actual_canonical.clone().map(Canonical::into_value),
            similarity: None,
            note: None,
        };

        if let Some(kind) = VerdictKind::from_presence(
            expected_canonical.is_some(),
            actual_canonical.is_some(),
        ) {
            verdict.kind = kind;
            return verdict;
        }

        let (Some(expected), Some(actual)) = (expected_canonical, actual_canonical) else {
            return verdict;
        };

        match (expected.value, actual.value) {
            (Ok(expected), Ok(actual)) => {
                let (matched, similarity) = self.matches(&expected, &actual);
                verdict.kind = if matched {
                    VerdictKind::TruePositive
                } else {
                    VerdictKind::WrongValue
                };
                verdict.similarity = similarity;
            }
            (expected, actual) => {
                verdict.kind = VerdictKind::WrongValue;
                verdict.note = [("expected", expected.err()), ("actual", actual.err())]
                    .into_iter()
                    .filter_map(|(side, error)| error.map(|error| format!("{side}: {error}")))
                    .reduce(|left, right| format!("{left}; {right}"));
            }
        }

        verdict
    }

    /// `None` when the value counts as null: a code that fails its pattern.
    fn canonicalize(&self, raw: &RawValue, format: Option<NumberFormat>) -> Option<Canonical> {
        let value = match self {
            Self::Date => normalize_date(raw).map(CanonicalValue::Date),
            Self::Money { .. } => normalize_amount(raw, format).map(CanonicalValue::Amount),
            Self::ExactCode(rule) => Ok(CanonicalValue::Code(normalize_code(raw, rule)?)),
            Self::FuzzyText { .. } => Ok(CanonicalValue::Text(normalize_text(&raw.as_text()))),
        };
        Some(Canonical {
            raw: raw.as_text().into_owned(),
            value,
        })
    }

    fn matches(&self, expected: &CanonicalValue, actual: &CanonicalValue) -> (bool, Option<f64>) {
        match (self, expected, actual) {
            (Self::Date, CanonicalValue::Date(left), CanonicalValue::Date(right)) => {
                (left == right, None)
            }
            (Self::Money { epsilon }, CanonicalValue::Amount(left), CanonicalValue::Amount(right)) => {
                ((left - right).abs() <= epsilon + FLOAT_SLACK, None)
            }
            (
                Self::FuzzyText { threshold },
                CanonicalValue::Text(left),
                CanonicalValue::Text(right),
            ) => {
                let score = text_similarity(left, right);
                (score >= *threshold, Some(score))
            }
            (_, left, right) => (left == right, None),
        }
    }
}

#[derive(Debug, Clone)]
struct Canonical {
    raw: String,
    value: Result<CanonicalValue, NormalizationError>,
}

impl Canonical {
    fn into_value(self) -> CanonicalValue {
        self.value
            .unwrap_or_else(|_| CanonicalValue::Unparsed(self.raw))
    }
}

/// Field rules for the whole schema, in schema order.
#[derive(Debug, Clone)]
pub struct FieldComparator {
    rules: Vec<FieldRule>,
}

impl FieldComparator {
    pub fn new(specs: &[FieldSpec]) -> Result<Self> {
        let mut rules = Field::ALL
            .into_iter()
            .map(|field| FieldRule::compile(&field.default_kind()))
            .collect::<Result<Vec<_>>>()?;

        for spec in specs {
            rules[spec.field.index()] = FieldRule::compile(&spec.kind)
                .with_context(|| format!("invalid configuration for field `{}`", spec.field))?;
        }

        debug_assert_eq!(rules.len(), FIELD_COUNT);
        Ok(Self { rules })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(&FieldSpec::defaults())
    }

    pub fn rule(&self, field: Field) -> &FieldRule {
        &self.rules[field.index()]
    }

    pub fn compare(
        &self,
        field: Field,
        expected: Option<&RawValue>,
        actual: Option<&RawValue>,
        format: Option<NumberFormat>,
    ) -> FieldVerdict {
        self.rule(field).compare(field, expected, actual, format)
    }
}
