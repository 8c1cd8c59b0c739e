use std::ops::AddAssign;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::evaluation::compare::{FieldVerdict, VerdictKind};
use crate::evaluation::error::AggregateError;
use crate::evaluation::score::DocumentScore;
use crate::schema::{FIELD_COUNT, Field};

/// Per-field verdict tallies. `wrong_value` is kept apart and counted into
/// both the false positive and the false negative totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub true_positive: u64,
    pub false_positive: u64,
    pub false_negative: u64,
    pub true_negative: u64,
    pub wrong_value: u64,
}

impl ConfusionCounts {
    pub fn record(&mut self, kind: VerdictKind) {
        match kind {
            VerdictKind::TruePositive => self.true_positive += 1,
            VerdictKind::FalsePositive => self.false_positive += 1,
            VerdictKind::FalseNegative => self.false_negative += 1,
            VerdictKind::TrueNegative => self.true_negative += 1,
            VerdictKind::WrongValue => self.wrong_value += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.true_positive
            + self.false_positive
            + self.false_negative
            + self.true_negative
            + self.wrong_value
    }

    pub fn correct(&self) -> u64 {
        self.true_positive + self.true_negative
    }

    pub fn precision(&self) -> Option<f64> {
        ratio(
            self.true_positive,
            self.true_positive + self.false_positive + self.wrong_value,
        )
    }

    pub fn recall(&self) -> Option<f64> {
        ratio(
            self.true_positive,
            self.true_positive + self.false_negative + self.wrong_value,
        )
    }

    pub fn f1(&self) -> Option<f64> {
        f1_score(self.precision(), self.recall())
    }
}

impl AddAssign for ConfusionCounts {
    fn add_assign(&mut self, other: Self) {
        self.true_positive += other.true_positive;
        self.false_positive += other.false_positive;
        self.false_negative += other.false_negative;
        self.true_negative += other.true_negative;
        self.wrong_value += other.wrong_value;
    }
}

/// `None` is the undefined sentinel for a zero denominator; a measured zero
/// stays `Some(0.0)`.
fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

fn f1_score(precision: Option<f64>, recall: Option<f64>) -> Option<f64> {
    let (precision, recall) = (precision?, recall?);
    if precision + recall == 0.0 {
        return None;
    }
    Some(2.0 * precision * recall / (precision + recall))
}

fn mean_seconds(total: Duration, count: u64) -> Option<f64> {
    if count == 0 {
        None
    } else {
        Some(total.as_secs_f64() / count as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetrics {
    pub field: Field,
    pub counts: ConfusionCounts,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

/// Finalized metrics of one pipeline variant. Every `Option<f64>` is
/// `None` when its denominator was zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunMetrics {
    pub variant_id: String,
    pub fields: Vec<FieldMetrics>,
    pub totals: ConfusionCounts,
    pub accuracy: Option<f64>,
    pub success_rate: Option<f64>,
    pub mean_duration_s: Option<f64>,
    pub acceptance_rate: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub documents: u64,
    pub failed_documents: u64,
    pub schema_violations: u64,
    pub mean_llm_duration_s: Option<f64>,
}

#[cfg(test)]
impl PipelineRunMetrics {
    pub fn field(&self, field: Field) -> &FieldMetrics {
        &self.fields[field.index()]
    }
}

/// Running counters of one pipeline variant. Partial aggregators built on
/// separate workers combine with `merge`; addition keeps it associative and
/// commutative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricAggregator {
    variant_id: String,
    fields: [ConfusionCounts; FIELD_COUNT],
    documents: u64,
    fully_correct: u64,
    accepted: u64,
    failed_documents: u64,
    schema_violations: u64,
    duration_total: Duration,
    llm_duration_total: Duration,
    llm_duration_count: u64,
}

impl MetricAggregator {
    pub fn new(variant_id: &str) -> Self {
        Self {
            variant_id: variant_id.to_string(),
            fields: [ConfusionCounts::default(); FIELD_COUNT],
            documents: 0,
            fully_correct: 0,
            accepted: 0,
            failed_documents: 0,
            schema_violations: 0,
            duration_total: Duration::ZERO,
            llm_duration_total: Duration::ZERO,
            llm_duration_count: 0,
        }
    }

    pub fn ingest(&mut self, score: &DocumentScore) {
        self.ingest_verdicts(&score.verdicts);

        self.documents += 1;
        self.fully_correct += u64::from(score.fully_correct);
        self.accepted += u64::from(score.accepted);
        self.failed_documents += u64::from(score.is_failure());
        self.duration_total += score.duration;
        if let Some(llm_duration) = score.llm_duration {
            self.llm_duration_total += llm_duration;
            self.llm_duration_count += 1;
        }
    }

    fn ingest_verdicts(&mut self, verdicts: &[FieldVerdict]) {
        for verdict in verdicts {
            self.fields[verdict.field.index()].record(verdict.kind);
        }
    }

    /// A pair whose extraction broke the schema contract. Counted only; its
    /// verdicts never enter the confusion counts.
    pub fn record_schema_violation(&mut self) {
        self.schema_violations += 1;
    }

    pub fn merge(mut self, other: &MetricAggregator) -> Result<Self, AggregateError> {
        if self.variant_id != other.variant_id {
            return Err(AggregateError::VariantMismatch {
                left: self.variant_id,
                right: other.variant_id.clone(),
            });
        }

        for (counts, other_counts) in self.fields.iter_mut().zip(other.fields) {
            *counts += other_counts;
        }
        self.documents += other.documents;
        self.fully_correct += other.fully_correct;
        self.accepted += other.accepted;
        self.failed_documents += other.failed_documents;
        self.schema_violations += other.schema_violations;
        self.duration_total += other.duration_total;
        self.llm_duration_total += other.llm_duration_total;
        self.llm_duration_count += other.llm_duration_count;

        Ok(self)
    }

    pub fn finalize(&self) -> PipelineRunMetrics {
        let fields = Field::ALL
            .into_iter()
            .map(|field| {
                let counts = self.fields[field.index()];
                FieldMetrics {
                    field,
                    counts,
                    precision: counts.precision(),
                    recall: counts.recall(),
                    f1: counts.f1(),
                }
            })
            .collect::<Vec<_>>();

        let mut totals = ConfusionCounts::default();
        for counts in self.fields {
            totals += counts;
        }

        PipelineRunMetrics {
            variant_id: self.variant_id.clone(),
            fields,
            totals,
            accuracy: ratio(totals.correct(), totals.total()),
            success_rate: ratio(self.fully_correct, self.documents),
            mean_duration_s: mean_seconds(self.duration_total, self.documents),
            acceptance_rate: ratio(self.accepted, self.documents),
            precision: totals.precision(),
            recall: totals.recall(),
            f1: totals.f1(),
            documents: self.documents,
            failed_documents: self.failed_documents,
            schema_violations: self.schema_violations,
            mean_llm_duration_s: mean_seconds(self.llm_duration_total, self.llm_duration_count),
        }
    }
}
