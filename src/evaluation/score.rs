use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::evaluation::compare::{FieldComparator, FieldVerdict, VerdictKind};
use crate::schema::{Field, GroundTruthRecord, InvoiceFields, NumberFormat};

/// Fields that must be correct for automated posting when the purchase order
/// number was extracted correctly.
const PO_POSTING_FIELDS: [Field; 2] = [Field::RecipientName, Field::InvoiceDate];

/// Fields that must be correct for automated posting without a purchase
/// order match; at least one of `PAYMENT_IDENTIFIERS` must be correct too.
const FULL_POSTING_FIELDS: [Field; 5] = [
    Field::RecipientName,
    Field::InvoiceNumber,
    Field::InvoiceDate,
    Field::TotalAmount,
    Field::Currency,
];
const PAYMENT_IDENTIFIERS: [Field; 2] = [Field::Iban, Field::UstId];

#[derive(Debug, Clone, PartialEq)]
pub struct RecordScore {
    /// One verdict per schema field, in schema order.
    pub verdicts: Vec<FieldVerdict>,
    pub fully_correct: bool,
    pub accepted: bool,
}

#[cfg(test)]
impl RecordScore {
    pub fn verdict(&self, field: Field) -> &FieldVerdict {
        &self.verdicts[field.index()]
    }
}

/// Scored outcome of one (document, variant) pair, as streamed out of the
/// runner and persisted in the score store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentScore {
    pub document_id: String,
    pub variant_id: String,
    pub verdicts: Vec<FieldVerdict>,
    pub fully_correct: bool,
    pub accepted: bool,
    pub duration: Duration,
    pub llm_duration: Option<Duration>,
    /// Set when extraction failed or timed out and the document was scored
    /// as entirely absent.
    pub failure: Option<String>,
}

impl DocumentScore {
    pub fn from_record(
        document_id: &str,
        variant_id: &str,
        score: RecordScore,
        duration: Duration,
        llm_duration: Option<Duration>,
        failure: Option<String>,
    ) -> Self {
        Self {
            document_id: document_id.to_string(),
            variant_id: variant_id.to_string(),
            verdicts: score.verdicts,
            fully_correct: score.fully_correct,
            accepted: score.accepted,
            duration,
            llm_duration,
            failure,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RecordScorer {
    comparator: FieldComparator,
    default_format: Option<NumberFormat>,
}

impl RecordScorer {
    pub fn new(comparator: FieldComparator, default_format: Option<NumberFormat>) -> Self {
        Self {
            comparator,
            default_format,
        }
    }

    /// Deterministic: the same inputs always produce the same verdicts.
    pub fn score(&self, ground_truth: &GroundTruthRecord, extraction: &InvoiceFields) -> RecordScore {
        let format = ground_truth.number_format.or(self.default_format);

        let verdicts = Field::ALL
            .into_iter()
            .map(|field| {
                self.comparator.compare(
                    field,
                    ground_truth.fields.get(field),
                    extraction.get(field),
                    format,
                )
            })
            .collect::<Vec<_>>();

        let fully_correct = verdicts.iter().all(|verdict| verdict.kind.is_correct());
        let accepted = posting_accepted(&verdicts);

        RecordScore {
            verdicts,
            fully_correct,
            accepted,
        }
    }

    /// What a failed or timed-out extraction is worth: every field absent.
    pub fn score_failure(&self, ground_truth: &GroundTruthRecord) -> RecordScore {
        self.score(ground_truth, &InvoiceFields::empty())
    }
}

fn posting_accepted(verdicts: &[FieldVerdict]) -> bool {
    let correct = |field: Field| verdicts[field.index()].kind.is_correct();

    if verdicts[Field::PurchaseOrderNumber.index()].kind == VerdictKind::TruePositive {
        return PO_POSTING_FIELDS.into_iter().all(correct);
    }

    FULL_POSTING_FIELDS.into_iter().all(correct) && PAYMENT_IDENTIFIERS.into_iter().any(correct)
}
