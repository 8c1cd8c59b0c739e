use std::path::Path;

use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};

use crate::evaluation::aggregate::PipelineRunMetrics;
use crate::evaluation::score::DocumentScore;
use crate::model::DetailRow;
use crate::schema::Field;
use crate::util::{ensure_directory, format_metric};

pub const RESULTS_FILE: &str = "results.csv";
pub const SUMMARY_FILE: &str = "summary.csv";
pub const DETAILS_FILE: &str = "details.csv";

/// Column names of `DetailRow`, written up front so an empty run still
/// produces a header.
const DETAILS_HEADER: [&str; 8] = [
    "pipeline",
    "document_id",
    "field",
    "verdict",
    "expected",
    "actual",
    "similarity",
    "note",
];

const RESULTS_TRAILING_COLUMNS: [&str; 11] = [
    "accuracy",
    "success_rate",
    "mean_duration_s",
    "acceptance_rate",
    "precision",
    "recall",
    "f1",
    "documents",
    "failed_documents",
    "schema_violations",
    "mean_llm_duration_s",
];

/// `pipeline`, per-field precision, recall and F1 in schema order, then the
/// overall columns.
pub fn results_header() -> Vec<String> {
    let mut header = vec!["pipeline".to_string()];
    for metric in ["precision", "recall", "f1"] {
        header.extend(Field::ALL.iter().map(|field| format!("{}_{metric}", field.key())));
    }
    header.extend(RESULTS_TRAILING_COLUMNS.iter().map(|column| column.to_string()));
    header
}

fn results_row(metrics: &PipelineRunMetrics) -> Vec<String> {
    let mut row = vec![metrics.variant_id.clone()];
    row.extend(metrics.fields.iter().map(|field| format_metric(field.precision)));
    row.extend(metrics.fields.iter().map(|field| format_metric(field.recall)));
    row.extend(metrics.fields.iter().map(|field| format_metric(field.f1)));
    row.extend([
        format_metric(metrics.accuracy),
        format_metric(metrics.success_rate),
        format_metric(metrics.mean_duration_s),
        format_metric(metrics.acceptance_rate),
        format_metric(metrics.precision),
        format_metric(metrics.recall),
        format_metric(metrics.f1),
        metrics.documents.to_string(),
        metrics.failed_documents.to_string(),
        metrics.schema_violations.to_string(),
        format_metric(metrics.mean_llm_duration_s),
    ]);
    row
}

pub fn write_results_csv(path: &Path, metrics: &[PipelineRunMetrics]) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer
        .write_record(results_header())
        .with_context(|| format!("failed to write header: {}", path.display()))?;
    for entry in metrics {
        writer
            .write_record(results_row(entry))
            .with_context(|| format!("failed to write results row: {}", path.display()))?;
    }
    finish(writer, path)
}

pub fn summary_header() -> Vec<String> {
    let mut header = [
        "pipeline",
        "document_id",
        "fully_correct",
        "accepted",
        "duration_s",
        "llm_duration_s",
        "failure",
    ]
    .iter()
    .map(|column| column.to_string())
    .collect::<Vec<_>>();
    header.extend(Field::ALL.iter().map(|field| field.key().to_string()));
    header
}

fn summary_row(score: &DocumentScore) -> Vec<String> {
    let flag = |value: bool| if value { "1" } else { "0" }.to_string();

    let mut row = vec![
        score.variant_id.clone(),
        score.document_id.clone(),
        flag(score.fully_correct),
        flag(score.accepted),
        format!("{:.3}", score.duration.as_secs_f64()),
        score
            .llm_duration
            .map(|duration| format!("{:.3}", duration.as_secs_f64()))
            .unwrap_or_default(),
        score.failure.clone().unwrap_or_default(),
    ];
    row.extend(score.verdicts.iter().map(|verdict| flag(verdict.kind.is_correct())));
    row
}

pub fn write_summary_csv(path: &Path, scores: &[DocumentScore]) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer
        .write_record(summary_header())
        .with_context(|| format!("failed to write header: {}", path.display()))?;
    for score in scores {
        writer
            .write_record(summary_row(score))
            .with_context(|| format!("failed to write summary row: {}", path.display()))?;
    }
    finish(writer, path)
}

pub fn detail_rows(score: &DocumentScore) -> Vec<DetailRow> {
    score
        .verdicts
        .iter()
        .map(|verdict| DetailRow {
            pipeline: score.variant_id.clone(),
            document_id: score.document_id.clone(),
            field: verdict.field.key().to_string(),
            verdict: verdict.kind.as_str().to_string(),
            expected: verdict
                .expected
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            actual: verdict
                .actual
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            similarity: verdict
                .similarity
                .map(|score| format!("{score:.4}"))
                .unwrap_or_default(),
            note: verdict.note.clone().unwrap_or_default(),
        })
        .collect()
}

pub fn write_details_csv(path: &Path, scores: &[DocumentScore]) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer
        .write_record(DETAILS_HEADER)
        .with_context(|| format!("failed to write header: {}", path.display()))?;
    for score in scores {
        for row in detail_rows(score) {
            writer
                .serialize(row)
                .with_context(|| format!("failed to write detail row: {}", path.display()))?;
        }
    }
    finish(writer, path)
}

fn create_writer(path: &Path) -> Result<Writer<std::fs::File>> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }
    // Every file writes its header explicitly.
    WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to create csv file: {}", path.display()))
}

fn finish(mut writer: Writer<std::fs::File>, path: &Path) -> Result<()> {
    writer
        .flush()
        .with_context(|| format!("failed to flush csv file: {}", path.display()))
}
