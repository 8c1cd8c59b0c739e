use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::cli::ScoreArgs;
use crate::config::BenchmarkConfig;
use crate::evaluation::compare::FieldVerdict;
use crate::evaluation::score::{RecordScore, RecordScorer};
use crate::extractors::parse_payload;
use crate::schema::{GroundTruthRecord, InvoiceFields, NumberFormat};

#[derive(Debug, Serialize)]
struct ScoreReport<'a> {
    document_id: &'a str,
    fully_correct: bool,
    accepted: bool,
    verdicts: &'a [FieldVerdict],
}

pub fn run(args: ScoreArgs) -> Result<()> {
    let config = BenchmarkConfig::load(args.config.as_deref())?;
    let number_format = args
        .number_format
        .map(NumberFormat::from)
        .or(config.default_number_format);
    let scorer = RecordScorer::new(config.comparator()?, number_format);

    let ground_truth = load_ground_truth(&args.ground_truth)?;
    let extraction = load_extraction(&args.extraction)?;
    let score = scorer.score(&ground_truth, &extraction);

    info!(
        document = %ground_truth.document_id,
        fully_correct = score.fully_correct,
        accepted = score.accepted,
        "scored extraction"
    );

    let mut output = io::BufWriter::new(io::stdout().lock());
    if args.json {
        write_json(&mut output, &ground_truth.document_id, &score)?;
    } else {
        write_table(&mut output, &ground_truth.document_id, &score)?;
    }
    output.flush()?;
    Ok(())
}

fn load_ground_truth(path: &Path) -> Result<GroundTruthRecord> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read ground truth: {}", path.display()))?;
    let value: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse ground truth: {}", path.display()))?;
    let document_id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    GroundTruthRecord::from_json(&document_id, &value)
        .with_context(|| format!("invalid ground truth: {}", path.display()))
}

fn load_extraction(path: &Path) -> Result<InvoiceFields> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read extraction: {}", path.display()))?;
    let output = parse_payload(&raw)
        .with_context(|| format!("failed to parse extraction: {}", path.display()))?;

    InvoiceFields::from_json_object(&output.fields)
        .with_context(|| format!("extraction breaks the schema: {}", path.display()))
}

fn write_json(output: &mut impl Write, document_id: &str, score: &RecordScore) -> Result<()> {
    let report = ScoreReport {
        document_id,
        fully_correct: score.fully_correct,
        accepted: score.accepted,
        verdicts: &score.verdicts,
    };
    serde_json::to_writer_pretty(&mut *output, &report)
        .context("failed to serialize score json output")?;
    writeln!(output)?;
    Ok(())
}

fn write_table(output: &mut impl Write, document_id: &str, score: &RecordScore) -> Result<()> {
    writeln!(output, "Document: {document_id}")?;
    for verdict in &score.verdicts {
        let expected = verdict
            .expected
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        let actual = verdict
            .actual
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());

        write!(
            output,
            "{:<22}\t{:<15}\texpected={expected}\tactual={actual}",
            verdict.field.key(),
            verdict.kind.as_str(),
        )?;
        if let Some(similarity) = verdict.similarity {
            write!(output, "\tsimilarity={similarity:.4}")?;
        }
        if let Some(note) = &verdict.note {
            write!(output, "\tnote={note}")?;
        }
        writeln!(output)?;
    }
    writeln!(
        output,
        "fully_correct={} accepted={}",
        score.fully_correct, score.accepted
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::evaluation::compare::FieldComparator;

    const LABEL: &str = r#"{
      "invoice_number": "RE-77",
      "invoice_date": "05.01.2021",
      "vendor_name": "Müller & Söhne GmbH",
      "recipient_name": "Beispiel AG",
      "total_amount": 1190.00,
      "currency": "EUR",
      "tax_rate": 19,
      "purchase_order_number": null,
      "ust-id": "DE123456789",
      "iban": null
    }"#;

    fn score_files(extraction: &str) -> (String, RecordScore) {
        let directory = tempdir().expect("temp dir");
        let label_path = directory.path().join("inv-77.json");
        let extraction_path = directory.path().join("inv-77.out");
        fs::write(&label_path, LABEL).expect("label written");
        fs::write(&extraction_path, extraction).expect("extraction written");

        let truth = load_ground_truth(&label_path).expect("label loads");
        let fields = load_extraction(&extraction_path).expect("extraction loads");
        let scorer = RecordScorer::new(
            FieldComparator::with_defaults().expect("default rules compile"),
            None,
        );
        (truth.document_id.clone(), scorer.score(&truth, &fields))
    }

    #[test]
    fn table_lists_every_field_with_verdict() {
        let (document_id, score) = score_files(
            r#"{"fields": {
              "invoice_number": "RE-77",
              "invoice_date": "2021-01-05",
              "vendor_name": "Mueller und Soehne GmbH",
              "recipient_name": "Beispiel AG",
              "total_amount": "1.190,00",
              "currency": "EUR",
              "tax_rate": "19%",
              "purchase_order_number": "",
              "ust-id": "DE123456789",
              "iban": "DE02120300000000202051"
            }, "duration_s": 4.2}"#,
        );
        assert_eq!(document_id, "inv-77");

        let mut buffer = Vec::new();
        write_table(&mut buffer, &document_id, &score).expect("table written");
        let text = String::from_utf8(buffer).expect("utf-8 output");

        assert!(text.starts_with("Document: inv-77\n"));
        assert_eq!(text.lines().count(), 12);
        assert!(text.contains("total_amount"));
        assert!(text.contains("iban                  \tfalse_positive"));
        assert!(text.contains("fully_correct=false"));
    }

    #[test]
    fn json_output_carries_verdicts() {
        let (document_id, score) = score_files(LABEL);

        let mut buffer = Vec::new();
        write_json(&mut buffer, &document_id, &score).expect("json written");
        let value: Value = serde_json::from_slice(&buffer).expect("valid json");

        assert_eq!(value["document_id"], "inv-77");
        assert_eq!(value["fully_correct"], true);
        assert_eq!(value["verdicts"].as_array().map(Vec::len), Some(10));
        assert_eq!(value["verdicts"][1]["kind"], "true_positive");
        assert_eq!(value["verdicts"][1]["expected"]["type"], "date");
        assert_eq!(value["verdicts"][1]["expected"]["value"], "2021-01-05");
    }

    #[test]
    fn missing_key_in_extraction_is_an_error() {
        let directory = tempdir().expect("temp dir");
        let path = directory.path().join("broken.json");
        fs::write(&path, r#"{"invoice_number": "RE-77"}"#).expect("extraction written");

        let error = load_extraction(&path).expect_err("schema violation");
        assert!(format!("{error:#}").contains("missing schema field"));
    }
}
