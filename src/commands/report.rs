use std::collections::BTreeMap;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::ReportArgs;
use crate::evaluation::aggregate::{MetricAggregator, PipelineRunMetrics};
use crate::evaluation::score::DocumentScore;
use crate::output::{
    DETAILS_FILE, RESULTS_FILE, SUMMARY_FILE, write_details_csv, write_results_csv,
    write_summary_csv,
};
use crate::store::ScoreStore;

pub fn run(args: ReportArgs) -> Result<()> {
    if !args.store_path.exists() {
        bail!("score store not found: {}", args.store_path.display());
    }

    let store = ScoreStore::open(&args.store_path)?;
    let schema_version = store.schema_version()?.unwrap_or_default();
    let mut scores = store.load_scores()?;
    if !args.variants.is_empty() {
        scores.retain(|score| args.variants.contains(&score.variant_id));
        for variant in &args.variants {
            if !scores.iter().any(|score| &score.variant_id == variant) {
                warn!(variant = %variant, "no stored scores for variant");
            }
        }
    }
    if scores.is_empty() {
        bail!("no stored scores to report in {}", args.store_path.display());
    }

    let metrics = aggregate_by_variant(&scores);
    write_results_csv(&args.output_dir.join(RESULTS_FILE), &metrics)?;
    if args.details {
        write_summary_csv(&args.output_dir.join(SUMMARY_FILE), &scores)?;
        write_details_csv(&args.output_dir.join(DETAILS_FILE), &scores)?;
    }

    info!(
        store = %args.store_path.display(),
        schema_version = %schema_version,
        variants = metrics.len(),
        documents = scores.len(),
        output_dir = %args.output_dir.display(),
        "report written"
    );
    Ok(())
}

/// Variants in name order. Schema violations are not stored, so their count
/// is always zero here.
fn aggregate_by_variant(scores: &[DocumentScore]) -> Vec<PipelineRunMetrics> {
    let mut aggregators = BTreeMap::<&str, MetricAggregator>::new();
    for score in scores {
        aggregators
            .entry(score.variant_id.as_str())
            .or_insert_with(|| MetricAggregator::new(&score.variant_id))
            .ingest(score);
    }
    aggregators
        .values()
        .map(MetricAggregator::finalize)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::evaluation::compare::{FieldVerdict, VerdictKind};
    use crate::schema::Field;

    fn score(variant_id: &str, document_id: &str, kind: VerdictKind) -> DocumentScore {
        DocumentScore {
            document_id: document_id.to_string(),
            variant_id: variant_id.to_string(),
            verdicts: Field::ALL
                .into_iter()
                .map(|field| FieldVerdict {
                    field,
                    kind,
                    expected: None,
                    actual: None,
                    similarity: None,
                    note: None,
                })
                .collect(),
            fully_correct: kind.is_correct(),
            accepted: kind.is_correct(),
            duration: Duration::from_secs(1),
            llm_duration: None,
            failure: None,
        }
    }

    fn seeded_store(path: &std::path::Path) {
        let store = ScoreStore::open(path).expect("store opens");
        for entry in [
            score("v2", "inv-1", VerdictKind::TruePositive),
            score("v1", "inv-1", VerdictKind::TruePositive),
            score("v1", "inv-2", VerdictKind::FalseNegative),
        ] {
            store.upsert(&entry, "label-hash", "run-1").expect("score stored");
        }
    }

    #[test]
    fn report_rebuilds_results_per_variant() {
        let directory = tempdir().expect("temp dir");
        let store_path = directory.path().join("scores.sqlite");
        seeded_store(&store_path);

        run(ReportArgs {
            store_path,
            output_dir: directory.path().join("report"),
            variants: Vec::new(),
            details: true,
        })
        .expect("report succeeds");

        let results = fs::read_to_string(directory.path().join("report").join(RESULTS_FILE))
            .expect("results readable");
        let lines = results.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("v1,"));
        assert!(lines[2].starts_with("v2,"));
        assert!(directory.path().join("report").join(DETAILS_FILE).exists());
    }

    #[test]
    fn report_filters_variants() {
        let directory = tempdir().expect("temp dir");
        let store_path = directory.path().join("scores.sqlite");
        seeded_store(&store_path);

        run(ReportArgs {
            store_path,
            output_dir: directory.path().to_path_buf(),
            variants: vec!["v2".to_string()],
            details: false,
        })
        .expect("report succeeds");

        let results =
            fs::read_to_string(directory.path().join(RESULTS_FILE)).expect("results readable");
        assert_eq!(results.lines().count(), 2);
        assert!(!directory.path().join(SUMMARY_FILE).exists());
    }

    #[test]
    fn aggregation_matches_per_variant_counts() {
        let metrics = aggregate_by_variant(&[
            score("v1", "inv-1", VerdictKind::TruePositive),
            score("v1", "inv-2", VerdictKind::FalseNegative),
        ]);

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].documents, 2);
        assert_eq!(metrics[0].success_rate, Some(0.5));
        assert_eq!(metrics[0].field(Field::Iban).recall, Some(0.5));
        assert_eq!(metrics[0].field(Field::Iban).precision, Some(1.0));
    }

    #[test]
    fn missing_store_is_an_error() {
        let directory = tempdir().expect("temp dir");
        let result = run(ReportArgs {
            store_path: directory.path().join("absent.sqlite"),
            output_dir: directory.path().to_path_buf(),
            variants: Vec::new(),
            details: false,
        });
        assert!(result.is_err());
    }
}
