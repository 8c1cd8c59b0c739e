use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::cli::BenchmarkArgs;
use crate::config::BenchmarkConfig;
use crate::dataset::GroundTruthSet;
use crate::evaluation::runner::{
    BenchmarkRunner, Extractor, PairOutcome, ResumeState, RunnerSettings,
};
use crate::evaluation::score::{DocumentScore, RecordScorer};
use crate::extractors::{CommandExtractor, RecordedExtractor};
use crate::model::{RunCounts, RunManifest, RunPaths, ViolationEntry};
use crate::output::{
    DETAILS_FILE, RESULTS_FILE, SUMMARY_FILE, write_details_csv, write_results_csv,
    write_summary_csv,
};
use crate::schema::NumberFormat;
use crate::store::{ScoreStore, StoredScore};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

const MANIFEST_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "run_manifest.json";

pub fn run(args: BenchmarkArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("bench-{}", utc_compact_string(started_ts));

    let config = resolve_config(&args)?;
    let scorer = RecordScorer::new(config.comparator()?, config.default_number_format);
    let ground_truth = GroundTruthSet::load_dir(&args.ground_truth_dir)?;
    if ground_truth.records.is_empty() {
        bail!(
            "no usable ground truth labels in {}",
            args.ground_truth_dir.display()
        );
    }

    let (extractor, extractor_description, discovered) = build_extractor(&args)?;
    let variants = resolve_variants(&args, &config, discovered)?;

    ensure_directory(&args.output_dir)?;
    let store_path = args
        .store_path
        .clone()
        .unwrap_or_else(|| args.output_dir.join("scores.sqlite"));
    let store = ScoreStore::open(&store_path)?;

    info!(
        run_id = %run_id,
        documents = ground_truth.records.len(),
        variants = variants.len(),
        store = %store_path.display(),
        resume = args.resume,
        "starting benchmark"
    );

    let resumed_scores = if args.resume {
        resumable_scores(store.load_stored()?, &ground_truth, &variants)
    } else {
        let removed = store.clear_variants(&variants)?;
        if removed > 0 {
            info!(removed, "cleared stored scores of a previous run");
        }
        Vec::new()
    };
    let resume = ResumeState::from_scores(&resumed_scores);

    let runner = BenchmarkRunner::new(
        scorer,
        extractor,
        RunnerSettings {
            timeout: config.timeout(),
            workers: config.workers,
        },
    );

    let mut new_scores = Vec::new();
    let outcome = runner.run(
        &ground_truth.records,
        &variants,
        &resume,
        &mut |outcome: &PairOutcome| -> Result<()> {
            if let PairOutcome::Scored(score) = outcome {
                let label_sha256 = ground_truth
                    .label_sha256(&score.document_id)
                    .unwrap_or_default();
                store.upsert(score, label_sha256, &run_id)?;
                new_scores.push(score.clone());
            }
            Ok(())
        },
    )?;

    let pairs_scored = new_scores.len();
    let mut scores = resumed_scores;
    scores.extend(new_scores);
    scores.sort_by(|left, right| {
        (&left.variant_id, &left.document_id).cmp(&(&right.variant_id, &right.document_id))
    });

    write_results_csv(&args.output_dir.join(RESULTS_FILE), &outcome.metrics)?;
    write_summary_csv(&args.output_dir.join(SUMMARY_FILE), &scores)?;
    write_details_csv(&args.output_dir.join(DETAILS_FILE), &scores)?;

    let mut violations = ground_truth
        .violations
        .iter()
        .map(|violation| ViolationEntry {
            source: "ground_truth".to_string(),
            variant_id: None,
            document_id: violation.document_id.clone(),
            reason: violation.reason.clone(),
        })
        .collect::<Vec<_>>();
    violations.extend(outcome.schema_violations.iter().map(|violation| ViolationEntry {
        source: "extraction".to_string(),
        variant_id: Some(violation.variant_id.clone()),
        document_id: violation.document_id.clone(),
        reason: violation.reason.clone(),
    }));

    let manifest = RunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: run_id.clone(),
        status: if violations.is_empty() {
            "completed".to_string()
        } else {
            "completed_with_schema_violations".to_string()
        },
        started_at,
        finished_at: now_utc_string(),
        command: std::env::args().collect::<Vec<_>>().join(" "),
        config: config.clone(),
        variants: variants.clone(),
        paths: RunPaths {
            ground_truth_dir: args.ground_truth_dir.display().to_string(),
            output_dir: args.output_dir.display().to_string(),
            store_path: Some(store_path.display().to_string()),
            extractor: extractor_description,
        },
        counts: RunCounts {
            documents: ground_truth.records.len(),
            variants: variants.len(),
            pairs_scored,
            pairs_resumed: resume.completed_count(),
            failed_documents: outcome
                .metrics
                .iter()
                .map(|metrics| metrics.failed_documents)
                .sum(),
            label_violations: ground_truth.violations.len(),
            extraction_violations: outcome.schema_violations.len(),
        },
        ground_truth: ground_truth.labels.clone(),
        schema_violations: violations.clone(),
    };
    write_json_pretty(&args.output_dir.join(MANIFEST_FILE), &manifest)?;

    for metrics in &outcome.metrics {
        info!(
            variant = %metrics.variant_id,
            documents = metrics.documents,
            accuracy = ?metrics.accuracy,
            success_rate = ?metrics.success_rate,
            acceptance_rate = ?metrics.acceptance_rate,
            "variant results"
        );
    }
    info!(
        run_id = %run_id,
        output_dir = %args.output_dir.display(),
        "benchmark artifacts written"
    );

    if !violations.is_empty() {
        for violation in &violations {
            error!(
                source = %violation.source,
                variant = %violation.variant_id.as_deref().unwrap_or("-"),
                document = %violation.document_id,
                reason = %violation.reason,
                "schema violation"
            );
        }
        bail!(
            "benchmark finished with {} schema violation(s); see {}",
            violations.len(),
            args.output_dir.join(MANIFEST_FILE).display()
        );
    }

    Ok(())
}

fn resolve_config(args: &BenchmarkArgs) -> Result<BenchmarkConfig> {
    let mut config = BenchmarkConfig::load(args.config.as_deref())?;
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(workers) = args.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        config.workers = workers;
    }
    if let Some(number_format) = args.number_format {
        config.default_number_format = Some(NumberFormat::from(number_format));
    }
    Ok(config)
}

/// The extractor plus a description for the manifest and, for recorded
/// outputs, the variants found on disk.
fn build_extractor(
    args: &BenchmarkArgs,
) -> Result<(Arc<dyn Extractor>, String, Vec<String>)> {
    if let Some(program) = &args.extract_command {
        let extractor = CommandExtractor::new(program, &args.extract_args, args.documents_dir.as_deref());
        let description = std::iter::once(program.as_str())
            .chain(args.extract_args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        return Ok((Arc::new(extractor), format!("command: {description}"), Vec::new()));
    }

    let Some(root) = &args.extractions_dir else {
        bail!("either --extractions-dir or --extract-command is required");
    };
    let extractor = RecordedExtractor::new(root);
    let discovered = extractor.discover_variants()?;
    Ok((
        Arc::new(extractor),
        format!("recorded: {}", root.display()),
        discovered,
    ))
}

fn resolve_variants(
    args: &BenchmarkArgs,
    config: &BenchmarkConfig,
    discovered: Vec<String>,
) -> Result<Vec<String>> {
    let requested = if !args.variants.is_empty() {
        args.variants.clone()
    } else if !config.variants.is_empty() {
        config.variants.clone()
    } else {
        discovered
    };

    let mut seen = HashSet::new();
    let variants = requested
        .into_iter()
        .filter(|variant| {
            let fresh = seen.insert(variant.clone());
            if !fresh {
                warn!(variant = %variant, "ignoring duplicate variant");
            }
            fresh
        })
        .collect::<Vec<_>>();

    if variants.is_empty() {
        bail!("no pipeline variants given; pass --variant or list them in the config");
    }
    Ok(variants)
}

/// Stored scores that still belong to this run: known variant, a document
/// that is part of the current ground truth, and scored against the label
/// file as it reads now.
fn resumable_scores(
    stored: Vec<StoredScore>,
    ground_truth: &GroundTruthSet,
    variants: &[String],
) -> Vec<DocumentScore> {
    let total = stored.len();
    let mut stale = 0;
    let kept = stored
        .into_iter()
        .filter(|stored| {
            let score = &stored.score;
            if !variants.contains(&score.variant_id) || ground_truth.get(&score.document_id).is_none() {
                return false;
            }
            let current = ground_truth.label_sha256(&score.document_id);
            if stored.label_sha256.as_deref() != current {
                stale += 1;
                return false;
            }
            true
        })
        .map(|stored| stored.score)
        .collect::<Vec<_>>();

    if stale > 0 {
        warn!(stale, "labels changed since scoring; re-running those pairs");
    }
    if kept.len() + stale < total {
        warn!(
            skipped = total - kept.len() - stale,
            "stored scores outside the current variants or ground truth were ignored"
        );
    }
    info!(resumed = kept.len(), "resuming from stored scores");
    kept
}

#[cfg(test)]
mod tests;
