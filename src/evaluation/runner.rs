use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{RecvTimeoutError, bounded};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::evaluation::aggregate::{MetricAggregator, PipelineRunMetrics};
use crate::evaluation::error::ExtractionError;
use crate::evaluation::score::{DocumentScore, RecordScorer};
use crate::schema::{ExtractionResult, GroundTruthRecord, InvoiceFields};

/// The external extraction collaborator. Implementations must return all
/// schema keys, value or null, for the given document and variant.
///
/// Work still running at `deadline` must be stopped; the runner has already
/// scored the pair as failed by then.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        document_id: &str,
        variant_id: &str,
        deadline: Option<Instant>,
    ) -> Result<ExtractionOutput, ExtractionError>;
}

/// Unvalidated extractor output. `duration` falls back to the measured wall
/// clock time when the extractor does not report one.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutput {
    pub fields: Value,
    pub duration: Option<Duration>,
    pub llm_duration: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub workers: usize,
}

/// Pairs finished by an earlier run, with the aggregates rebuilt from their
/// stored scores.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    completed: HashSet<(String, String)>,
    seeds: BTreeMap<String, MetricAggregator>,
}

impl ResumeState {
    pub fn from_scores(scores: &[DocumentScore]) -> Self {
        let mut state = Self::default();
        for score in scores {
            state
                .completed
                .insert((score.variant_id.clone(), score.document_id.clone()));
            state
                .seeds
                .entry(score.variant_id.clone())
                .or_insert_with(|| MetricAggregator::new(&score.variant_id))
                .ingest(score);
        }
        state
    }

    pub fn is_completed(&self, variant_id: &str, document_id: &str) -> bool {
        self.completed
            .contains(&(variant_id.to_string(), document_id.to_string()))
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub variant_id: String,
    pub document_id: String,
    pub reason: String,
}

/// What the runner streams out for every processed pair.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Scored(DocumentScore),
    SchemaViolation(SchemaViolation),
}

#[derive(Debug, Clone)]
pub struct BenchmarkOutcome {
    /// One row per variant, in the order the variants were given.
    pub metrics: Vec<PipelineRunMetrics>,
    pub schema_violations: Vec<SchemaViolation>,
}

#[derive(Debug, Clone, Copy)]
struct Task {
    variant: usize,
    record: usize,
}

pub struct BenchmarkRunner {
    scorer: RecordScorer,
    extractor: Arc<dyn Extractor>,
    settings: RunnerSettings,
}

impl BenchmarkRunner {
    pub fn new(scorer: RecordScorer, extractor: Arc<dyn Extractor>, settings: RunnerSettings) -> Self {
        Self {
            scorer,
            extractor,
            settings,
        }
    }

    /// Scores every (variant, document) pair not already in `resume` and
    /// finalizes each variant once all of its documents have resolved.
    /// `sink` sees every outcome as it arrives, in completion order; a sink
    /// error is reported after the run has drained.
    pub fn run(
        &self,
        records: &[GroundTruthRecord],
        variants: &[String],
        resume: &ResumeState,
        sink: &mut dyn FnMut(&PairOutcome) -> Result<()>,
    ) -> Result<BenchmarkOutcome> {
        let tasks = variants
            .iter()
            .enumerate()
            .flat_map(|(variant, variant_id)| {
                records
                    .iter()
                    .enumerate()
                    .filter(move |(_, record)| !resume.is_completed(variant_id, &record.document_id))
                    .map(move |(record, _)| Task { variant, record })
            })
            .collect::<Vec<_>>();

        let workers = self.settings.workers.max(1);
        info!(
            variants = variants.len(),
            documents = records.len(),
            pending = tasks.len(),
            resumed = resume.completed_count(),
            workers,
            "benchmark started"
        );

        let (task_sender, task_receiver) = bounded::<Task>(workers * 2);
        let (outcome_sender, outcome_receiver) = bounded::<PairOutcome>(workers * 4);

        let mut schema_violations = Vec::new();
        let mut sink_error = None;

        let partials = thread::scope(|scope| -> Result<Vec<Vec<MetricAggregator>>> {
            scope.spawn(move || {
                for task in tasks {
                    if task_sender.send(task).is_err() {
                        break;
                    }
                }
            });

            let handles = (0..workers)
                .map(|_| {
                    let task_receiver = task_receiver.clone();
                    let outcome_sender = outcome_sender.clone();
                    scope.spawn(move || {
                        let mut aggregators = variants
                            .iter()
                            .map(|variant_id| MetricAggregator::new(variant_id))
                            .collect::<Vec<_>>();

                        for task in task_receiver.iter() {
                            let outcome =
                                self.process(&records[task.record], &variants[task.variant]);
                            let aggregator = &mut aggregators[task.variant];
                            match &outcome {
                                PairOutcome::Scored(score) => aggregator.ingest(score),
                                PairOutcome::SchemaViolation(_) => {
                                    aggregator.record_schema_violation()
                                }
                            }
                            if outcome_sender.send(outcome).is_err() {
                                break;
                            }
                        }

                        aggregators
                    })
                })
                .collect::<Vec<_>>();
            drop(task_receiver);
            drop(outcome_sender);

            for outcome in outcome_receiver.iter() {
                if sink_error.is_none() {
                    sink_error = sink(&outcome).err();
                }
                if let PairOutcome::SchemaViolation(violation) = outcome {
                    schema_violations.push(violation);
                }
            }

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| anyhow!("benchmark worker panicked"))
                })
                .collect()
        })?;

        if let Some(err) = sink_error {
            return Err(err).context("failed to record benchmark outcome");
        }

        let mut metrics = Vec::with_capacity(variants.len());
        for (index, variant_id) in variants.iter().enumerate() {
            let mut aggregator = resume
                .seeds
                .get(variant_id)
                .cloned()
                .unwrap_or_else(|| MetricAggregator::new(variant_id));
            for partial in &partials {
                aggregator = aggregator.merge(&partial[index])?;
            }

            let finalized = aggregator.finalize();
            info!(
                variant = %variant_id,
                documents = finalized.documents,
                failed = finalized.failed_documents,
                schema_violations = finalized.schema_violations,
                "variant finalized"
            );
            metrics.push(finalized);
        }

        schema_violations.sort_by(|left, right| {
            (&left.variant_id, &left.document_id).cmp(&(&right.variant_id, &right.document_id))
        });

        Ok(BenchmarkOutcome {
            metrics,
            schema_violations,
        })
    }

    fn process(&self, record: &GroundTruthRecord, variant_id: &str) -> PairOutcome {
        let document_id = record.document_id.as_str();
        let started = Instant::now();
        let extracted = self.extract_with_timeout(document_id, variant_id);
        let elapsed = started.elapsed();

        let output = match extracted {
            Ok(output) => output,
            Err(err) => {
                warn!(
                    variant = %variant_id,
                    document = %document_id,
                    error = %err,
                    "extraction failed; scoring document as fully failed"
                );
                let score = self.scorer.score_failure(record);
                return PairOutcome::Scored(DocumentScore::from_record(
                    document_id,
                    variant_id,
                    score,
                    elapsed,
                    None,
                    Some(err.to_string()),
                ));
            }
        };

        let fields = match InvoiceFields::from_json_object(&output.fields) {
            Ok(fields) => fields,
            Err(err) => {
                error!(
                    variant = %variant_id,
                    document = %document_id,
                    error = %err,
                    "extraction broke the schema contract"
                );
                return PairOutcome::SchemaViolation(SchemaViolation {
                    variant_id: variant_id.to_string(),
                    document_id: document_id.to_string(),
                    reason: err.to_string(),
                });
            }
        };

        let unknown = InvoiceFields::unknown_keys(&output.fields);
        if !unknown.is_empty() {
            debug!(
                variant = %variant_id,
                document = %document_id,
                keys = %unknown.join(","),
                "ignoring keys outside the schema"
            );
        }

        let result = ExtractionResult {
            document_id: document_id.to_string(),
            variant_id: variant_id.to_string(),
            fields,
            duration: output.duration.unwrap_or(elapsed),
            llm_duration: output.llm_duration,
        };
        let score = self.scorer.score(record, &result.fields);
        debug!(
            variant = %variant_id,
            document = %document_id,
            fully_correct = score.fully_correct,
            "document scored"
        );

        PairOutcome::Scored(DocumentScore::from_record(
            document_id,
            variant_id,
            score,
            result.duration,
            result.llm_duration,
            None,
        ))
    }

    /// Runs the extraction on a detached thread so a call that outlives the
    /// timeout never blocks the worker. The extractor receives the same
    /// deadline and stops its own work when it passes.
    fn extract_with_timeout(
        &self,
        document_id: &str,
        variant_id: &str,
    ) -> Result<ExtractionOutput, ExtractionError> {
        let (sender, receiver) = bounded(1);
        let extractor = Arc::clone(&self.extractor);
        let document = document_id.to_string();
        let variant = variant_id.to_string();
        let deadline = self
            .settings
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));

        thread::Builder::new()
            .name(format!("extract-{variant_id}-{document_id}"))
            .spawn(move || {
                let _ = sender.send(extractor.extract(&document, &variant, deadline));
            })
            .map_err(|err| {
                ExtractionError::Failed(format!("failed to spawn extraction thread: {err}"))
            })?;

        match self.settings.timeout {
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(ExtractionError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => Err(ExtractionError::Disconnected),
            },
            None => receiver
                .recv()
                .unwrap_or(Err(ExtractionError::Disconnected)),
        }
    }
}
