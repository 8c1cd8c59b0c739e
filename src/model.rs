use serde::{Deserialize, Serialize};

use crate::config::BenchmarkConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEntry {
    pub document_id: String,
    pub filename: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationEntry {
    pub source: String,
    pub variant_id: Option<String>,
    pub document_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPaths {
    pub ground_truth_dir: String,
    pub output_dir: String,
    pub store_path: Option<String>,
    pub extractor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunCounts {
    pub documents: usize,
    pub variants: usize,
    pub pairs_scored: usize,
    pub pairs_resumed: usize,
    pub failed_documents: u64,
    pub label_violations: usize,
    pub extraction_violations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
    pub command: String,
    pub config: BenchmarkConfig,
    pub variants: Vec<String>,
    pub paths: RunPaths,
    pub counts: RunCounts,
    pub ground_truth: Vec<LabelEntry>,
    pub schema_violations: Vec<ViolationEntry>,
}

/// One row of `details.csv`: a single field verdict.
#[derive(Debug, Clone, Serialize)]
pub struct DetailRow {
    pub pipeline: String,
    pub document_id: String,
    pub field: String,
    pub verdict: String,
    pub expected: String,
    pub actual: String,
    pub similarity: String,
    pub note: String,
}
