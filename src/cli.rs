use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::schema::NumberFormat;

#[derive(Parser, Debug)]
#[command(
    name = "invoice-bench",
    version,
    about = "Benchmark invoice field extraction pipelines against verified ground truth"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Score every pipeline variant over the ground-truth set.
    Benchmark(BenchmarkArgs),
    /// Compare one extraction file with one ground-truth label.
    Score(ScoreArgs),
    /// Rebuild the CSV artifacts from a score store.
    Report(ReportArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BenchmarkArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub ground_truth_dir: PathBuf,

    /// Recorded outputs laid out as `<dir>/<variant>/<document_id>.json`.
    #[arg(long, conflicts_with = "extract_command", required_unless_present = "extract_command")]
    pub extractions_dir: Option<PathBuf>,

    /// Program invoked as `<command> <extract-arg..> <variant> <document>`.
    #[arg(long)]
    pub extract_command: Option<String>,

    #[arg(long = "extract-arg", allow_hyphen_values = true)]
    pub extract_args: Vec<String>,

    #[arg(long)]
    pub documents_dir: Option<PathBuf>,

    #[arg(long = "variant")]
    pub variants: Vec<String>,

    #[arg(long, default_value = ".cache/invoice-bench")]
    pub output_dir: PathBuf,

    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long, value_enum)]
    pub number_format: Option<NumberFormatArg>,

    /// Defaults to `<output-dir>/scores.sqlite`.
    #[arg(long)]
    pub store_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub resume: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ScoreArgs {
    #[arg(long)]
    pub ground_truth: PathBuf,

    #[arg(long)]
    pub extraction: PathBuf,

    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub number_format: Option<NumberFormatArg>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[arg(long, default_value = ".cache/invoice-bench/scores.sqlite")]
    pub store_path: PathBuf,

    #[arg(long, default_value = ".cache/invoice-bench")]
    pub output_dir: PathBuf,

    /// Restrict the report to these variants.
    #[arg(long = "variant")]
    pub variants: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub details: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum NumberFormatArg {
    DecimalComma,
    DecimalPoint,
}

impl From<NumberFormatArg> for NumberFormat {
    fn from(value: NumberFormatArg) -> Self {
        match value {
            NumberFormatArg::DecimalComma => NumberFormat::DecimalComma,
            NumberFormatArg::DecimalPoint => NumberFormat::DecimalPoint,
        }
    }
}
