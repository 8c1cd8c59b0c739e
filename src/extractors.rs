use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::evaluation::error::ExtractionError;
use crate::evaluation::runner::{ExtractionOutput, Extractor};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Replays extractions saved by an earlier pipeline run from
/// `<root>/<variant>/<document_id>.json`.
#[derive(Debug, Clone)]
pub struct RecordedExtractor {
    root: PathBuf,
}

impl RecordedExtractor {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Every subdirectory of the root is one variant, sorted by name.
    pub fn discover_variants(&self) -> Result<Vec<String>> {
        let mut variants = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to read extractions directory: {}", self.root.display()))?
        {
            let entry = entry.with_context(|| {
                format!("failed to list extractions directory: {}", self.root.display())
            })?;
            if entry.path().is_dir() {
                variants.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        variants.sort();
        Ok(variants)
    }
}

impl Extractor for RecordedExtractor {
    fn extract(
        &self,
        document_id: &str,
        variant_id: &str,
        _deadline: Option<Instant>,
    ) -> Result<ExtractionOutput, ExtractionError> {
        let path = self
            .root
            .join(variant_id)
            .join(format!("{document_id}.json"));
        let raw = fs::read_to_string(&path).map_err(|err| {
            ExtractionError::Failed(format!("no recorded extraction at {}: {err}", path.display()))
        })?;
        parse_payload(&raw)
    }
}

/// Runs `<program> <args..> <variant> <document>` per extraction and reads
/// the result from stdout.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    documents_dir: Option<PathBuf>,
}

impl CommandExtractor {
    pub fn new(program: &str, args: &[String], documents_dir: Option<&Path>) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            documents_dir: documents_dir.map(Path::to_path_buf),
        }
    }

    /// The source file whose stem is the document id, or the bare id when no
    /// documents directory is configured.
    fn document_argument(&self, document_id: &str) -> Result<String, ExtractionError> {
        let Some(directory) = &self.documents_dir else {
            return Ok(document_id.to_string());
        };

        let mut candidates = fs::read_dir(directory)
            .map_err(|err| {
                ExtractionError::Failed(format!(
                    "failed to read documents directory {}: {err}",
                    directory.display()
                ))
            })?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .file_stem()
                        .is_some_and(|stem| stem.to_string_lossy() == document_id)
            })
            .collect::<Vec<_>>();
        candidates.sort();

        candidates
            .into_iter()
            .next()
            .map(|path| path.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ExtractionError::Failed(format!(
                    "no source document for {document_id} in {}",
                    directory.display()
                ))
            })
    }
}

impl Extractor for CommandExtractor {
    fn extract(
        &self,
        document_id: &str,
        variant_id: &str,
        deadline: Option<Instant>,
    ) -> Result<ExtractionOutput, ExtractionError> {
        let document = self.document_argument(document_id)?;
        debug!(program = %self.program, variant = %variant_id, document = %document, "running extractor");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(variant_id)
            .arg(&document)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                ExtractionError::Failed(format!("failed to execute {}: {err}", self.program))
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_until(&mut child, deadline).map_err(|err| {
            ExtractionError::Failed(format!("failed to wait for {}: {err}", self.program))
        })?;
        let Some(status) = status else {
            // Readers stay detached: grandchildren may still hold the pipes.
            warn!(program = %self.program, variant = %variant_id, document = %document_id, "killed extractor past its deadline");
            return Err(ExtractionError::Failed(format!(
                "{} killed after passing its deadline for {document_id}",
                self.program
            )));
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        if !status.success() {
            return Err(ExtractionError::Failed(format!(
                "{} returned non-zero exit status for {document_id}: {}",
                self.program,
                stderr.trim()
            )));
        }

        parse_payload(&stdout)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|buffer| String::from_utf8_lossy(&buffer).into_owned())
        .unwrap_or_default()
}

/// Waits for the child to exit. Past `deadline` the child is killed and
/// reaped, and `None` is returned.
fn wait_until(child: &mut Child, deadline: Option<Instant>) -> io::Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return child.wait().map(Some);
    };

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            // The child may exit between try_wait and kill.
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(CHILD_POLL_INTERVAL.min(deadline - now));
    }
}

/// Accepts a bare field object or an envelope
/// `{"fields": {..}, "duration_s": .., "llm_duration_s": ..}`. Text around
/// the outermost braces, such as a model's prose or code fences, is ignored.
pub fn parse_payload(raw: &str) -> Result<ExtractionOutput, ExtractionError> {
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return Err(ExtractionError::Failed(
            "extractor output contains no JSON object".to_string(),
        ));
    };
    if end < start {
        return Err(ExtractionError::Failed(
            "extractor output contains no JSON object".to_string(),
        ));
    }

    let value: Value = serde_json::from_str(&raw[start..=end])
        .map_err(|err| ExtractionError::Failed(format!("invalid extractor JSON: {err}")))?;

    match value.get("fields") {
        Some(fields) if fields.is_object() => Ok(ExtractionOutput {
            fields: fields.clone(),
            duration: seconds(&value, "duration_s"),
            llm_duration: seconds(&value, "llm_duration_s"),
        }),
        _ => Ok(ExtractionOutput {
            fields: value,
            duration: None,
            llm_duration: None,
        }),
    }
}

fn seconds(value: &Value, key: &str) -> Option<Duration> {
    value
        .get(key)
        .and_then(Value::as_f64)
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
}
