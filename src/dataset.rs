use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::model::LabelEntry;
use crate::schema::{GroundTruthRecord, InvoiceFields};
use crate::util::sha256_file;

/// A label file that could not be used as ground truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelViolation {
    pub document_id: String,
    pub path: PathBuf,
    pub reason: String,
}

/// The fixed evaluation set: one verified record per document, sorted by
/// document id.
#[derive(Debug, Clone)]
pub struct GroundTruthSet {
    pub records: Vec<GroundTruthRecord>,
    pub labels: Vec<LabelEntry>,
    pub violations: Vec<LabelViolation>,
}

impl GroundTruthSet {
    /// Loads every `<document_id>.json` in `directory`. Labels that break the
    /// schema are reported in `violations` and left out of `records`.
    pub fn load_dir(directory: &Path) -> Result<Self> {
        let mut paths = fs::read_dir(directory)
            .with_context(|| format!("failed to read ground truth directory: {}", directory.display()))?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("failed to list ground truth directory: {}", directory.display()))?;
        paths.retain(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        });
        paths.sort();

        if paths.is_empty() {
            bail!("no ground truth labels found in {}", directory.display());
        }

        let mut records = Vec::with_capacity(paths.len());
        let mut labels = Vec::with_capacity(paths.len());
        let mut violations = Vec::new();

        for path in paths {
            let Some(document_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                bail!("label file name is not valid UTF-8: {}", path.display());
            };
            let document_id = document_id.to_string();

            labels.push(LabelEntry {
                document_id: document_id.clone(),
                filename: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                sha256: sha256_file(&path)?,
            });

            match read_label(&document_id, &path) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    error!(document = %document_id, reason = %reason, "ground truth label rejected");
                    violations.push(LabelViolation {
                        document_id,
                        path,
                        reason,
                    });
                }
            }
        }

        info!(
            directory = %directory.display(),
            documents = records.len(),
            rejected = violations.len(),
            "loaded ground truth"
        );

        Ok(Self {
            records,
            labels,
            violations,
        })
    }

    pub fn label_sha256(&self, document_id: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.document_id == document_id)
            .map(|label| label.sha256.as_str())
    }

    pub fn get(&self, document_id: &str) -> Option<&GroundTruthRecord> {
        self.records
            .binary_search_by(|record| record.document_id.as_str().cmp(document_id))
            .ok()
            .map(|index| &self.records[index])
    }
}

fn read_label(document_id: &str, path: &Path) -> std::result::Result<GroundTruthRecord, String> {
    let raw = fs::read(path).map_err(|err| format!("failed to read label: {err}"))?;
    let value: Value =
        serde_json::from_slice(&raw).map_err(|err| format!("invalid label JSON: {err}"))?;

    let unknown = InvoiceFields::unknown_keys(&value)
        .into_iter()
        .filter(|key| key != "number_format")
        .collect::<Vec<_>>();
    if !unknown.is_empty() {
        debug!(document = %document_id, keys = %unknown.join(","), "label carries extra keys");
    }

    GroundTruthRecord::from_json(document_id, &value).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::schema::{Field, NumberFormat};

    fn write_label(directory: &Path, document_id: &str, value: &Value) {
        fs::write(
            directory.join(format!("{document_id}.json")),
            serde_json::to_vec(value).expect("label serializes"),
        )
        .expect("label written");
    }

    fn label() -> Value {
        json!({
            "invoice_number": "RE-1",
            "invoice_date": "01.02.2020",
            "vendor_name": "Mustermann GmbH",
            "recipient_name": "Beispiel AG",
            "total_amount": "1.234,56",
            "currency": "EUR",
            "tax_rate": "19",
            "purchase_order_number": null,
            "ust-id": null,
            "iban": null,
        })
    }

    #[test]
    fn load_dir_sorts_hashes_and_reports_violations() {
        let directory = tempdir().expect("temp dir");
        write_label(directory.path(), "inv-b", &label());
        let mut hinted = label();
        hinted["number_format"] = json!("decimal_comma");
        write_label(directory.path(), "inv-a", &hinted);
        let mut broken = label();
        broken
            .as_object_mut()
            .expect("label is an object")
            .remove("currency");
        write_label(directory.path(), "inv-c", &broken);
        fs::write(directory.path().join("notes.txt"), "ignored").expect("note written");

        let set = GroundTruthSet::load_dir(directory.path()).expect("ground truth loads");

        let ids = set
            .records
            .iter()
            .map(|record| record.document_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["inv-a", "inv-b"]);
        assert_eq!(set.labels.len(), 3);
        assert!(set.labels.iter().all(|label| label.sha256.len() == 64));
        assert_eq!(set.violations.len(), 1);
        assert_eq!(set.violations[0].document_id, "inv-c");
        assert!(set.violations[0].reason.contains("currency"));

        let record = set.get("inv-a").expect("inv-a present");
        assert_eq!(record.number_format, Some(NumberFormat::DecimalComma));
        assert!(record.fields.get(Field::TotalAmount).is_some());
        assert!(set.get("inv-c").is_none());
    }

    #[test]
    fn label_with_unknown_number_format_is_a_violation() {
        let directory = tempdir().expect("temp dir");
        write_label(directory.path(), "inv-a", &label());
        let mut misspelled = label();
        misspelled["number_format"] = json!("de_DE");
        write_label(directory.path(), "inv-b", &misspelled);

        let set = GroundTruthSet::load_dir(directory.path()).expect("ground truth loads");

        assert_eq!(set.records.len(), 1);
        assert!(set.get("inv-b").is_none());
        assert_eq!(set.violations.len(), 1);
        assert_eq!(set.violations[0].document_id, "inv-b");
        assert!(set.violations[0].reason.contains("de_DE"));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let directory = tempdir().expect("temp dir");
        assert!(GroundTruthSet::load_dir(directory.path()).is_err());
    }
}
