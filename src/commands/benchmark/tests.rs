use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};

use super::*;

fn label(invoice_number: &str) -> Value {
    json!({
        "invoice_number": invoice_number,
        "invoice_date": "12.03.2015",
        "vendor_name": "Mustermann GmbH",
        "recipient_name": "Beispiel AG",
        "total_amount": 367.50,
        "currency": "EUR",
        "tax_rate": 19.00,
        "purchase_order_number": null,
        "ust-id": "DE123456789",
        "iban": "AT491700000122001632",
    })
}

fn write_json(path: &Path, value: &Value) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir");
    }
    fs::write(path, serde_json::to_vec_pretty(value).expect("json serializes")).expect("file written");
}

struct Fixture {
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let root = tempdir().expect("temp dir");
        let fixture = Self { root };

        write_json(&fixture.ground_truth_dir().join("inv-01.json"), &label("RE-1"));
        write_json(&fixture.ground_truth_dir().join("inv-02.json"), &label("RE-2"));

        for (variant, second_number) in [("paddle+llama3", "RE-2"), ("tesseract+mistral", "RE-9")] {
            for (document, number) in [("inv-01", "RE-1"), ("inv-02", second_number)] {
                write_json(
                    &fixture.extractions_dir().join(variant).join(format!("{document}.json")),
                    &json!({
                        "fields": label(number),
                        "duration_s": 2.0,
                        "llm_duration_s": 1.5,
                    }),
                );
            }
        }

        fixture
    }

    fn ground_truth_dir(&self) -> PathBuf {
        self.root.path().join("ground_truth")
    }

    fn extractions_dir(&self) -> PathBuf {
        self.root.path().join("extractions")
    }

    fn output_dir(&self) -> PathBuf {
        self.root.path().join("out")
    }

    fn args(&self) -> BenchmarkArgs {
        BenchmarkArgs {
            config: None,
            ground_truth_dir: self.ground_truth_dir(),
            extractions_dir: Some(self.extractions_dir()),
            extract_command: None,
            extract_args: Vec::new(),
            documents_dir: None,
            variants: Vec::new(),
            output_dir: self.output_dir(),
            timeout_ms: Some(5_000),
            workers: Some(2),
            number_format: None,
            store_path: None,
            resume: false,
        }
    }

    fn read_output(&self, name: &str) -> String {
        fs::read_to_string(self.output_dir().join(name)).expect("artifact readable")
    }
}

fn results_rows(text: &str) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    reader
        .records()
        .map(|record| {
            record
                .expect("row parses")
                .iter()
                .map(str::to_string)
                .collect()
        })
        .collect()
}

#[test]
fn benchmark_writes_all_artifacts_for_discovered_variants() {
    let fixture = Fixture::new();

    run(fixture.args()).expect("benchmark succeeds");

    let rows = results_rows(&fixture.read_output(RESULTS_FILE));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], "paddle+llama3");
    assert_eq!(rows[1][0], "tesseract+mistral");

    let header = crate::output::results_header();
    let success = header
        .iter()
        .position(|column| column == "success_rate")
        .expect("success_rate column");
    assert_eq!(rows[0][success], "1.0000");
    assert_eq!(rows[1][success], "0.5000");

    let summary = fixture.read_output(SUMMARY_FILE);
    assert_eq!(summary.lines().count(), 1 + 4);
    let details = fixture.read_output(DETAILS_FILE);
    assert_eq!(details.lines().count(), 1 + 4 * 10);

    let manifest: Value =
        serde_json::from_str(&fixture.read_output(MANIFEST_FILE)).expect("manifest parses");
    assert_eq!(manifest["status"], "completed");
    assert_eq!(manifest["counts"]["pairs_scored"], 4);
    assert_eq!(manifest["ground_truth"].as_array().map(Vec::len), Some(2));
}

#[test]
fn schema_violations_fail_the_run_after_artifacts_are_written() {
    let fixture = Fixture::new();
    let mut broken = label("RE-2");
    broken
        .as_object_mut()
        .expect("label is an object")
        .remove("currency");
    write_json(
        &fixture
            .extractions_dir()
            .join("paddle+llama3")
            .join("inv-02.json"),
        &broken,
    );

    let error = run(fixture.args()).expect_err("violation fails the run");
    assert!(error.to_string().contains("1 schema violation"));

    let manifest: Value =
        serde_json::from_str(&fixture.read_output(MANIFEST_FILE)).expect("manifest parses");
    assert_eq!(manifest["status"], "completed_with_schema_violations");
    assert_eq!(manifest["schema_violations"][0]["variant_id"], "paddle+llama3");
    assert_eq!(manifest["schema_violations"][0]["document_id"], "inv-02");

    let rows = results_rows(&fixture.read_output(RESULTS_FILE));
    let header = crate::output::results_header();
    let column = |name: &str| {
        header
            .iter()
            .position(|column| column == name)
            .expect("column present")
    };
    assert_eq!(rows[0][column("documents")], "1");
    assert_eq!(rows[0][column("schema_violations")], "1");
}

#[test]
fn resume_reuses_stored_scores_without_extracting_again() {
    let fixture = Fixture::new();
    run(fixture.args()).expect("first run succeeds");
    let first_results = fixture.read_output(RESULTS_FILE);

    fs::remove_dir_all(fixture.extractions_dir().join("tesseract+mistral"))
        .expect("variant outputs removed");
    fs::create_dir_all(fixture.extractions_dir().join("tesseract+mistral"))
        .expect("empty variant dir");

    let mut args = fixture.args();
    args.resume = true;
    run(args).expect("resumed run succeeds");

    assert_eq!(fixture.read_output(RESULTS_FILE), first_results);
    let manifest: Value =
        serde_json::from_str(&fixture.read_output(MANIFEST_FILE)).expect("manifest parses");
    assert_eq!(manifest["counts"]["pairs_scored"], 0);
    assert_eq!(manifest["counts"]["pairs_resumed"], 4);
}

#[test]
fn resume_rescores_pairs_whose_label_changed() {
    let fixture = Fixture::new();
    run(fixture.args()).expect("first run succeeds");

    write_json(&fixture.ground_truth_dir().join("inv-02.json"), &label("RE-9"));

    let mut args = fixture.args();
    args.resume = true;
    run(args).expect("resumed run succeeds");

    let manifest: Value =
        serde_json::from_str(&fixture.read_output(MANIFEST_FILE)).expect("manifest parses");
    assert_eq!(manifest["counts"]["pairs_resumed"], 2);
    assert_eq!(manifest["counts"]["pairs_scored"], 2);

    let rows = results_rows(&fixture.read_output(RESULTS_FILE));
    let header = crate::output::results_header();
    let success = header
        .iter()
        .position(|column| column == "success_rate")
        .expect("success_rate column");
    assert_eq!(rows[0][success], "0.5000");
    assert_eq!(rows[1][success], "1.0000");
}

#[test]
fn explicit_variants_override_discovery() {
    let fixture = Fixture::new();
    let mut args = fixture.args();
    args.variants = vec!["paddle+llama3".to_string(), "paddle+llama3".to_string()];

    run(args).expect("benchmark succeeds");

    let rows = results_rows(&fixture.read_output(RESULTS_FILE));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], "paddle+llama3");
}
