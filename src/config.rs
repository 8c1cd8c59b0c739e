use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::evaluation::compare::FieldComparator;
use crate::schema::{Field, FieldKind, FieldSpec, NumberFormat};

pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_WORKERS: usize = 2;

/// Benchmark configuration file. Every section is optional; CLI flags
/// override the values read here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchmarkConfig {
    /// Per-field comparison overrides keyed by schema field name.
    pub fields: BTreeMap<String, FieldKind>,
    pub variants: Vec<String>,
    /// 0 disables the per-document timeout.
    pub timeout_ms: u64,
    pub workers: usize,
    pub default_number_format: Option<NumberFormat>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            fields: BTreeMap::new(),
            variants: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            workers: DEFAULT_WORKERS,
            default_number_format: None,
        }
    }
}

impl BenchmarkConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = fs::read(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        config.validate()?;

        info!(
            path = %path.display(),
            overrides = config.fields.len(),
            variants = config.variants.len(),
            "loaded benchmark config"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        self.comparator().map(|_| ())
    }

    /// Full field list in schema order with overrides applied.
    pub fn field_specs(&self) -> Result<Vec<FieldSpec>> {
        let mut specs = FieldSpec::defaults();
        for (key, kind) in &self.fields {
            let Some(field) = Field::from_key(key) else {
                bail!("unknown field in config: `{key}`");
            };
            specs[field.index()].kind = kind.clone();
        }
        Ok(specs)
    }

    pub fn comparator(&self) -> Result<FieldComparator> {
        if self.fields.is_empty() {
            return FieldComparator::with_defaults();
        }
        FieldComparator::new(&self.field_specs()?)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_path_yields_defaults() {
        let config = BenchmarkConfig::load(None).expect("defaults load");

        assert_eq!(config.timeout(), Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)));
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.field_specs().expect("defaults valid"), FieldSpec::defaults());
    }

    #[test]
    fn overrides_replace_only_named_fields() {
        let directory = tempdir().expect("temp dir");
        let path = directory.path().join("bench.json");
        fs::write(
            &path,
            r#"{
              "fields": {
                "vendor_name": { "type": "fuzzy_text", "threshold": 0.9 },
                "total_amount": { "type": "money" }
              },
              "timeout_ms": 0,
              "default_number_format": "decimal_comma"
            }"#,
        )
        .expect("config written");

        let config = BenchmarkConfig::load(Some(&path)).expect("config loads");
        let specs = config.field_specs().expect("specs resolve");

        assert_eq!(
            specs[Field::VendorName.index()].kind,
            FieldKind::FuzzyText { threshold: 0.9 }
        );
        assert_eq!(
            specs[Field::TotalAmount.index()].kind,
            Field::TotalAmount.default_kind()
        );
        assert_eq!(
            specs[Field::RecipientName.index()].kind,
            Field::RecipientName.default_kind()
        );
        assert_eq!(config.timeout(), None);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.default_number_format, Some(NumberFormat::DecimalComma));
    }

    #[test]
    fn invalid_settings_fail_fast() {
        let directory = tempdir().expect("temp dir");
        let cases = [
            r#"{ "fields": { "due_date": { "type": "date" } } }"#,
            r#"{ "fields": { "iban": { "type": "exact_code", "pattern": "([A-Z" } } }"#,
            r#"{ "fields": { "tax_rate": { "type": "money", "epsilon": -1.0 } } }"#,
            r#"{ "workers": 0 }"#,
            r#"{ "timeout": 5 }"#,
        ];

        for (index, case) in cases.iter().enumerate() {
            let path = directory.path().join(format!("case-{index}.json"));
            fs::write(&path, case).expect("config written");
            assert!(BenchmarkConfig::load(Some(&path)).is_err(), "{case}");
        }
    }
}
