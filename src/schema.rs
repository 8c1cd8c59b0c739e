use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evaluation::error::SchemaError;

pub const FIELD_COUNT: usize = 10;
pub const DEFAULT_MONEY_EPSILON: f64 = 0.005;
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.85;

const REFERENCE_CODE_PATTERN: &str = r"^[A-Z0-9][A-Z0-9/_.\-]*$";
const CURRENCY_PATTERN: &str = r"^[A-Z]{3}$";
const VAT_ID_PATTERN: &str = r"^[A-Z]{2}[A-Z0-9]{8,12}$";
const IBAN_PATTERN: &str = r"^[A-Z]{2}[0-9]{2}[A-Z0-9]{11,30}$";
const IDENTIFIER_STRIP_CHARS: &str = "-./";

/// The invoice fields every ground-truth record and extraction result carry,
/// declared in schema order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "invoice_number")]
    InvoiceNumber,
    #[serde(rename = "invoice_date")]
    InvoiceDate,
    #[serde(rename = "vendor_name")]
    VendorName,
    #[serde(rename = "recipient_name")]
    RecipientName,
    #[serde(rename = "total_amount")]
    TotalAmount,
    #[serde(rename = "currency")]
    Currency,
    #[serde(rename = "tax_rate")]
    TaxRate,
    #[serde(rename = "purchase_order_number")]
    PurchaseOrderNumber,
    #[serde(rename = "ust-id")]
    UstId,
    #[serde(rename = "iban")]
    Iban,
}

impl Field {
    pub const ALL: [Field; FIELD_COUNT] = [
        Field::InvoiceNumber,
        Field::InvoiceDate,
        Field::VendorName,
        Field::RecipientName,
        Field::TotalAmount,
        Field::Currency,
        Field::TaxRate,
        Field::PurchaseOrderNumber,
        Field::UstId,
        Field::Iban,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::InvoiceNumber => "invoice_number",
            Self::InvoiceDate => "invoice_date",
            Self::VendorName => "vendor_name",
            Self::RecipientName => "recipient_name",
            Self::TotalAmount => "total_amount",
            Self::Currency => "currency",
            Self::TaxRate => "tax_rate",
            Self::PurchaseOrderNumber => "purchase_order_number",
            Self::UstId => "ust-id",
            Self::Iban => "iban",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }

    /// Position in schema order; stable across runs.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn default_kind(self) -> FieldKind {
        match self {
            Self::InvoiceNumber | Self::PurchaseOrderNumber => FieldKind::ExactCode {
                pattern: Some(REFERENCE_CODE_PATTERN.to_string()),
                strip_chars: String::new(),
                aliases: BTreeMap::new(),
            },
            Self::Currency => FieldKind::ExactCode {
                pattern: Some(CURRENCY_PATTERN.to_string()),
                strip_chars: String::new(),
                aliases: [("€", "EUR"), ("$", "USD"), ("£", "GBP")]
                    .into_iter()
                    .map(|(alias, code)| (alias.to_string(), code.to_string()))
                    .collect(),
            },
            Self::UstId => FieldKind::ExactCode {
                pattern: Some(VAT_ID_PATTERN.to_string()),
                strip_chars: IDENTIFIER_STRIP_CHARS.to_string(),
                aliases: BTreeMap::new(),
            },
            Self::Iban => FieldKind::ExactCode {
                pattern: Some(IBAN_PATTERN.to_string()),
                strip_chars: IDENTIFIER_STRIP_CHARS.to_string(),
                aliases: BTreeMap::new(),
            },
            Self::TotalAmount | Self::TaxRate => FieldKind::Money {
                epsilon: DEFAULT_MONEY_EPSILON,
            },
            Self::InvoiceDate => FieldKind::Date,
            Self::VendorName | Self::RecipientName => FieldKind::FuzzyText {
                threshold: DEFAULT_FUZZY_THRESHOLD,
            },
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// How a field is canonicalized and compared. Configured per field; the
/// comparator compiles each variant into a rule carrying its own behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Date,
    Money {
        #[serde(default = "default_money_epsilon")]
        epsilon: f64,
    },
    ExactCode {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        strip_chars: String,
        #[serde(default)]
        aliases: BTreeMap<String, String>,
    },
    FuzzyText {
        #[serde(default = "default_fuzzy_threshold")]
        threshold: f64,
    },
}

fn default_money_epsilon() -> f64 {
    DEFAULT_MONEY_EPSILON
}

fn default_fuzzy_threshold() -> f64 {
    DEFAULT_FUZZY_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub field: Field,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn defaults() -> Vec<FieldSpec> {
        Field::ALL
            .into_iter()
            .map(|field| FieldSpec {
                field,
                kind: field.default_kind(),
            })
            .collect()
    }
}

/// Locale hint for resolving `1.234`-style amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberFormat {
    #[serde(alias = "comma")]
    DecimalComma,
    #[serde(alias = "point", alias = "dot")]
    DecimalPoint,
}

impl NumberFormat {
    pub fn decimal_separator(self) -> char {
        match self {
            Self::DecimalComma => ',',
            Self::DecimalPoint => '.',
        }
    }
}

/// A non-null field value exactly as it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl RawValue {
    fn from_json(field: Field, value: &Value) -> Result<Option<Self>, SchemaError> {
        match value {
            Value::Null => Ok(None),
            Value::String(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                    Ok(None)
                } else {
                    Ok(Some(Self::Text(text.clone())))
                }
            }
            Value::Number(number) => number
                .as_f64()
                .map(|number| Some(Self::Number(number)))
                .ok_or_else(|| SchemaError::UnsupportedValue {
                    field,
                    value: number.to_string(),
                }),
            other => Err(SchemaError::UnsupportedValue {
                field,
                value: other.to_string(),
            }),
        }
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text.as_str()),
            Self::Number(number) => Cow::Owned(format_number(*number)),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

fn format_number(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}

/// One value-or-null slot per schema field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvoiceFields {
    pub invoice_number: Option<RawValue>,
    pub invoice_date: Option<RawValue>,
    pub vendor_name: Option<RawValue>,
    pub recipient_name: Option<RawValue>,
    pub total_amount: Option<RawValue>,
    pub currency: Option<RawValue>,
    pub tax_rate: Option<RawValue>,
    pub purchase_order_number: Option<RawValue>,
    #[serde(rename = "ust-id")]
    pub ust_id: Option<RawValue>,
    pub iban: Option<RawValue>,
}

impl InvoiceFields {
    /// All fields null; what a failed extraction is scored as.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, field: Field) -> Option<&RawValue> {
        self.slot(field).as_ref()
    }

    pub fn set(&mut self, field: Field, value: Option<RawValue>) {
        *self.slot_mut(field) = value;
    }

    fn slot(&self, field: Field) -> &Option<RawValue> {
        match field {
            Field::InvoiceNumber => &self.invoice_number,
            Field::InvoiceDate => &self.invoice_date,
            Field::VendorName => &self.vendor_name,
            Field::RecipientName => &self.recipient_name,
            Field::TotalAmount => &self.total_amount,
            Field::Currency => &self.currency,
            Field::TaxRate => &self.tax_rate,
            Field::PurchaseOrderNumber => &self.purchase_order_number,
            Field::UstId => &self.ust_id,
            Field::Iban => &self.iban,
        }
    }

    fn slot_mut(&mut self, field: Field) -> &mut Option<RawValue> {
        match field {
            Field::InvoiceNumber => &mut self.invoice_number,
            Field::InvoiceDate => &mut self.invoice_date,
            Field::VendorName => &mut self.vendor_name,
            Field::RecipientName => &mut self.recipient_name,
            Field::TotalAmount => &mut self.total_amount,
            Field::Currency => &mut self.currency,
            Field::TaxRate => &mut self.tax_rate,
            Field::PurchaseOrderNumber => &mut self.purchase_order_number,
            Field::UstId => &mut self.ust_id,
            Field::Iban => &mut self.iban,
        }
    }

    /// Builds the record from a parsed JSON object. Every schema key must be
    /// present; `null`, blank strings and `"null"` all mean "not provided".
    pub fn from_json_object(value: &Value) -> Result<Self, SchemaError> {
        let object = value.as_object().ok_or(SchemaError::NotAnObject)?;

        let mut fields = Self::empty();
        for field in Field::ALL {
            let raw = object
                .get(field.key())
                .ok_or(SchemaError::MissingField { field })?;
            fields.set(field, RawValue::from_json(field, raw)?);
        }

        Ok(fields)
    }

    pub fn unknown_keys(value: &Value) -> Vec<String> {
        value
            .as_object()
            .map(|object| {
                object
                    .keys()
                    .filter(|key| Field::from_key(key).is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruthRecord {
    pub document_id: String,
    pub number_format: Option<NumberFormat>,
    pub fields: InvoiceFields,
}

impl GroundTruthRecord {
    /// Reads a label object: the schema fields plus an optional
    /// `number_format` hint.
    pub fn from_json(document_id: &str, value: &Value) -> Result<Self, SchemaError> {
        let fields = InvoiceFields::from_json_object(value)?;
        let number_format = match value.get("number_format") {
            None | Some(Value::Null) => None,
            Some(hint) => Some(
                serde_json::from_value::<NumberFormat>(hint.clone())
                    .map_err(|_| SchemaError::InvalidNumberFormat(hint.to_string()))?,
            ),
        };

        Ok(Self {
            document_id: document_id.to_string(),
            number_format,
            fields,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub document_id: String,
    pub variant_id: String,
    pub fields: InvoiceFields,
    pub duration: Duration,
    pub llm_duration: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn complete_object() -> Value {
        json!({
            "invoice_number": "RE-2024-001",
            "invoice_date": "12.03.2015",
            "vendor_name": "Mustermann GmbH",
            "recipient_name": "Beispiel AG",
            "total_amount": 367.5,
            "currency": "EUR",
            "tax_rate": "19,00",
            "purchase_order_number": null,
            "ust-id": "DE123456789",
            "iban": "null",
        })
    }

    #[test]
    fn field_keys_round_trip_in_schema_order() {
        for (index, field) in Field::ALL.into_iter().enumerate() {
            assert_eq!(field.index(), index);
            assert_eq!(Field::from_key(field.key()), Some(field));
        }
        assert_eq!(Field::UstId.key(), "ust-id");
        assert_eq!(Field::from_key("ust_id"), None);
    }

    #[test]
    fn from_json_object_treats_blank_and_null_literal_as_absent() {
        let fields = InvoiceFields::from_json_object(&complete_object())
            .expect("complete object should parse");

        assert_eq!(fields.get(Field::PurchaseOrderNumber), None);
        assert_eq!(fields.get(Field::Iban), None);
        assert_eq!(fields.get(Field::TotalAmount), Some(&RawValue::Number(367.5)));
        assert_eq!(
            fields.get(Field::TaxRate),
            Some(&RawValue::Text("19,00".to_string()))
        );
    }

    #[test]
    fn from_json_object_rejects_missing_key() {
        let mut object = complete_object();
        object
            .as_object_mut()
            .expect("fixture is an object")
            .remove("ust-id");

        let error = InvoiceFields::from_json_object(&object).expect_err("missing key must fail");
        assert_eq!(error, SchemaError::MissingField { field: Field::UstId });
    }

    #[test]
    fn from_json_object_rejects_nested_values() {
        let mut object = complete_object();
        object["currency"] = json!(["EUR"]);

        let error = InvoiceFields::from_json_object(&object).expect_err("array must fail");
        assert!(matches!(
            error,
            SchemaError::UnsupportedValue {
                field: Field::Currency,
                ..
            }
        ));
    }

    #[test]
    fn unknown_keys_are_reported() {
        let mut object = complete_object();
        object["due_date"] = json!("01.04.2015");

        assert_eq!(InvoiceFields::unknown_keys(&object), vec!["due_date".to_string()]);
    }

    #[test]
    fn ground_truth_reads_number_format_hint() {
        let mut object = complete_object();
        object["number_format"] = json!("decimal_comma");

        let record = GroundTruthRecord::from_json("inv-1", &object).expect("label should parse");
        assert_eq!(record.number_format, Some(NumberFormat::DecimalComma));
        assert_eq!(record.document_id, "inv-1");
    }

    #[test]
    fn ground_truth_rejects_unknown_number_format() {
        for hint in [json!("de_DE"), json!("decimal_comma "), json!(1)] {
            let mut object = complete_object();
            object["number_format"] = hint.clone();

            assert!(
                matches!(
                    GroundTruthRecord::from_json("inv-1", &object),
                    Err(SchemaError::InvalidNumberFormat(_))
                ),
                "{hint}"
            );
        }

        let mut object = complete_object();
        object["number_format"] = Value::Null;
        let record = GroundTruthRecord::from_json("inv-1", &object).expect("null hint is absent");
        assert_eq!(record.number_format, None);
    }

    #[test]
    fn numbers_render_without_spurious_fraction() {
        assert_eq!(RawValue::Number(12345.0).as_text(), "12345");
        assert_eq!(RawValue::Number(19.5).as_text(), "19.5");
    }
}
