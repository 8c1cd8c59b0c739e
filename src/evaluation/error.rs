use std::time::Duration;

use thiserror::Error;

use crate::schema::Field;

/// A present value that could not be brought into canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("value is empty")]
    Empty,

    #[error("unrecognized date format: {0:?}")]
    UnparseableDate(String),

    #[error("unrecognized amount: {0:?}")]
    UnparseableAmount(String),

    /// `1.234` style input: a single separator followed by a three digit
    /// group reads as either a thousands mark or a decimal point.
    #[error("ambiguous separator in {0:?}; a number format hint is required")]
    AmbiguousSeparator(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("record is missing schema field `{}`", field.key())]
    MissingField { field: Field },

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("field `{}` holds an unsupported value: {value}", field.key())]
    UnsupportedValue { field: Field, value: String },

    #[error("unknown number_format {0}; expected \"decimal_comma\" or \"decimal_point\"")]
    InvalidNumberFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("extraction exceeded timeout of {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("extraction failed: {0}")]
    Failed(String),

    #[error("extraction worker exited without a result")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("cannot merge metrics of variant `{right}` into `{left}`")]
    VariantMismatch { left: String, right: String },
}
