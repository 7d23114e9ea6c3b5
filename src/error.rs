use thiserror::Error;

/// Errors surfaced to the caller of a single prediction or training run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    #[error("malformed request: {0}")]
    InvalidRequest(String),

    #[error("request is missing required field '{0}'")]
    MissingField(String),

    #[error("could not parse date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("unknown item_id '{0}': not present in item metadata")]
    UnknownItem(String),

    #[error("column '{column}' holds non-numeric value '{value}' and has no vocabulary")]
    NonNumeric { column: String, value: String },

    #[error("schema mismatch: missing {missing:?}, extra {extra:?}, same order: {same_order}")]
    SchemaMismatch {
        missing: Vec<String>,
        extra: Vec<String>,
        same_order: bool,
    },

    #[error("training columns absent at inference: {0:?}")]
    SchemaDrift(Vec<String>),

    #[error("processed data must contain a '{0}' column")]
    MissingTarget(String),

    #[error("model failure: {0}")]
    Model(String),
}

impl ForecastError {
    /// Stable machine-readable tag used in structured error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ForecastError::InvalidRequest(_) => "invalid_request",
            ForecastError::MissingField(_) => "missing_field",
            ForecastError::InvalidDate(_) => "invalid_date",
            ForecastError::UnknownItem(_) => "unknown_item",
            ForecastError::NonNumeric { .. } => "non_numeric",
            ForecastError::SchemaMismatch { .. } => "schema_mismatch",
            ForecastError::SchemaDrift(_) => "schema_drift",
            ForecastError::MissingTarget(_) => "missing_target",
            ForecastError::Model(_) => "model",
        }
    }
}
