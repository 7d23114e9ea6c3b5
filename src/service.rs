//! Prediction surface: raw record in, one forecast out. Every per-request
//! failure comes back as a `ForecastError`; only startup can be fatal.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{PipelinePaths, SchemaPolicy};
use crate::error::ForecastError;
use crate::inference::{build_features, BuiltFeatures, InferenceContext, RawRecord};
use crate::model::{Regressor, XgbRegressor};
use crate::reference::ReferenceData;
use crate::vocab::{CategoricalVocabulary, FeatureColumns};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub prediction: f64,
}

/// What the debug preprocess call returns: the produced columns and the row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreprocessReport {
    pub columns: Vec<String>,
    pub sample_row: serde_json::Map<String, Value>,
    pub filled: Vec<String>,
    pub ignored: Vec<String>,
}

pub struct PredictionService {
    ctx: InferenceContext,
    model: Box<dyn Regressor>,
    round: bool,
}

impl PredictionService {
    pub fn new(ctx: InferenceContext, model: Box<dyn Regressor>, round: bool) -> Self {
        Self { ctx, model, round }
    }

    /// Load the model, frozen artifacts and reference tables. Any failure
    /// here means the service must not start.
    pub fn load(paths: &PipelinePaths, policy: SchemaPolicy, round: bool) -> anyhow::Result<Self> {
        let model = XgbRegressor::load(&paths.model())?;
        let ctx = load_context(paths, policy)?;
        info!(
            variant = %paths.variant,
            model = %paths.model().display(),
            "prediction service ready"
        );
        Ok(Self::new(ctx, Box::new(model), round))
    }

    pub fn context(&self) -> &InferenceContext {
        &self.ctx
    }

    pub fn preprocess(&self, record: &RawRecord) -> Result<BuiltFeatures, ForecastError> {
        build_features(&self.ctx, record)
    }

    pub fn predict(&self, record: &RawRecord) -> Result<Prediction, ForecastError> {
        let built = self.preprocess(record)?;
        let matrix = built
            .vector
            .to_matrix()
            .map_err(|e| ForecastError::Model(e.to_string()))?;
        let output = self
            .model
            .predict(&matrix)
            .map_err(|e| ForecastError::Model(e.to_string()))?;

        let value = match output.as_slice() {
            [single] => *single as f64,
            other => {
                return Err(ForecastError::Model(format!(
                    "expected one prediction, got {}",
                    other.len()
                )))
            }
        };
        let prediction = if self.round { value.round() } else { value };
        debug!(prediction, "prediction served");
        Ok(Prediction { prediction })
    }

    pub fn preprocess_report(&self, record: &RawRecord) -> Result<PreprocessReport, ForecastError> {
        preprocess_report(&self.ctx, record)
    }

    /// Answer one JSON request line. Never fails: errors become
    /// `{"error": {"kind", "message"}}` responses.
    pub fn handle_json(&self, line: &str) -> Value {
        match parse_request(line).and_then(|record| self.predict(&record)) {
            Ok(prediction) => json!(prediction),
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "prediction request failed");
                error_response(&err)
            }
        }
    }
}

pub fn preprocess_report(
    ctx: &InferenceContext,
    record: &RawRecord,
) -> Result<PreprocessReport, ForecastError> {
    let built = build_features(ctx, record)?;
    let sample_row = built
        .vector
        .columns
        .iter()
        .zip(&built.vector.values)
        .map(|(column, value)| (column.clone(), json!(value)))
        .collect();
    Ok(PreprocessReport {
        columns: built.vector.columns,
        sample_row,
        filled: built.drift.filled,
        ignored: built.drift.ignored,
    })
}

/// Frozen artifacts plus reference tables; everything preprocessing needs.
pub fn load_context(
    paths: &PipelinePaths,
    policy: SchemaPolicy,
) -> anyhow::Result<InferenceContext> {
    let columns = FeatureColumns::load(&paths.feature_columns())?;
    let vocab = CategoricalVocabulary::load(&paths.cat_mappings())?;
    let reference = ReferenceData::load(paths)?;

    info!(
        features = columns.len(),
        categorical = vocab.columns().count(),
        "loaded frozen feature artifacts"
    );
    Ok(InferenceContext {
        reference,
        columns,
        vocab,
        policy,
    })
}

pub fn error_response(err: &ForecastError) -> Value {
    json!({ "error": { "kind": err.kind(), "message": err.to_string() } })
}

/// Accepts `{"features": {...}}` or the bare feature object.
pub fn parse_request(line: &str) -> Result<RawRecord, ForecastError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ForecastError::InvalidRequest(e.to_string()))?;
    let body = match value {
        Value::Object(mut map) => match map.remove("features") {
            Some(Value::Object(features)) => features,
            Some(_) => {
                return Err(ForecastError::InvalidRequest(
                    "'features' must be a JSON object".into(),
                ))
            }
            None => map,
        },
        _ => return Err(ForecastError::InvalidRequest("request must be a JSON object".into())),
    };
    Ok(body)
}
