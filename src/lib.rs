//! Retail sales forecasting: feature ETL over the M5-style raw tables,
//! gradient-boosted training, and a single-record prediction service whose
//! preprocessing reproduces the training features column for column.

pub mod config;
pub mod error;
pub mod features;
pub mod inference;
pub mod model;
pub mod reference;
pub mod service;
pub mod train;
pub mod vocab;

pub use config::{ModelVariant, PipelinePaths, SchemaPolicy, TrainParams};
pub use error::ForecastError;
pub use inference::{
    align_to_frozen, build_features, compare_columns, validate_schema, InferenceContext, RawRecord,
};
pub use model::{FeatureMatrix, Regressor, XgbRegressor};
pub use reference::ReferenceData;
pub use service::{Prediction, PredictionService};
pub use vocab::{CategoricalVocabulary, FeatureColumns};
