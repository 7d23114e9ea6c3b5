use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use crate::config::{ModelVariant, PipelinePaths, TrainParams};
use crate::error::ForecastError;
use crate::features::{add_date_parts, is_history_column};
use crate::model::{FeatureMatrix, FitReport, XgbRegressor};
use crate::reference::{float_column, read_parquet, text_column, write_parquet, MISSING_LEVEL};
use crate::vocab::{CategoricalVocabulary, FeatureColumns};

pub const TARGET: &str = "sales";

/// Identifier / leakage columns never handed to the model.
pub const NON_FEATURE_COLUMNS: [&str; 3] = ["id", "d", "date"];

/// Encoded training matrix plus the artifacts that must be frozen with it.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub x: FeatureMatrix,
    pub y: Vec<f32>,
    pub columns: FeatureColumns,
    pub vocab: CategoricalVocabulary,
}

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub train_rows: usize,
    pub valid_rows: usize,
    pub n_features: usize,
    pub fit: FitReport,
}

pub fn ensure_target(df: &DataFrame) -> Result<(), ForecastError> {
    if df.get_column_names().contains(&TARGET) {
        Ok(())
    } else {
        Err(ForecastError::MissingTarget(TARGET.to_string()))
    }
}

/// Random subset of `frac` of the rows, reproducible through `seed`.
pub fn sample_frame(df: &DataFrame, frac: f64, seed: u64) -> anyhow::Result<DataFrame> {
    if frac >= 1.0 {
        return Ok(df.clone());
    }
    let mut indices: Vec<u32> = (0..df.height() as u32).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    indices.truncate((df.height() as f64 * frac).round() as usize);

    let idx = UInt32Chunked::from_vec("", indices);
    Ok(df.take(&idx)?)
}

/// Shuffled split of `n` row indices into (train, valid).
pub fn train_valid_split(n: usize, valid_frac: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let n_valid = ((n as f64 * valid_frac).ceil() as usize).min(n);
    let valid = indices.split_off(n - n_valid);
    (indices, valid)
}

/// Turn the processed table into the model matrix: re-derive date parts,
/// drop identifiers (and history columns for the no-lag variant), freeze the
/// column order and encode text columns against a freshly fitted vocabulary.
pub fn prepare_features(df: &DataFrame, variant: ModelVariant) -> anyhow::Result<PreparedData> {
    ensure_target(df)?;

    let mut df = df.clone();
    if df.get_column_names().contains(&"date") {
        add_date_parts(&mut df)?;
    }

    let feature_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .filter(|name| *name != TARGET && !NON_FEATURE_COLUMNS.contains(name))
        .filter(|name| variant == ModelVariant::Full || !is_history_column(name))
        .map(str::to_string)
        .collect();
    anyhow::ensure!(
        !feature_names.is_empty(),
        "no feature columns left after dropping identifiers"
    );

    let target = float_column(&df, TARGET)?;
    let labelled: Vec<usize> = (0..df.height()).filter(|&row| target[row].is_some()).collect();

    let mut vocab = CategoricalVocabulary::new();
    let mut encoded: Vec<Vec<f32>> = Vec::with_capacity(feature_names.len());
    for name in &feature_names {
        let column = if matches!(df.column(name)?.dtype(), DataType::String) {
            let levels: Vec<String> = text_column(&df, name)?
                .into_iter()
                .map(|v| v.unwrap_or_else(|| MISSING_LEVEL.to_string()))
                .collect();
            vocab.fit(name, levels.iter().cloned());
            levels
                .iter()
                .map(|level| vocab.encode(name, level) as f32)
                .collect()
        } else {
            float_column(&df, name)?
                .into_iter()
                .map(|v| v.map_or(f32::NAN, |v| v as f32))
                .collect()
        };
        encoded.push(column);
    }

    let mut values = Vec::with_capacity(labelled.len() * feature_names.len());
    for &row in &labelled {
        values.extend(encoded.iter().map(|column| column[row]));
    }
    let y: Vec<f32> = labelled
        .iter()
        .map(|&row| target[row].unwrap_or_default() as f32)
        .collect();

    let x = FeatureMatrix::new(feature_names.clone(), values, labelled.len())?;
    Ok(PreparedData {
        x,
        y,
        columns: FeatureColumns::new(feature_names),
        vocab,
    })
}

/// Full training run: processed parquet in, model + frozen artifacts +
/// validation split out.
pub fn train(paths: &PipelinePaths, params: &TrainParams) -> anyhow::Result<TrainSummary> {
    params.validate()?;

    // 1. Load the processed feature table
    let df = read_parquet(&paths.train_features())?;
    ensure_target(&df)?;

    // 2. Sample for quicker runs
    let df = sample_frame(&df, params.sample_frac, params.seed)?;
    info!(rows = df.height(), sample_frac = params.sample_frac, "sampled training rows");

    // 3. Encode features and freeze the artifacts
    let prepared = prepare_features(&df, paths.variant)?;
    prepared.columns.save(&paths.feature_columns())?;
    prepared.vocab.save(&paths.cat_mappings())?;
    info!(
        features = prepared.columns.len(),
        categorical = prepared.vocab.columns().count(),
        path = %paths.feature_columns().display(),
        "saved feature columns and categorical mappings"
    );

    // 4. Split and keep the validation rows for offline evaluation
    let (train_idx, valid_idx) =
        train_valid_split(prepared.x.n_rows(), params.valid_frac, params.seed);
    anyhow::ensure!(
        !train_idx.is_empty() && !valid_idx.is_empty(),
        "not enough rows to split: {} labelled rows",
        prepared.x.n_rows()
    );
    let x_train = prepared.x.take_rows(&train_idx);
    let x_valid = prepared.x.take_rows(&valid_idx);
    let y_train: Vec<f32> = train_idx.iter().map(|&i| prepared.y[i]).collect();
    let y_valid: Vec<f32> = valid_idx.iter().map(|&i| prepared.y[i]).collect();

    write_parquet(&mut x_valid.to_frame()?, &paths.x_valid())?;
    write_parquet(&mut DataFrame::new(vec![Series::new(TARGET, &y_valid)])?, &paths.y_valid())?;

    // 5. Fit and persist
    let (model, fit) = XgbRegressor::fit(&x_train, &y_train, &x_valid, &y_valid, params)?;
    info!(
        rounds = fit.best_rounds,
        valid_rmse = fit.valid_rmse,
        valid_mae = fit.valid_mae,
        "model trained"
    );
    model.save(&paths.model())?;
    info!(path = %paths.model().display(), variant = %paths.variant, "saved model");

    Ok(TrainSummary {
        train_rows: train_idx.len(),
        valid_rows: valid_idx.len(),
        n_features: x_train.n_cols(),
        fit,
    })
}
