use std::path::Path;

use anyhow::{anyhow, Context};
use polars::prelude::*;
use tracing::{debug, info};
use xgboost::{parameters, Booster, DMatrix};

use crate::config::TrainParams;

/// Dense row-major f32 matrix with named columns, the shape the booster consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    columns: Vec<String>,
    values: Vec<f32>,
    n_rows: usize,
}

impl FeatureMatrix {
    pub fn new(columns: Vec<String>, values: Vec<f32>, n_rows: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            values.len() == columns.len() * n_rows,
            "matrix has {} values, expected {} rows x {} columns",
            values.len(),
            n_rows,
            columns.len()
        );
        Ok(Self {
            columns,
            values,
            n_rows,
        })
    }

    pub fn from_row(columns: Vec<String>, row: Vec<f32>) -> anyhow::Result<Self> {
        Self::new(columns, row, 1)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn row(&self, idx: usize) -> &[f32] {
        let width = self.n_cols();
        &self.values[idx * width..(idx + 1) * width]
    }

    pub fn take_rows(&self, rows: &[usize]) -> FeatureMatrix {
        let mut values = Vec::with_capacity(rows.len() * self.n_cols());
        for &row in rows {
            values.extend_from_slice(self.row(row));
        }
        FeatureMatrix {
            columns: self.columns.clone(),
            values,
            n_rows: rows.len(),
        }
    }

    /// Back to a polars frame, one Float32 column per feature.
    pub fn to_frame(&self) -> anyhow::Result<DataFrame> {
        let width = self.n_cols();
        let columns = self
            .columns
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let values: Vec<f32> = (0..self.n_rows)
                    .map(|row| self.values[row * width + col])
                    .collect();
                Series::new(name, values)
            })
            .collect();
        Ok(DataFrame::new(columns)?)
    }

    fn to_dmatrix(&self, labels: Option<&[f32]>) -> anyhow::Result<DMatrix> {
        anyhow::ensure!(self.n_rows > 0, "cannot build a DMatrix from zero rows");
        let mut dmatrix = DMatrix::from_dense(&self.values, self.n_rows)?;
        if let Some(labels) = labels {
            dmatrix.set_labels(labels)?;
        }
        Ok(dmatrix)
    }
}

/// Anything that turns a feature matrix into one forecast per row.
pub trait Regressor {
    fn predict(&self, features: &FeatureMatrix) -> anyhow::Result<Vec<f32>>;
}

/// Outcome of a fit with early stopping.
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub best_rounds: u32,
    pub valid_rmse: f64,
    pub valid_mae: f64,
}

pub struct XgbRegressor {
    booster: Booster,
}

impl XgbRegressor {
    /// Fits a squared-error booster, stopping once validation RMSE has not
    /// improved for `early_stopping_rounds`, then refits to the best round count.
    pub fn fit(
        x_train: &FeatureMatrix,
        y_train: &[f32],
        x_valid: &FeatureMatrix,
        y_valid: &[f32],
        params: &TrainParams,
    ) -> anyhow::Result<(Self, FitReport)> {
        let dtrain = x_train.to_dmatrix(Some(y_train))?;
        let dvalid = x_valid.to_dmatrix(Some(y_valid))?;

        let mut probe =
            Booster::new_with_cached_dmats(&booster_params(params)?, &[&dtrain, &dvalid])?;
        let mut best_score = f64::INFINITY;
        let mut best_round = 0u32;
        for round in 0..params.n_estimators {
            probe.update(&dtrain, round as i32)?;
            let score = rmse(&probe.predict(&dvalid)?, y_valid);
            debug!(round, valid_rmse = score, "boosting round");
            if score < best_score {
                best_score = score;
                best_round = round;
            } else if round - best_round >= params.early_stopping_rounds {
                info!(round, best_round, "early stopping");
                break;
            }
        }

        let best_rounds = best_round + 1;
        let training = parameters::TrainingParametersBuilder::default()
            .dtrain(&dtrain)
            .boost_rounds(best_rounds)
            .booster_params(booster_params(params)?)
            .evaluation_sets(None)
            .build()
            .map_err(|e| anyhow!("invalid training parameters: {e}"))?;
        let booster = Booster::train(&training)?;

        let model = XgbRegressor { booster };
        let predictions = model.predict(x_valid)?;
        let report = FitReport {
            best_rounds,
            valid_rmse: rmse(&predictions, y_valid),
            valid_mae: mae(&predictions, y_valid),
        };
        Ok((model, report))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.booster
            .save(path)
            .with_context(|| format!("saving model to {}", path.display()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let booster = Booster::load(path)
            .with_context(|| format!("loading model {}", path.display()))?;
        Ok(Self { booster })
    }
}

impl Regressor for XgbRegressor {
    fn predict(&self, features: &FeatureMatrix) -> anyhow::Result<Vec<f32>> {
        let dmatrix = features.to_dmatrix(None)?;
        Ok(self.booster.predict(&dmatrix)?)
    }
}

fn booster_params(params: &TrainParams) -> anyhow::Result<parameters::BoosterParameters> {
    let learning_params = parameters::learning::LearningTaskParametersBuilder::default()
        .objective(parameters::learning::Objective::RegLinear)
        .build()
        .map_err(|e| anyhow!("invalid learning parameters: {e}"))?;

    let tree_params = parameters::tree::TreeBoosterParametersBuilder::default()
        .eta(params.learning_rate)
        .max_depth(params.max_depth)
        .build()
        .map_err(|e| anyhow!("invalid tree parameters: {e}"))?;

    parameters::BoosterParametersBuilder::default()
        .booster_type(parameters::BoosterType::Tree(tree_params))
        .learning_params(learning_params)
        .verbose(false)
        .build()
        .map_err(|e| anyhow!("invalid booster parameters: {e}"))
}

pub fn rmse(predicted: &[f32], actual: &[f32]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let sse: f64 = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (*p as f64 - *a as f64).powi(2))
        .sum();
    (sse / actual.len() as f64).sqrt()
}

pub fn mae(predicted: &[f32], actual: &[f32]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let sae: f64 = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (*p as f64 - *a as f64).abs())
        .sum();
    sae / actual.len() as f64
}
