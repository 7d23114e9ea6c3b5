use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which flavour of model the artifacts belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    /// Keeps the lag and rolling-mean columns. Those cannot be computed from a
    /// single request, so serving this variant sentinel-fills them.
    Full,
    /// Trained without any `lag_*` / `rolling_*` column.
    NoLag,
}

impl ModelVariant {
    fn suffix(&self) -> &'static str {
        match self {
            ModelVariant::Full => "",
            ModelVariant::NoLag => "_nolag",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVariant::Full => write!(f, "full"),
            ModelVariant::NoLag => write!(f, "nolag"),
        }
    }
}

impl FromStr for ModelVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(ModelVariant::Full),
            "nolag" | "no-lag" | "no_lag" => Ok(ModelVariant::NoLag),
            other => anyhow::bail!("unknown model variant '{other}', expected 'full' or 'nolag'"),
        }
    }
}

/// How the inference feature builder treats training columns it could not produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaPolicy {
    /// Fill them with the -1 sentinel and log a warning.
    #[default]
    FillSentinel,
    /// Reject the request with `ForecastError::SchemaDrift`.
    Strict,
}

/// Every file location the pipeline reads or writes.
#[derive(Debug, Clone)]
pub struct PipelinePaths {
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub variant: ModelVariant,
}

impl PipelinePaths {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        models_dir: impl Into<PathBuf>,
        variant: ModelVariant,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            models_dir: models_dir.into(),
            variant,
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data_dir.join("processed")
    }

    pub fn calendar_csv(&self) -> PathBuf {
        self.raw_dir().join("calendar.csv")
    }

    pub fn sales_csv(&self) -> PathBuf {
        self.raw_dir().join("sales_train_validation.csv")
    }

    pub fn prices_csv(&self) -> PathBuf {
        self.raw_dir().join("sell_prices.csv")
    }

    pub fn train_features(&self) -> PathBuf {
        self.processed_dir().join("train_features.parquet")
    }

    pub fn x_valid(&self) -> PathBuf {
        self.processed_dir()
            .join(format!("X_valid{}.parquet", self.variant.suffix()))
    }

    pub fn y_valid(&self) -> PathBuf {
        self.processed_dir()
            .join(format!("y_valid{}.parquet", self.variant.suffix()))
    }

    pub fn feature_columns(&self) -> PathBuf {
        self.models_dir
            .join(format!("feature_columns{}.json", self.variant.suffix()))
    }

    pub fn cat_mappings(&self) -> PathBuf {
        self.models_dir
            .join(format!("cat_mappings{}.json", self.variant.suffix()))
    }

    pub fn model(&self) -> PathBuf {
        self.models_dir
            .join(format!("model{}.xgb", self.variant.suffix()))
    }
}

/// Hyperparameters and sampling options for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainParams {
    pub learning_rate: f32,
    pub max_depth: u32,
    /// Upper bound on boosting rounds before early stopping kicks in.
    pub n_estimators: u32,
    pub early_stopping_rounds: u32,
    /// Fraction of processed rows used for training; 1.0 keeps everything.
    pub sample_frac: f64,
    pub valid_frac: f64,
    pub seed: u64,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            max_depth: 6,
            n_estimators: 300,
            early_stopping_rounds: 30,
            sample_frac: 0.2,
            valid_frac: 0.2,
            seed: 42,
        }
    }
}

impl TrainParams {
    /// Read parameters from a JSON file; keys left out keep their defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading training params {}", path.display()))?;
        let params: TrainParams = serde_json::from_str(&raw)
            .with_context(|| format!("parsing training params {}", path.display()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.sample_frac > 0.0 && self.sample_frac <= 1.0,
            "sample_frac must be in (0, 1], got {}",
            self.sample_frac
        );
        anyhow::ensure!(
            self.valid_frac > 0.0 && self.valid_frac < 1.0,
            "valid_frac must be in (0, 1), got {}",
            self.valid_frac
        );
        anyhow::ensure!(self.n_estimators > 0, "n_estimators must be positive");
        Ok(())
    }
}
