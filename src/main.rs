use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sales_forecaster::{
    build_features, compare_columns,
    config::{ModelVariant, PipelinePaths, SchemaPolicy, TrainParams},
    features::build_training_features,
    service::{error_response, load_context, parse_request, preprocess_report, PredictionService},
    train::train,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

// Pipeline entry point
// 1. build-features: raw CSVs -> processed parquet
// 2. train: processed parquet -> model + frozen columns/vocabulary
// 3. predict / serve: raw request -> forecast

#[derive(Parser, Debug)]
#[command(name = "sales-forecaster", version, about = "Retail sales forecasting pipeline")]
struct Cli {
    /// Root holding raw/ and processed/
    #[arg(long, env = "FORECAST_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    #[arg(long, env = "FORECAST_MODELS_DIR", default_value = "models", global = true)]
    models_dir: PathBuf,

    /// full | nolag
    #[arg(long, env = "FORECAST_VARIANT", default_value = "nolag", global = true)]
    variant: ModelVariant,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Melt, merge and engineer the training features
    BuildFeatures {
        /// Keep only the first N series of the sales table (0 = all)
        #[arg(long, default_value_t = 5000)]
        max_series: usize,
    },
    /// Train the model and freeze the feature artifacts
    Train {
        /// JSON file overriding the default training parameters
        #[arg(long)]
        params: Option<PathBuf>,
    },
    /// Forecast a single JSON request, e.g. '{"item_id":"FOODS_1_001","date":"2016-05-01"}'
    Predict {
        request: String,
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        no_round: bool,
    },
    /// Show the feature row a request turns into
    Preprocess {
        request: String,
        #[arg(long)]
        strict: bool,
    },
    /// Check a request's produced columns against the frozen training list
    CompareFeatures { request: String },
    /// Answer one JSON request per stdin line with one JSON response per stdout line
    Serve {
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        no_round: bool,
    },
}

fn policy(strict: bool) -> SchemaPolicy {
    if strict {
        SchemaPolicy::Strict
    } else {
        SchemaPolicy::FillSentinel
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let paths = PipelinePaths::new(&cli.data_dir, &cli.models_dir, cli.variant);

    match cli.command {
        Command::BuildFeatures { max_series } => {
            let df = build_training_features(&paths, max_series)?;
            info!(
                rows = df.height(),
                cols = df.width(),
                path = %paths.train_features().display(),
                "processed data saved"
            );
        }
        Command::Train { params } => {
            let params = match params {
                Some(path) => TrainParams::from_json_file(&path)?,
                None => TrainParams::default(),
            };
            let summary = train(&paths, &params)?;
            info!(
                train_rows = summary.train_rows,
                valid_rows = summary.valid_rows,
                features = summary.n_features,
                valid_rmse = summary.fit.valid_rmse,
                "training complete"
            );
        }
        Command::Predict {
            request,
            strict,
            no_round,
        } => {
            let service = PredictionService::load(&paths, policy(strict), !no_round)?;
            let response = service.handle_json(&request);
            println!("{response}");
            if response.get("error").is_some() {
                std::process::exit(1);
            }
        }
        Command::Preprocess { request, strict } => {
            let ctx = load_context(&paths, policy(strict))?;
            match parse_request(&request).and_then(|record| preprocess_report(&ctx, &record)) {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(err) => {
                    println!("{}", error_response(&err));
                    std::process::exit(1);
                }
            }
        }
        Command::CompareFeatures { request } => {
            let ctx = load_context(&paths, SchemaPolicy::FillSentinel)?;
            let record = parse_request(&request)?;
            let built = build_features(&ctx, &record)?;
            let produced: Vec<String> = built
                .vector
                .columns
                .iter()
                .filter(|c| !built.drift.filled.contains(c))
                .cloned()
                .collect();
            let comparison = compare_columns(ctx.columns.names(), &produced);

            println!("Training cols count: {}", ctx.columns.len());
            println!("Preprocess cols count: {}", produced.len());
            println!("Missing (in training but not produced): {:?}", comparison.missing);
            println!("Ignored (produced but not in training): {:?}", built.drift.ignored);
            println!("Order matches exactly: {}", comparison.same_order);
        }
        Command::Serve { strict, no_round } => {
            let service = PredictionService::load(&paths, policy(strict), !no_round)?;
            let stdin = io::stdin();
            let mut stdout = io::stdout().lock();
            for line in stdin.lock().lines() {
                let line = line.context("reading request from stdin")?;
                if line.trim().is_empty() {
                    continue;
                }
                let response = service.handle_json(&line);
                writeln!(stdout, "{response}")?;
                stdout.flush()?;
            }
        }
    }

    Ok(())
}
