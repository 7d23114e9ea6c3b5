//! Single-record feature builder. Produces exactly the frozen training
//! columns, in order, from a raw request and the read-only reference data.
//!
//! History features (`lag_*`, `rolling_*`) cannot be derived from one
//! request. A model trained with them gets the -1 sentinel in their place,
//! which is a known train/serve skew; the no-lag variant avoids it.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::SchemaPolicy;
use crate::error::ForecastError;
use crate::features::{date_parts, DATE_PART_COLUMNS};
use crate::model::FeatureMatrix;
use crate::reference::{parse_date, Cell, ReferenceData, SENTINEL};
use crate::vocab::{CategoricalVocabulary, FeatureColumns};

pub type RawRecord = serde_json::Map<String, Value>;

/// Read-only state shared by every request.
#[derive(Debug, Clone)]
pub struct InferenceContext {
    pub reference: ReferenceData,
    pub columns: FeatureColumns,
    pub vocab: CategoricalVocabulary,
    pub policy: SchemaPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    pub columns: Vec<String>,
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn to_matrix(&self) -> anyhow::Result<FeatureMatrix> {
        FeatureMatrix::from_row(self.columns.clone(), self.values.clone())
    }

    pub fn get(&self, column: &str) -> Option<f32> {
        let idx = self.columns.iter().position(|c| c == column)?;
        Some(self.values[idx])
    }
}

/// Columns the builder had to invent or throw away for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftReport {
    /// Training columns absent from the request after every join; sent as -1.
    pub filled: Vec<String>,
    /// Produced columns the model was not trained on.
    pub ignored: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuiltFeatures {
    pub vector: FeatureVector,
    pub drift: DriftReport,
}

/// Difference between the frozen column list and what was produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnComparison {
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    pub same_order: bool,
}

impl ColumnComparison {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.same_order
    }
}

pub fn compare_columns(frozen: &[String], produced: &[String]) -> ColumnComparison {
    ColumnComparison {
        missing: frozen.iter().filter(|c| !produced.contains(c)).cloned().collect(),
        extra: produced.iter().filter(|c| !frozen.contains(c)).cloned().collect(),
        same_order: frozen == produced,
    }
}

/// The produced columns must equal the frozen list, names and order.
pub fn validate_schema(frozen: &FeatureColumns, produced: &[String]) -> Result<(), ForecastError> {
    let comparison = compare_columns(frozen.names(), produced);
    if comparison.is_exact() {
        Ok(())
    } else {
        Err(ForecastError::SchemaMismatch {
            missing: comparison.missing,
            extra: comparison.extra,
            same_order: comparison.same_order,
        })
    }
}

fn cell_from_json(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Missing,
        Value::Bool(b) => Cell::Num(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64().map_or(Cell::Missing, Cell::Num),
        Value::String(s) => Cell::Text(s.clone()),
        other => Cell::Text(other.to_string()),
    }
}

fn required_text(record: &RawRecord, field: &str) -> Result<String, ForecastError> {
    match record.get(field).map(cell_from_json) {
        Some(Cell::Text(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(cell @ Cell::Num(_)) => Ok(cell.as_category()),
        _ => Err(ForecastError::MissingField(field.to_string())),
    }
}

/// Build the model input for one raw request.
pub fn build_features(
    ctx: &InferenceContext,
    record: &RawRecord,
) -> Result<BuiltFeatures, ForecastError> {
    let item_id = required_text(record, "item_id")?;
    let raw_date = required_text(record, "date")?;
    let date = parse_date(&raw_date).ok_or_else(|| ForecastError::InvalidDate(raw_date.clone()))?;
    let meta = ctx
        .reference
        .items
        .get(&item_id)
        .ok_or_else(|| ForecastError::UnknownItem(item_id.clone()))?;
    let store_id = required_text(record, "store_id").unwrap_or_else(|_| meta.store_id.clone());

    let mut row: BTreeMap<String, Cell> = record
        .iter()
        .map(|(key, value)| (key.clone(), cell_from_json(value)))
        .collect();
    row.insert("item_id".into(), Cell::Text(item_id.clone()));
    row.insert("store_id".into(), Cell::Text(store_id.clone()));
    row.insert("dept_id".into(), Cell::Text(meta.dept_id.clone()));
    row.insert("cat_id".into(), Cell::Text(meta.cat_id.clone()));
    row.insert("state_id".into(), Cell::Text(meta.state_id.clone()));
    row.insert("date".into(), Cell::Text(date.format("%Y-%m-%d").to_string()));

    let calendar = &ctx.reference.calendar;
    let day = calendar.by_date(date);
    match day {
        Some(day) => {
            row.insert("d".into(), Cell::Text(day.d.clone()));
            let week = day.wm_yr_wk.map_or(Cell::Missing, |w| Cell::Num(w as f64));
            row.insert("wm_yr_wk".into(), week);
            for (name, cell) in calendar.attr_names().iter().zip(&day.attrs) {
                row.insert(name.clone(), cell.clone());
            }
        }
        // Unmatched calendar join: the columns exist, their values do not.
        None => {
            row.insert("wm_yr_wk".into(), Cell::Missing);
            for name in calendar.attr_names() {
                row.insert(name.clone(), Cell::Missing);
            }
        }
    }

    let price = day
        .and_then(|day| day.wm_yr_wk)
        .and_then(|week| ctx.reference.prices.get(&store_id, &item_id, week));
    row.insert("sell_price".into(), Cell::Num(price.unwrap_or(SENTINEL)));

    for (name, value) in DATE_PART_COLUMNS.iter().zip(date_parts(date)) {
        row.insert(name.to_string(), Cell::Num(value));
    }

    let mut produced = Vec::with_capacity(ctx.columns.len());
    let mut drift = DriftReport::default();
    for (name, cell) in &row {
        if ctx.columns.contains(name) {
            produced.push((name.clone(), encode_cell(&ctx.vocab, name, cell)?));
        } else {
            drift.ignored.push(name.clone());
        }
    }
    for column in ctx.columns.names() {
        if !row.contains_key(column) {
            drift.filled.push(column.clone());
            produced.push((column.clone(), SENTINEL));
        }
    }

    if !drift.filled.is_empty() {
        match ctx.policy {
            SchemaPolicy::Strict => return Err(ForecastError::SchemaDrift(drift.filled)),
            SchemaPolicy::FillSentinel => warn!(
                columns = ?drift.filled,
                "training columns missing at inference, filled with -1"
            ),
        }
    }

    let vector = align_to_frozen(&ctx.columns, produced)?;
    Ok(BuiltFeatures { vector, drift })
}

fn encode_cell(
    vocab: &CategoricalVocabulary,
    column: &str,
    cell: &Cell,
) -> Result<f64, ForecastError> {
    if vocab.contains(column) {
        return Ok(vocab.encode(column, &cell.as_category()) as f64);
    }
    match cell {
        Cell::Num(v) => Ok(*v),
        Cell::Missing => Ok(SENTINEL),
        Cell::Text(s) => s.trim().parse::<f64>().map_err(|_| ForecastError::NonNumeric {
            column: column.to_string(),
            value: s.clone(),
        }),
    }
}

/// Reorder produced `(column, value)` pairs into the frozen order, dropping
/// columns the model does not know, then check the result against the
/// frozen list.
pub fn align_to_frozen(
    frozen: &FeatureColumns,
    produced: Vec<(String, f64)>,
) -> Result<FeatureVector, ForecastError> {
    let mut by_name: HashMap<String, f64> = produced.into_iter().collect();
    let mut columns = Vec::with_capacity(frozen.len());
    let mut values = Vec::with_capacity(frozen.len());
    for name in frozen.names() {
        if let Some(value) = by_name.remove(name) {
            columns.push(name.clone());
            values.push(value as f32);
        }
    }
    validate_schema(frozen, &columns)?;
    Ok(FeatureVector { columns, values })
}
