//! Static reference tables shared by the training ETL and the inference
//! feature builder: the calendar, the weekly price list and the item
//! metadata. They are loaded once and never mutated.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use polars::prelude::*;
use tracing::info;

use crate::config::PipelinePaths;

/// Columns identifying a series in the wide sales table, in file order.
pub const ID_COLUMNS: [&str; 6] = ["id", "item_id", "dept_id", "cat_id", "store_id", "state_id"];

/// Value written in place of anything the pipeline could not look up.
pub const SENTINEL: f64 = -1.0;

/// One loosely typed value, as it sits in a joined row before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Num(f64),
    Text(String),
    Missing,
}

impl Cell {
    /// String form used for vocabulary lookups. Missing values become the
    /// literal `"nan"`, which is how they were cast when the vocabulary was fitted.
    pub fn as_category(&self) -> String {
        match self {
            Cell::Num(v) => v.to_string(),
            Cell::Text(s) => s.clone(),
            Cell::Missing => MISSING_LEVEL.to_string(),
        }
    }
}

pub const MISSING_LEVEL: &str = "nan";

pub fn read_csv(path: &Path) -> anyhow::Result<DataFrame> {
    let df = CsvReader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?
        .has_header(true)
        .finish()
        .with_context(|| format!("parsing {}", path.display()))?;

    info!(path = %path.display(), rows = df.height(), cols = df.width(), "loaded csv");
    Ok(df)
}

pub fn read_parquet(path: &Path) -> anyhow::Result<DataFrame> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let df = ParquetReader::new(file)
        .finish()
        .with_context(|| format!("parsing {}", path.display()))?;

    info!(path = %path.display(), rows = df.height(), cols = df.width(), "loaded parquet");
    Ok(df)
}

pub fn write_parquet(df: &mut DataFrame, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    ParquetWriter::new(file)
        .finish(df)
        .with_context(|| format!("writing {}", path.display()))?;

    info!(path = %path.display(), rows = df.height(), "saved parquet");
    Ok(())
}

pub fn text_column(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<String>>> {
    let series = df
        .column(name)
        .with_context(|| format!("column '{name}' not found"))?
        .cast(&DataType::String)?;
    let values = series.str()?.into_iter().map(|v| v.map(str::to_owned)).collect();
    Ok(values)
}

pub fn float_column(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<f64>>> {
    let series = df
        .column(name)
        .with_context(|| format!("column '{name}' not found"))?
        .cast(&DataType::Float64)?;
    let values = series.f64()?.into_iter().collect();
    Ok(values)
}

pub fn int_column(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<i64>>> {
    let series = df
        .column(name)
        .with_context(|| format!("column '{name}' not found"))?
        .cast(&DataType::Int64)?;
    let values = series.i64()?.into_iter().collect();
    Ok(values)
}

/// Reads a column keeping text columns as text and everything else as numbers.
fn cell_column(df: &DataFrame, name: &str) -> anyhow::Result<(bool, Vec<Cell>)> {
    let is_numeric = df.column(name)?.dtype().is_numeric();
    let cells = if is_numeric {
        float_column(df, name)?
            .into_iter()
            .map(|v| v.map_or(Cell::Missing, Cell::Num))
            .collect()
    } else {
        text_column(df, name)?
            .into_iter()
            .map(|v| v.map_or(Cell::Missing, Cell::Text))
            .collect()
    };
    Ok((is_numeric, cells))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    // Accept full ISO-8601 datetimes by keeping the date part.
    let date_part = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// A calendar row. `attrs` follows `Calendar::attr_names`.
#[derive(Debug, Clone)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub d: String,
    pub wm_yr_wk: Option<i64>,
    pub attrs: Vec<Cell>,
}

/// Date-indexed calendar. Every column other than `date`, `d` and
/// `wm_yr_wk` is carried along as an attribute (weekday, events, snap flags…).
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    attr_names: Vec<String>,
    numeric_attrs: Vec<bool>,
    days: Vec<CalendarDay>,
    by_date: HashMap<NaiveDate, usize>,
    by_day_key: HashMap<String, usize>,
}

impl Calendar {
    pub fn from_frame(df: &DataFrame) -> anyhow::Result<Self> {
        let dates = text_column(df, "date")?;
        let day_keys = text_column(df, "d")?;
        let weeks = int_column(df, "wm_yr_wk")?;

        let mut attr_names = Vec::new();
        let mut numeric_attrs = Vec::new();
        let mut attr_columns = Vec::new();
        for name in df.get_column_names() {
            if matches!(name, "date" | "d" | "wm_yr_wk") {
                continue;
            }
            let (numeric, cells) = cell_column(df, name)?;
            attr_names.push(name.to_string());
            numeric_attrs.push(numeric);
            attr_columns.push(cells);
        }

        let mut calendar = Calendar {
            attr_names,
            numeric_attrs,
            ..Default::default()
        };
        for row in 0..df.height() {
            let raw_date = dates[row].as_deref().unwrap_or_default();
            let date = parse_date(raw_date)
                .with_context(|| format!("calendar row {row}: bad date '{raw_date}'"))?;
            let d = day_keys[row]
                .clone()
                .with_context(|| format!("calendar row {row}: missing day key"))?;

            calendar.by_date.insert(date, calendar.days.len());
            calendar.by_day_key.insert(d.clone(), calendar.days.len());
            calendar.days.push(CalendarDay {
                date,
                d,
                wm_yr_wk: weeks[row],
                attrs: attr_columns.iter().map(|col| col[row].clone()).collect(),
            });
        }
        Ok(calendar)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Self::from_frame(&read_csv(path)?)
    }

    pub fn attr_names(&self) -> &[String] {
        &self.attr_names
    }

    /// Whether attribute `idx` came from a numeric column.
    pub fn attr_is_numeric(&self, idx: usize) -> bool {
        self.numeric_attrs[idx]
    }

    pub fn by_date(&self, date: NaiveDate) -> Option<&CalendarDay> {
        self.by_date.get(&date).map(|&idx| &self.days[idx])
    }

    pub fn by_day_key(&self, d: &str) -> Option<&CalendarDay> {
        self.by_day_key.get(d).map(|&idx| &self.days[idx])
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

/// (store_id, item_id, wm_yr_wk) → sell_price.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    prices: HashMap<(String, String, i64), f64>,
}

impl PriceTable {
    pub fn from_frame(df: &DataFrame) -> anyhow::Result<Self> {
        let stores = text_column(df, "store_id")?;
        let items = text_column(df, "item_id")?;
        let weeks = int_column(df, "wm_yr_wk")?;
        let prices = float_column(df, "sell_price")?;

        let mut table = PriceTable::default();
        for (((store, item), week), price) in stores.into_iter().zip(items).zip(weeks).zip(prices) {
            if let (Some(store), Some(item), Some(week), Some(price)) = (store, item, week, price) {
                table.prices.insert((store, item, week), price);
            }
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Self::from_frame(&read_csv(path)?)
    }

    pub fn get(&self, store_id: &str, item_id: &str, wm_yr_wk: i64) -> Option<f64> {
        self.prices
            .get(&(store_id.to_string(), item_id.to_string(), wm_yr_wk))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMeta {
    pub dept_id: String,
    pub cat_id: String,
    pub state_id: String,
    pub store_id: String,
}

/// item_id → metadata. When an item appears under several stores the first
/// row seen wins.
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    items: HashMap<String, ItemMeta>,
}

impl ItemCatalog {
    pub fn from_frame(df: &DataFrame) -> anyhow::Result<Self> {
        let items = text_column(df, "item_id")?;
        let depts = text_column(df, "dept_id")?;
        let cats = text_column(df, "cat_id")?;
        let stores = text_column(df, "store_id")?;
        let states = text_column(df, "state_id")?;

        let mut catalog = ItemCatalog::default();
        for row in 0..df.height() {
            let Some(item) = items[row].clone() else {
                continue;
            };
            catalog.items.entry(item).or_insert_with(|| ItemMeta {
                dept_id: depts[row].clone().unwrap_or_default(),
                cat_id: cats[row].clone().unwrap_or_default(),
                state_id: states[row].clone().unwrap_or_default(),
                store_id: stores[row].clone().unwrap_or_default(),
            });
        }
        Ok(catalog)
    }

    /// Builds the catalog from the processed feature table when it exists,
    /// falling back to the id columns of the raw wide sales file.
    pub fn load(paths: &PipelinePaths) -> anyhow::Result<Self> {
        let columns: Vec<String> = ID_COLUMNS[1..].iter().map(|c| c.to_string()).collect();
        let processed = paths.train_features();
        let df = if processed.exists() {
            let file = File::open(&processed)
                .with_context(|| format!("opening {}", processed.display()))?;
            ParquetReader::new(file)
                .with_columns(Some(columns))
                .finish()
                .with_context(|| format!("parsing {}", processed.display()))?
        } else {
            let raw = paths.sales_csv();
            CsvReader::from_path(&raw)
                .with_context(|| format!("opening {}", raw.display()))?
                .has_header(true)
                .with_columns(Some(columns))
                .finish()
                .with_context(|| format!("parsing {}", raw.display()))?
        };
        Self::from_frame(&df)
    }

    pub fn get(&self, item_id: &str) -> Option<&ItemMeta> {
        self.items.get(item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Everything looked up while building features, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub calendar: Calendar,
    pub prices: PriceTable,
    pub items: ItemCatalog,
}

impl ReferenceData {
    pub fn load(paths: &PipelinePaths) -> anyhow::Result<Self> {
        let calendar = Calendar::load(&paths.calendar_csv())?;
        let prices = PriceTable::load(&paths.prices_csv())?;
        let items = ItemCatalog::load(paths)?;

        info!(
            calendar_days = calendar.len(),
            prices = prices.len(),
            items = items.len(),
            "reference data loaded"
        );
        Ok(Self {
            calendar,
            prices,
            items,
        })
    }
}
