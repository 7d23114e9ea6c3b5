//! Training-time feature engineering: wide sales → long rows joined with
//! the calendar and prices, decomposed dates, and per-series lag / rolling
//! statistics computed from strictly earlier days.

use std::collections::HashMap;

use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use tracing::info;

use crate::config::PipelinePaths;
use crate::reference::{
    float_column, parse_date, read_csv, text_column, write_parquet, Calendar, Cell, PriceTable,
    ReferenceData, ID_COLUMNS,
};

pub const LAGS: [i64; 3] = [7, 14, 28];
pub const ROLLING_WINDOWS: [i64; 2] = [7, 28];

/// Date parts derived identically at training and inference time.
pub const DATE_PART_COLUMNS: [&str; 7] = [
    "dayofweek",
    "month",
    "quarter",
    "year",
    "date_year",
    "date_month",
    "date_day",
];

/// Values for `DATE_PART_COLUMNS`, in the same order. Monday is day 0.
pub fn date_parts(date: NaiveDate) -> [f64; 7] {
    let month = date.month() as f64;
    let year = date.year() as f64;
    [
        date.weekday().num_days_from_monday() as f64,
        month,
        ((date.month() - 1) / 3 + 1) as f64,
        year,
        year,
        month,
        date.day() as f64,
    ]
}

pub fn lag_column(lag: i64) -> String {
    format!("lag_{lag}")
}

pub fn rolling_column(window: i64) -> String {
    format!("rolling_mean_{window}")
}

/// True for columns that need sales history and cannot be built from one request.
pub fn is_history_column(name: &str) -> bool {
    name.starts_with("lag_") || name.starts_with("rolling_")
}

/// `"d_1913"` → `1913`.
pub fn parse_day_number(d: &str) -> Option<i64> {
    d.strip_prefix("d_")?.parse().ok()
}

/// Reshape the wide sales table (one column per day) into one row per
/// series and day. Rows come out day-major, like a dataframe melt.
pub fn melt_sales(sales: &DataFrame) -> anyhow::Result<DataFrame> {
    let id_values: Vec<Vec<Option<String>>> = ID_COLUMNS
        .iter()
        .map(|name| text_column(sales, name))
        .collect::<anyhow::Result<_>>()?;

    let day_columns: Vec<String> = sales
        .get_column_names()
        .into_iter()
        .filter(|name| !ID_COLUMNS.contains(name))
        .map(str::to_string)
        .collect();
    anyhow::ensure!(!day_columns.is_empty(), "sales table has no day columns");

    let n_series = sales.height();
    let total = n_series * day_columns.len();
    let mut ids: Vec<Vec<Option<&str>>> = vec![Vec::with_capacity(total); ID_COLUMNS.len()];
    let mut day_keys = Vec::with_capacity(total);
    let mut values = Vec::with_capacity(total);

    for day in &day_columns {
        let day_sales = float_column(sales, day)?;
        for (row, sold) in day_sales.into_iter().enumerate() {
            for (col, out) in ids.iter_mut().enumerate() {
                out.push(id_values[col][row].as_deref());
            }
            day_keys.push(day.as_str());
            values.push(sold);
        }
    }

    let mut columns: Vec<Series> = ID_COLUMNS
        .iter()
        .zip(ids)
        .map(|(name, col)| Series::new(name, col))
        .collect();
    columns.push(Series::new("d", day_keys));
    columns.push(Series::new("sales", values));

    let long = DataFrame::new(columns)?;
    info!(series = n_series, days = day_columns.len(), rows = long.height(), "melted sales");
    Ok(long)
}

/// Left-join the calendar on `d`, then prices on (store_id, item_id, wm_yr_wk).
/// Unmatched rows keep nulls.
pub fn merge_reference(
    long: &DataFrame,
    calendar: &Calendar,
    prices: &PriceTable,
) -> anyhow::Result<DataFrame> {
    let day_keys = text_column(long, "d")?;
    let stores = text_column(long, "store_id")?;
    let items = text_column(long, "item_id")?;

    let days: Vec<_> = day_keys
        .iter()
        .map(|d| d.as_deref().and_then(|d| calendar.by_day_key(d)))
        .collect();

    let dates: Vec<Option<String>> = days
        .iter()
        .map(|day| day.map(|day| day.date.format("%Y-%m-%d").to_string()))
        .collect();
    let weeks: Vec<Option<i64>> = days.iter().map(|day| day.and_then(|day| day.wm_yr_wk)).collect();

    let mut joined = vec![Series::new("date", dates), Series::new("wm_yr_wk", weeks.clone())];
    for (idx, name) in calendar.attr_names().iter().enumerate() {
        let cells = days.iter().map(|day| day.map(|day| &day.attrs[idx]));
        let series = if calendar.attr_is_numeric(idx) {
            let values: Vec<Option<f64>> = cells
                .map(|cell| match cell {
                    Some(Cell::Num(v)) => Some(*v),
                    _ => None,
                })
                .collect();
            Series::new(name, values)
        } else {
            let values: Vec<Option<&str>> = cells
                .map(|cell| match cell {
                    Some(Cell::Text(s)) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            Series::new(name, values)
        };
        joined.push(series);
    }

    let sell_prices: Vec<Option<f64>> = (0..long.height())
        .map(|row| match (&stores[row], &items[row], weeks[row]) {
            (Some(store), Some(item), Some(week)) => prices.get(store, item, week),
            _ => None,
        })
        .collect();
    joined.push(Series::new("sell_price", sell_prices));

    let merged = long.hstack(&joined)?;
    let matched = days.iter().filter(|day| day.is_some()).count();
    info!(rows = merged.height(), calendar_matched = matched, "merged reference tables");
    Ok(merged)
}

/// Add (or overwrite) `DATE_PART_COLUMNS` from the `date` column.
pub fn add_date_parts(df: &mut DataFrame) -> anyhow::Result<()> {
    let parts: Vec<Option<[f64; 7]>> = text_column(df, "date")?
        .iter()
        .map(|raw| raw.as_deref().and_then(parse_date).map(date_parts))
        .collect();

    for (idx, name) in DATE_PART_COLUMNS.iter().enumerate() {
        let values: Vec<Option<f64>> = parts.iter().map(|p| p.map(|p| p[idx])).collect();
        df.with_column(Series::new(name, values))?;
    }
    Ok(())
}

/// Lag and rolling-mean columns for long rows, keyed by series and day number.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryFeatures {
    pub lags: Vec<(String, Vec<Option<f64>>)>,
    pub rolling: Vec<(String, Vec<Option<f64>>)>,
}

/// Per-series history features. Each row only ever sees strictly earlier
/// days of its own series: `lag_k` is the sales of day d−k and
/// `rolling_mean_w` the mean over days d−w ..= d−1, null unless every one of
/// those days was observed.
pub fn history_features(
    series: &[Option<String>],
    days: &[Option<i64>],
    sales: &[Option<f64>],
    lags: &[i64],
    windows: &[i64],
) -> HistoryFeatures {
    let n = series.len();
    let mut lag_values = vec![vec![None; n]; lags.len()];
    let mut rolling_values = vec![vec![None; n]; windows.len()];

    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for (row, id) in series.iter().enumerate() {
        if let (Some(id), Some(_)) = (id, days[row]) {
            groups.entry(id.as_str()).or_default().push(row);
        }
    }

    for rows in groups.values() {
        let (first, last) = rows.iter().fold((i64::MAX, i64::MIN), |(lo, hi), &row| {
            let day = days[row].unwrap_or_default();
            (lo.min(day), hi.max(day))
        });
        // Dense per-day view of this series; gaps stay None.
        let mut by_day: Vec<Option<f64>> = vec![None; (last - first + 1) as usize];
        for &row in rows {
            let offset = (days[row].unwrap_or_default() - first) as usize;
            by_day[offset] = sales[row];
        }
        let at = |day: i64| -> Option<f64> {
            if day < first || day > last {
                None
            } else {
                by_day[(day - first) as usize]
            }
        };

        for &row in rows {
            let day = days[row].unwrap_or_default();
            for (out, &lag) in lag_values.iter_mut().zip(lags) {
                out[row] = at(day - lag);
            }
            for (out, &window) in rolling_values.iter_mut().zip(windows) {
                let mut sum = 0.0;
                let mut complete = true;
                for past in (day - window)..day {
                    match at(past) {
                        Some(v) => sum += v,
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                out[row] = complete.then(|| sum / window as f64);
            }
        }
    }

    HistoryFeatures {
        lags: lags.iter().map(|&l| lag_column(l)).zip(lag_values).collect(),
        rolling: windows
            .iter()
            .map(|&w| rolling_column(w))
            .zip(rolling_values)
            .collect(),
    }
}

/// Append lag and rolling columns computed over `id` / `d` / `sales`.
pub fn add_history_features(df: &mut DataFrame) -> anyhow::Result<()> {
    let series = text_column(df, "id")?;
    let days: Vec<Option<i64>> = text_column(df, "d")?
        .iter()
        .map(|d| d.as_deref().and_then(parse_day_number))
        .collect();
    let sales = float_column(df, "sales")?;

    let history = history_features(&series, &days, &sales, &LAGS, &ROLLING_WINDOWS);
    for (name, values) in history.lags.into_iter().chain(history.rolling) {
        df.with_column(Series::new(&name, values))?;
    }
    Ok(())
}

/// Run every training-mode step over already loaded tables.
pub fn engineer_features(
    sales: &DataFrame,
    reference: &ReferenceData,
) -> anyhow::Result<DataFrame> {
    let long = melt_sales(sales)?;
    let mut df = merge_reference(&long, &reference.calendar, &reference.prices)?;
    add_date_parts(&mut df)?;
    add_history_features(&mut df)?;
    Ok(df)
}

/// Read the raw CSVs, engineer features and save the processed parquet.
/// `max_series` keeps only the first N series of the wide table (0 = all).
pub fn build_training_features(
    paths: &PipelinePaths,
    max_series: usize,
) -> anyhow::Result<DataFrame> {
    let calendar = Calendar::load(&paths.calendar_csv())?;
    let prices = PriceTable::load(&paths.prices_csv())?;
    let mut sales = read_csv(&paths.sales_csv())?;
    if max_series > 0 && sales.height() > max_series {
        sales = sales.head(Some(max_series));
        info!(max_series, "limited sales table to first series");
    }

    let reference = ReferenceData {
        calendar,
        prices,
        ..Default::default()
    };
    let mut df = engineer_features(&sales, &reference).context("engineering training features")?;
    write_parquet(&mut df, &paths.train_features())?;
    Ok(df)
}
