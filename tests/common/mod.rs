#![allow(dead_code)]

use std::fmt::Write as _;
use std::fs;

use chrono::{Datelike, Duration, NaiveDate};
use sales_forecaster::{FeatureMatrix, ModelVariant, PipelinePaths, Regressor};
use tempfile::TempDir;

pub const DAYS: i64 = 40;
pub const FOODS: &str = "FOODS_1_001";
pub const HOBBIES: &str = "HOBBIES_1_001";

pub fn day_date(day: i64) -> NaiveDate {
    // d_40 lands on 2016-05-01.
    NaiveDate::from_ymd_opt(2016, 3, 23).unwrap() + Duration::days(day - 1)
}

pub fn week_of(day: i64) -> i64 {
    11608 + (day - 1) / 7
}

pub fn foods_sales(day: i64) -> i64 {
    day % 5
}

pub fn hobbies_sales(day: i64) -> i64 {
    (day % 3) * 2
}

pub struct Fixture {
    pub dir: TempDir,
    pub paths: PipelinePaths,
}

/// Raw M5-style tables for two series over `DAYS` days. HOBBIES_1_001 has
/// no price in its last week.
pub fn fixture(variant: ModelVariant) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let paths = PipelinePaths::new(dir.path().join("data"), dir.path().join("models"), variant);
    fs::create_dir_all(paths.raw_dir()).unwrap();

    let mut calendar = String::from(
        "date,wm_yr_wk,weekday,wday,month,year,d,event_name_1,event_type_1,snap_CA,snap_TX\n",
    );
    for day in 1..=DAYS {
        let date = day_date(day);
        let wday = (date.weekday().num_days_from_monday() + 2) % 7 + 1;
        let (event, kind) = if day == DAYS {
            ("OrthodoxEaster", "Religious")
        } else {
            ("", "")
        };
        writeln!(
            calendar,
            "{},{},{},{},{},{},d_{},{},{},{},{}",
            date.format("%Y-%m-%d"),
            week_of(day),
            date.format("%A"),
            wday,
            date.month(),
            date.year(),
            day,
            event,
            kind,
            (day % 2),
            (day % 3 == 0) as i64,
        )
        .unwrap();
    }
    fs::write(paths.calendar_csv(), calendar).unwrap();

    let mut header = String::from("id,item_id,dept_id,cat_id,store_id,state_id");
    let mut foods = format!("{FOODS}_CA_1_validation,{FOODS},FOODS_1,FOODS,CA_1,CA");
    let mut hobbies = format!("{HOBBIES}_TX_1_validation,{HOBBIES},HOBBIES_1,HOBBIES,TX_1,TX");
    for day in 1..=DAYS {
        write!(header, ",d_{day}").unwrap();
        write!(foods, ",{}", foods_sales(day)).unwrap();
        write!(hobbies, ",{}", hobbies_sales(day)).unwrap();
    }
    fs::write(paths.sales_csv(), format!("{header}\n{foods}\n{hobbies}\n")).unwrap();

    let mut prices = String::from("store_id,item_id,wm_yr_wk,sell_price\n");
    let last_week = week_of(DAYS);
    for week in week_of(1)..=last_week {
        writeln!(prices, "CA_1,{FOODS},{week},2.25").unwrap();
        if week != last_week {
            writeln!(prices, "TX_1,{HOBBIES},{week},8.5").unwrap();
        }
    }
    fs::write(paths.prices_csv(), prices).unwrap();

    Fixture { dir, paths }
}

/// Predicts the first feature plus 0.4, so rounding is observable.
pub struct FirstFeatureModel;

impl Regressor for FirstFeatureModel {
    fn predict(&self, features: &FeatureMatrix) -> anyhow::Result<Vec<f32>> {
        Ok((0..features.n_rows())
            .map(|row| features.row(row)[0] + 0.4)
            .collect())
    }
}

/// Broken model returning two values for one row.
pub struct TwoOutputModel;

impl Regressor for TwoOutputModel {
    fn predict(&self, _features: &FeatureMatrix) -> anyhow::Result<Vec<f32>> {
        Ok(vec![1.0, 2.0])
    }
}
