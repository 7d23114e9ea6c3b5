mod common;

use std::collections::HashMap;

use common::*;
use polars::prelude::DataFrame;
use sales_forecaster::features::{build_training_features, parse_day_number};
use sales_forecaster::reference::{float_column, read_parquet, text_column};
use sales_forecaster::service::{load_context, parse_request};
use sales_forecaster::train::prepare_features;
use sales_forecaster::{
    build_features, InferenceContext, ModelVariant, PredictionService, RawRecord, SchemaPolicy,
};
use serde_json::json;

type History = (Vec<String>, Vec<i64>, Vec<f64>, DataFrame);

fn processed_history(fx: &Fixture) -> History {
    let df = build_training_features(&fx.paths, 0).unwrap();
    let ids = text_column(&df, "id")
        .unwrap()
        .into_iter()
        .map(Option::unwrap)
        .collect();
    let days = text_column(&df, "d")
        .unwrap()
        .into_iter()
        .map(|d| parse_day_number(&d.unwrap()).unwrap())
        .collect();
    let sales = float_column(&df, "sales")
        .unwrap()
        .into_iter()
        .map(Option::unwrap)
        .collect();
    (ids, days, sales, df)
}

/// Run the training-side preparation and freeze its artifacts to disk.
fn freeze_artifacts(fx: &Fixture) {
    build_training_features(&fx.paths, 0).unwrap();
    let df = read_parquet(&fx.paths.train_features()).unwrap();
    let prepared = prepare_features(&df, fx.paths.variant).unwrap();
    prepared.columns.save(&fx.paths.feature_columns()).unwrap();
    prepared.vocab.save(&fx.paths.cat_mappings()).unwrap();
}

fn context(fx: &Fixture, policy: SchemaPolicy) -> InferenceContext {
    freeze_artifacts(fx);
    load_context(&fx.paths, policy).unwrap()
}

fn request(store_id: &str, item_id: &str, date: &str) -> RawRecord {
    let body = json!({"store_id": store_id, "item_id": item_id, "date": date});
    parse_request(&body.to_string()).unwrap()
}

#[test]
fn processed_table_has_one_row_per_series_day() {
    let fx = fixture(ModelVariant::NoLag);
    let (ids, days, sales, df) = processed_history(&fx);

    assert_eq!(df.height(), 2 * DAYS as usize);
    assert!(fx.paths.train_features().exists());
    for row in 0..ids.len() {
        let expected = if ids[row].starts_with(FOODS) {
            foods_sales(days[row])
        } else {
            hobbies_sales(days[row])
        };
        assert_eq!(sales[row], expected as f64);
    }

    let dates = text_column(&df, "date").unwrap();
    let weekday = text_column(&df, "weekday").unwrap();
    for row in 0..ids.len() {
        let date = day_date(days[row]);
        assert_eq!(dates[row], Some(date.format("%Y-%m-%d").to_string()));
        assert_eq!(weekday[row], Some(date.format("%A").to_string()));
    }
}

#[test]
fn lag_features_equal_sales_k_days_earlier() {
    let fx = fixture(ModelVariant::Full);
    let (ids, days, sales, df) = processed_history(&fx);
    let by_key: HashMap<(String, i64), f64> = ids
        .iter()
        .cloned()
        .zip(days.iter().copied())
        .zip(sales.iter().copied())
        .collect();

    for k in [7, 14, 28] {
        let lag = float_column(&df, &format!("lag_{k}")).unwrap();
        for row in 0..ids.len() {
            let expected = by_key.get(&(ids[row].clone(), days[row] - k)).copied();
            assert_eq!(lag[row], expected, "lag_{k} at {} d_{}", ids[row], days[row]);
        }
    }
}

#[test]
fn rolling_means_cover_previous_window_only() {
    let fx = fixture(ModelVariant::Full);
    let (ids, days, _, df) = processed_history(&fx);

    for w in [7i64, 28] {
        let rolling = float_column(&df, &format!("rolling_mean_{w}")).unwrap();
        for row in 0..ids.len() {
            let day = days[row];
            let history = |d: i64| {
                if ids[row].starts_with(FOODS) {
                    foods_sales(d)
                } else {
                    hobbies_sales(d)
                }
            };
            if day <= w {
                assert_eq!(rolling[row], None, "window {w} day {day}");
            } else {
                let expected = ((day - w)..day).map(history).sum::<i64>() as f64 / w as f64;
                approx::assert_relative_eq!(rolling[row].unwrap(), expected, epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn inference_vector_matches_frozen_training_columns() {
    let fx = fixture(ModelVariant::NoLag);
    let ctx = context(&fx, SchemaPolicy::Strict);

    let body = json!({"features": {"store_id": "CA_1", "item_id": FOODS, "date": "2016-05-01"}});
    let record = parse_request(&body.to_string()).unwrap();
    let built = build_features(&ctx, &record).unwrap();

    assert_eq!(built.vector.columns, ctx.columns.names());
    assert_eq!(built.vector.values.len(), ctx.columns.len());
    assert!(built.drift.filled.is_empty());
    assert!(!ctx
        .columns
        .names()
        .iter()
        .any(|c| c.starts_with("lag_") || c.starts_with("rolling_")));

    let v = &built.vector;
    assert_eq!(v.get("sell_price"), Some(2.25));
    assert_eq!(v.get("wm_yr_wk"), Some(week_of(DAYS) as f32));
    assert_eq!(v.get("dayofweek"), Some(6.0));
    assert_eq!(v.get("date_month"), Some(5.0));
    assert_eq!(v.get("item_id"), Some(ctx.vocab.encode("item_id", FOODS) as f32));
    assert_eq!(
        v.get("event_name_1"),
        Some(ctx.vocab.encode("event_name_1", "OrthodoxEaster") as f32)
    );
    assert_ne!(v.get("event_name_1"), Some(-1.0));
}

#[test]
fn training_and_inference_encode_the_same_row_identically() {
    let fx = fixture(ModelVariant::NoLag);
    freeze_artifacts(&fx);
    let df = read_parquet(&fx.paths.train_features()).unwrap();
    let prepared = prepare_features(&df, ModelVariant::NoLag).unwrap();
    let ctx = load_context(&fx.paths, SchemaPolicy::Strict).unwrap();

    // Row for HOBBIES on d_10: the price exists that week.
    let ids = text_column(&df, "id").unwrap();
    let day_keys = text_column(&df, "d").unwrap();
    let row = (0..df.height())
        .find(|&r| {
            let hobbies = ids[r].as_deref().unwrap().starts_with(HOBBIES);
            hobbies && day_keys[r].as_deref() == Some("d_10")
        })
        .unwrap();

    let date = day_date(10).to_string();
    let built = build_features(&ctx, &request("TX_1", HOBBIES, &date)).unwrap();

    assert_eq!(prepared.columns.names(), ctx.columns.names());
    assert_eq!(built.vector.values.as_slice(), prepared.x.row(row));
}

#[test]
fn missing_price_is_sentinel_filled() {
    let fx = fixture(ModelVariant::NoLag);
    let ctx = context(&fx, SchemaPolicy::Strict);

    let built = build_features(&ctx, &request("TX_1", HOBBIES, "2016-05-01")).unwrap();
    assert_eq!(built.vector.get("sell_price"), Some(-1.0));
    assert_eq!(built.vector.columns, ctx.columns.names());
}

#[test]
fn date_outside_calendar_passes_strict_schema_check() {
    let fx = fixture(ModelVariant::NoLag);
    let ctx = context(&fx, SchemaPolicy::Strict);

    let built = build_features(&ctx, &request("CA_1", FOODS, "2030-01-01")).unwrap();
    assert!(built.drift.filled.is_empty());
    assert_eq!(built.vector.columns, ctx.columns.names());
    assert_eq!(built.vector.get("wm_yr_wk"), Some(-1.0));
    assert_eq!(built.vector.get("sell_price"), Some(-1.0));
    assert_eq!(built.vector.get("date_year"), Some(2030.0));
}

#[test]
fn full_variant_fills_history_columns_and_reports_them() {
    let fx = fixture(ModelVariant::Full);
    let ctx = context(&fx, SchemaPolicy::FillSentinel);

    let record = request("CA_1", FOODS, "2016-05-01");
    let built = build_features(&ctx, &record).unwrap();

    for column in ["lag_7", "lag_14", "lag_28", "rolling_mean_7", "rolling_mean_28"] {
        assert_eq!(built.vector.get(column), Some(-1.0));
        assert!(built.drift.filled.contains(&column.to_string()));
    }
    assert_eq!(built.vector.columns, ctx.columns.names());

    let strict = load_context(&fx.paths, SchemaPolicy::Strict).unwrap();
    let err = build_features(&strict, &record).unwrap_err();
    assert_eq!(err.kind(), "schema_drift");
}

#[test]
fn preprocessing_is_idempotent() {
    let fx = fixture(ModelVariant::NoLag);
    let ctx = context(&fx, SchemaPolicy::FillSentinel);
    let record = request("CA_1", FOODS, "2016-04-20");

    let first = build_features(&ctx, &record).unwrap();
    let second = build_features(&ctx, &record).unwrap();
    let bits = |values: &[f32]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&first.vector.values), bits(&second.vector.values));
    assert_eq!(first.vector.columns, second.vector.columns);
}

#[test]
fn service_answers_with_one_number_or_a_structured_error() {
    let fx = fixture(ModelVariant::NoLag);
    let ctx = context(&fx, SchemaPolicy::FillSentinel);
    let first_column = ctx.columns.names()[0].clone();
    let service = PredictionService::new(ctx, Box::new(FirstFeatureModel), true);

    let body = json!({"features": {"store_id": "CA_1", "item_id": FOODS, "date": "2016-05-01"}});
    let ok = service.handle_json(&body.to_string());
    let prediction = ok["prediction"].as_f64().unwrap();
    assert_eq!(prediction, prediction.round());

    let report = service
        .preprocess_report(&request("CA_1", FOODS, "2016-05-01"))
        .unwrap();
    let first_value = report.sample_row[&first_column].as_f64().unwrap();
    assert_eq!(prediction, (first_value + 0.4).round());

    let unknown_item = request("CA_1", "FOODS_9_999", "2016-05-01");
    let body = json!({ "features": unknown_item });
    let unknown = service.handle_json(&body.to_string());
    assert_eq!(unknown["error"]["kind"], "unknown_item");
    assert!(unknown.get("prediction").is_none());

    let garbage = service.handle_json("{not json");
    assert_eq!(garbage["error"]["kind"], "invalid_request");
}

#[test]
fn unrounded_predictions_and_bad_model_output() {
    let fx = fixture(ModelVariant::NoLag);
    let ctx = context(&fx, SchemaPolicy::FillSentinel);
    let record = request("CA_1", FOODS, "2016-05-01");

    let raw = PredictionService::new(ctx.clone(), Box::new(FirstFeatureModel), false);
    let value = raw.predict(&record).unwrap().prediction;
    assert!((value - value.round()).abs() > 0.3);

    let broken = PredictionService::new(ctx, Box::new(TwoOutputModel), true);
    assert_eq!(broken.predict(&record).unwrap_err().kind(), "model");
}
