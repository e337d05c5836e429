//! Loader tests against a real Postgres.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`. Each test
//! works in its own schema so runs do not interfere.

use std::time::Duration;

use cold_weather_client::db::{table_counts, weather_report, TableCounts};
use cold_weather_client::domain::{FrostbiteRisk, RawObservation, WeatherRecord};
use cold_weather_etl::{
    schema,
    sinks::{postgres::derived_candidates, PostgresLoader},
    transform::{enrich, transform_batch},
};
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};
use time::macros::datetime;

async fn isolated_pool(name: &str) -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let schema_name = format!("cold_weather_test_{name}");

    let admin = PgPoolOptions::new().max_connections(1).connect(&url).await.unwrap();
    admin
        .execute(format!("DROP SCHEMA IF EXISTS {schema_name} CASCADE; CREATE SCHEMA {schema_name};").as_str())
        .await
        .unwrap();

    let search_path = schema_name.clone();
    PgPoolOptions::new()
        .max_connections(2)
        .after_connect(move |conn, _meta| {
            let sql = format!("SET search_path TO {search_path}");
            Box::pin(async move {
                conn.execute(sql.as_str()).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .unwrap()
}

fn observation(city: &str, hour: i64, temperature: Option<f64>) -> RawObservation {
    RawObservation {
        city: city.to_string(),
        latitude: 49.895_136,
        longitude: -97.138_374,
        ts: datetime!(2024-01-15 00:00:00 UTC) + time::Duration::hours(hour),
        temperature,
        relative_humidity: Some(75.0),
        wind_speed_10m: Some(30.0),
        precipitation: Some(1.0),
    }
}

fn batch() -> Vec<WeatherRecord> {
    transform_batch(vec![
        observation("Winnipeg", 0, Some(-5.0)),
        observation("Winnipeg", 1, Some(-15.0)),
        observation("Winnipeg", 2, None),
        observation("Thompson", 0, Some(-35.0)),
    ])
}

fn loader(pool: &PgPool) -> PostgresLoader {
    PostgresLoader::new(pool.clone(), 2, 0, Duration::from_millis(10))
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn schema_bootstrap_runs_once() {
    let pool = isolated_pool("bootstrap").await;

    assert!(!schema::schema_exists(&pool).await.unwrap());
    assert!(schema::ensure_schema(&pool).await.unwrap());
    assert!(!schema::ensure_schema(&pool).await.unwrap());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn reloading_the_same_batch_is_a_no_op() {
    let pool = isolated_pool("idempotent").await;
    schema::ensure_schema(&pool).await.unwrap();
    let loader = loader(&pool);
    let records = batch();

    let first = loader.load(&records).await.unwrap();
    assert_eq!(first.locations.inserted, 2);
    assert_eq!(first.raw_weather.inserted, 4);
    assert_eq!(first.derived_metrics.inserted, 3);
    assert_eq!(first.derived_unmatched, 0);
    assert_eq!(first.derived_missing, 1);

    let after_first = table_counts(&pool).await.unwrap();
    assert_eq!(
        after_first,
        TableCounts {
            locations: 2,
            raw_weather: 4,
            derived_metrics: 3
        }
    );

    let second = loader.load(&records).await.unwrap();
    assert_eq!(second.locations.inserted, 0);
    assert_eq!(second.raw_weather.inserted, 0);
    assert_eq!(second.raw_weather.conflicts(), 4);
    assert_eq!(second.derived_metrics.inserted, 0);
    assert_eq!(second.derived_metrics.conflicts(), 3);
    assert_eq!(second.derived_unmatched, 0);
    assert_eq!(table_counts(&pool).await.unwrap(), after_first);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn existing_rows_are_never_overwritten() {
    let pool = isolated_pool("immutable").await;
    schema::ensure_schema(&pool).await.unwrap();
    let loader = loader(&pool);

    loader.load(&[enrich(observation("Winnipeg", 0, Some(-5.0)))]).await.unwrap();

    let mut moved = observation("Winnipeg", 0, Some(-40.0));
    moved.latitude = 50.0;
    loader.load(&[enrich(moved)]).await.unwrap();

    let (lat,): (f64,) = sqlx::query_as("SELECT latitude FROM locations WHERE city = 'Winnipeg'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(lat, 49.8951);

    let (temp,): (Option<f64>,) = sqlx::query_as("SELECT temperature FROM raw_weather")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(temp, Some(-5.0));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn every_derived_row_has_exactly_one_raw_row() {
    let pool = isolated_pool("referential").await;
    schema::ensure_schema(&pool).await.unwrap();
    loader(&pool).load(&batch()).await.unwrap();

    let (orphans,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM derived_metrics d LEFT JOIN raw_weather rw ON rw.id = d.raw_weather_id WHERE rw.id IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(orphans, 0);

    let report = weather_report(
        &pool,
        "Winnipeg",
        datetime!(2024-01-15 00:00:00 UTC),
        datetime!(2024-01-16 00:00:00 UTC),
    )
    .await
    .unwrap();
    assert_eq!(report.len(), 3);
    assert!(report.windows(2).all(|w| w[0].ts < w[1].ts));
    assert_eq!(report[0].frostbite_risk, FrostbiteRisk::TenToThirtyMinutes.as_str());
    assert_eq!(report[0].snowfall_cm, Some(1.0));
    // Hour without a temperature has no derived row and falls back in the view.
    assert_eq!(report[2].frostbite_risk, FrostbiteRisk::NoRisk.as_str());
    assert_eq!(report[2].snowfall_cm, Some(0.0));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn derived_rows_without_raw_rows_are_counted_apart_from_conflicts() {
    let pool = isolated_pool("unmatched").await;
    schema::ensure_schema(&pool).await.unwrap();
    let loader = loader(&pool);

    let loaded = vec![enrich(observation("Winnipeg", 0, Some(-5.0)))];
    loader.load(&loaded).await.unwrap();

    // Hour 0 is already derived, hour 5 was never loaded as raw weather.
    let records = vec![
        enrich(observation("Winnipeg", 0, Some(-5.0))),
        enrich(observation("Winnipeg", 5, Some(-20.0))),
        enrich(observation("Churchill", 0, Some(-30.0))),
    ];
    let (count, unmatched) = loader
        .upsert_derived_metrics(&derived_candidates(&records))
        .await
        .unwrap();

    assert_eq!(count.attempted, 1);
    assert_eq!(count.inserted, 0);
    assert_eq!(count.conflicts(), 1);
    assert_eq!(unmatched, 2);
    assert_eq!(table_counts(&pool).await.unwrap().derived_metrics, 1);
}
