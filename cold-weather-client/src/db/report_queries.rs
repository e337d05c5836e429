use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::FrostbiteRisk;

/// One hour of the joined report view for a city.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WeatherReportRow {
    pub city: String,
    pub ts: OffsetDateTime,
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub wind_speed_10m: Option<f64>,
    pub precipitation: Option<f64>,
    pub wind_chill: Option<f64>,
    pub frostbite_risk: String,
    pub snowfall_cm: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableCounts {
    pub locations: i64,
    pub raw_weather: i64,
    pub derived_metrics: i64,
}

/// Fetch the time-ordered report view for a single city.
///
/// Hours without a derived-metrics row fall back to the raw temperature as
/// wind chill, the [`FrostbiteRisk::NoRisk`] label and zero snowfall.
pub async fn weather_report(
    pool: &PgPool,
    city: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<WeatherReportRow>> {
    let rows = sqlx::query_as::<_, WeatherReportRow>(
        r#"
        SELECT
            l.city,
            rw.timestamp                               AS ts,
            rw.temperature,
            rw.relative_humidity,
            rw.wind_speed_10m,
            rw.precipitation,
            COALESCE(d.wind_chill, rw.temperature)     AS wind_chill,
            COALESCE(d.frostbite_risk, $4)             AS frostbite_risk,
            COALESCE(d.snowfall_cm, 0.0)               AS snowfall_cm
        FROM raw_weather rw
        JOIN locations l ON rw.location_id = l.id
        LEFT JOIN derived_metrics d ON d.raw_weather_id = rw.id
        WHERE l.city = $1
          AND rw.timestamp >= $2
          AND rw.timestamp <  $3
        ORDER BY rw.timestamp
        "#,
    )
    .bind(city)
    .bind(start)
    .bind(end)
    .bind(FrostbiteRisk::NoRisk.as_str())
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn list_cities(pool: &PgPool) -> Result<Vec<String>> {
    let cities = sqlx::query_scalar::<_, String>("SELECT city FROM locations ORDER BY city")
        .fetch_all(pool)
        .await?;

    Ok(cities)
}

/// Row counts of the three pipeline tables.
pub async fn table_counts(pool: &PgPool) -> Result<TableCounts> {
    let (locations, raw_weather, derived_metrics) = sqlx::query_as::<_, (i64, i64, i64)>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM locations),
            (SELECT COUNT(*) FROM raw_weather),
            (SELECT COUNT(*) FROM derived_metrics)
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(TableCounts {
        locations,
        raw_weather,
        derived_metrics,
    })
}
