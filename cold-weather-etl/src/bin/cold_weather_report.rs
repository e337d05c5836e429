use anyhow::{bail, Context, Result};
use cold_weather_client::db::{list_cities, weather_report};
use cold_weather_etl::{
    config::{self, AppConfig},
    observability,
};
use std::env;
use time::{macros::format_description, Date, Duration, OffsetDateTime};

fn parse_day(value: &str) -> Result<OffsetDateTime> {
    let date = Date::parse(value, format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("invalid date '{value}', expected YYYY-MM-DD"))?;
    Ok(date.midnight().assume_utc())
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.1}")).unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        bail!("usage: cold_weather_report <city> <start YYYY-MM-DD> <end YYYY-MM-DD>");
    }
    let city = &args[1];
    let start = parse_day(&args[2])?;
    // End date is inclusive.
    let end = parse_day(&args[3])? + Duration::days(1);
    if end <= start {
        bail!("end date must not be before start date");
    }

    let cfg = AppConfig::load()?;
    let pool = config::connect(&cfg.database).await?;

    let rows = weather_report(&pool, city, start, end).await?;
    if rows.is_empty() {
        let known = list_cities(&pool).await?;
        tracing::warn!(city = %city, known = %known.join(", "), "no rows for city in range");
        return Ok(());
    }

    println!(
        "{:<20} {:>8} {:>8} {:>8} {:>8} {:>10} {:>8}  frostbite",
        "timestamp (UTC)", "temp", "rh", "wind", "precip", "windchill", "snow"
    );
    for row in &rows {
        println!(
            "{:<20} {:>8} {:>8} {:>8} {:>8} {:>10} {:>8}  {}",
            format!("{} {:02}:00", row.ts.date(), row.ts.hour()),
            fmt_opt(row.temperature),
            fmt_opt(row.relative_humidity),
            fmt_opt(row.wind_speed_10m),
            fmt_opt(row.precipitation),
            fmt_opt(row.wind_chill),
            fmt_opt(row.snowfall_cm),
            row.frostbite_risk,
        );
    }
    tracing::info!(city = %city, rows = rows.len(), "report complete");

    Ok(())
}
