use anyhow::Result;
use cold_weather_client::domain::{RawObservation, WeatherRecord};
use cold_weather_etl::{
    cache::ResponseCache,
    config::{self, AppConfig},
    metrics_server, observability,
    pipeline::Pipeline,
    schema,
    sinks::PostgresLoader,
    sources::{FailurePolicy, LocationSource, OpenMeteoExtractor},
    transform::ColdWeatherMetrics,
};
use std::{sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let locations = cfg.locations();
    if locations.is_empty() {
        tracing::warn!("no locations configured, nothing to do");
        return Ok(());
    }
    let cities: Vec<&str> = locations.iter().map(|l| l.city.as_str()).collect();
    tracing::info!(count = cities.len(), cities = %cities.join(", "), "monitoring cities");

    let cache = ResponseCache::new(&cfg.cache.dir, Duration::from_secs(cfg.cache.ttl_secs));
    let extractor = OpenMeteoExtractor::from_config(&cfg.api, cache)?
        .with_concurrency(cfg.pipeline.fetch_concurrency);
    let source = LocationSource::new(
        extractor,
        locations,
        FailurePolicy::from_skip_flag(cfg.pipeline.skip_failed_locations),
    );

    let pool = config::connect(&cfg.database).await?;
    if schema::ensure_schema(&pool).await? {
        tracing::info!("bootstrapped empty database");
    }

    let sink = PostgresLoader::new(
        pool,
        cfg.pipeline.batch_size,
        cfg.pipeline.max_retries,
        Duration::from_millis(cfg.pipeline.retry_backoff_ms),
    );

    let pipeline: Pipeline<_, RawObservation, WeatherRecord, _> = Pipeline {
        source,
        transform: Arc::new(ColdWeatherMetrics),
        sink,
    };

    match pipeline.run().await {
        Ok(report) => {
            tracing::info!(
                records = report.records,
                locations_inserted = report.locations.inserted,
                raw_inserted = report.raw_weather.inserted,
                raw_already_present = report.raw_weather.conflicts(),
                raw_unresolved = report.raw_unresolved,
                derived_inserted = report.derived_metrics.inserted,
                derived_unmatched = report.derived_unmatched,
                derived_without_metrics = report.derived_missing,
                "ETL completed"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "ETL run failed");
            Err(e.into())
        }
    }
}
