use std::{
    collections::{HashMap, HashSet},
    future::Future,
    time::{Duration, SystemTime},
};

use cold_weather_client::domain::{Location, RawObservation, WeatherRecord};
use futures::StreamExt;
use sqlx::{postgres::PgPool, Postgres, QueryBuilder};

use crate::pipeline::{Envelope, PipelineError, Sink};

/// Rows offered to and accepted by one load stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCount {
    pub attempted: u64,
    pub inserted: u64,
}

impl StageCount {
    /// Rows skipped because they already existed.
    pub fn conflicts(&self) -> u64 {
        self.attempted.saturating_sub(self.inserted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub records: usize,
    pub locations: StageCount,
    pub raw_weather: StageCount,
    /// Records dropped because their city had no `locations` row.
    pub raw_unresolved: u64,
    pub derived_metrics: StageCount,
    /// Derived rows whose `(city, timestamp)` had no `raw_weather` row.
    pub derived_unmatched: u64,
    /// Records without a wind chill, never offered to `derived_metrics`.
    pub derived_missing: u64,
}

/// Distinct locations of a batch keyed by city, first occurrence wins,
/// coordinates rounded for storage.
pub fn dedupe_locations<'a>(observations: impl IntoIterator<Item = &'a RawObservation>) -> Vec<Location> {
    let mut seen = HashSet::new();
    observations
        .into_iter()
        .filter(|obs| seen.insert(obs.city.as_str()))
        .map(|obs| obs.location().rounded())
        .collect()
}

/// Attach the stored location id to every record whose city is known.
/// Returns the resolved rows and the number of records that were dropped.
pub fn resolve_location_ids<'a>(
    records: &'a [WeatherRecord],
    city_ids: &HashMap<String, i32>,
) -> (Vec<(i32, &'a RawObservation)>, u64) {
    let mut dropped = 0;
    let resolved = records
        .iter()
        .filter_map(|r| match city_ids.get(&r.raw.city) {
            Some(id) => Some((*id, &r.raw)),
            None => {
                dropped += 1;
                None
            }
        })
        .collect();
    (resolved, dropped)
}

/// Records that carry derived metrics worth persisting.
pub fn derived_candidates(records: &[WeatherRecord]) -> Vec<&WeatherRecord> {
    records.iter().filter(|r| r.derived.wind_chill.is_some()).collect()
}

/// Idempotent three-stage Postgres loader: locations, then raw observations,
/// then derived metrics. Each stage runs in its own transaction and only ever
/// inserts; existing keys are skipped.
pub struct PostgresLoader {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PostgresLoader {
    pub fn new(pool: PgPool, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    pub async fn load(&self, records: &[WeatherRecord]) -> Result<LoadReport, PipelineError> {
        let mut report = LoadReport {
            records: records.len(),
            ..LoadReport::default()
        };
        if records.is_empty() {
            tracing::info!("no records to load");
            return Ok(report);
        }

        let locations = dedupe_locations(records.iter().map(|r| &r.raw));
        report.locations = self
            .with_retries("locations", || self.upsert_locations(&locations))
            .await?;
        tracing::info!(
            attempted = report.locations.attempted,
            inserted = report.locations.inserted,
            "loaded locations"
        );

        let (raw, unresolved) = self
            .with_retries("raw_weather", || self.upsert_raw_observations(records))
            .await?;
        report.raw_weather = raw;
        report.raw_unresolved = unresolved;
        tracing::info!(
            attempted = raw.attempted,
            inserted = raw.inserted,
            already_present = raw.conflicts(),
            "loaded raw weather rows"
        );

        let candidates = derived_candidates(records);
        report.derived_missing = (records.len() - candidates.len()) as u64;
        if candidates.is_empty() {
            tracing::info!("no derived metrics to load");
            return Ok(report);
        }
        let (derived, unmatched) = self
            .with_retries("derived_metrics", || self.upsert_derived_metrics(&candidates))
            .await?;
        report.derived_metrics = derived;
        report.derived_unmatched = unmatched;
        tracing::info!(
            attempted = report.derived_metrics.attempted,
            inserted = report.derived_metrics.inserted,
            unmatched = report.derived_unmatched,
            without_metrics = report.derived_missing,
            "loaded derived metrics"
        );

        Ok(report)
    }

    /// Run a whole stage, replaying it on failure. Replays are safe because
    /// every stage skips keys that already exist.
    async fn with_retries<T, F, Fut>(&self, stage: &'static str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(out) => return Ok(out),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(error = %e, stage, attempt, "load stage failed, retrying with backoff");
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, stage, "load stage failed, giving up");
                    metrics::counter!("load_stage_errors_total").increment(1);
                    return Err(PipelineError::Sink(format!("{stage}: {e}")));
                }
            }
        }
    }

    /// Insert unseen cities. Existing rows keep their coordinates.
    pub async fn upsert_locations(&self, locations: &[Location]) -> Result<StageCount, sqlx::Error> {
        let mut count = StageCount {
            attempted: locations.len() as u64,
            inserted: 0,
        };

        let mut tx = self.pool.begin().await?;
        for chunk in locations.chunks(self.batch_size) {
            let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO locations (city, latitude, longitude) ");
            builder.push_values(chunk, |mut b, loc| {
                b.push_bind(&loc.city).push_bind(loc.latitude).push_bind(loc.longitude);
            });
            builder.push(" ON CONFLICT (city) DO NOTHING");

            count.inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        metrics::counter!("locations_inserted_total").increment(count.inserted);
        Ok(count)
    }

    /// Insert raw rows for cities already in `locations`. Returns the stage
    /// count and the number of records dropped for an unknown city.
    pub async fn upsert_raw_observations(&self, records: &[WeatherRecord]) -> Result<(StageCount, u64), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let city_ids: HashMap<String, i32> = sqlx::query_as::<_, (String, i32)>("SELECT city, id FROM locations")
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();

        let (resolved, unresolved) = resolve_location_ids(records, &city_ids);
        if unresolved > 0 {
            metrics::counter!("raw_weather_unresolved_total").increment(unresolved);
            tracing::warn!(
                dropped = unresolved,
                "some cities not found in locations table, dropping their observations"
            );
        }

        let mut count = StageCount {
            attempted: resolved.len() as u64,
            inserted: 0,
        };
        for chunk in resolved.chunks(self.batch_size) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO raw_weather (location_id, timestamp, temperature, relative_humidity, wind_speed_10m, precipitation) ",
            );
            builder.push_values(chunk, |mut b, (location_id, obs)| {
                b.push_bind(*location_id)
                    .push_bind(obs.ts)
                    .push_bind(obs.temperature)
                    .push_bind(obs.relative_humidity)
                    .push_bind(obs.wind_speed_10m)
                    .push_bind(obs.precipitation);
            });
            builder.push(" ON CONFLICT (location_id, timestamp) DO NOTHING");

            count.inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        metrics::counter!("raw_weather_inserted_total").increment(count.inserted);
        Ok((count, unresolved))
    }

    /// Insert derived rows keyed through `(city, timestamp)` back to `raw_weather.id`.
    /// `attempted` counts the records that matched a raw row. Returns the stage
    /// count and the number of records with no raw row.
    pub async fn upsert_derived_metrics(
        &self,
        records: &[&WeatherRecord],
    ) -> Result<(StageCount, u64), sqlx::Error> {
        let mut count = StageCount::default();

        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(self.batch_size) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "WITH v (city, ts, wind_chill, frostbite_risk, snowfall_cm) AS (",
            );
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(&r.raw.city)
                    .push_bind(r.raw.ts)
                    .push_bind(r.derived.wind_chill)
                    .push_bind(r.derived.frostbite_risk.as_str())
                    .push_bind(r.derived.snowfall_cm);
            });
            builder.push(
                "), matched AS ( \
                     SELECT rw.id AS raw_weather_id, v.wind_chill, v.frostbite_risk, v.snowfall_cm \
                     FROM v \
                     JOIN locations l ON l.city = v.city \
                     JOIN raw_weather rw ON rw.location_id = l.id AND rw.timestamp = v.ts \
                 ), inserted AS ( \
                     INSERT INTO derived_metrics (raw_weather_id, wind_chill, frostbite_risk, snowfall_cm) \
                     SELECT raw_weather_id, wind_chill, frostbite_risk, snowfall_cm FROM matched \
                     ON CONFLICT (raw_weather_id) DO NOTHING \
                     RETURNING 1 \
                 ) \
                 SELECT (SELECT COUNT(*) FROM matched), (SELECT COUNT(*) FROM inserted)",
            );

            let (matched, inserted) = builder
                .build_query_as::<(i64, i64)>()
                .fetch_one(&mut *tx)
                .await?;
            count.attempted += matched as u64;
            count.inserted += inserted as u64;
        }
        tx.commit().await?;

        let unmatched = (records.len() as u64).saturating_sub(count.attempted);
        if unmatched > 0 {
            metrics::counter!("derived_metrics_unmatched_total").increment(unmatched);
            tracing::warn!(
                dropped = unmatched,
                "derived metrics without a matching raw weather row, skipping them"
            );
        }

        metrics::counter!("derived_metrics_inserted_total").increment(count.inserted);
        Ok((count, unmatched))
    }
}

#[async_trait::async_trait]
impl Sink<WeatherRecord> for PostgresLoader {
    type Report = LoadReport;

    async fn run<S>(&self, mut input: S) -> Result<LoadReport, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<WeatherRecord>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut records = Vec::new();
        let mut first_received: Option<SystemTime> = None;

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline, aborting load");
                    return Err(e);
                }
            };
            first_received = Some(first_received.map_or(env.received_at, |t| t.min(env.received_at)));
            records.push(env.payload);
        }

        let report = self.load(&records).await?;

        if let Some(min_received) = first_received {
            if let Ok(dur) = SystemTime::now().duration_since(min_received) {
                metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
            }
        }

        Ok(report)
    }
}
