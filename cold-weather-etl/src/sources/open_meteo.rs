use std::{future::Future, time::Duration};

use cold_weather_client::domain::{Location, RawObservation};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use time::{
    format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime,
    PrimitiveDateTime, UtcOffset,
};

use crate::{
    cache::{CacheKey, ResponseCache},
    config::ApiConfig,
};

/// Hourly variables requested for every location.
pub const HOURLY_FIELDS: &str = "temperature_2m,relative_humidity_2m,wind_speed_10m,precipitation";

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("weather request for {city} failed: {source}")]
    Request {
        city: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("weather API returned {status} for {city}")]
    HttpStatus {
        city: String,
        status: reqwest::StatusCode,
    },
    #[error("invalid weather payload for {city}: {source}")]
    Decode {
        city: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("hourly series for {city} is misaligned: '{field}' has {found} values, expected {expected}")]
    Misaligned {
        city: String,
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid utc offset {seconds}s for {city}")]
    Offset { city: String, seconds: i32 },
    #[error("invalid timestamp '{value}' for {city}")]
    Timestamp { city: String, value: String },
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    utc_offset_seconds: i32,
    hourly: HourlySeries,
}

#[derive(Debug, Deserialize)]
struct HourlySeries {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
    relative_humidity_2m: Vec<Option<f64>>,
    wind_speed_10m: Vec<Option<f64>>,
    precipitation: Vec<Option<f64>>,
}

/// Fetches hourly series from an Open-Meteo compatible forecast endpoint,
/// consulting a [`ResponseCache`] first.
#[derive(Debug, Clone)]
pub struct OpenMeteoExtractor {
    client: reqwest::Client,
    base_url: String,
    cache: ResponseCache,
    forecast_days: Option<u32>,
    concurrency: usize,
}

impl OpenMeteoExtractor {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, cache: ResponseCache) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            cache,
            forecast_days: None,
            concurrency: 1,
        }
    }

    pub fn from_config(api: &ApiConfig, cache: ResponseCache) -> Result<Self, ExtractError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()
            .map_err(ExtractError::Client)?;

        Ok(Self::new(client, api.base_url.clone(), cache).with_forecast_days(api.forecast_days))
    }

    pub fn with_forecast_days(mut self, forecast_days: Option<u32>) -> Self {
        self.forecast_days = forecast_days;
        self
    }

    /// Number of locations fetched at once. `1` keeps the run fully sequential.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn request_params(&self, location: &Location) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("latitude", location.latitude.to_string()),
            ("longitude", location.longitude.to_string()),
            ("hourly", HOURLY_FIELDS.to_string()),
            ("timezone", "auto".to_string()),
        ];
        if let Some(days) = self.forecast_days {
            params.push(("forecast_days", days.to_string()));
        }
        params
    }

    /// Hourly observations for one location, in API (chronological) order.
    pub async fn fetch(&self, location: &Location) -> Result<Vec<RawObservation>, ExtractError> {
        let params = self.request_params(location);
        let key = CacheKey::for_request(location.latitude, location.longitude, &params);

        if let Some(body) = self.cache.get(&key).await {
            match parse_forecast(&body, location) {
                Ok(records) => {
                    tracing::info!(city = %location.city, records = records.len(), "cache hit");
                    metrics::counter!("weather_cache_hits_total").increment(1);
                    return Ok(records);
                }
                Err(e) => {
                    tracing::warn!(city = %location.city, error = %e, "corrupt cache entry, refetching");
                }
            }
        }
        metrics::counter!("weather_cache_misses_total").increment(1);

        tracing::info!(city = %location.city, "fetching from weather API");
        let body = self.download(location, &params).await?;
        let records = parse_forecast(&body, location)?;

        if let Err(e) = self.cache.put(&key, &body).await {
            tracing::warn!(city = %location.city, error = %e, "failed to write cache entry");
        }

        tracing::info!(city = %location.city, records = records.len(), "extracted hourly records");
        Ok(records)
    }

    /// Concatenation of [`fetch`](Self::fetch) for every location, in input order.
    /// The first failure aborts the whole extraction.
    pub async fn fetch_all(&self, locations: &[Location]) -> Result<Vec<RawObservation>, ExtractError> {
        let batches: Vec<Vec<RawObservation>> = stream::iter(locations.iter().cloned())
            .map(|loc| self.fetch_owned(loc))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let records: Vec<RawObservation> = batches.into_iter().flatten().collect();
        metrics::counter!("weather_records_extracted_total").increment(records.len() as u64);
        Ok(records)
    }

    /// Per-location outcome of [`fetch`](Self::fetch), in input order. Never short-circuits.
    pub async fn fetch_each(
        &self,
        locations: &[Location],
    ) -> Vec<Result<Vec<RawObservation>, ExtractError>> {
        stream::iter(locations.iter().cloned())
            .map(|loc| self.fetch_owned(loc))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    fn fetch_owned(
        &self,
        location: Location,
    ) -> impl Future<Output = Result<Vec<RawObservation>, ExtractError>> + Send + 'static {
        let this = self.clone();
        async move { this.fetch(&location).await }
    }

    async fn download(
        &self,
        location: &Location,
        params: &[(&'static str, String)],
    ) -> Result<Vec<u8>, ExtractError> {
        metrics::counter!("weather_api_requests_total").increment(1);

        let response = self
            .client
            .get(&self.base_url)
            .query(params)
            .send()
            .await
            .map_err(|source| {
                metrics::counter!("weather_api_failures_total").increment(1);
                ExtractError::Request {
                    city: location.city.clone(),
                    source,
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            metrics::counter!("weather_api_failures_total").increment(1);
            tracing::warn!(city = %location.city, %status, "weather API request failed");
            return Err(ExtractError::HttpStatus {
                city: location.city.clone(),
                status,
            });
        }

        let body = response.bytes().await.map_err(|source| ExtractError::Request {
            city: location.city.clone(),
            source,
        })?;
        Ok(body.to_vec())
    }
}

/// Zip the parallel hourly arrays of a forecast payload into one record per
/// hour, tagged with the location and normalised to UTC.
pub fn parse_forecast(body: &[u8], location: &Location) -> Result<Vec<RawObservation>, ExtractError> {
    let city = &location.city;
    let payload: ForecastResponse = serde_json::from_slice(body).map_err(|source| ExtractError::Decode {
        city: city.clone(),
        source,
    })?;
    let hourly = payload.hourly;

    let expected = hourly.time.len();
    for (field, found) in [
        ("temperature_2m", hourly.temperature_2m.len()),
        ("relative_humidity_2m", hourly.relative_humidity_2m.len()),
        ("wind_speed_10m", hourly.wind_speed_10m.len()),
        ("precipitation", hourly.precipitation.len()),
    ] {
        if found != expected {
            return Err(ExtractError::Misaligned {
                city: city.clone(),
                field,
                expected,
                found,
            });
        }
    }

    let offset = UtcOffset::from_whole_seconds(payload.utc_offset_seconds).map_err(|_| ExtractError::Offset {
        city: city.clone(),
        seconds: payload.utc_offset_seconds,
    })?;

    hourly
        .time
        .iter()
        .enumerate()
        .map(|(i, value)| -> Result<RawObservation, ExtractError> {
            let ts = parse_hour(value, offset).ok_or_else(|| ExtractError::Timestamp {
                city: city.clone(),
                value: value.clone(),
            })?;
            Ok(RawObservation {
                city: city.clone(),
                latitude: location.latitude,
                longitude: location.longitude,
                ts,
                temperature: hourly.temperature_2m[i],
                relative_humidity: hourly.relative_humidity_2m[i],
                wind_speed_10m: hourly.wind_speed_10m[i],
                precipitation: hourly.precipitation[i],
            })
        })
        .collect()
}

/// Parse an API time value into UTC.
///
/// Local wall-clock values (`2024-01-15T06:00`) are interpreted at `offset`;
/// values carrying their own offset keep it.
pub fn parse_hour(value: &str, offset: UtcOffset) -> Option<OffsetDateTime> {
    if let Ok(ts) = OffsetDateTime::parse(value, &Rfc3339) {
        return Some(ts.to_offset(UtcOffset::UTC));
    }

    PrimitiveDateTime::parse(value, format_description!("[year]-[month]-[day]T[hour]:[minute]"))
        .or_else(|_| {
            PrimitiveDateTime::parse(
                value,
                format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
            )
        })
        .ok()
        .map(|local| local.assume_offset(offset).to_offset(UtcOffset::UTC))
}
