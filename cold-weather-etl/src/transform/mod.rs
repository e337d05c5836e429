use crate::pipeline::{Envelope, PipelineError, Transform};
use cold_weather_client::domain::{DerivedMetrics, FrostbiteRisk, RawObservation, WeatherRecord};

/// Wind chill only applies at or below this air temperature (°C).
pub const WIND_CHILL_MAX_TEMP_C: f64 = 10.0;
/// Wind chill only applies above this wind speed (km/h).
pub const WIND_CHILL_MIN_WIND_KMH: f64 = 4.8;
/// Precipitation at or below this temperature (°C) is counted as snow.
pub const SNOW_MAX_TEMP_C: f64 = 2.0;
/// Below this temperature (°C) snow is fluffier and uses the higher ratio.
pub const COLD_SNOW_TEMP_C: f64 = -10.0;

/// One decimal place, halves to even.
fn round1(v: f64) -> f64 {
    (v * 10.0).round_ties_even() / 10.0
}

/// Wind chill (°C) from air temperature (°C) and 10 m wind speed (km/h).
///
/// Outside the cold-and-windy region the air temperature is returned unchanged.
pub fn wind_chill(temperature_c: f64, wind_speed_kmh: f64) -> f64 {
    if temperature_c <= WIND_CHILL_MAX_TEMP_C && wind_speed_kmh > WIND_CHILL_MIN_WIND_KMH {
        let v = wind_speed_kmh.powf(0.16);
        round1(13.12 + 0.6215 * temperature_c - 11.37 * v + 0.3965 * temperature_c * v)
    } else {
        temperature_c
    }
}

/// Frostbite exposure band for a wind chill (°C). The first matching band wins.
pub fn frostbite_risk(wind_chill_c: Option<f64>) -> FrostbiteRisk {
    match wind_chill_c {
        Some(wc) if wc >= -10.0 => FrostbiteRisk::Low,
        Some(wc) if wc < -10.0 && wc >= -25.0 => FrostbiteRisk::TenToThirtyMinutes,
        Some(wc) if wc < -25.0 && wc >= -35.0 => FrostbiteRisk::FiveToTenMinutes,
        Some(wc) if wc < -35.0 && wc >= -48.0 => FrostbiteRisk::FiveMinutesOrLess,
        Some(wc) if wc < -48.0 => FrostbiteRisk::UnderFiveMinutes,
        // NaN or missing
        _ => FrostbiteRisk::NoRisk,
    }
}

/// Estimated snowfall (cm) from hourly precipitation (mm) and temperature (°C).
pub fn estimate_snowfall(precipitation_mm: f64, temperature_c: f64) -> f64 {
    if temperature_c <= SNOW_MAX_TEMP_C && precipitation_mm > 0.0 {
        let ratio = if temperature_c < COLD_SNOW_TEMP_C { 15.0 } else { 10.0 };
        round1(precipitation_mm * ratio / 10.0)
    } else {
        0.0
    }
}

/// Derive the cold-weather metrics for one observation.
///
/// Missing inputs leave the dependent metric undefined instead of failing the row.
pub fn derive_metrics(obs: &RawObservation) -> DerivedMetrics {
    let wind_chill = match (obs.temperature, obs.wind_speed_10m) {
        (Some(t), Some(v)) => Some(wind_chill(t, v)).filter(|wc| !wc.is_nan()),
        _ => None,
    };
    let snowfall_cm = match (obs.precipitation, obs.temperature) {
        (Some(p), Some(t)) => Some(estimate_snowfall(p, t)),
        _ => None,
    };

    DerivedMetrics {
        wind_chill,
        frostbite_risk: frostbite_risk(wind_chill),
        snowfall_cm,
    }
}

pub fn enrich(obs: RawObservation) -> WeatherRecord {
    let derived = derive_metrics(&obs);
    WeatherRecord { raw: obs, derived }
}

/// Elementwise [`enrich`] over a batch, preserving order.
pub fn transform_batch(batch: Vec<RawObservation>) -> Vec<WeatherRecord> {
    batch.into_iter().map(enrich).collect()
}

#[derive(Clone, Default)]
pub struct ColdWeatherMetrics;

#[async_trait::async_trait]
impl Transform<RawObservation, WeatherRecord> for ColdWeatherMetrics {
    async fn apply(
        &self,
        input: Envelope<RawObservation>,
    ) -> Result<Envelope<WeatherRecord>, PipelineError> {
        let env = input.map(enrich);
        if env.payload.derived.wind_chill.is_none() {
            metrics::counter!("transform_incomplete_rows_total").increment(1);
        }
        Ok(env)
    }
}
