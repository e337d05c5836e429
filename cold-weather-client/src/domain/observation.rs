use time::OffsetDateTime;

use super::{FrostbiteRisk, Location};

/// One hourly observation for a city as returned by the forecast API.
///
/// `ts` is always UTC. Measurement fields are `None` when the API sent `null`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawObservation {
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub ts: OffsetDateTime,
    /// °C at 2 m.
    pub temperature: Option<f64>,
    /// % at 2 m.
    pub relative_humidity: Option<f64>,
    /// km/h at 10 m.
    pub wind_speed_10m: Option<f64>,
    /// mm over the preceding hour.
    pub precipitation: Option<f64>,
}

impl RawObservation {
    pub fn location(&self) -> Location {
        Location::new(self.city.clone(), self.latitude, self.longitude)
    }
}

/// Cold-weather metrics derived from a single [`RawObservation`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DerivedMetrics {
    /// °C, `None` when temperature or wind speed is missing.
    pub wind_chill: Option<f64>,
    pub frostbite_risk: FrostbiteRisk,
    /// cm, `None` when temperature or precipitation is missing.
    pub snowfall_cm: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WeatherRecord {
    pub raw: RawObservation,
    pub derived: DerivedMetrics,
}
