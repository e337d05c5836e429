/// A monitored city. `city` is the natural key in storage.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(city: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            city: city.into(),
            latitude,
            longitude,
        }
    }

    /// Copy of this location with coordinates rounded to 4 decimal places,
    /// the precision used for storage and cache keys.
    pub fn rounded(&self) -> Self {
        Self {
            city: self.city.clone(),
            latitude: round_coordinate(self.latitude),
            longitude: round_coordinate(self.longitude),
        }
    }
}

pub fn round_coordinate(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_four_decimals() {
        let loc = Location::new("Oslo", 59.913_868_9, 10.752_245_1).rounded();
        assert_eq!(loc.latitude, 59.9139);
        assert_eq!(loc.longitude, 10.7522);
        assert_eq!(loc.city, "Oslo");
    }

    #[test]
    fn rounding_keeps_negative_coordinates() {
        assert_eq!(round_coordinate(-79.383_24), -79.3832);
    }
}
