mod frostbite;
mod location;
mod observation;

pub use frostbite::FrostbiteRisk;
pub use location::Location;
pub use observation::{DerivedMetrics, RawObservation, WeatherRecord};
