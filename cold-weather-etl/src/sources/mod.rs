pub mod locations;
pub mod open_meteo;

pub use locations::{FailurePolicy, LocationSource};
pub use open_meteo::{ExtractError, OpenMeteoExtractor};
