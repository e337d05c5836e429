use cold_weather_client::domain::{Location, RawObservation};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

use super::{ExtractError, OpenMeteoExtractor};

impl From<ExtractError> for PipelineError {
    fn from(e: ExtractError) -> Self {
        PipelineError::Source(e.to_string())
    }
}

/// What to do when one location cannot be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Fail the whole run.
    #[default]
    Abort,
    /// Log the failure and continue with the remaining locations.
    SkipAndContinue,
}

impl FailurePolicy {
    pub fn from_skip_flag(skip_failed_locations: bool) -> Self {
        if skip_failed_locations {
            FailurePolicy::SkipAndContinue
        } else {
            FailurePolicy::Abort
        }
    }
}

/// Source of raw observations for a fixed list of configured locations.
#[derive(Debug, Clone)]
pub struct LocationSource {
    extractor: OpenMeteoExtractor,
    locations: Vec<Location>,
    policy: FailurePolicy,
}

impl LocationSource {
    pub fn new(extractor: OpenMeteoExtractor, locations: Vec<Location>, policy: FailurePolicy) -> Self {
        Self {
            extractor,
            locations,
            policy,
        }
    }

    /// Extract every location according to the failure policy.
    pub async fn extract(&self) -> Result<Vec<RawObservation>, ExtractError> {
        match self.policy {
            FailurePolicy::Abort => self.extractor.fetch_all(&self.locations).await,
            FailurePolicy::SkipAndContinue => {
                let outcomes = self.extractor.fetch_each(&self.locations).await;
                let mut records = Vec::new();
                for (location, outcome) in self.locations.iter().zip(outcomes) {
                    match outcome {
                        Ok(rows) => records.extend(rows),
                        Err(e) => {
                            metrics::counter!("weather_locations_skipped_total").increment(1);
                            tracing::warn!(city = %location.city, error = %e, "skipping location after failed extraction");
                        }
                    }
                }
                Ok(records)
            }
        }
    }
}

#[async_trait::async_trait]
impl Source<RawObservation> for LocationSource {
    async fn stream(&self) -> EnvelopeStream<RawObservation> {
        let this = self.clone();
        let s = async_stream::try_stream! {
            let records = this.extract().await.map_err(PipelineError::from)?;
            tracing::info!(records = records.len(), locations = this.locations.len(), "extraction finished");

            for record in records {
                yield Envelope::now(record);
            }
        };

        Box::pin(s)
    }
}
