//! Batched writes of time series to the metrics backend.

use crate::descriptor::PROJECT_LABEL;
use crate::monitoring::{MetricsBackend, MonitoringError, TimeSeries};
use thiserror::Error;
use tracing::{event, Level};

/// Most series the backend accepts in a single write.
pub const MAX_BATCH_SIZE: usize = 200;

/// A batch was rejected. Batches before it stay written.
#[derive(Error, Debug)]
#[error("failed to write time series batch {batch} of {batches}")]
pub struct PublishError {
    /// One based index of the rejected batch.
    pub batch: usize,
    pub batches: usize,
    /// Series written by earlier batches.
    pub written: usize,
    /// Projects whose points were in the rejected batch.
    pub project_ids: Vec<String>,
    #[source]
    pub source: MonitoringError,
}

/// Writes series in contiguous, ordered batches, one call at a time.
pub struct BatchPublisher<'a, M: ?Sized> {
    backend: &'a M,
    project_id: &'a str,
}

impl<'a, M: MetricsBackend + ?Sized> BatchPublisher<'a, M> {
    pub fn new(backend: &'a M, project_id: &'a str) -> Self {
        BatchPublisher {
            backend,
            project_id,
        }
    }

    /// Writes all of `series` and returns the number of batches sent.
    ///
    /// Stops at the first rejected batch.
    pub fn publish(&self, series: &[TimeSeries]) -> Result<usize, PublishError> {
        if series.is_empty() {
            event!(Level::INFO, "No time series data to write.");
            return Ok(0);
        }

        let total = series.len();
        let batches = total.div_ceil(MAX_BATCH_SIZE);
        let mut written = 0;

        for (index, batch) in series.chunks(MAX_BATCH_SIZE).enumerate() {
            if let Err(source) = self.backend.create_time_series(self.project_id, batch) {
                let project_ids: Vec<String> = batch
                    .iter()
                    .filter_map(|s| s.label(PROJECT_LABEL))
                    .map(str::to_string)
                    .collect();
                event!(Level::ERROR, "Failed to write time series batch: {}", source);
                event!(Level::ERROR, "Failed projects: {:?}", project_ids);
                return Err(PublishError {
                    batch: index + 1,
                    batches,
                    written,
                    project_ids,
                    source,
                });
            }

            written += batch.len();
            event!(
                Level::INFO,
                "Successfully wrote batch of {} time series (total: {}/{})",
                batch.len(),
                written,
                total
            );
        }

        Ok(batches)
    }
}
