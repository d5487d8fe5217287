use crate::aggregator::CostAggregator;
use crate::auth::TokenSource;
use crate::billing::{BigQueryClient, BillingError, BillingSource};
use crate::config::{ConfigError, ReporterConfig};
use crate::descriptor::{cost_descriptor, ensure_descriptor};
use crate::monitoring::{MetricsBackend, MonitoringClient};
use crate::publisher::{BatchPublisher, PublishError};
use crate::series::build_series;
use crate::window::TimeWindow;
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, Level};

pub const STATUS_OK: u16 = 200;
pub const STATUS_ERROR: u16 = 500;

/// Failures that abort a run.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to query billing data")]
    Query(#[from] BillingError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Result of a run that completed.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// No project had qualifying cost in the window.
    NoData,
    Reported { projects: usize, total_cost: f64 },
}

impl RunOutcome {
    pub fn message(&self) -> String {
        match self {
            RunOutcome::NoData => "No data to report".to_string(),
            RunOutcome::Reported {
                projects,
                total_cost,
            } => format!(
                "Successfully wrote metrics for {} projects. Total cost: ${:.2}",
                projects, total_cost
            ),
        }
    }
}

/// What the trigger answers: a short text and an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResponse {
    pub message: String,
    pub status: u16,
}

impl From<Result<RunOutcome, ReportError>> for RunResponse {
    fn from(result: Result<RunOutcome, ReportError>) -> Self {
        match result {
            Ok(outcome) => RunResponse {
                message: outcome.message(),
                status: STATUS_OK,
            },
            Err(err) => RunResponse {
                message: format!("Error: {}", describe(&err)),
                status: STATUS_ERROR,
            },
        }
    }
}

/// Renders an error followed by its chain of causes.
fn describe(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// This is the entry point of the library. One `run` computes the
/// previous day's cost per project and publishes it.
///
/// The reporter owns the billing source and the metrics backend. They
/// carry connection pools and a token cache, so a reporter should be
/// built once per process and shared by every invocation. It holds no
/// other state between runs.
pub struct CostReporter<B, M> {
    config: ReporterConfig,
    billing: B,
    metrics: M,
}

impl CostReporter<BigQueryClient, MonitoringClient> {
    /// Instantiates a reporter talking to BigQuery and Cloud
    /// Monitoring through `http`.
    pub fn new(
        config: ReporterConfig,
        http: Client,
        tokens: Arc<dyn TokenSource + Send + Sync>,
    ) -> Self {
        CostReporter::with_clients(
            config,
            BigQueryClient::new(http.clone(), Arc::clone(&tokens)),
            MonitoringClient::new(http, tokens),
        )
    }
}

impl<B: BillingSource, M: MetricsBackend> CostReporter<B, M> {
    /// Leaves the responsibility to provide the clients to the caller.
    pub fn with_clients(config: ReporterConfig, billing: B, metrics: M) -> Self {
        CostReporter {
            config,
            billing,
            metrics,
        }
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    /// Runs the pipeline for the day before `now`.
    pub fn execute(&self, now: DateTime<Utc>) -> Result<RunOutcome, ReportError> {
        self.config.validate()?;
        let monitoring_project = self.config.monitoring_project()?;
        let query_project = self.config.query_project()?;

        let descriptor = cost_descriptor(&self.config.metric_type, &self.config.service_description);
        ensure_descriptor(&self.metrics, monitoring_project, &descriptor);

        let window = TimeWindow::previous_day(now);
        let rows = CostAggregator::new(
            &self.billing,
            query_project,
            &self.config.billing_table,
            &self.config.service_description,
        )
        .fetch_costs(&window)?;

        if rows.is_empty() {
            event!(
                Level::INFO,
                "No {} costs found for the previous day",
                self.config.service_description
            );
            return Ok(RunOutcome::NoData);
        }

        let series = build_series(&self.config.metric_type, &rows, window.end);
        BatchPublisher::new(&self.metrics, monitoring_project).publish(&series)?;

        let total_cost: f64 = rows.iter().map(|row| row.daily_cost).sum();
        event!(
            Level::INFO,
            "Successfully processed {} projects. Total cost: ${:.2}",
            series.len(),
            total_cost
        );
        Ok(RunOutcome::Reported {
            projects: series.len(),
            total_cost,
        })
    }

    /// Runs the pipeline and converts the result into the response of
    /// the trigger. Failures are logged here and nowhere above.
    pub fn run(&self, now: DateTime<Utc>) -> RunResponse {
        event!(
            Level::INFO,
            "Starting {} daily cost report",
            self.config.service_description
        );
        let result = self.execute(now);
        if let Err(err) = &result {
            event!(Level::ERROR, "Daily cost report failed with error: {}", describe(err));
        }
        RunResponse::from(result)
    }
}
