pub mod aggregator;
pub mod api;
pub mod auth;
pub mod billing;
pub mod config;
pub mod descriptor;
pub mod monitoring;
pub mod publisher;
pub mod reporter;
pub mod series;
pub mod window;

pub use auth::{MetadataServer, StaticToken, TokenSource};
pub use config::ReporterConfig;
pub use reporter::{CostReporter, RunOutcome, RunResponse};
