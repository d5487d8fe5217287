//! Settings of the reporter and their validation.
//!
//! Values are normally sourced from the environment by the service
//! binary. Validation is deferred to each run so that a misconfigured
//! deployment still answers the trigger with a failure instead of
//! refusing to start.

use thiserror::Error;

pub static DEFAULT_BILLING_TABLE: &str = "your-project.your_dataset.gcp_billing_export_v1_*";
pub static DEFAULT_SERVICE_DESCRIPTION: &str = "BigQuery";
pub static DEFAULT_METRIC_TYPE: &str = "custom.googleapis.com/billing/bigquery/daily_cost";

/// Configuration errors. These are fatal and detected before any
/// external call is made.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("MONITORING_PROJECT_ID environment variable not set")]
    MissingMonitoringProject,

    #[error("invalid billing table reference {0:?}")]
    InvalidBillingTable(String),
}

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Fully-qualified billing export table, `project.dataset.table`.
    /// Wildcard tables are allowed.
    pub billing_table: String,
    /// Value of `service.description` in the billing export whose cost
    /// is reported.
    pub service_description: String,
    /// Type of the custom metric points are written to.
    pub metric_type: String,
    /// Project owning the metric descriptor and the time series.
    pub monitoring_project_id: Option<String>,
    /// Project the aggregation query job runs in. Defaults to the
    /// monitoring project.
    pub query_project_id: Option<String>,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        ReporterConfig {
            billing_table: DEFAULT_BILLING_TABLE.to_string(),
            service_description: DEFAULT_SERVICE_DESCRIPTION.to_string(),
            metric_type: DEFAULT_METRIC_TYPE.to_string(),
            monitoring_project_id: None,
            query_project_id: None,
        }
    }
}

impl ReporterConfig {
    /// Checks that everything a run needs is present and well formed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.monitoring_project()?;
        if !is_valid_table_reference(&self.billing_table) {
            return Err(ConfigError::InvalidBillingTable(self.billing_table.clone()));
        }
        Ok(())
    }

    pub fn monitoring_project(&self) -> Result<&str, ConfigError> {
        non_empty(&self.monitoring_project_id).ok_or(ConfigError::MissingMonitoringProject)
    }

    pub fn query_project(&self) -> Result<&str, ConfigError> {
        match non_empty(&self.query_project_id) {
            Some(project) => Ok(project),
            None => self.monitoring_project(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// The table reference is interpolated into the query text since
/// BigQuery does not accept it as a parameter, so only the characters
/// that can appear in `project.dataset.table` (including the legacy
/// `domain:project` form and wildcard suffixes) are accepted.
fn is_valid_table_reference(table: &str) -> bool {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '*');
    let parts: Vec<&str> = table.split('.').collect();
    table.chars().all(allowed) && parts.len() >= 2 && parts.iter().all(|part| !part.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{is_valid_table_reference, ConfigError, ReporterConfig};

    fn config(project: Option<&str>) -> ReporterConfig {
        ReporterConfig {
            billing_table: "acme-billing.exports.gcp_billing_export_v1_0123".to_string(),
            monitoring_project_id: project.map(str::to_string),
            ..ReporterConfig::default()
        }
    }

    #[test]
    fn test_missing_monitoring_project() {
        assert_eq!(
            config(None).validate(),
            Err(ConfigError::MissingMonitoringProject)
        );
        assert_eq!(
            config(Some("  ")).validate(),
            Err(ConfigError::MissingMonitoringProject)
        );
    }

    #[test]
    fn test_query_project_defaults_to_monitoring_project() {
        let mut config = config(Some("acme-ops"));
        assert!(config.validate().is_ok());
        assert_eq!(config.query_project(), Ok("acme-ops"));

        config.query_project_id = Some("acme-billing".to_string());
        assert_eq!(config.query_project(), Ok("acme-billing"));
        assert_eq!(config.monitoring_project(), Ok("acme-ops"));
    }

    #[test]
    fn test_invalid_billing_table() {
        let mut config = config(Some("acme-ops"));
        config.billing_table = "acme.billing.export` WHERE 1=1 --".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBillingTable(config.billing_table.clone()))
        );
    }

    #[test]
    fn test_table_references() {
        assert!(is_valid_table_reference("acme.billing.gcp_billing_export_v1_*"));
        assert!(is_valid_table_reference("example.com:acme.billing.export"));
        assert!(is_valid_table_reference("billing.export"));
        assert!(!is_valid_table_reference("export"));
        assert!(!is_valid_table_reference("acme..export"));
        assert!(!is_valid_table_reference("acme.billing.export "));
        assert!(!is_valid_table_reference("`acme.billing.export`"));
        assert!(!is_valid_table_reference(""));
    }
}
