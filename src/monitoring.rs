//! This module provides an abstraction over the metrics backend in
//! order to allow the pipeline to run against Cloud Monitoring in
//! production and against an in-memory recorder in tests.
//!
//! The wire types mirror the Cloud Monitoring v3 REST representation.

use crate::api::read_failure;
use crate::auth::{AuthError, TokenSource};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
#[cfg(test)]
use std::cell::RefCell;
use std::collections::BTreeMap;
#[cfg(test)]
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

static MONITORING_API_URL: &str = "https://monitoring.googleapis.com/v3";

/// Metrics backend errors.
#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("failed to authenticate against Cloud Monitoring")]
    Auth(#[from] AuthError),

    #[error("failed to send Cloud Monitoring request")]
    RequestFailed(#[source] reqwest::Error),

    #[error("Cloud Monitoring returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl MonitoringError {
    /// True when the backend positively reported the resource missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MonitoringError::Api { status: 404, .. })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    MetricKindUnspecified,
    Gauge,
    Delta,
    Cumulative,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    ValueTypeUnspecified,
    Bool,
    Int64,
    Double,
    String,
    Distribution,
    Money,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDescriptor {
    pub key: String,
    #[serde(default = "string_value_type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub description: String,
}

fn string_value_type() -> ValueType {
    ValueType::String
}

/// Schema of a custom metric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptor {
    /// Resource name, only set on descriptors read back from the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    #[serde(default)]
    pub labels: Vec<LabelDescriptor>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Metric {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInterval {
    pub end_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedValue {
    pub double_value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Point {
    pub interval: TimeInterval,
    pub value: TypedValue,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeries {
    pub metric: Metric,
    pub resource: MonitoredResource,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    pub points: Vec<Point>,
}

impl TimeSeries {
    /// Value of a metric label, if set.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metric.labels.get(key).map(String::as_str)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimeSeriesBody<'a> {
    time_series: &'a [TimeSeries],
}

/// A basic metrics backend.
///
/// Every call is scoped to the project whose metrics namespace is
/// written to.
pub trait MetricsBackend {
    fn get_metric_descriptor(
        &self,
        project_id: &str,
        metric_type: &str,
    ) -> Result<MetricDescriptor, MonitoringError>;

    fn create_metric_descriptor(
        &self,
        project_id: &str,
        descriptor: &MetricDescriptor,
    ) -> Result<(), MonitoringError>;

    /// Writes one batch. The backend accepts or rejects the batch as a
    /// whole and takes at most 200 series per call.
    fn create_time_series(
        &self,
        project_id: &str,
        series: &[TimeSeries],
    ) -> Result<(), MonitoringError>;
}

impl<T: MetricsBackend + ?Sized> MetricsBackend for &T {
    fn get_metric_descriptor(
        &self,
        project_id: &str,
        metric_type: &str,
    ) -> Result<MetricDescriptor, MonitoringError> {
        (**self).get_metric_descriptor(project_id, metric_type)
    }

    fn create_metric_descriptor(
        &self,
        project_id: &str,
        descriptor: &MetricDescriptor,
    ) -> Result<(), MonitoringError> {
        (**self).create_metric_descriptor(project_id, descriptor)
    }

    fn create_time_series(
        &self,
        project_id: &str,
        series: &[TimeSeries],
    ) -> Result<(), MonitoringError> {
        (**self).create_time_series(project_id, series)
    }
}

/// Talks to the Cloud Monitoring v3 REST API.
pub struct MonitoringClient {
    http: Client,
    tokens: Arc<dyn TokenSource + Send + Sync>,
    base_url: String,
}

impl MonitoringClient {
    pub fn new(http: Client, tokens: Arc<dyn TokenSource + Send + Sync>) -> Self {
        MonitoringClient {
            http,
            tokens,
            base_url: MONITORING_API_URL.to_string(),
        }
    }

    fn check(response: Response) -> Result<Response, MonitoringError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let (status, message) = read_failure(response);
        Err(MonitoringError::Api { status, message })
    }
}

impl MetricsBackend for MonitoringClient {
    fn get_metric_descriptor(
        &self,
        project_id: &str,
        metric_type: &str,
    ) -> Result<MetricDescriptor, MonitoringError> {
        // The metric type contains slashes which are part of the
        // resource name and must not be escaped.
        let url = format!(
            "{}/projects/{}/metricDescriptors/{}",
            self.base_url, project_id, metric_type
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.tokens.token()?)
            .send()
            .map_err(MonitoringError::RequestFailed)?;
        Self::check(response)?
            .json()
            .map_err(MonitoringError::RequestFailed)
    }

    fn create_metric_descriptor(
        &self,
        project_id: &str,
        descriptor: &MetricDescriptor,
    ) -> Result<(), MonitoringError> {
        let url = format!("{}/projects/{}/metricDescriptors", self.base_url, project_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.tokens.token()?)
            .json(descriptor)
            .send()
            .map_err(MonitoringError::RequestFailed)?;
        Self::check(response).map(|_| ())
    }

    fn create_time_series(
        &self,
        project_id: &str,
        series: &[TimeSeries],
    ) -> Result<(), MonitoringError> {
        let url = format!("{}/projects/{}/timeSeries", self.base_url, project_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.tokens.token()?)
            .json(&CreateTimeSeriesBody {
                time_series: series,
            })
            .send()
            .map_err(MonitoringError::RequestFailed)?;
        Self::check(response).map(|_| ())
    }
}

/// In-memory backend recording every call.
///
/// Descriptors live in `descriptors` keyed by type. Writes are recorded
/// per call, and the write whose zero based index equals `fail_write`
/// is rejected.
#[cfg(test)]
pub(crate) struct DummyMetricsBackend {
    pub descriptors: Rc<RefCell<Vec<MetricDescriptor>>>,
    pub lookups: Rc<RefCell<usize>>,
    pub creates: Rc<RefCell<usize>>,
    pub writes: Rc<RefCell<Vec<Vec<TimeSeries>>>>,
    pub lookup_status: Option<u16>,
    pub create_status: Option<u16>,
    pub fail_write: Option<usize>,
}

#[cfg(test)]
impl DummyMetricsBackend {
    pub fn new() -> Self {
        DummyMetricsBackend {
            descriptors: Rc::new(RefCell::new(Vec::new())),
            lookups: Rc::new(RefCell::new(0)),
            creates: Rc::new(RefCell::new(0)),
            writes: Rc::new(RefCell::new(Vec::new())),
            lookup_status: None,
            create_status: None,
            fail_write: None,
        }
    }

    pub fn total_calls(&self) -> usize {
        *self.lookups.borrow() + *self.creates.borrow() + self.writes.borrow().len()
    }
}

#[cfg(test)]
impl MetricsBackend for DummyMetricsBackend {
    fn get_metric_descriptor(
        &self,
        _project_id: &str,
        metric_type: &str,
    ) -> Result<MetricDescriptor, MonitoringError> {
        *self.lookups.borrow_mut() += 1;
        if let Some(status) = self.lookup_status {
            return Err(MonitoringError::Api {
                status,
                message: "lookup rejected".to_string(),
            });
        }
        self.descriptors
            .borrow()
            .iter()
            .find(|descriptor| descriptor.metric_type == metric_type)
            .cloned()
            .ok_or_else(|| MonitoringError::Api {
                status: 404,
                message: format!("Could not find descriptor for metric '{}'", metric_type),
            })
    }

    fn create_metric_descriptor(
        &self,
        _project_id: &str,
        descriptor: &MetricDescriptor,
    ) -> Result<(), MonitoringError> {
        *self.creates.borrow_mut() += 1;
        if let Some(status) = self.create_status {
            return Err(MonitoringError::Api {
                status,
                message: "Descriptor already exists".to_string(),
            });
        }
        self.descriptors.borrow_mut().push(descriptor.clone());
        Ok(())
    }

    fn create_time_series(
        &self,
        _project_id: &str,
        series: &[TimeSeries],
    ) -> Result<(), MonitoringError> {
        let index = self.writes.borrow().len();
        if self.fail_write == Some(index) {
            // Rejected calls are still counted so callers can assert on them.
            self.writes.borrow_mut().push(Vec::new());
            return Err(MonitoringError::Api {
                status: 400,
                message: "One or more TimeSeries could not be written".to_string(),
            });
        }
        self.writes.borrow_mut().push(series.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CreateTimeSeriesBody, LabelDescriptor, Metric, MetricDescriptor, MetricKind,
        MonitoredResource, MonitoringError, Point, TimeInterval, TimeSeries, TypedValue,
        ValueType,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_not_found() {
        let not_found = MonitoringError::Api {
            status: 404,
            message: "missing".to_string(),
        };
        let denied = MonitoringError::Api {
            status: 403,
            message: "denied".to_string(),
        };
        assert!(not_found.is_not_found());
        assert!(!denied.is_not_found());
    }

    #[test]
    fn test_descriptor_format() {
        let descriptor = MetricDescriptor {
            name: None,
            metric_type: "custom.googleapis.com/billing/bigquery/daily_cost".to_string(),
            metric_kind: MetricKind::Gauge,
            value_type: ValueType::Double,
            labels: vec![LabelDescriptor {
                key: "project_id".to_string(),
                value_type: ValueType::String,
                description: "GCP Project ID".to_string(),
            }],
            unit: "USD".to_string(),
            description: "Daily BigQuery cost per project in USD".to_string(),
            display_name: "BigQuery Daily Cost".to_string(),
        };

        assert_eq!(
            serde_json::to_value(&descriptor).unwrap(),
            json!({
                "type": "custom.googleapis.com/billing/bigquery/daily_cost",
                "metricKind": "GAUGE",
                "valueType": "DOUBLE",
                "labels": [
                    {"key": "project_id", "valueType": "STRING", "description": "GCP Project ID"}
                ],
                "unit": "USD",
                "description": "Daily BigQuery cost per project in USD",
                "displayName": "BigQuery Daily Cost"
            })
        );
    }

    #[test]
    fn test_read_back_descriptor() {
        let descriptor: MetricDescriptor = serde_json::from_value(json!({
            "name": "projects/acme-ops/metricDescriptors/custom.googleapis.com/billing/bigquery/daily_cost",
            "type": "custom.googleapis.com/billing/bigquery/daily_cost",
            "labels": [{"key": "project_id"}],
            "metricKind": "GAUGE",
            "valueType": "DOUBLE",
            "monitoredResourceTypes": ["global"]
        }))
        .unwrap();

        assert!(descriptor.name.is_some());
        assert_eq!(descriptor.labels[0].value_type, ValueType::String);
        assert_eq!(descriptor.display_name, "");
    }

    #[test]
    fn test_time_series_format() {
        let series = TimeSeries {
            metric: Metric {
                metric_type: "custom.googleapis.com/billing/bigquery/daily_cost".to_string(),
                labels: BTreeMap::from([("project_id".to_string(), "acme-web".to_string())]),
            },
            resource: MonitoredResource {
                resource_type: "global".to_string(),
                labels: BTreeMap::new(),
            },
            metric_kind: MetricKind::Gauge,
            value_type: ValueType::Double,
            points: vec![Point {
                interval: TimeInterval {
                    end_time: Utc.with_ymd_and_hms(2023, 10, 8, 0, 0, 0).unwrap(),
                },
                value: TypedValue { double_value: 12.5 },
            }],
        };
        assert_eq!(series.label("project_id"), Some("acme-web"));

        let batch = [series];
        assert_eq!(
            serde_json::to_value(CreateTimeSeriesBody { time_series: &batch }).unwrap(),
            json!({
                "timeSeries": [{
                    "metric": {
                        "type": "custom.googleapis.com/billing/bigquery/daily_cost",
                        "labels": {"project_id": "acme-web"}
                    },
                    "resource": {"type": "global"},
                    "metricKind": "GAUGE",
                    "valueType": "DOUBLE",
                    "points": [{
                        "interval": {"endTime": "2023-10-08T00:00:00Z"},
                        "value": {"doubleValue": 12.5}
                    }]
                }]
            })
        );
    }
}
