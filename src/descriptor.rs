//! Provisioning of the custom metric descriptor.
//!
//! The descriptor is created on first use. Two overlapping runs may
//! both try to create it, so a failed creation is never fatal: the
//! state that matters, a descriptor being present, is reached either
//! way.

use crate::monitoring::{
    LabelDescriptor, MetricDescriptor, MetricKind, MetricsBackend, MonitoringError, ValueType,
};
use tracing::{event, Level};

pub static PROJECT_LABEL: &str = "project_id";

/// Outcome of looking up a descriptor.
///
/// A lookup can fail for reasons other than absence (permissions,
/// network). That case is kept apart from `Absent` so that it can be
/// logged, even though both lead to a creation attempt.
#[derive(Debug)]
pub enum DescriptorLookup {
    Exists,
    Absent,
    LookupFailed(MonitoringError),
}

/// Outcome of `ensure_descriptor`. None of them is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// The descriptor was already there.
    Existing,
    /// The descriptor was created by this call.
    Created,
    /// Creation failed. Usually another run created it first.
    Unconfirmed(String),
}

/// Builds the descriptor of the daily cost gauge for a service.
pub fn cost_descriptor(metric_type: &str, service_description: &str) -> MetricDescriptor {
    MetricDescriptor {
        name: None,
        metric_type: metric_type.to_string(),
        metric_kind: MetricKind::Gauge,
        value_type: ValueType::Double,
        labels: vec![LabelDescriptor {
            key: PROJECT_LABEL.to_string(),
            value_type: ValueType::String,
            description: "GCP Project ID".to_string(),
        }],
        unit: "USD".to_string(),
        description: format!("Daily {} cost per project in USD", service_description),
        display_name: format!("{} Daily Cost", service_description),
    }
}

pub fn lookup_descriptor<M: MetricsBackend + ?Sized>(
    backend: &M,
    project_id: &str,
    metric_type: &str,
) -> DescriptorLookup {
    match backend.get_metric_descriptor(project_id, metric_type) {
        Ok(_) => DescriptorLookup::Exists,
        Err(err) if err.is_not_found() => DescriptorLookup::Absent,
        Err(err) => DescriptorLookup::LookupFailed(err),
    }
}

/// Makes sure `descriptor` exists in the metrics namespace of
/// `project_id`, creating it when the lookup does not find it.
pub fn ensure_descriptor<M: MetricsBackend + ?Sized>(
    backend: &M,
    project_id: &str,
    descriptor: &MetricDescriptor,
) -> Provisioned {
    let metric_type = descriptor.metric_type.as_str();
    match lookup_descriptor(backend, project_id, metric_type) {
        DescriptorLookup::Exists => {
            event!(Level::INFO, "Metric descriptor {} already exists.", metric_type);
            return Provisioned::Existing;
        }
        DescriptorLookup::Absent => {
            event!(Level::INFO, "Metric descriptor {} not found. Creating...", metric_type);
        }
        DescriptorLookup::LookupFailed(err) => {
            event!(
                Level::WARN,
                "Lookup of metric descriptor {} failed ({}). Attempting creation anyway.",
                metric_type,
                err
            );
        }
    }

    match backend.create_metric_descriptor(project_id, descriptor) {
        Ok(()) => {
            event!(Level::INFO, "Created metric descriptor: {}", metric_type);
            Provisioned::Created
        }
        Err(err) => {
            event!(
                Level::WARN,
                "Failed to create metric descriptor (may already exist): {}",
                err
            );
            Provisioned::Unconfirmed(err.to_string())
        }
    }
}
