//! Conversion of aggregated cost rows into gauge time series.

use crate::aggregator::CostRow;
use crate::descriptor::PROJECT_LABEL;
use crate::monitoring::{
    Metric, MetricKind, MonitoredResource, Point, TimeInterval, TimeSeries, TypedValue, ValueType,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

static GLOBAL_RESOURCE: &str = "global";

/// Builds one single-point series per row, in row order.
///
/// Every point is stamped with `timestamp`, the end of the reported
/// window, so that re-running a day overwrites its points instead of
/// adding new ones.
pub fn build_series(metric_type: &str, rows: &[CostRow], timestamp: DateTime<Utc>) -> Vec<TimeSeries> {
    rows.iter()
        .map(|row| cost_series(metric_type, row, timestamp))
        .collect()
}

fn cost_series(metric_type: &str, row: &CostRow, timestamp: DateTime<Utc>) -> TimeSeries {
    TimeSeries {
        metric: Metric {
            metric_type: metric_type.to_string(),
            labels: BTreeMap::from([(PROJECT_LABEL.to_string(), row.project_id.clone())]),
        },
        resource: MonitoredResource {
            resource_type: GLOBAL_RESOURCE.to_string(),
            labels: BTreeMap::new(),
        },
        metric_kind: MetricKind::Gauge,
        value_type: ValueType::Double,
        points: vec![Point {
            interval: TimeInterval { end_time: timestamp },
            value: TypedValue {
                double_value: row.daily_cost,
            },
        }],
    }
}
