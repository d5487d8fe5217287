//! This module contains the query that aggregates one day of billing
//! export records into a cost per project.
//!
//! The aggregation runs inside the data warehouse. Only the window
//! bounds and the service filter vary between runs and both are bound
//! parameters.

use crate::billing::{BillingError, BillingSource, ParameterType, QueryParameter, QueryRequest, Row};
use crate::window::TimeWindow;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{event, Level};

/// Cost of the reported service for one project over one window, in
/// USD. Rows come out of the query with a strictly positive cost.
#[derive(Clone, Debug, PartialEq)]
pub struct CostRow {
    pub project_id: String,
    pub daily_cost: f64,
}

/// Builds the aggregation statement for a billing export table.
///
/// The table is the only interpolated value and must be validated by
/// the caller. `cost > 0` drops credits before summing and the HAVING
/// clause drops projects whose adjustments cancel the charges out.
pub fn aggregation_query(billing_table: &str) -> String {
    format!(
        "SELECT
    project.id AS project_id,
    SUM(cost) AS daily_cost
FROM
    `{}`
WHERE
    service.description = @service_description
    AND usage_start_time >= @start_time
    AND usage_start_time < @end_time
    AND cost > 0
GROUP BY
    project_id
HAVING
    daily_cost > 0",
        billing_table
    )
}

pub struct CostAggregator<'a, B: ?Sized> {
    source: &'a B,
    query_project: &'a str,
    billing_table: &'a str,
    service_description: &'a str,
}

impl<'a, B: BillingSource + ?Sized> CostAggregator<'a, B> {
    pub fn new(
        source: &'a B,
        query_project: &'a str,
        billing_table: &'a str,
        service_description: &'a str,
    ) -> Self {
        CostAggregator {
            source,
            query_project,
            billing_table,
            service_description,
        }
    }

    /// Builds the query request for a window.
    pub fn request(&self, window: &TimeWindow) -> QueryRequest {
        let timestamp = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Micros, true);
        QueryRequest {
            project_id: self.query_project.to_string(),
            sql: aggregation_query(self.billing_table),
            parameters: vec![
                QueryParameter::new("start_time", ParameterType::Timestamp, timestamp(&window.start)),
                QueryParameter::new("end_time", ParameterType::Timestamp, timestamp(&window.end)),
                QueryParameter::new(
                    "service_description",
                    ParameterType::String,
                    self.service_description,
                ),
            ],
        }
    }

    /// Returns the cost per project for the window. No qualifying
    /// usage yields an empty vector.
    pub fn fetch_costs(&self, window: &TimeWindow) -> Result<Vec<CostRow>, BillingError> {
        event!(
            Level::INFO,
            "Querying {} billing data from {} to {}",
            self.service_description,
            window.start.to_rfc3339(),
            window.end.to_rfc3339()
        );

        let rows = self.source.query(&self.request(window))?;
        let mut costs = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            if let Some(cost) = parse_row(index, row)? {
                event!(
                    Level::INFO,
                    "Project: {}, Cost: ${:.2}",
                    cost.project_id,
                    cost.daily_cost
                );
                costs.push(cost);
            }
        }
        Ok(costs)
    }
}

/// Converts a result row into a `CostRow`.
///
/// Charges not attributed to a project come back with a NULL project
/// id. They cannot be labelled, so they are logged and skipped.
fn parse_row(index: usize, row: Row) -> Result<Option<CostRow>, BillingError> {
    let malformed = |reason: String| BillingError::MalformedRow { row: index, reason };

    let mut cells = row.into_iter();
    let project_id = cells.next().ok_or_else(|| malformed("missing project_id column".to_string()))?;
    let daily_cost = cells
        .next()
        .flatten()
        .ok_or_else(|| malformed("missing daily_cost value".to_string()))?;
    let daily_cost: f64 = daily_cost
        .parse()
        .map_err(|_| malformed(format!("daily_cost {:?} is not a number", daily_cost)))?;

    match project_id.filter(|id| !id.trim().is_empty()) {
        Some(project_id) => Ok(Some(CostRow {
            project_id,
            daily_cost,
        })),
        None => {
            event!(
                Level::WARN,
                "Skipping ${:.2} of cost without a project id",
                daily_cost
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{aggregation_query, CostAggregator, CostRow};
    use crate::billing::{BillingError, DummyBillingSource, ParameterType, QueryParameter};
    use crate::window::TimeWindow;
    use chrono::{TimeZone, Utc};

    fn window() -> TimeWindow {
        TimeWindow::previous_day(Utc.with_ymd_and_hms(2023, 10, 8, 6, 30, 0).unwrap())
    }

    #[test]
    fn test_query_binds_parameters() {
        let source = DummyBillingSource::with_costs(&[]);
        let aggregator = CostAggregator::new(&source, "acme-ops", "acme.billing.export_v1_*", "BigQuery");

        let rows = aggregator.fetch_costs(&window()).unwrap();
        assert!(rows.is_empty());

        let queries = source.queries.borrow();
        assert_eq!(queries.len(), 1);
        let query = &queries[0];
        assert_eq!(query.project_id, "acme-ops");
        assert!(query.sql.contains("FROM\n    `acme.billing.export_v1_*`"));
        assert!(query.sql.contains("service.description = @service_description"));
        assert!(query.sql.contains("HAVING\n    daily_cost > 0"));
        assert!(!query.sql.contains("2023-10"));
        assert!(!query.sql.contains("'BigQuery'"));
        assert_eq!(
            query.parameters,
            vec![
                QueryParameter::new("start_time", ParameterType::Timestamp, "2023-10-07T00:00:00.000000Z"),
                QueryParameter::new("end_time", ParameterType::Timestamp, "2023-10-08T00:00:00.000000Z"),
                QueryParameter::new("service_description", ParameterType::String, "BigQuery"),
            ]
        );
    }

    #[test]
    fn test_rows_are_parsed_in_order() {
        let source = DummyBillingSource::with_costs(&[("proj-a", 12.5), ("proj-b", 3.25)]);
        let aggregator = CostAggregator::new(&source, "acme-ops", "acme.billing.export", "BigQuery");

        assert_eq!(
            aggregator.fetch_costs(&window()).unwrap(),
            vec![
                CostRow {
                    project_id: "proj-a".to_string(),
                    daily_cost: 12.5
                },
                CostRow {
                    project_id: "proj-b".to_string(),
                    daily_cost: 3.25
                },
            ]
        );
    }

    #[test]
    fn test_rows_without_project_are_skipped() {
        let mut source = DummyBillingSource::with_costs(&[("proj-a", 1.0)]);
        source.rows.push(vec![None, Some("4.2".to_string())]);
        source.rows.push(vec![Some(String::new()), Some("0.5".to_string())]);
        let aggregator = CostAggregator::new(&source, "acme-ops", "acme.billing.export", "BigQuery");

        let rows = aggregator.fetch_costs(&window()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].project_id, "proj-a");
    }

    #[test]
    fn test_malformed_cost() {
        let mut source = DummyBillingSource::with_costs(&[]);
        source.rows.push(vec![Some("proj-a".to_string()), Some("a lot".to_string())]);
        let aggregator = CostAggregator::new(&source, "acme-ops", "acme.billing.export", "BigQuery");

        match aggregator.fetch_costs(&window()) {
            Err(BillingError::MalformedRow { row, .. }) => assert_eq!(row, 0),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_query_failure_propagates() {
        let mut source = DummyBillingSource::with_costs(&[("proj-a", 1.0)]);
        source.fail = true;
        let aggregator = CostAggregator::new(&source, "acme-ops", "acme.billing.export", "BigQuery");

        assert!(matches!(
            aggregator.fetch_costs(&window()),
            Err(BillingError::Api { status: 403, .. })
        ));
    }

    #[test]
    fn test_query_text() {
        let query = aggregation_query("acme.billing.export");
        assert!(query.starts_with("SELECT\n    project.id AS project_id,\n    SUM(cost) AS daily_cost"));
        assert!(query.contains("AND usage_start_time >= @start_time"));
        assert!(query.contains("AND usage_start_time < @end_time"));
        assert!(query.contains("AND cost > 0"));
    }
}
