//! This module abstracts the data warehouse holding the billing
//! export so that the aggregation logic does not depend on the
//! BigQuery REST API directly.
//!
//! It also simplifies unit tests.

use crate::api::read_failure;
use crate::auth::{AuthError, TokenSource};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
#[cfg(test)]
use std::cell::RefCell;
#[cfg(test)]
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, Level};

static BIGQUERY_API_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// How long BigQuery holds a `jobs.query` or `getQueryResults` call
/// open waiting for the job to complete.
const SERVER_WAIT_MS: u64 = 10_000;

/// Errors raised while running a query.
#[derive(Error, Debug)]
pub enum BillingError {
    #[error("failed to authenticate against BigQuery")]
    Auth(#[from] AuthError),

    #[error("failed to send BigQuery request")]
    RequestFailed(#[source] reqwest::Error),

    #[error("BigQuery returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("BigQuery job failed: {0}")]
    JobFailed(String),

    /// A row did not have the shape the query promises.
    #[error("malformed result row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParameterType {
    Timestamp,
    String,
}

/// A named query parameter. Values are sent in their string form.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    pub name: String,
    pub kind: ParameterType,
    pub value: String,
}

impl QueryParameter {
    pub fn new(name: &str, kind: ParameterType, value: impl Into<String>) -> Self {
        QueryParameter {
            name: name.to_string(),
            kind,
            value: value.into(),
        }
    }
}

/// A standard SQL statement and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Project the query job is billed to and runs in.
    pub project_id: String,
    pub sql: String,
    pub parameters: Vec<QueryParameter>,
}

/// One result row. Cells are in select-list order; `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// A data source able to run a parameterized query.
pub trait BillingSource {
    fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, BillingError>;
}

impl<T: BillingSource + ?Sized> BillingSource for &T {
    fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, BillingError> {
        (**self).query(request)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<ParameterBody<'a>>,
    timeout_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ParameterBody<'a> {
    name: &'a str,
    parameter_type: ParameterTypeBody,
    parameter_value: ParameterValueBody<'a>,
}

#[derive(Serialize)]
struct ParameterTypeBody {
    #[serde(rename = "type")]
    kind: ParameterType,
}

#[derive(Serialize)]
struct ParameterValueBody<'a> {
    value: &'a str,
}

impl<'a> QueryBody<'a> {
    fn new(request: &'a QueryRequest) -> Self {
        QueryBody {
            query: &request.sql,
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: request
                .parameters
                .iter()
                .map(|parameter| ParameterBody {
                    name: &parameter.name,
                    parameter_type: ParameterTypeBody {
                        kind: parameter.kind,
                    },
                    parameter_value: ParameterValueBody {
                        value: &parameter.value,
                    },
                })
                .collect(),
            timeout_ms: SERVER_WAIT_MS,
        }
    }
}

/// Response of `jobs.query` and `jobs.getQueryResults`.
///
/// # Example
///
/// ```json
/// {
///   "jobReference": {"projectId": "acme-ops", "jobId": "job_x1", "location": "US"},
///   "jobComplete": true,
///   "rows": [{"f": [{"v": "acme-web"}, {"v": "12.5"}]}],
///   "pageToken": "BFX2..."
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    rows: Vec<RowBody>,
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RowBody {
    f: Vec<CellBody>,
}

#[derive(Debug, Deserialize)]
struct CellBody {
    v: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    message: String,
}

impl QueryResponse {
    /// Entries in `errors` do not mean the job failed, a failed job
    /// comes back with an error status. They are logged and the rows
    /// are kept.
    fn log_errors(&self) {
        for error in &self.errors {
            event!(Level::WARN, "BigQuery reported: {}", error.message);
        }
    }

    fn take_rows(&mut self) -> impl Iterator<Item = Row> {
        std::mem::take(&mut self.rows)
            .into_iter()
            .map(|row| row.f.into_iter().map(|cell| cell.v).collect())
    }
}

/// Runs queries through the BigQuery v2 REST API.
pub struct BigQueryClient {
    http: Client,
    tokens: Arc<dyn TokenSource + Send + Sync>,
    base_url: String,
}

impl BigQueryClient {
    pub fn new(http: Client, tokens: Arc<dyn TokenSource + Send + Sync>) -> Self {
        BigQueryClient {
            http,
            tokens,
            base_url: BIGQUERY_API_URL.to_string(),
        }
    }

    fn start_query(&self, request: &QueryRequest) -> Result<QueryResponse, BillingError> {
        let url = format!("{}/projects/{}/queries", self.base_url, request.project_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.tokens.token()?)
            .json(&QueryBody::new(request))
            .send()
            .map_err(BillingError::RequestFailed)?;
        parse_response(response)
    }

    fn get_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, BillingError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.base_url, job.project_id, job.job_id
        );
        let mut params = vec![("timeoutMs", SERVER_WAIT_MS.to_string())];
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response = self
            .http
            .get(&url)
            .query(&params)
            .bearer_auth(self.tokens.token()?)
            .send()
            .map_err(BillingError::RequestFailed)?;
        parse_response(response)
    }
}

fn parse_response(response: reqwest::blocking::Response) -> Result<QueryResponse, BillingError> {
    if !response.status().is_success() {
        let (status, message) = read_failure(response);
        return Err(BillingError::Api { status, message });
    }
    response.json().map_err(BillingError::RequestFailed)
}

/// Follows a query until its job is complete and every result page is
/// read. `fetch` asks for the next response of a job, starting at the
/// given page token.
fn collect_rows<F>(first: QueryResponse, mut fetch: F) -> Result<Vec<Row>, BillingError>
where
    F: FnMut(&JobReference, Option<&str>) -> Result<QueryResponse, BillingError>,
{
    let mut response = first;
    let mut rows = Vec::new();

    loop {
        response.log_errors();
        if response.job_complete {
            rows.extend(response.take_rows());
            if response.page_token.is_none() {
                return Ok(rows);
            }
        }

        let job = response.job_reference.clone().ok_or_else(|| {
            BillingError::JobFailed("response carries no job reference".to_string())
        })?;
        if !response.job_complete {
            event!(Level::DEBUG, "Waiting for BigQuery job {}", job.job_id);
        }
        response = fetch(&job, response.page_token.as_deref())?;
    }
}

impl BillingSource for BigQueryClient {
    /// Runs the query to completion and returns every row of every
    /// result page.
    fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, BillingError> {
        let first = self.start_query(request)?;
        collect_rows(first, |job, page_token| self.get_results(job, page_token))
    }
}

#[cfg(test)]
pub(crate) struct DummyBillingSource {
    pub rows: Vec<Row>,
    pub fail: bool,
    pub queries: Rc<RefCell<Vec<QueryRequest>>>,
}

#[cfg(test)]
impl DummyBillingSource {
    pub fn with_costs(costs: &[(&str, f64)]) -> Self {
        DummyBillingSource {
            rows: costs
                .iter()
                .map(|(project, cost)| vec![Some(project.to_string()), Some(cost.to_string())])
                .collect(),
            fail: false,
            queries: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

#[cfg(test)]
impl BillingSource for DummyBillingSource {
    fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, BillingError> {
        self.queries.borrow_mut().push(request.clone());
        if self.fail {
            return Err(BillingError::Api {
                status: 403,
                message: "Access Denied: Table acme:billing.export".to_string(),
            });
        }
        Ok(self.rows.clone())
    }
}
