//! Plumbing shared by the BigQuery and Cloud Monitoring clients.

use reqwest::blocking::{Client, ClientBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

static USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Builds the HTTP client shared by every outbound call of the process.
///
/// The client keeps a connection pool, so it should be created once at
/// startup and cloned into the API clients.
pub fn build_http_client(request_timeout: Duration) -> Result<Client, reqwest::Error> {
    ClientBuilder::new()
        .timeout(request_timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Error envelope returned by Google REST APIs.
///
/// ```json
/// {"error": {"code": 404, "message": "Could not find descriptor", "status": "NOT_FOUND"}}
/// ```
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Consumes a non-success response and returns its status and a
/// human readable message.
pub(crate) fn read_failure(response: Response) -> (u16, String) {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    (status.as_u16(), failure_message(status, &body))
}

fn failure_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.message.is_empty() => envelope.error.message,
        _ if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
        _ => body.trim().to_string(),
    }
}
