//! OAuth access tokens for the Google APIs.
//!
//! On Cloud Run the token comes from the metadata server of the
//! instance. For local runs a token can be passed in directly, e.g.
//! the output of `gcloud auth print-access-token`.

use crate::api::read_failure;
use chrono::{DateTime, Duration, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{event, Level};

static METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";

/// Tokens are refreshed this long before the metadata server says
/// they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Errors raised while obtaining an access token.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The metadata server could not be reached.
    #[error("failed to request access token from the metadata server")]
    RequestFailed(#[source] reqwest::Error),

    /// The metadata server answered with an error.
    #[error("metadata server returned {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Anything able to hand out a bearer token for the Google APIs.
pub trait TokenSource {
    fn token(&self) -> Result<String, AuthError>;
}

/// A fixed token, supplied through configuration.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        StaticToken(token.into())
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

/// Response of the metadata server token endpoint.
///
/// ```json
/// {"access_token": "ya29.c.b0Aaek...", "expires_in": 3599, "token_type": "Bearer"}
/// ```
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

impl CachedToken {
    fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        let lifetime = (response.expires_in - EXPIRY_MARGIN_SECS).max(0);
        CachedToken {
            value: response.access_token,
            refresh_at: now + Duration::seconds(lifetime),
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.refresh_at
    }
}

/// Fetches tokens for the default service account of the instance
/// and caches them until shortly before they expire.
pub struct MetadataServer {
    client: Client,
    url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServer {
    pub fn new(client: Client) -> Self {
        MetadataServer {
            client,
            url: METADATA_TOKEN_URL.to_string(),
            cached: Mutex::new(None),
        }
    }

    fn fetch(&self) -> Result<TokenResponse, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .header(METADATA_FLAVOR_HEADER, "Google")
            .send()
            .map_err(AuthError::RequestFailed)?;

        if !response.status().is_success() {
            let (status, message) = read_failure(response);
            return Err(AuthError::Rejected { status, message });
        }

        response.json().map_err(AuthError::RequestFailed)
    }
}

impl TokenSource for MetadataServer {
    fn token(&self) -> Result<String, AuthError> {
        let now = Utc::now();
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh(now)) {
            return Ok(token.value.clone());
        }

        let token = CachedToken::from_response(self.fetch()?, now);
        event!(Level::DEBUG, "Refreshed access token, valid until {}", token.refresh_at);
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{CachedToken, StaticToken, TokenResponse, TokenSource};
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_static_token() {
        let source = StaticToken::new("secret");
        assert_eq!(source.token().unwrap(), "secret");
        assert_eq!(source.token().unwrap(), "secret");
    }

    #[test]
    fn test_cached_token_refreshes_before_expiry() {
        let now = Utc.with_ymd_and_hms(2023, 10, 8, 22, 15, 0).unwrap();
        let token = CachedToken::from_response(
            TokenResponse {
                access_token: "ya29.token".to_string(),
                expires_in: 3599,
            },
            now,
        );
        assert_eq!(token.value, "ya29.token");
        assert!(token.is_fresh(now));
        assert!(token.is_fresh(now + Duration::seconds(3538)));
        assert!(!token.is_fresh(now + Duration::seconds(3539)));
    }

    #[test]
    fn test_short_lived_token_is_never_fresh() {
        let now = Utc.with_ymd_and_hms(2023, 10, 8, 22, 15, 0).unwrap();
        let token = CachedToken::from_response(
            TokenResponse {
                access_token: "ya29.token".to_string(),
                expires_in: 30,
            },
            now,
        );
        assert!(!token.is_fresh(now));
    }

    #[test]
    fn test_token_response_format() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token": "ya29.abc", "expires_in": 3599, "token_type": "Bearer"}"#,
        )
        .unwrap();
        assert_eq!(response.access_token, "ya29.abc");
        assert_eq!(response.expires_in, 3599);
    }
}
