//! CI platform client for short-lived runner tokens.
//!
//! The long-lived token read from the pool's secret is exchanged for a
//! registration token when runners start and a removal token when the pool
//! is deleted. Neither short-lived token is stored anywhere.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Short-lived token returned by the platform
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunnerToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("token exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("missing credential: {0}")]
    MissingCredential(String),
}

impl RunnerApiError {
    /// Exchanges are always retried; a rejected credential may be rotated in
    /// the referenced secret without any change to the pool.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        true
    }

    /// HTTP status reported by the platform, if it answered at all
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Timeout(_) | Self::MissingCredential(_) => None,
        }
    }
}

/// Token exchanges against the CI platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunnerRegistry: Send + Sync {
    /// Exchange `token` for a registration token scoped to `repository`
    async fn registration_token(
        &self,
        api_url: &str,
        repository: &str,
        token: &str,
    ) -> Result<RunnerToken, RunnerApiError>;

    /// Exchange `token` for a removal token scoped to `repository`
    async fn removal_token(
        &self,
        api_url: &str,
        repository: &str,
        token: &str,
    ) -> Result<RunnerToken, RunnerApiError>;
}

/// `reqwest` implementation of [`RunnerRegistry`]
#[derive(Debug, Clone)]
pub struct GithubRunnerApi {
    client: reqwest::Client,
}

impl GithubRunnerApi {
    pub fn new(timeout: Duration) -> Result<Self, RunnerApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("kindling-controller"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    async fn exchange(
        &self,
        api_url: &str,
        repository: &str,
        token: &str,
        endpoint: &str,
    ) -> Result<RunnerToken, RunnerApiError> {
        let url = format!(
            "{}/repos/{repository}/actions/runners/{endpoint}",
            api_url.trim_end_matches('/')
        );
        debug!(%url, "Exchanging runner token");

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerApiError::Status { status, body });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl RunnerRegistry for GithubRunnerApi {
    async fn registration_token(
        &self,
        api_url: &str,
        repository: &str,
        token: &str,
    ) -> Result<RunnerToken, RunnerApiError> {
        self.exchange(api_url, repository, token, "registration-token")
            .await
    }

    async fn removal_token(
        &self,
        api_url: &str,
        repository: &str,
        token: &str,
    ) -> Result<RunnerToken, RunnerApiError> {
        self.exchange(api_url, repository, token, "remove-token").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api() -> GithubRunnerApi {
        GithubRunnerApi::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn registration_token_is_exchanged_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octocat/hello/actions/runners/registration-token"))
            .and(header("authorization", "Bearer long-lived"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "REG123",
                "expires_at": "2026-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = api()
            .registration_token(&server.uri(), "octocat/hello", "long-lived")
            .await
            .unwrap();
        assert_eq!(token.token, "REG123");
        assert_eq!(token.expires_at.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn removal_token_uses_its_own_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octocat/hello/actions/runners/remove-token"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"token": "RM1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let token = api()
            .removal_token(&format!("{}/", server.uri()), "octocat/hello", "t")
            .await
            .unwrap();
        assert_eq!(token.token, "RM1");
        assert!(token.expires_at.is_none());
    }

    #[tokio::test]
    async fn rejected_credential_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
            .mount(&server)
            .await;

        let err = api()
            .registration_token(&server.uri(), "octocat/hello", "wrong")
            .await
            .unwrap_err();
        match &err {
            RunnerApiError::Status { status, body } => {
                assert_eq!(*status, 401);
                assert_eq!(body, "Bad credentials");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.status(), Some(401));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = api()
            .removal_token(&server.uri(), "octocat/hello", "t")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn slow_platform_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"token": "late"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = GithubRunnerApi::new(Duration::from_millis(200)).unwrap();
        let err = client
            .registration_token(&server.uri(), "octocat/hello", "t")
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerApiError::Http(_)));
        assert!(err.is_transient());
    }
}
