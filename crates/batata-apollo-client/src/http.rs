//! HTTP fetcher with a bounded retry budget
//!
//! One `GET` per attempt, classified into a body, a not-modified marker, or an error.
//! Transport errors and unexpected statuses are retried against the same URL;
//! `401` is returned at once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::auth::AuthHook;
use crate::error::{ClientError, Result};

/// Successful outcome of a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// `200` with the response body
    Body(String),
    /// `304`, the caller's version is current
    NotModified,
}

/// GET-with-retry used for config, notification and discovery requests.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    backoff: Duration,
    auth_hook: Option<Arc<dyn AuthHook>>,
}

impl Fetcher {
    /// Create a fetcher sleeping `backoff` between attempts
    pub fn new(backoff: Duration) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| ClientError::Other(e.into()))?;

        Ok(Self {
            client,
            backoff,
            auth_hook: None,
        })
    }

    /// Attach a signing hook consulted before each request
    pub fn with_auth_hook(mut self, hook: Arc<dyn AuthHook>) -> Self {
        self.auth_hook = Some(hook);
        self
    }

    /// Fetch `url`, retrying up to `max_attempts` times.
    pub async fn fetch(&self, url: &Url, timeout: Duration, max_attempts: u32) -> Result<Fetched> {
        let attempts = max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.fetch_once(url, timeout).await {
                Ok(fetched) => return Ok(fetched),
                Err(e @ ClientError::Unauthorized { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        "Request to {} failed (attempt {}/{}): {}",
                        url, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < attempts && !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
        }

        Err(ClientError::ExhaustedRetries {
            url: url.to_string(),
            attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| ClientError::TransientNetwork("no attempt".into())),
            ),
        })
    }

    async fn fetch_once(&self, url: &Url, timeout: Duration) -> Result<Fetched> {
        let mut request = self.client.get(url.clone()).timeout(timeout);

        if let Some(hook) = &self.auth_hook {
            for (name, value) in hook.headers(url) {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::TransientNetwork(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| ClientError::TransientNetwork(e.to_string()))?;
                debug!("GET {} -> 200 ({} bytes)", url, body.len());
                Ok(Fetched::Body(body))
            }
            StatusCode::NOT_MODIFIED => {
                debug!("GET {} -> 304", url);
                Ok(Fetched::NotModified)
            }
            StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized {
                url: url.to_string(),
            }),
            status => Err(ClientError::TransientNetwork(format!(
                "unexpected status {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::ZERO).unwrap();
        let fetched = fetcher
            .fetch(&url(&server, "/ok"), Duration::from_secs(1), 3)
            .await
            .unwrap();
        assert_eq!(fetched, Fetched::Body("hello".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/same"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::ZERO).unwrap();
        let fetched = fetcher
            .fetch(&url(&server, "/same"), Duration::from_secs(1), 3)
            .await
            .unwrap();
        assert_eq!(fetched, Fetched::NotModified);
    }

    #[tokio::test]
    async fn test_fetch_unauthorized_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secret"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::ZERO).unwrap();
        let err = fetcher
            .fetch(&url(&server, "/secret"), Duration::from_secs(1), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_fetch_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::from_millis(1)).unwrap();
        let err = fetcher
            .fetch(&url(&server, "/broken"), Duration::from_secs(1), 3)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::ExhaustedRetries { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_fetch_recovers_after_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::ZERO).unwrap();
        let fetched = fetcher
            .fetch(&url(&server, "/flaky"), Duration::from_secs(1), 5)
            .await
            .unwrap();
        assert_eq!(fetched, Fetched::Body("ok".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_applies_auth_hook() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/signed"))
            .and(header_exists("Authorization"))
            .and(header_exists("Timestamp"))
            .respond_with(ResponseTemplate::new(200).set_body_string("signed"))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::ZERO)
            .unwrap()
            .with_auth_hook(Arc::new(crate::auth::HmacAuthHook::new("app", "key")));
        let fetched = fetcher
            .fetch(&url(&server, "/signed"), Duration::from_secs(1), 1)
            .await
            .unwrap();
        assert_eq!(fetched, Fetched::Body("signed".to_string()));
    }
}
