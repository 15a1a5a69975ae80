use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;

/// Whether a failed call to the mapping endpoint is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// Throttling, request timeouts and transient gateway/server failures retry.
    /// Server errors that will not change on repeat (501, 505, 511...) do not.
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_EARLY
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Self::Retryable,
            _ => Self::NonRetryable,
        }
    }

    /// Connection failures, timeouts and bodies cut off mid-read retry. Undecodable
    /// responses and bad requests do not.
    pub fn for_transport(err: &reqwest::Error) -> Self {
        if err.is_builder() || err.is_decode() || err.is_redirect() {
            Self::NonRetryable
        } else if err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Oracle retries: at most `max_retries` repeats of a retryable failure, `delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// `failed_attempts` counts the calls already made and failed.
    pub fn should_retry(&self, failed_attempts: usize, disposition: RetryDisposition) -> bool {
        disposition == RetryDisposition::Retryable && failed_attempts <= self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            user_agent: Some(format!("fedao-normalizer/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_retry_and_permanent_ones_do_not() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(RetryDisposition::for_status(status), RetryDisposition::Retryable, "{status}");
        }
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::UNPROCESSABLE_ENTITY,
            StatusCode::NOT_IMPLEMENTED,
            StatusCode::HTTP_VERSION_NOT_SUPPORTED,
        ] {
            assert_eq!(RetryDisposition::for_status(status), RetryDisposition::NonRetryable, "{status}");
        }
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let client = build_http_client(&HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
        })
        .expect("client");
        let err = client
            .post("http://127.0.0.1:9/map")
            .send()
            .await
            .expect_err("nothing listens on the discard port");
        assert_eq!(RetryDisposition::for_transport(&err), RetryDisposition::Retryable);
    }

    #[test]
    fn retries_stop_after_the_configured_repeats() {
        let policy = RetryPolicy {
            max_retries: 2,
            delay: Duration::from_millis(150),
        };
        assert!(policy.should_retry(1, RetryDisposition::Retryable));
        assert!(policy.should_retry(2, RetryDisposition::Retryable));
        assert!(!policy.should_retry(3, RetryDisposition::Retryable));
        assert!(!policy.should_retry(1, RetryDisposition::NonRetryable));

        let never = RetryPolicy {
            max_retries: 0,
            delay: Duration::ZERO,
        };
        assert!(!never.should_retry(1, RetryDisposition::Retryable));
    }

    #[test]
    fn client_builds_with_default_config() {
        assert!(build_http_client(&HttpClientConfig::default()).is_ok());
    }
}
