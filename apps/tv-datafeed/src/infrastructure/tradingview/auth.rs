//! Session Authentication
//!
//! Exchanges account credentials for the token sent with `set_auth_token`.
//!
//! # Flow
//!
//! 1. No credentials: return the anonymous token without any request.
//! 2. POST the sign-in form (`username`, `password`, `remember=on`) with a
//!    `Referer` header, retrying with the shared [`RetryPolicy`].
//! 3. Read `user.auth_token` from the JSON response.
//! 4. If every attempt fails, fall back to the anonymous token.
//!
//! Authentication never fails the caller; it only decides which token is
//! used.

use std::time::Duration;

use reqwest::header::REFERER;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::application::services::retry::RetryPolicy;
use crate::domain::session::{AuthToken, Credentials};

/// Default sign-in endpoint.
pub const DEFAULT_SIGNIN_URL: &str = "https://www.tradingview.com/accounts/signin/";

const REFERER_URL: &str = "https://www.tradingview.com";

/// Per-request timeout for sign-in.
pub const SIGNIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Sign-in failures. Logged and absorbed by [`SessionAuthenticator`].
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Request could not be sent or the body could not be read.
    #[error("sign-in request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("sign-in rejected with status {0}")]
    Status(u16),

    /// Response carried no token.
    #[error("sign-in response missing auth token")]
    MissingToken,
}

#[derive(Deserialize)]
struct SignInResponse {
    user: Option<SignInUser>,
}

#[derive(Deserialize)]
struct SignInUser {
    auth_token: Option<String>,
}

/// Resolves the auth token once per client.
#[derive(Debug, Clone)]
pub struct SessionAuthenticator {
    client: reqwest::Client,
    signin_url: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl SessionAuthenticator {
    /// Create an authenticator.
    #[must_use]
    pub fn new(client: reqwest::Client, signin_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            signin_url: signin_url.into(),
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop retrying when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Produce a token, falling back to anonymous access.
    pub async fn authenticate(&self, credentials: Option<&Credentials>) -> AuthToken {
        let Some(credentials) = credentials else {
            tracing::info!("No credentials provided, using anonymous access");
            return AuthToken::anonymous();
        };

        let result = self
            .retry
            .run(
                &self.cancel,
                |_| self.sign_in(credentials),
                |attempt, err| {
                    tracing::warn!(attempt = %attempt, error = %err, "Auth attempt failed");
                },
            )
            .await;

        match result {
            Ok(token) => {
                tracing::info!(username = credentials.username(), "Authentication successful");
                token
            }
            Err(err) => {
                tracing::error!(
                    attempts = err.attempts(),
                    error = %err.into_last(),
                    "All auth attempts failed, using anonymous access"
                );
                AuthToken::anonymous()
            }
        }
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<AuthToken, AuthError> {
        let response = self
            .client
            .post(&self.signin_url)
            .header(REFERER, REFERER_URL)
            .form(&[
                ("username", credentials.username()),
                ("password", credentials.password()),
                ("remember", "on"),
            ])
            .timeout(SIGNIN_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Status(status.as_u16()));
        }

        let body: SignInResponse = response.json().await?;
        body.user
            .and_then(|user| user.auth_token)
            .filter(|token| !token.is_empty())
            .map(AuthToken::new)
            .ok_or(AuthError::MissingToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn authenticator(server: &MockServer, attempts: u32) -> SessionAuthenticator {
        SessionAuthenticator::new(
            reqwest::Client::new(),
            format!("{}/accounts/signin/", server.uri()),
            RetryPolicy::new(attempts, Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn returns_token_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/signin/"))
            .and(header("referer", REFERER_URL))
            .and(body_string_contains("username=trader"))
            .and(body_string_contains("remember=on"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "user": { "auth_token": "tok-123" } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let token = authenticator(&server, 3)
            .authenticate(Some(&Credentials::new("trader", "pw")))
            .await;
        assert_eq!(token.as_str(), "tok-123");
    }

    #[tokio::test]
    async fn falls_back_to_anonymous_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let token = authenticator(&server, 2)
            .authenticate(Some(&Credentials::new("trader", "pw")))
            .await;
        assert!(token.is_anonymous());
    }

    #[tokio::test]
    async fn missing_token_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "bad" })))
            .expect(1)
            .mount(&server)
            .await;

        let token = authenticator(&server, 1)
            .authenticate(Some(&Credentials::new("trader", "wrong")))
            .await;
        assert!(token.is_anonymous());
    }

    #[tokio::test]
    async fn no_credentials_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        assert!(authenticator(&server, 3).authenticate(None).await.is_anonymous());
    }
}
