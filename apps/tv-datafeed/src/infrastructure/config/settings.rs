//! Datafeed Configuration Settings
//!
//! Configuration types for the fetcher, loaded from environment variables.
//! Unparsable values fall back to their defaults.

use std::time::Duration;

use crate::application::ports::Endpoint;
use crate::application::services::batch::BatchSettings;
use crate::application::services::retry::RetryPolicy;
use crate::domain::market_data::Interval;
use crate::domain::session::Credentials;
use crate::infrastructure::tradingview::auth::DEFAULT_SIGNIN_URL;
use crate::infrastructure::tradingview::client::FetcherSettings;
use crate::infrastructure::tradingview::connection::{
    ConnectionSettings, DEFAULT_ORIGIN, DEFAULT_WS_URL,
};
use crate::infrastructure::tradingview::scanner::DEFAULT_SCANNER_URL;

/// Remote endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Chart WebSocket URL.
    pub ws_url: String,
    /// `Origin` header for the WebSocket handshake.
    pub ws_origin: String,
    /// Sign-in URL.
    pub signin_url: String,
    /// Scanner base URL.
    pub scanner_url: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            ws_origin: DEFAULT_ORIGIN.to_string(),
            signin_url: DEFAULT_SIGNIN_URL.to_string(),
            scanner_url: DEFAULT_SCANNER_URL.to_string(),
        }
    }
}

/// Retry counts, delays and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    /// Attempts per fetch and per sign-in.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Open attempts per fetch attempt.
    pub connect_attempts: u32,
    /// Limit for a single open.
    pub connect_timeout: Duration,
    /// Limit for a single receive.
    pub receive_timeout: Duration,
    /// Limit for one whole attempt.
    pub attempt_deadline: Duration,
    /// Messages read before giving up on a terminal marker.
    pub max_messages: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(3000),
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(10),
            attempt_deadline: Duration::from_secs(60),
            max_messages: 100,
        }
    }
}

/// Batch pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPacing {
    /// Sleep between symbols.
    pub symbol_delay: Duration,
    /// Retry rounds after the first pass.
    pub rounds: u32,
}

impl Default for BatchPacing {
    fn default() -> Self {
        Self {
            symbol_delay: Duration::from_millis(2000),
            rounds: 3,
        }
    }
}

/// What the binary fetches when not told otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDefaults {
    /// Exchange label, also used for the scanner.
    pub exchange: String,
    /// Bar interval.
    pub interval: Interval,
    /// Bars per symbol.
    pub bar_count: u32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            exchange: "NSE".to_string(),
            interval: Interval::Daily,
            bar_count: 10,
        }
    }
}

/// Complete datafeed configuration.
#[derive(Debug, Clone, Default)]
pub struct DatafeedConfig {
    /// Account credentials, `None` for anonymous access.
    pub credentials: Option<Credentials>,
    /// Remote endpoints.
    pub endpoints: EndpointSettings,
    /// Retry and timeout settings.
    pub retry: RetrySettings,
    /// Batch pacing.
    pub batch: BatchPacing,
    /// Request defaults.
    pub request: RequestDefaults,
}

impl DatafeedConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if only one of `TV_USERNAME` / `TV_PASSWORD` is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if only one of `TV_USERNAME` / `TV_PASSWORD` is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let credentials = match (get("TV_USERNAME"), get("TV_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::IncompleteCredentials("TV_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::IncompleteCredentials("TV_USERNAME")),
        };

        let endpoints = EndpointSettings {
            ws_url: get("TV_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            ws_origin: get("TV_WS_ORIGIN").unwrap_or_else(|| DEFAULT_ORIGIN.to_string()),
            signin_url: get("TV_SIGNIN_URL").unwrap_or_else(|| DEFAULT_SIGNIN_URL.to_string()),
            scanner_url: get("TV_SCANNER_URL").unwrap_or_else(|| DEFAULT_SCANNER_URL.to_string()),
        };

        let defaults = RetrySettings::default();
        let retry = RetrySettings {
            max_retries: parse_u32(&get, "TV_MAX_RETRIES", defaults.max_retries),
            retry_delay: parse_millis(&get, "TV_RETRY_DELAY_MS", defaults.retry_delay),
            connect_attempts: parse_u32(&get, "TV_CONNECT_ATTEMPTS", defaults.connect_attempts),
            connect_timeout: parse_secs(&get, "TV_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            receive_timeout: parse_secs(&get, "TV_RECEIVE_TIMEOUT_SECS", defaults.receive_timeout),
            attempt_deadline: parse_secs(
                &get,
                "TV_ATTEMPT_DEADLINE_SECS",
                defaults.attempt_deadline,
            ),
            max_messages: parse_u32(&get, "TV_MAX_MESSAGES", defaults.max_messages),
        };

        let batch = BatchPacing {
            symbol_delay: parse_millis(
                &get,
                "TV_SYMBOL_DELAY_MS",
                BatchPacing::default().symbol_delay,
            ),
            rounds: parse_env(&get, "TV_BATCH_ROUNDS", BatchPacing::default().rounds),
        };

        let request = RequestDefaults {
            exchange: get("TV_EXCHANGE").unwrap_or_else(|| RequestDefaults::default().exchange),
            interval: parse_env(&get, "TV_INTERVAL", Interval::default()),
            bar_count: parse_u32(&get, "TV_BARS", RequestDefaults::default().bar_count),
        };

        Ok(Self {
            credentials,
            endpoints,
            retry,
            batch,
            request,
        })
    }

    /// Policy for fetch attempts and sign-in.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_retries, self.retry.retry_delay)
    }

    /// Connection settings for [`ConnectionManager`](crate::ConnectionManager).
    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            endpoint: Endpoint::new(&self.endpoints.ws_url)
                .with_header("Origin", &self.endpoints.ws_origin),
            connect_timeout: self.retry.connect_timeout,
            receive_timeout: self.retry.receive_timeout,
            connect_retry: RetryPolicy::new(self.retry.connect_attempts, self.retry.retry_delay),
        }
    }

    /// Limits for [`SymbolFetcher`](crate::SymbolFetcher).
    #[must_use]
    pub const fn fetcher_settings(&self) -> FetcherSettings {
        FetcherSettings {
            max_messages: self.retry.max_messages,
            attempt_deadline: self.retry.attempt_deadline,
            retry: self.retry_policy(),
        }
    }

    /// Pacing for [`BatchRetryCoordinator`](crate::BatchRetryCoordinator).
    #[must_use]
    pub const fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            symbol_delay: self.batch.symbol_delay,
            rounds: RetryPolicy::new(self.batch.rounds, self.retry.retry_delay),
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// One credential variable is set without the other.
    #[error("incomplete credentials: {0} is not set")]
    IncompleteCredentials(&'static str),
}

fn parse_env<T, G>(get: &G, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
            default
        }),
    }
}

/// Positive integers only; zero falls back to the default.
fn parse_u32<G: Fn(&str) -> Option<String>>(get: &G, key: &str, default: u32) -> u32 {
    match parse_env(get, key, default) {
        0 => default,
        value => value,
    }
}

fn parse_secs<G: Fn(&str) -> Option<String>>(get: &G, key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_env(get, key, default.as_secs()))
}

fn parse_millis<G: Fn(&str) -> Option<String>>(get: &G, key: &str, default: Duration) -> Duration {
    let millis = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parse_env(get, key, millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<DatafeedConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        DatafeedConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config(&[]).unwrap();
        assert!(config.credentials.is_none());
        assert_eq!(config.endpoints, EndpointSettings::default());
        assert_eq!(config.retry, RetrySettings::default());
        assert_eq!(config.request.exchange, "NSE");
        assert_eq!(config.request.interval, Interval::Daily);
        assert_eq!(config.request.bar_count, 10);
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("TV_USERNAME", "trader"),
            ("TV_PASSWORD", "pw"),
            ("TV_MAX_RETRIES", "5"),
            ("TV_RETRY_DELAY_MS", "250"),
            ("TV_BATCH_ROUNDS", "0"),
            ("TV_INTERVAL", "1H"),
            ("TV_WS_URL", "ws://localhost:9000"),
        ])
        .unwrap();

        assert_eq!(config.credentials.as_ref().unwrap().username(), "trader");
        assert_eq!(config.retry_policy(), RetryPolicy::new(5, Duration::from_millis(250)));
        assert_eq!(config.batch.rounds, 0);
        assert_eq!(config.request.interval, Interval::Hour1);
        assert_eq!(config.connection_settings().endpoint.url, "ws://localhost:9000");
    }

    #[test]
    fn unparsable_values_fall_back() {
        let config = config(&[
            ("TV_MAX_RETRIES", "many"),
            ("TV_CONNECT_TIMEOUT_SECS", "-1"),
            ("TV_INTERVAL", "2D"),
            ("TV_BARS", "0"),
        ])
        .unwrap();

        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request.interval, Interval::Daily);
        assert_eq!(config.request.bar_count, 10);
    }

    #[test]
    fn half_credentials_are_rejected() {
        assert_eq!(
            config(&[("TV_USERNAME", "trader")]).unwrap_err(),
            ConfigError::IncompleteCredentials("TV_PASSWORD")
        );
        assert_eq!(
            config(&[("TV_PASSWORD", "pw"), ("TV_USERNAME", " ")]).unwrap_err(),
            ConfigError::IncompleteCredentials("TV_USERNAME")
        );
    }

    #[test]
    fn component_settings() {
        let config = config(&[("TV_CONNECT_ATTEMPTS", "1"), ("TV_SYMBOL_DELAY_MS", "10")]).unwrap();

        let connection = config.connection_settings();
        assert_eq!(connection.connect_retry.max_attempts(), 1);
        assert_eq!(
            connection.endpoint.headers,
            vec![("Origin".to_string(), DEFAULT_ORIGIN.to_string())]
        );

        let fetcher = config.fetcher_settings();
        assert_eq!(fetcher.max_messages, 100);
        assert_eq!(fetcher.retry.max_attempts(), 3);

        let batch = config.batch_settings();
        assert_eq!(batch.symbol_delay, Duration::from_millis(10));
        assert_eq!(batch.rounds.max_attempts(), 3);
    }
}
