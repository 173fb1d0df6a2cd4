//! Session Identity Types
//!
//! Login credentials, the auth token sent with `set_auth_token`, and the
//! per-attempt quote/chart session identifiers.
//!
//! Session ids come from a caller-supplied random source so tests can seed
//! it; nothing here holds process-wide state.

use rand::Rng;

/// Prefix of quote-session identifiers.
pub const QUOTE_SESSION_PREFIX: &str = "qs_";

/// Prefix of chart-session identifiers.
pub const CHART_SESSION_PREFIX: &str = "cs_";

/// Number of random letters after the prefix.
pub const SESSION_SUFFIX_LEN: usize = 12;

/// Token value accepted by the server for public, logged-out access.
pub const ANONYMOUS_TOKEN: &str = "unauthorized_user_token";

// =============================================================================
// Session Identifiers
// =============================================================================

/// Generate `prefix` followed by [`SESSION_SUFFIX_LEN`] random lowercase letters.
pub fn generate_session_id<R: Rng + ?Sized>(prefix: &str, rng: &mut R) -> String {
    let mut id = String::with_capacity(prefix.len() + SESSION_SUFFIX_LEN);
    id.push_str(prefix);
    id.extend((0..SESSION_SUFFIX_LEN).map(|_| char::from(rng.random_range(b'a'..=b'z'))));
    id
}

/// Quote and chart session ids for a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIds {
    /// Quote session (`qs_…`).
    pub quote: String,
    /// Chart session (`cs_…`).
    pub chart: String,
}

impl SessionIds {
    /// Draw a fresh pair of ids.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            quote: generate_session_id(QUOTE_SESSION_PREFIX, rng),
            chart: generate_session_id(CHART_SESSION_PREFIX, rng),
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// TradingView account credentials.
///
/// The `Debug` implementation redacts the password for safe logging.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Account username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Account password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Auth Token
// =============================================================================

/// Opaque token sent as the first protocol message of every attempt.
///
/// The anonymous token is a valid value, not an error state.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a token returned by the login endpoint.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The logged-out token.
    #[must_use]
    pub fn anonymous() -> Self {
        Self(ANONYMOUS_TOKEN.to_string())
    }

    /// Whether this is the logged-out token.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS_TOKEN
    }

    /// Raw token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AuthToken {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_anonymous() {
            f.debug_tuple("AuthToken").field(&self.0).finish()
        } else {
            f.debug_tuple("AuthToken").field(&"[REDACTED]").finish()
        }
    }
}
