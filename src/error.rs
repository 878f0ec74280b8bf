//! Error taxonomy (C16).
//!
//! Replaces the source's dynamic string-substring error classification
//! with a tagged-variant enum. The string table survives only at the
//! config boundary, where operator-facing cooldown rules are parsed into
//! [`CooldownReason`] once at config-load time.

use std::time::Duration;
use thiserror::Error;

/// Error kinds the core distinguishes internally.
///
/// Everything recoverable at a category boundary is absorbed by the scan
/// engine into a per-category error message; only dead-subsystem failures
/// propagate as hard errors to the operator.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The URL is gone or wrong (HTTP 404).
    #[error("permanent failure for {url}")]
    Permanent {
        /// The requested URL.
        url: String,
    },

    /// Access denied, bot challenge, or a `/blocked`-style redirect.
    #[error("blocked: {reason}")]
    Blocked {
        /// Human-readable block reason (challenge phrase, status, or path match).
        reason: String,
    },

    /// HTTP 429 exhausted all retries.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Server-suggested wait, if any.
        retry_after: Option<Duration>,
    },

    /// Transport-layer error or 5xx exhausted all retries.
    #[error("transient failure: {source}")]
    Transient {
        /// Underlying transport error.
        #[source]
        source: anyhow::Error,
    },

    /// A 2xx response whose body triage rejected it.
    #[error("content invalid: {reason}")]
    ContentInvalid {
        /// Why the content was rejected (bot-page pattern, suspect partial, zero indicators).
        reason: String,
    },

    /// Missing parser, malformed category URL, malformed exclusion regex.
    #[error("config error: {message}")]
    ConfigError {
        /// Description of the misconfiguration.
        message: String,
    },

    /// The relational store failed in a way the core cannot route around.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The key-value store failed in a way the core cannot route around.
    #[error("cache/kv error: {0}")]
    Cache(#[from] redis::RedisError),

    /// All configured proxies are unavailable.
    #[error("proxy pool exhausted")]
    ProxyPoolExhausted,
}

/// Convenience alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Operator-facing cooldown reasons, parsed once from the config's
/// string-keyed error-cooldown table (see `SPEC_FULL.md` §4.15/§6).
///
/// This is the only place a string substring match on an error message is
/// still permitted — it exists purely to translate a human-authored config
/// table into a lookup the scheduler can use without re-parsing strings at
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CooldownReason {
    /// HTTP 403 — typically a block.
    Http403,
    /// HTTP 429 — rate limited.
    Http429,
    /// A read timed out.
    ReadTimeout,
    /// Content triage flagged a bot challenge.
    BotChallenge,
}

impl CooldownReason {
    /// Default cooldown duration for this reason, matching `SPEC_FULL.md` §6.
    #[must_use]
    pub fn default_cooldown(self) -> Duration {
        match self {
            Self::Http403 => Duration::from_secs(8 * 3600),
            Self::Http429 => Duration::from_secs(3600),
            Self::ReadTimeout => Duration::from_secs(30 * 60),
            Self::BotChallenge => Duration::from_secs(6 * 3600),
        }
    }

    /// Classify a category's `last_error` message into a cooldown reason.
    ///
    /// This is the one legitimate substring match in the core: it exists to
    /// bridge a persisted human-readable error string to a tagged reason,
    /// not to drive control flow on ad-hoc string contents elsewhere.
    #[must_use]
    pub fn classify(last_error: &str) -> Option<Self> {
        if last_error.contains("HTTP 403") {
            Some(Self::Http403)
        } else if last_error.contains("HTTP 429") {
            Some(Self::Http429)
        } else if last_error.contains("ReadTimeout") {
            Some(Self::ReadTimeout)
        } else if last_error.contains("Blocked or bot challenge detected") {
            Some(Self::BotChallenge)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_substrings() {
        assert_eq!(CooldownReason::classify("HTTP 403 Forbidden"), Some(CooldownReason::Http403));
        assert_eq!(CooldownReason::classify("got HTTP 429 too many"), Some(CooldownReason::Http429));
        assert_eq!(CooldownReason::classify("ReadTimeout after 30s"), Some(CooldownReason::ReadTimeout));
        assert_eq!(
            CooldownReason::classify("Blocked or bot challenge detected"),
            Some(CooldownReason::BotChallenge)
        );
        assert_eq!(CooldownReason::classify("some other error"), None);
    }

    #[test]
    fn default_cooldowns_match_spec() {
        assert_eq!(CooldownReason::Http403.default_cooldown(), Duration::from_secs(8 * 3600));
        assert_eq!(CooldownReason::Http429.default_cooldown(), Duration::from_secs(3600));
        assert_eq!(CooldownReason::ReadTimeout.default_cooldown(), Duration::from_secs(30 * 60));
        assert_eq!(CooldownReason::BotChallenge.default_cooldown(), Duration::from_secs(6 * 3600));
    }
}
