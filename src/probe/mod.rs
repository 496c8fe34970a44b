//! Datastore readiness probe.
//!
//! Runs once, before any supervised process is launched. The probe either
//! reports the datastore ready or fails permanently, in which case the
//! bootstrap aborts.

mod postgres;

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use url::Url;

use crate::error::{ProbeError, ProbeFailure};

pub use postgres::PostgresCheck;

pub const CANONICAL_SCHEME: &str = "postgresql";
const DEPRECATED_PREFIX: &str = "postgres://";
const CANONICAL_PREFIX: &str = "postgresql://";

/// Rewrites the deprecated `postgres://` scheme to `postgresql://`.
pub fn normalize_scheme(raw: &str) -> Cow<'_, str> {
    match raw.strip_prefix(DEPRECATED_PREFIX) {
        Some(rest) => Cow::Owned(format!("{CANONICAL_PREFIX}{rest}")),
        None => Cow::Borrowed(raw),
    }
}

/// A parsed, scheme-normalized datastore address.
///
/// `Display` and `Debug` never reveal the password.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    url: Url,
}

impl ConnectionTarget {
    pub fn parse(raw: &str) -> Result<Self, ProbeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProbeError::MissingTarget);
        }

        let normalized = normalize_scheme(raw);
        let url = Url::parse(&normalized).map_err(|e| ProbeError::InvalidTarget(e.to_string()))?;

        if url.scheme() != CANONICAL_SCHEME {
            return Err(ProbeError::InvalidTarget(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ProbeError::InvalidTarget("missing host".to_string()));
        }

        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn masked(&self) -> String {
        let mut masked = self.url.clone();
        if masked.password().is_some() {
            // only fails for URLs that cannot carry credentials
            let _ = masked.set_password(Some("****"));
        }
        masked.to_string()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionTarget").field(&self.masked()).finish()
    }
}

/// Connects to the datastore, asks it what it is, and disconnects.
#[async_trait]
pub trait CapabilityCheck: Send + Sync {
    /// Returns the server's self-description on success.
    async fn check(&self, target: &ConnectionTarget) -> Result<String, ProbeError>;
}

/// One round of the retry loop. Not retained once the loop finishes.
#[derive(Debug)]
pub struct ProbeAttempt {
    pub number: u32,
    pub outcome: Result<String, ProbeError>,
}

impl ProbeAttempt {
    fn log(&self, max_attempts: u32) {
        match &self.outcome {
            Ok(server) => info!(
                "Datastore probe attempt {}/{} succeeded: {server}",
                self.number, max_attempts
            ),
            Err(e) => warn!(
                "Datastore probe attempt {}/{} failed: {e}",
                self.number, max_attempts
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    pub attempts: u32,
    pub server: String,
}

pub struct Prober<C> {
    check: C,
    max_attempts: u32,
    backoff_unit: Duration,
}

impl<C: CapabilityCheck> Prober<C> {
    pub fn new(check: C, max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            check,
            max_attempts: max_attempts.max(1),
            backoff_unit,
        }
    }

    /// Wait after failed attempt `attempt` (1-indexed): `2^attempt` units.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    pub async fn probe(&self, raw_target: Option<&str>) -> Result<Ready, ProbeFailure> {
        let target = raw_target
            .ok_or(ProbeError::MissingTarget)
            .and_then(ConnectionTarget::parse)
            .map_err(ProbeFailure::Target)?;

        info!(
            "Probing datastore {target}, up to {} attempts",
            self.max_attempts
        );

        let mut number = 1;
        loop {
            let attempt = ProbeAttempt {
                number,
                outcome: self.check.check(&target).await,
            };
            attempt.log(self.max_attempts);

            match attempt.outcome {
                Ok(server) => {
                    return Ok(Ready {
                        attempts: number,
                        server,
                    })
                }
                Err(last) if number >= self.max_attempts => {
                    return Err(ProbeFailure::Exhausted {
                        attempts: number,
                        last,
                    })
                }
                Err(_) => {
                    let wait = self.backoff(number);
                    info!("Waiting {wait:?} before the next datastore probe");
                    tokio::time::sleep(wait).await;
                    number += 1;
                }
            }
        }
    }
}
