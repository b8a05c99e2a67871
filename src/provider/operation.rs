//! Polling of long-running provider operations.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::debug;

use super::{ProviderError, ProviderFuture};

/// Default delay between two status checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of status checks before giving up.
pub const DEFAULT_MAX_CHECKS: u32 = 60;

/// Lifecycle state reported for an operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OperationStatus {
    /// The provider finished the operation (successfully or not).
    Done,
    /// Any other provider state, kept verbatim for logging.
    Pending(String),
}

impl OperationStatus {
    /// Parses a provider status label.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("DONE") {
            Self::Done
        } else {
            Self::Pending(raw.to_owned())
        }
    }

    /// Returns `true` for the terminal state.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl<'de> Deserialize<'de> for OperationStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Handle for an operation started by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Operation {
    /// Provider operation name.
    pub name: String,
    /// Zone scoping the operation, when the provider reports one.
    pub zone: Option<String>,
    /// Most recently observed status.
    pub status: OperationStatus,
    /// Error text attached to a finished operation.
    pub error: Option<String>,
}

impl Operation {
    /// Creates a pending operation handle.
    #[must_use]
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: None,
            status: OperationStatus::Pending("PENDING".to_owned()),
            error: None,
        }
    }
}

/// Distinguishes operations that need polling from ones that completed
/// synchronously (plain reads).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationKind {
    /// Asynchronous zone operation tracked by the provider.
    Zone,
    /// Synchronous request with nothing to wait for.
    Immediate,
}

/// Source of fresh operation status.
pub trait OperationSource: Send + Sync {
    /// Fetches the latest state of `operation`.
    fn check<'a>(&'a self, operation: &'a Operation) -> ProviderFuture<'a, Operation>;
}

/// Drives operations to completion with a fixed interval and check budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OperationPoller {
    interval: Duration,
    max_checks: u32,
}

impl Default for OperationPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_CHECKS)
    }
}

impl OperationPoller {
    /// Creates a poller. A zero check budget is treated as one check.
    #[must_use]
    pub fn new(interval: Duration, max_checks: u32) -> Self {
        Self {
            interval,
            max_checks: max_checks.max(1),
        }
    }

    /// Delay between two checks.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Maximum number of checks before timing out.
    #[must_use]
    pub const fn max_checks(&self) -> u32 {
        self.max_checks
    }

    /// Waits until `operation` reports `DONE`.
    ///
    /// Immediate operations and handles that are already done are returned
    /// without issuing a check. A failed check aborts the wait at once.
    ///
    /// # Errors
    ///
    /// Returns the source's error when a check fails, or
    /// [`ProviderError::Timeout`] once the check budget is exhausted.
    pub async fn wait_for<S>(
        &self,
        source: &S,
        operation: Operation,
        kind: OperationKind,
    ) -> Result<Operation, ProviderError>
    where
        S: OperationSource + ?Sized,
    {
        if kind == OperationKind::Immediate || operation.status.is_done() {
            return Ok(operation);
        }

        let mut checks = 0_u32;
        loop {
            let current = source.check(&operation).await?;
            checks += 1;
            if current.status.is_done() {
                debug!(operation = %current.name, checks, "operation finished");
                return Ok(current);
            }
            if checks >= self.max_checks {
                return Err(ProviderError::Timeout {
                    operation: operation.name.clone(),
                    checks,
                });
            }
            debug!(operation = %current.name, status = ?current.status, checks, "operation pending");
            sleep(self.interval).await;
        }
    }
}
