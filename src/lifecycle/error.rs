//! Error types for lifecycle operations.

use thiserror::Error;

use crate::provider::ProviderError;
use crate::remote::RemoteError;
use crate::store::StoreError;

/// Errors raised by [`crate::lifecycle::LifecycleOrchestrator`].
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Raised when a project, driver, or instance cannot be found.
    #[error("{kind} '{name}' was not found")]
    NotFound {
        /// Kind of the missing entity.
        kind: &'static str,
        /// Requested name.
        name: String,
    },
    /// Raised when an instance name is already tracked by the project.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Kind of the conflicting entity.
        kind: &'static str,
        /// Conflicting name.
        name: String,
    },
    /// Raised when request arguments are unusable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Raised when the provider rejects a call for an instance.
    #[error("provider call for instance '{instance}' failed: {source}")]
    Provider {
        /// Instance the call targeted.
        instance: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when running a payload on an instance fails.
    #[error("remote execution on instance '{instance}' failed: {source}")]
    Remote {
        /// Instance the payload targeted.
        instance: String,
        /// Transport failure.
        #[source]
        source: RemoteError,
    },
    /// Raised when a project cannot be saved after a provider change.
    #[error("failed to persist project '{project}': {source}")]
    Persist {
        /// Project that could not be saved.
        project: String,
        /// Store failure.
        #[source]
        source: StoreError,
    },
    /// Raised when stores cannot be read.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when no bootstrap script matches the instance OS.
    #[error("no {service} bootstrap script found for OS '{os}'")]
    ScriptNotFound {
        /// Service the script installs.
        service: String,
        /// Operating system reported for the instance.
        os: String,
    },
    /// Raised when an instance has no external address to connect to.
    #[error("instance '{instance}' has no external IP address")]
    MissingAddress {
        /// Instance name.
        instance: String,
    },
    /// Raised when the confirmation prompt cannot be shown.
    #[error("confirmation failed: {0}")]
    Confirmation(String),
    /// Raised when a batch finished with failed items.
    #[error("{failed} of {total} operations failed")]
    PartialBatchFailure {
        /// Number of failed items.
        failed: usize,
        /// Number of submitted items.
        total: usize,
    },
}
