//! Provider abstraction for creating, inspecting, and removing instances.
//!
//! A [`ProviderClient`] hides one cloud API behind a normalised instance
//! shape. Clients are built from a [`Driver`] record by the factories held in
//! a [`ProviderRegistry`], so the orchestrator never switches on provider
//! names itself.

pub mod google;
pub mod operation;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Driver, Instance};

pub use operation::{Operation, OperationKind, OperationPoller, OperationSource, OperationStatus};

/// HTTP status used by providers to report an absent resource.
pub const NOT_FOUND_CODE: u16 = 404;

/// Errors raised by provider clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when an instance specification is incomplete.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when the provider reports the resource as absent.
    #[error("{resource} was not found")]
    NotFound {
        /// Resource path or name that was requested.
        resource: String,
    },
    /// Raised when the provider rejects a request.
    #[error("provider request failed with status {code}: {message}")]
    Api {
        /// HTTP status returned by the provider.
        code: u16,
        /// Provider supplied error message.
        message: String,
    },
    /// Raised when an operation does not complete within the poll budget.
    #[error("operation {operation} did not complete after {checks} status checks")]
    Timeout {
        /// Provider operation name.
        operation: String,
        /// Number of status checks performed.
        checks: u32,
    },
    /// Raised when an operation completes with an error payload.
    #[error("operation {operation} failed: {message}")]
    OperationFailed {
        /// Provider operation name.
        operation: String,
        /// Error text reported by the provider.
        message: String,
    },
    /// Raised when the HTTP exchange itself fails.
    #[error("provider transport error: {0}")]
    Transport(String),
    /// Raised when credentials cannot be loaded or exchanged for a token.
    #[error("provider authentication failed: {0}")]
    Auth(String),
    /// Raised when a response body cannot be decoded.
    #[error("unexpected provider response: {0}")]
    Decode(String),
    /// Raised when no factory is registered for a driver's provider.
    #[error("unsupported provider '{0}'")]
    Unsupported(String),
}

impl ProviderError {
    /// Returns the HTTP-style status code carried by the error, if any.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::NotFound { .. } => Some(NOT_FOUND_CODE),
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` when the error reports an absent resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.code(), Some(NOT_FOUND_CODE))
    }
}

/// Key/value pair attached to an instance as metadata.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MetadataItem {
    /// Metadata key (for example `sshKeys`).
    pub key: String,
    /// Metadata value.
    pub value: String,
}

impl MetadataItem {
    /// Builds a metadata item.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Builds the `sshKeys` item authorising `public_key` for `user`.
    #[must_use]
    pub fn ssh_keys(user: &str, public_key: &str) -> Self {
        Self::new("sshKeys", format!("{user}:{}", public_key.trim()))
    }
}

/// Identifies an existing instance for lookups and removal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRef {
    /// Instance name.
    pub name: String,
    /// Zone hosting the instance; `None` uses the client's default zone.
    pub zone: Option<String>,
}

impl InstanceRef {
    /// Builds a reference from a stored instance record.
    #[must_use]
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            name: instance.name.clone(),
            zone: Some(instance.zone.clone()).filter(|zone| !zone.is_empty()),
        }
    }
}

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Instance name.
    pub name: String,
    /// Machine type override; `None` uses the client default.
    pub machine_type: Option<String>,
    /// Zone override; `None` uses the client default.
    pub zone: Option<String>,
    /// Metadata attached at creation time.
    pub metadata: Vec<MetadataItem>,
}

impl InstanceSpec {
    /// Starts a builder for an [`InstanceSpec`].
    #[must_use]
    pub fn builder() -> InstanceSpecBuilder {
        InstanceSpecBuilder::default()
    }
}

/// Builder for [`InstanceSpec`] that trims inputs and rejects empty names.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceSpecBuilder {
    name: String,
    machine_type: Option<String>,
    zone: Option<String>,
    metadata: Vec<MetadataItem>,
}

impl InstanceSpecBuilder {
    /// Sets the instance name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the optional machine type.
    #[must_use]
    pub fn machine_type(mut self, value: Option<String>) -> Self {
        self.machine_type = value;
        self
    }

    /// Sets the optional zone.
    #[must_use]
    pub fn zone(mut self, value: Option<String>) -> Self {
        self.zone = value;
        self
    }

    /// Appends a metadata item.
    #[must_use]
    pub fn metadata(mut self, item: MetadataItem) -> Self {
        self.metadata.push(item);
        self
    }

    /// Builds the specification.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when the name is empty.
    pub fn build(self) -> Result<InstanceSpec, ProviderError> {
        let name = self.name.trim().to_owned();
        if name.is_empty() {
            return Err(ProviderError::Validation("name".to_owned()));
        }
        Ok(InstanceSpec {
            name,
            machine_type: non_blank(self.machine_type),
            zone: non_blank(self.zone),
            metadata: self.metadata,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|trimmed| !trimmed.is_empty())
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Capability implemented by cloud providers.
pub trait ProviderClient: Send + Sync {
    /// Creates an instance, waits for the provider operation to finish, and
    /// returns the normalised record.
    fn create<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, Instance>;

    /// Fetches the current record for an instance.
    fn get<'a>(&'a self, target: &'a InstanceRef) -> ProviderFuture<'a, Instance>;

    /// Removes an instance and waits for completion. Absent instances are
    /// reported with [`ProviderError::NotFound`].
    fn remove<'a>(&'a self, target: &'a InstanceRef) -> ProviderFuture<'a, ()>;

    /// Replaces an instance's metadata items.
    fn set_metadata<'a>(
        &'a self,
        target: &'a InstanceRef,
        items: &'a [MetadataItem],
    ) -> ProviderFuture<'a, ()>;
}

/// Builds a provider client from a driver record.
pub type ProviderFactory =
    Box<dyn Fn(&Driver) -> Result<Arc<dyn ProviderClient>, ProviderError> + Send + Sync>;

/// Maps provider identifiers to client factories.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in Google Compute Engine provider.
    #[must_use]
    pub fn with_defaults(settings: google::GoogleSettings) -> Self {
        let mut registry = Self::new();
        registry.register(google::PROVIDER_ID, move |driver: &Driver| {
            let client = google::GoogleProvider::from_driver(driver, settings.clone())?;
            Ok(Arc::new(client) as Arc<dyn ProviderClient>)
        });
        registry
    }

    /// Registers (or replaces) the factory for `provider`.
    pub fn register<F>(&mut self, provider: impl Into<String>, factory: F)
    where
        F: Fn(&Driver) -> Result<Arc<dyn ProviderClient>, ProviderError> + Send + Sync + 'static,
    {
        self.factories.insert(provider.into(), Box::new(factory));
    }

    /// Builds a client for `driver`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unsupported`] when the driver's provider is
    /// unknown, or the factory's error when the credentials are unusable.
    pub fn client_for(&self, driver: &Driver) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        let factory = self
            .factories
            .get(&driver.provider)
            .ok_or_else(|| ProviderError::Unsupported(driver.provider.clone()))?;
        factory(driver)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
