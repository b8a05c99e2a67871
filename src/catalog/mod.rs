//! Project and driver management.
//!
//! The [`Catalog`] owns both stores for the duration of one command. Project
//! creation prepares the SSH key pair used to reach the project's instances;
//! driver creation reads a credentials file and asks the provider registry
//! to validate it before anything is written.

mod keys;

use camino::Utf8Path;
use thiserror::Error;
use tracing::info;

use crate::model::{Driver, Project};
use crate::process::CommandRunner;
use crate::provider::{ProviderError, ProviderRegistry};
use crate::store::{DriverStore, ProjectStore, StoreError, read_text, validate_name};

pub use keys::{KEY_COMMENT, KeyGenError, KeyGenerator, public_key_path};

/// Errors raised by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Raised when the named record already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Record kind.
        kind: &'static str,
        /// Conflicting name.
        name: String,
    },
    /// Raised when the named record does not exist.
    #[error("{kind} '{name}' was not found")]
    NotFound {
        /// Record kind.
        kind: &'static str,
        /// Requested name.
        name: String,
    },
    /// Raised when a required argument is missing.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Raised when the credentials file cannot be read or parsed.
    #[error("failed to load credentials from {path}: {message}")]
    Credentials {
        /// Credentials file path.
        path: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the provider rejects a driver definition.
    #[error("driver '{name}' was rejected: {source}")]
    InvalidDriver {
        /// Driver name.
        name: String,
        /// Provider validation failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when the project key pair cannot be prepared.
    #[error(transparent)]
    KeyGen(#[from] KeyGenError),
    /// Raised when a store cannot be written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary row for `project list`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProjectSummary {
    /// Project name.
    pub name: String,
    /// Number of tracked instances.
    pub instances: usize,
}

/// Summary row for `driver list`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DriverSummary {
    /// Driver name.
    pub name: String,
    /// Provider identifier.
    pub provider: String,
}

/// Owns the stores for project and driver commands.
#[derive(Debug)]
pub struct Catalog<R> {
    projects: ProjectStore,
    drivers: DriverStore,
    registry: ProviderRegistry,
    keys: KeyGenerator<R>,
}

impl<R: CommandRunner> Catalog<R> {
    /// Assembles a catalog from loaded stores.
    pub const fn new(
        projects: ProjectStore,
        drivers: DriverStore,
        registry: ProviderRegistry,
        keys: KeyGenerator<R>,
    ) -> Self {
        Self {
            projects,
            drivers,
            registry,
            keys,
        }
    }

    /// Creates an empty project, generating its key pair when none exists.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::AlreadyExists`] for a duplicate name,
    /// [`CatalogError::KeyGen`] when the key pair cannot be prepared, or the
    /// store error when the project cannot be written.
    pub fn project_create(&mut self, name: &str) -> Result<ProjectSummary, CatalogError> {
        validate_name("project", name)?;
        if self.projects.contains(name) {
            return Err(CatalogError::AlreadyExists {
                kind: "project",
                name: name.to_owned(),
            });
        }

        let private_key = self.projects.key_path(name);
        let public_key = self.keys.ensure(&private_key)?;
        self.projects
            .add(Project::new(name, public_key, private_key))?;
        info!(project = name, "project created");

        Ok(ProjectSummary {
            name: name.to_owned(),
            instances: 0,
        })
    }

    /// Lists projects in name order.
    #[must_use]
    pub fn project_list(&self) -> Vec<ProjectSummary> {
        self.projects
            .iter()
            .map(|project| ProjectSummary {
                name: project.name.clone(),
                instances: project.instances.len(),
            })
            .collect()
    }

    /// Deletes a project record. Its key pair stays on disk.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] for unknown projects, or the
    /// store error when the file cannot be removed.
    pub fn project_remove(&mut self, name: &str) -> Result<Project, CatalogError> {
        if !self.projects.contains(name) {
            return Err(CatalogError::NotFound {
                kind: "project",
                name: name.to_owned(),
            });
        }
        let removed = self.projects.remove(name)?;
        info!(project = name, instances = removed.instances.len(), "project removed");
        Ok(removed)
    }

    /// Registers a driver from a JSON credentials file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidRequest`] for an empty name,
    /// [`CatalogError::AlreadyExists`] for a duplicate,
    /// [`CatalogError::Credentials`] when the file is unreadable, or
    /// [`CatalogError::InvalidDriver`] when the provider rejects it.
    pub fn driver_create(
        &mut self,
        provider: &str,
        name: &str,
        credentials_path: &Utf8Path,
    ) -> Result<DriverSummary, CatalogError> {
        if name.trim().is_empty() {
            return Err(CatalogError::InvalidRequest("driver name is required".to_owned()));
        }
        if self.drivers.get(name).is_some() {
            return Err(CatalogError::AlreadyExists {
                kind: "driver",
                name: name.to_owned(),
            });
        }

        let credentials_error = |message: String| CatalogError::Credentials {
            path: credentials_path.to_string(),
            message,
        };
        let raw = read_text(credentials_path).map_err(|err| credentials_error(err.to_string()))?;
        let credentials: serde_json::Value =
            serde_json::from_str(&raw).map_err(|err| credentials_error(err.to_string()))?;

        let driver = Driver {
            provider: provider.to_owned(),
            name: name.to_owned(),
            credentials,
        };
        self.registry
            .client_for(&driver)
            .map_err(|source| CatalogError::InvalidDriver {
                name: name.to_owned(),
                source,
            })?;
        self.drivers.add(driver)?;
        info!(driver = name, provider, "driver created");

        Ok(DriverSummary {
            name: name.to_owned(),
            provider: provider.to_owned(),
        })
    }

    /// Lists drivers in name order.
    #[must_use]
    pub fn driver_list(&self) -> Vec<DriverSummary> {
        self.drivers
            .iter()
            .map(|driver| DriverSummary {
                name: driver.name.clone(),
                provider: driver.provider.clone(),
            })
            .collect()
    }

    /// Deletes a driver record.
    ///
    /// Instances that reference the driver are left in their projects.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] for unknown drivers, or the store
    /// error when the file cannot be removed.
    pub fn driver_remove(&mut self, name: &str) -> Result<DriverSummary, CatalogError> {
        if self.drivers.get(name).is_none() {
            return Err(CatalogError::NotFound {
                kind: "driver",
                name: name.to_owned(),
            });
        }
        let removed = self.drivers.remove(name)?;
        info!(driver = name, "driver removed");
        Ok(DriverSummary {
            name: removed.name,
            provider: removed.provider,
        })
    }
}

#[cfg(test)]
mod tests;
