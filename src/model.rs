//! Records persisted by the project and driver stores.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Status label shown for instances the provider no longer knows about.
pub const STATUS_DELETED: &str = "DELETED";

/// Status label shown when a refresh could not reach the provider.
pub const STATUS_FAILED: &str = "FAILED";

/// Addresses assigned to an instance's primary network interface.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Address on the provider's private network.
    #[serde(default)]
    pub internal_ip: Option<String>,
    /// NAT address reachable from the operator's workstation.
    #[serde(default)]
    pub external_ip: Option<String>,
}

/// Normalised description of a compute instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Unique name within the owning project.
    pub name: String,
    /// Short machine type (for example `n1-standard-1`).
    pub machine_type: String,
    /// Short zone name (for example `us-central1-a`).
    pub zone: String,
    /// Name of the driver that created the instance.
    pub driver: String,
    /// Provider status string (for example `RUNNING`).
    pub status: String,
    /// Operating system label used to select bootstrap scripts.
    #[serde(default)]
    pub os: String,
    /// Network addresses.
    #[serde(default)]
    pub network: Network,
}

impl Instance {
    /// Returns the external address when the provider assigned one.
    #[must_use]
    pub fn external_ip(&self) -> Option<&str> {
        self.network.external_ip.as_deref()
    }
}

/// A named group of instances sharing one SSH key pair.
///
/// Only `name` and `instances` are written to disk; the key material is
/// attached by the store when the project is loaded.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Project {
    /// Project name, also used as the file and key name.
    pub name: String,
    /// Instances keyed by name.
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    /// OpenSSH public key line installed on every instance.
    #[serde(skip)]
    pub public_key: String,
    /// Path to the private key used to reach the project's instances.
    #[serde(skip)]
    pub private_key: Utf8PathBuf,
}

impl Project {
    /// Creates an empty project bound to the given key pair.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        public_key: impl Into<String>,
        private_key: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            instances: BTreeMap::new(),
            public_key: public_key.into(),
            private_key: private_key.into(),
        }
    }
}

/// Credentials for one provider account.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Driver {
    /// Provider identifier (for example `gce`).
    pub provider: String,
    /// Driver name referenced from [`Instance::driver`].
    pub name: String,
    /// Raw credential document understood by the provider.
    pub credentials: serde_json::Value,
}
