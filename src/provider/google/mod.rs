//! Google Compute Engine implementation of [`ProviderClient`].
//!
//! Every mutating call returns a zone operation which is driven to completion
//! by the [`OperationPoller`] before the normalised instance record is read
//! back. Boot disks share the instance name and are removed alongside it.

mod api;
mod auth;
mod types;

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use crate::model::{Driver, Instance};
use crate::provider::operation::{DEFAULT_MAX_CHECKS, DEFAULT_POLL_INTERVAL};
use crate::provider::{
    InstanceRef, InstanceSpec, MetadataItem, Operation, OperationKind, OperationPoller,
    ProviderClient, ProviderError, ProviderFuture,
};

use api::{GoogleApi, ZoneOperations};
use auth::{ServiceAccountKey, TokenSource};
use types::{
    AccessConfigBody, AttachedDiskBody, DEFAULT_NETWORK, EXTERNAL_NAT, InitializeParamsBody,
    InsertInstanceBody, MetadataBody, NetworkInterfaceBody, ONE_TO_ONE_NAT, os_from_image,
};

/// Provider identifier stored on drivers.
pub const PROVIDER_ID: &str = "gce";

/// Default zone for new instances.
pub const DEFAULT_ZONE: &str = "us-central1-a";

/// Default machine type for new instances.
pub const DEFAULT_MACHINE_TYPE: &str = "n1-standard-1";

/// Default boot image family.
pub const DEFAULT_IMAGE: &str = "projects/debian-cloud/global/images/family/debian-12";

/// Defaults and polling behaviour applied to every Compute Engine client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GoogleSettings {
    /// Zone used when a request does not name one.
    pub zone: String,
    /// Machine type used when a request does not name one.
    pub machine_type: String,
    /// Boot image for new instances.
    pub image: String,
    /// Delay between operation status checks.
    pub poll_interval: Duration,
    /// Operation status checks before timing out.
    pub max_poll_checks: u32,
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            zone: DEFAULT_ZONE.to_owned(),
            machine_type: DEFAULT_MACHINE_TYPE.to_owned(),
            image: DEFAULT_IMAGE.to_owned(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_checks: DEFAULT_MAX_CHECKS,
        }
    }
}

/// Compute Engine client bound to one driver.
#[derive(Debug)]
pub struct GoogleProvider {
    api: GoogleApi,
    driver: String,
    settings: GoogleSettings,
    poller: OperationPoller,
}

impl GoogleProvider {
    /// Builds a client from a driver's service-account credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Auth`] when the credentials are not a usable
    /// service-account key.
    pub fn from_driver(driver: &Driver, settings: GoogleSettings) -> Result<Self, ProviderError> {
        let key = ServiceAccountKey::from_credentials(&driver.credentials)?;
        let poller = OperationPoller::new(settings.poll_interval, settings.max_poll_checks);
        Ok(Self {
            api: GoogleApi::new(TokenSource::new(key)),
            driver: driver.name.clone(),
            settings,
            poller,
        })
    }

    /// Project the driver's credentials belong to.
    #[must_use]
    pub fn project_id(&self) -> &str {
        self.api.project_id()
    }

    fn zone_for<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested.unwrap_or(&self.settings.zone)
    }

    fn insert_body(&self, spec: &InstanceSpec, zone: &str) -> InsertInstanceBody {
        let machine_type = spec
            .machine_type
            .as_deref()
            .unwrap_or(&self.settings.machine_type);
        InsertInstanceBody {
            name: spec.name.clone(),
            machine_type: format!("zones/{zone}/machineTypes/{machine_type}"),
            network_interfaces: vec![NetworkInterfaceBody {
                network: DEFAULT_NETWORK.to_owned(),
                access_configs: vec![AccessConfigBody {
                    kind: ONE_TO_ONE_NAT.to_owned(),
                    name: EXTERNAL_NAT.to_owned(),
                }],
            }],
            disks: vec![AttachedDiskBody {
                kind: "PERSISTENT".to_owned(),
                boot: true,
                auto_delete: true,
                initialize_params: InitializeParamsBody {
                    source_image: self.settings.image.clone(),
                },
            }],
            metadata: MetadataBody {
                fingerprint: None,
                items: spec.metadata.clone(),
            },
        }
    }

    async fn settle(&self, zone: &str, operation: Operation) -> Result<Operation, ProviderError> {
        let source = ZoneOperations {
            api: &self.api,
            zone,
        };
        let finished = self
            .poller
            .wait_for(&source, operation, OperationKind::Zone)
            .await?;
        if let Some(message) = finished.error.clone() {
            return Err(ProviderError::OperationFailed {
                operation: finished.name,
                message,
            });
        }
        Ok(finished)
    }

    async fn fetch(&self, zone: &str, name: &str) -> Result<Instance, ProviderError> {
        let raw = self.api.get_instance(zone, name).await?;
        Ok(raw.normalise(&self.driver, &os_from_image(&self.settings.image)))
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance, ProviderError> {
        let zone = self.zone_for(spec.zone.as_deref());
        let body = self.insert_body(spec, zone);
        let operation = self.api.insert_instance(zone, &body).await?;
        debug!(instance = %spec.name, operation = %operation.name, "insert accepted");
        self.settle(zone, operation).await?;
        info!(instance = %spec.name, zone, "instance provisioned");
        self.fetch(zone, &spec.name).await
    }

    async fn remove_instance(&self, target: &InstanceRef) -> Result<(), ProviderError> {
        let zone = self.zone_for(target.zone.as_deref());
        let name = target.name.as_str();
        delete_with_boot_disk(name, self.delete_instance_settled(zone, name), || {
            self.delete_disk_settled(zone, name)
        })
        .await
    }

    async fn delete_instance_settled(&self, zone: &str, name: &str) -> Result<(), ProviderError> {
        let operation = self.api.delete_instance(zone, name).await?;
        self.settle(zone, operation).await.map(|_| ())
    }

    async fn delete_disk_settled(&self, zone: &str, name: &str) -> Result<(), ProviderError> {
        let operation = self.api.delete_disk(zone, name).await?;
        self.settle(zone, operation).await.map(|_| ())
    }

    async fn replace_metadata(
        &self,
        target: &InstanceRef,
        items: &[MetadataItem],
    ) -> Result<(), ProviderError> {
        let zone = self.zone_for(target.zone.as_deref());
        let current = self.api.get_instance(zone, &target.name).await?;
        let body = MetadataBody {
            fingerprint: current.metadata.fingerprint,
            items: items.to_vec(),
        };
        let operation = self.api.set_metadata(zone, &target.name, &body).await?;
        self.settle(zone, operation).await.map(|_| ())
    }
}

/// Deletes an instance, then its boot disk.
///
/// Either resource may already be gone. Any other instance failure is
/// returned before the disk is touched.
async fn delete_with_boot_disk<I, D, F>(
    name: &str,
    instance: I,
    disk: D,
) -> Result<(), ProviderError>
where
    I: Future<Output = Result<(), ProviderError>>,
    D: FnOnce() -> F,
    F: Future<Output = Result<(), ProviderError>>,
{
    match instance.await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => debug!(instance = name, "instance already removed"),
        Err(err) => return Err(err),
    }
    match disk().await {
        Err(err) if err.is_not_found() => {
            debug!(disk = name, "boot disk already removed");
            Ok(())
        }
        outcome => outcome,
    }
}

impl ProviderClient for GoogleProvider {
    fn create<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, Instance> {
        Box::pin(async move { self.create_instance(spec).await })
    }

    fn get<'a>(&'a self, target: &'a InstanceRef) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            let zone = self.zone_for(target.zone.as_deref());
            self.fetch(zone, &target.name).await
        })
    }

    fn remove<'a>(&'a self, target: &'a InstanceRef) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.remove_instance(target).await })
    }

    fn set_metadata<'a>(
        &'a self,
        target: &'a InstanceRef,
        items: &'a [MetadataItem],
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.replace_metadata(target, items).await })
    }
}

#[cfg(test)]
mod tests;
