//! Wire types for the Compute Engine v1 REST API.

use serde::{Deserialize, Serialize};

use crate::model::{Instance, Network};
use crate::provider::operation::{Operation, OperationStatus};
use crate::provider::MetadataItem;

/// Access config type requesting an ephemeral public address.
pub(crate) const ONE_TO_ONE_NAT: &str = "ONE_TO_ONE_NAT";
/// Display name of the public address access config.
pub(crate) const EXTERNAL_NAT: &str = "External NAT";
/// Network attached to new instances.
pub(crate) const DEFAULT_NETWORK: &str = "global/networks/default";

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InsertInstanceBody {
    pub(crate) name: String,
    pub(crate) machine_type: String,
    pub(crate) network_interfaces: Vec<NetworkInterfaceBody>,
    pub(crate) disks: Vec<AttachedDiskBody>,
    pub(crate) metadata: MetadataBody,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NetworkInterfaceBody {
    pub(crate) network: String,
    pub(crate) access_configs: Vec<AccessConfigBody>,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct AccessConfigBody {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AttachedDiskBody {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) boot: bool,
    pub(crate) auto_delete: bool,
    pub(crate) initialize_params: InitializeParamsBody,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializeParamsBody {
    pub(crate) source_image: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct MetadataBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) fingerprint: Option<String>,
    #[serde(default)]
    pub(crate) items: Vec<MetadataItem>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GceInstance {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) machine_type: String,
    #[serde(default)]
    pub(crate) zone: String,
    #[serde(default)]
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) network_interfaces: Vec<GceNetworkInterface>,
    #[serde(default)]
    pub(crate) disks: Vec<GceAttachedDisk>,
    #[serde(default)]
    pub(crate) metadata: MetadataBody,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GceNetworkInterface {
    #[serde(rename = "networkIP", default)]
    pub(crate) network_ip: Option<String>,
    #[serde(default)]
    pub(crate) access_configs: Vec<GceAccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GceAccessConfig {
    #[serde(rename = "natIP", default)]
    pub(crate) nat_ip: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct GceAttachedDisk {
    #[serde(default)]
    pub(crate) boot: bool,
    #[serde(default)]
    pub(crate) licenses: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct GceOperation {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) zone: Option<String>,
    pub(crate) status: OperationStatus,
    #[serde(default)]
    pub(crate) error: Option<GceOperationError>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct GceOperationError {
    #[serde(default)]
    pub(crate) errors: Vec<GceErrorDetail>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct GceErrorDetail {
    #[serde(default)]
    pub(crate) code: String,
    #[serde(default)]
    pub(crate) message: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ApiErrorEnvelope {
    pub(crate) error: ApiErrorBody,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub(crate) message: String,
}

/// Returns the final segment of a resource URL
/// (`.../zones/us-central1-a` becomes `us-central1-a`).
pub(crate) fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

impl From<GceOperation> for Operation {
    fn from(value: GceOperation) -> Self {
        let error = value.error.and_then(|details| {
            let messages: Vec<String> = details
                .errors
                .into_iter()
                .map(|detail| {
                    if detail.code.is_empty() {
                        detail.message
                    } else {
                        format!("{}: {}", detail.code, detail.message)
                    }
                })
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        });
        Self {
            name: value.name,
            zone: value.zone.map(|zone| last_segment(&zone).to_owned()),
            status: value.status,
            error,
        }
    }
}

impl GceInstance {
    /// Derives the OS label from the boot disk's first licence
    /// (`.../licenses/debian-12-bookworm` becomes `debian-12-bookworm`).
    pub(crate) fn os_label(&self) -> Option<String> {
        self.disks
            .iter()
            .find(|disk| disk.boot)
            .and_then(|disk| disk.licenses.first())
            .map(|licence| last_segment(licence).to_owned())
    }

    /// Converts the provider record into the normalised instance shape.
    pub(crate) fn normalise(self, driver: &str, fallback_os: &str) -> Instance {
        let os = self.os_label().unwrap_or_else(|| fallback_os.to_owned());
        let primary = self.network_interfaces.into_iter().next();
        let network = primary.map_or_else(Network::default, |interface| Network {
            internal_ip: interface.network_ip,
            external_ip: interface
                .access_configs
                .into_iter()
                .next()
                .and_then(|config| config.nat_ip),
        });
        Instance {
            machine_type: last_segment(&self.machine_type).to_owned(),
            zone: last_segment(&self.zone).to_owned(),
            name: self.name,
            driver: driver.to_owned(),
            status: self.status,
            os,
            network,
        }
    }
}

/// Derives an OS label from an image path
/// (`projects/debian-cloud/global/images/family/debian-12` becomes `debian-12`).
pub(crate) fn os_from_image(image: &str) -> String {
    last_segment(image).to_owned()
}
