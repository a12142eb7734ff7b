//! BareMetalHost CRD
//!
//! The Metal3 inventory object for one physical server. The CRD itself is
//! owned by the bare-metal operator; the agent only reads hosts and claims
//! them for machines through `spec.consumerRef`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::references::{ConsumerReference, SecretReference};
use crate::scheme::{SchemeError, TypeRegistry};

/// API group served by the bare-metal operator
pub const METAL3_GROUP: &str = "metal3.io";

/// Version of the Metal3 API the agent requires
pub const METAL3_VERSION: &str = "v1alpha1";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "metal3.io",
    version = "v1alpha1",
    kind = "BareMetalHost",
    namespaced,
    status = "BareMetalHostStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioning.state"}"#,
    printcolumn = r#"{"name":"Consumer","type":"string","jsonPath":".spec.consumerRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalHostSpec {
    /// Whether the host should be powered on
    #[serde(default)]
    pub online: bool,

    /// Object that has claimed this host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_ref: Option<ConsumerReference>,

    /// Image to provision onto the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,

    /// Secret holding the user data for the provisioned image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<SecretReference>,

    /// Baseboard management controller connection details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmc: Option<BmcDetails>,

    /// MAC address of the NIC used for provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_mac_address: Option<String>,
}

/// Image provisioned onto a host
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Location of the image
    pub url: String,

    /// Location of the image checksum
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BmcDetails {
    /// BMC address (e.g., "ipmi://10.0.0.10")
    pub address: String,

    /// Secret holding the BMC credentials
    pub credentials_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalHostStatus {
    /// Provisioning progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<ProvisionStatus>,

    /// Whether the host is powered on
    #[serde(default)]
    pub powered_on: bool,

    /// Overall health reported by the operator ("OK", "discovered", "error")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational_status: Option<String>,

    /// Error message reported by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionStatus {
    /// Provisioning state machine position
    #[serde(default)]
    pub state: String,

    /// Provisioner-assigned identifier of the host
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl BareMetalHost {
    /// Whether the host can be claimed by a new machine
    #[must_use]
    pub fn is_available(&self) -> bool {
        if self.spec.consumer_ref.is_some() || self.metadata.deletion_timestamp.is_some() {
            return false;
        }
        if !self.can_power_on() {
            return false;
        }
        let operational = self
            .status
            .as_ref()
            .and_then(|s| s.operational_status.as_deref());
        operational != Some("error")
    }

    /// Whether the operator has BMC details to power the host on with
    #[must_use]
    pub fn can_power_on(&self) -> bool {
        self.spec
            .bmc
            .as_ref()
            .is_some_and(|bmc| !bmc.address.trim().is_empty())
    }

    /// Whether the host is consumed by the named machine
    #[must_use]
    pub fn is_consumed_by(&self, machine_name: &str, machine_namespace: &str) -> bool {
        let host_namespace = self.metadata.namespace.as_deref().unwrap_or_default();
        self.spec.consumer_ref.as_ref().is_some_and(|consumer| {
            consumer.is_machine()
                && consumer.name == machine_name
                && consumer.namespace.as_deref().unwrap_or(host_namespace) == machine_namespace
        })
    }

    /// Provisioner identifier, once assigned
    #[must_use]
    pub fn provisioning_id(&self) -> Option<&str> {
        self.status.as_ref()?.provisioning.as_ref()?.id.as_deref()
    }
}

/// Register the Metal3 kinds.
pub fn add_to_scheme(registry: &mut TypeRegistry) -> Result<(), SchemeError> {
    registry.add_resource::<BareMetalHost>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn host(consumer: Option<ConsumerReference>, operational: Option<&str>) -> BareMetalHost {
        BareMetalHost {
            metadata: ObjectMeta {
                name: Some("host-0".to_string()),
                namespace: Some("openshift-machine-api".to_string()),
                ..Default::default()
            },
            spec: BareMetalHostSpec {
                consumer_ref: consumer,
                bmc: Some(BmcDetails {
                    address: "ipmi://10.0.0.10".to_string(),
                    credentials_name: "host-0-bmc-secret".to_string(),
                }),
                ..Default::default()
            },
            status: Some(BareMetalHostStatus {
                operational_status: operational.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_unclaimed_healthy_host_is_available() {
        assert!(host(None, Some("OK")).is_available());
        assert!(host(None, None).is_available());
    }

    #[test]
    fn test_claimed_or_failed_host_is_unavailable() {
        let consumer = ConsumerReference::machine("worker-0", "openshift-machine-api");
        assert!(!host(Some(consumer), Some("OK")).is_available());
        assert!(!host(None, Some("error")).is_available());
    }

    #[test]
    fn test_host_without_bmc_is_unavailable() {
        let mut unmanaged = host(None, Some("OK"));
        unmanaged.spec.bmc = None;
        assert!(!unmanaged.can_power_on());
        assert!(!unmanaged.is_available());

        let mut blank = host(None, Some("OK"));
        blank.spec.bmc = Some(BmcDetails {
            address: " ".to_string(),
            credentials_name: "host-0-bmc-secret".to_string(),
        });
        assert!(!blank.is_available());
    }

    #[test]
    fn test_is_consumed_by_defaults_namespace() {
        let mut consumer = ConsumerReference::machine("worker-0", "ignored");
        consumer.namespace = None;
        let host = host(Some(consumer), None);
        assert!(host.is_consumed_by("worker-0", "openshift-machine-api"));
        assert!(!host.is_consumed_by("worker-1", "openshift-machine-api"));
    }
}
