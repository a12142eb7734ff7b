//! Machine CRD
//!
//! The machine-api `Machine` object: one physical machine the cluster wants
//! to exist. The provider spec is opaque at this level and decoded by
//! [`crate::BareMetalMachineProviderSpec`].

use kube::CustomResource;
use kube::core::GroupVersionKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::scheme::{SchemeError, TypeRegistry};

/// API group of the machine-api objects
pub const MACHINE_GROUP: &str = "machine.openshift.io";

/// Served version of the machine-api objects
pub const MACHINE_VERSION: &str = "v1beta1";

/// `apiVersion` string for `Machine`
pub const MACHINE_API_VERSION: &str = "machine.openshift.io/v1beta1";

/// Annotation on a `Machine` naming the host it consumes (`namespace/name`)
pub const HOST_ANNOTATION: &str = "metal3.io/BareMetalHost";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Provider-specific configuration
    #[serde(default)]
    pub provider_spec: ProviderSpec,

    /// Identifier assigned by the provider once the machine exists
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Opaque provider configuration embedded in a `Machine`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ProviderSpec {
    /// Raw provider spec object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Lifecycle phase reported by the machine controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Addresses reported by the backing host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Last time the status was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,

    /// Error message if reconciliation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    /// Address type (InternalIP, Hostname, ...)
    #[serde(rename = "type")]
    pub address_type: String,

    /// The address itself
    pub address: String,
}

impl Machine {
    /// `namespace/name` of the host recorded on this machine, if any
    #[must_use]
    pub fn host_key(&self) -> Option<(&str, &str)> {
        self.metadata
            .annotations
            .as_ref()?
            .get(HOST_ANNOTATION)?
            .split_once('/')
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
    }
}

/// Register the machine-api kinds.
pub fn add_to_scheme(registry: &mut TypeRegistry) -> Result<(), SchemeError> {
    registry.add_resource::<Machine>()?;
    registry.add_kind(
        GroupVersionKind::gvk(MACHINE_GROUP, MACHINE_VERSION, "MachineList"),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn machine_with_annotation(value: &str) -> Machine {
        Machine {
            metadata: ObjectMeta {
                name: Some("worker-0".to_string()),
                namespace: Some("openshift-machine-api".to_string()),
                annotations: Some(BTreeMap::from([(
                    HOST_ANNOTATION.to_string(),
                    value.to_string(),
                )])),
                ..Default::default()
            },
            spec: MachineSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_host_key_parses_annotation() {
        let machine = machine_with_annotation("openshift-machine-api/host-0");
        assert_eq!(machine.host_key(), Some(("openshift-machine-api", "host-0")));
    }

    #[test]
    fn test_host_key_rejects_malformed_annotation() {
        assert_eq!(machine_with_annotation("host-0").host_key(), None);
        assert_eq!(machine_with_annotation("/host-0").host_key(), None);
    }

    #[test]
    fn test_provider_id_field_name() {
        let spec = MachineSpec {
            provider_id: Some("metal3://abc".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["providerID"], "metal3://abc");
    }

    #[test]
    fn test_add_to_scheme_registers_machine_kinds() {
        let mut registry = TypeRegistry::new();
        add_to_scheme(&mut registry).unwrap();
        assert!(registry.recognizes(&crate::scheme::gvk_of::<Machine>()));
        assert!(registry.recognizes(&GroupVersionKind::gvk(
            MACHINE_GROUP,
            MACHINE_VERSION,
            "MachineList"
        )));
    }
}
