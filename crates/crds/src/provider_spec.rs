//! Bare-metal provider spec
//!
//! Embedded inside `Machine.spec.providerSpec.value`. Not a served resource,
//! so it is registered without a plural.

use std::collections::BTreeMap;

use kube::core::GroupVersionKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::bare_metal_host::Image;
use crate::machine::Machine;
use crate::references::SecretReference;
use crate::scheme::{SchemeError, TypeRegistry};

/// API group of the provider spec kinds
pub const PROVIDER_GROUP: &str = "baremetal.cluster.k8s.io";

/// Version of the provider spec kinds
pub const PROVIDER_VERSION: &str = "v1alpha1";

/// Provider configuration for a bare-metal `Machine`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalMachineProviderSpec {
    /// Image to provision onto the claimed host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,

    /// Secret holding user data for the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<SecretReference>,

    /// Constraints on which hosts may be claimed
    #[serde(default)]
    pub host_selector: HostSelector,
}

/// Label constraints on claimable hosts
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostSelector {
    /// Labels a host must carry with exactly these values
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl HostSelector {
    /// Whether a label set satisfies the selector
    #[must_use]
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.and_then(|l| l.get(key)) == Some(value))
    }
}

impl BareMetalMachineProviderSpec {
    /// Decode the provider spec embedded in a machine.
    ///
    /// A machine without a provider spec decodes to the default spec.
    pub fn from_machine(machine: &Machine) -> Result<Self, serde_json::Error> {
        match &machine.spec.provider_spec.value {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(Self::default()),
        }
    }
}

/// Register the provider spec kinds.
pub fn add_to_scheme(registry: &mut TypeRegistry) -> Result<(), SchemeError> {
    for kind in ["BareMetalMachineProviderSpec", "BareMetalMachineProviderStatus"] {
        registry.add_kind(
            GroupVersionKind::gvk(PROVIDER_GROUP, PROVIDER_VERSION, kind),
            None,
        )?;
    }
    Ok(())
}
