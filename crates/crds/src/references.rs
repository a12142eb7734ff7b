//! Object references shared between Machine and BareMetalHost
//!
//! Follows the Kubernetes `ObjectReference` shape (apiVersion, kind, name,
//! namespace) restricted to the fields the agent reads and writes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference from a `BareMetalHost` to the object consuming it
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerReference {
    /// API version of the consumer (e.g., "machine.openshift.io/v1beta1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the consumer (e.g., "Machine")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name of the consumer
    pub name: String,

    /// Namespace of the consumer (defaults to the host's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ConsumerReference {
    /// Reference a `Machine` by name and namespace
    pub fn machine(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_version: Some(crate::machine::MACHINE_API_VERSION.to_string()),
            kind: Some("Machine".to_string()),
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Whether this reference points at a `Machine`
    #[must_use]
    pub fn is_machine(&self) -> bool {
        self.kind.as_deref() == Some("Machine")
    }
}

/// Reference to a `Secret`, used for host user data
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the secret
    pub name: String,

    /// Namespace of the secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}
