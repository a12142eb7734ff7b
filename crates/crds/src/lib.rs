//! Bare-metal Machine CRD Definitions
//!
//! Kubernetes types consumed by the bare-metal machine controller, plus the
//! type registry the controller builds before attaching any watches.

pub mod bare_metal_host;
pub mod machine;
pub mod provider_spec;
pub mod references;
pub mod scheme;

pub use bare_metal_host::{
    BareMetalHost, BareMetalHostSpec, BareMetalHostStatus, BmcDetails, Image, METAL3_GROUP,
    METAL3_VERSION, ProvisionStatus,
};
pub use machine::{
    HOST_ANNOTATION, MACHINE_API_VERSION, MACHINE_GROUP, MACHINE_VERSION, Machine, MachineAddress,
    MachineSpec, MachineStatus, ProviderSpec,
};
pub use provider_spec::{BareMetalMachineProviderSpec, HostSelector, PROVIDER_GROUP, PROVIDER_VERSION};
pub use references::{ConsumerReference, SecretReference};
pub use scheme::{
    RegisteredKind, SchemeBuilder, SchemeError, TypeRegistry, describe, gvk_of, register_schemes,
};

/// Scheme builders for every API group the controller reads or writes.
pub const SCHEME_BUILDERS: [SchemeBuilder; 3] = [
    provider_spec::add_to_scheme,
    machine::add_to_scheme,
    bare_metal_host::add_to_scheme,
];
