//! Runtime type registry
//!
//! The `TypeRegistry` is the merged set of object kinds the agent can
//! decode and reconcile. Each API group contributes its kinds through a
//! `SchemeBuilder`; controllers are only attached once every kind they
//! read or write is present.

use std::collections::HashMap;

use kube::Resource;
use kube::core::GroupVersionKind;
use thiserror::Error;

/// Errors raised while merging kinds into a [`TypeRegistry`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemeError {
    /// The same kind was registered twice with a different resource name
    #[error("kind {kind} already registered as {existing:?}, refusing {requested:?}")]
    Conflict {
        /// `group/version, Kind=...` description of the kind
        kind: String,
        /// Plural already in the registry
        existing: Option<String>,
        /// Plural that was rejected
        requested: Option<String>,
    },

    /// The kind is missing a version or kind name
    #[error("invalid kind: {0}")]
    InvalidKind(String),
}

/// What the registry knows about a registered kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredKind {
    /// Plural resource name when the kind is served by the API server.
    /// Embedded kinds (list types, provider specs) carry `None`.
    pub plural: Option<String>,
}

/// Signature shared by every per-group registration function.
pub type SchemeBuilder = fn(&mut TypeRegistry) -> Result<(), SchemeError>;

/// Merged set of known object kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeRegistry {
    kinds: HashMap<GroupVersionKind, RegisteredKind>,
}

impl TypeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kind by its group/version/kind triple.
    ///
    /// Adding an identical entry again is a no-op.
    pub fn add_kind(
        &mut self,
        gvk: GroupVersionKind,
        plural: Option<&str>,
    ) -> Result<(), SchemeError> {
        if gvk.kind.is_empty() || gvk.version.is_empty() {
            return Err(SchemeError::InvalidKind(describe(&gvk)));
        }

        let requested = RegisteredKind {
            plural: plural.map(str::to_string),
        };

        match self.kinds.get(&gvk) {
            Some(existing) if *existing == requested => Ok(()),
            Some(existing) => Err(SchemeError::Conflict {
                kind: describe(&gvk),
                existing: existing.plural.clone(),
                requested: requested.plural,
            }),
            None => {
                self.kinds.insert(gvk, requested);
                Ok(())
            }
        }
    }

    /// Add a statically typed resource (anything deriving `CustomResource`
    /// or a `k8s-openapi` type).
    pub fn add_resource<K>(&mut self) -> Result<(), SchemeError>
    where
        K: Resource<DynamicType = ()>,
    {
        let plural = K::plural(&()).into_owned();
        self.add_kind(gvk_of::<K>(), Some(&plural))
    }

    /// Whether the kind has been registered
    #[must_use]
    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains_key(gvk)
    }

    /// Look up a registered kind
    #[must_use]
    pub fn get(&self, gvk: &GroupVersionKind) -> Option<&RegisteredKind> {
        self.kinds.get(gvk)
    }

    /// Plural resource name of a served kind
    #[must_use]
    pub fn plural(&self, gvk: &GroupVersionKind) -> Option<&str> {
        self.get(gvk)?.plural.as_deref()
    }

    /// Number of registered kinds
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether nothing has been registered yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Registered kinds sorted by group, version and kind
    #[must_use]
    pub fn kinds(&self) -> Vec<&GroupVersionKind> {
        let mut kinds: Vec<_> = self.kinds.keys().collect();
        kinds.sort_by(|a, b| {
            (&a.group, &a.version, &a.kind).cmp(&(&b.group, &b.version, &b.kind))
        });
        kinds
    }
}

/// Apply every builder in turn, stopping at the first failure.
///
/// Builders contribute disjoint kinds, so the order only decides which
/// error is reported when more than one would fail.
pub fn register_schemes(
    registry: &mut TypeRegistry,
    builders: &[SchemeBuilder],
) -> Result<(), SchemeError> {
    for builder in builders {
        builder(registry)?;
    }
    Ok(())
}

/// Group/version/kind of a statically typed resource
#[must_use]
pub fn gvk_of<K>() -> GroupVersionKind
where
    K: Resource<DynamicType = ()>,
{
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Human readable `group/version, Kind=kind` form
#[must_use]
pub fn describe(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}, Kind={}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
    }
}
