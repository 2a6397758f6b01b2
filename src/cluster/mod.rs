use std::fmt::{self, Debug, Display};

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

mod client;
#[cfg(test)]
pub(crate) mod memory;

pub use client::KubeCluster;

/// Field manager used for every write issued by the operator
pub const MANAGER: &str = "object-store-operator";

/// A namespaced object the reconcilers can read and write
pub trait ClusterResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// The slice of the cluster API store consumed by the reconcilers.
///
/// Calls are single round trips and are never retried here: failures go back
/// to the controller runtime, which owns the retry policy.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch an object, `None` when it does not exist.
    async fn get<K: ClusterResource>(&self, namespace: &str, name: &str)
        -> Result<Option<K>, kube::Error>;

    /// Create an object. An existing object surfaces as an `AlreadyExists` api error.
    async fn create<K: ClusterResource>(&self, namespace: &str, object: &K)
        -> Result<K, kube::Error>;

    /// Replace an object, guarded by its resource version.
    async fn replace<K: ClusterResource>(&self, namespace: &str, object: &K)
        -> Result<K, kube::Error>;

    /// Merge `status` into the status subresource of an object.
    async fn patch_status<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<K, kube::Error>;
}

/// What `create_or_update` ended up doing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
    Unchanged,
    Created,
    Updated,
}

impl Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationResult::Unchanged => write!(f, "unchanged"),
            OperationResult::Created => write!(f, "created"),
            OperationResult::Updated => write!(f, "updated"),
        }
    }
}

pub fn is_already_exists(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.reason == "AlreadyExists")
}

/// Fetch the current version of `object` (or start from `object` itself when it
/// does not exist yet), apply `mutate` and write the result back only if it changed.
///
/// `mutate` must be a pure function of its input and the desired state so that
/// every call recomputes the same target.
pub async fn create_or_update<C, K, F>(
    cluster: &C,
    object: K,
    mutate: F,
) -> Result<(K, OperationResult)>
where
    C: ClusterApi + ?Sized,
    K: ClusterResource,
    F: FnOnce(&mut K) -> Result<()> + Send,
{
    let kind = K::kind(&()).to_string();
    let name = object.meta().name.clone().ok_or_else(|| Error::MissingField {
        kind: kind.clone(),
        field: "metadata.name",
    })?;
    let namespace = object.namespace().ok_or_else(|| Error::MissingField {
        kind: kind.clone(),
        field: "metadata.namespace",
    })?;

    let current = cluster
        .get::<K>(&namespace, &name)
        .await
        .map_err(Error::store::<K>("get", &name))?;

    match current {
        None => {
            let mut object = object;
            mutate(&mut object)?;
            ensure_identity(&object, &kind, &name, &namespace)?;

            let created = cluster
                .create(&namespace, &object)
                .await
                .map_err(Error::store::<K>("create", &name))?;
            Ok((created, OperationResult::Created))
        }
        Some(mut existing) => {
            let before = serde_json::to_value(&existing)?;
            mutate(&mut existing)?;
            ensure_identity(&existing, &kind, &name, &namespace)?;

            if serde_json::to_value(&existing)? == before {
                return Ok((existing, OperationResult::Unchanged));
            }

            let updated = cluster
                .replace(&namespace, &existing)
                .await
                .map_err(Error::store::<K>("update", &name))?;
            Ok((updated, OperationResult::Updated))
        }
    }
}

fn ensure_identity<K: ClusterResource>(
    object: &K,
    kind: &str,
    name: &str,
    namespace: &str,
) -> Result<()> {
    if object.meta().name.as_deref() != Some(name)
        || object.meta().namespace.as_deref() != Some(namespace)
    {
        return Err(Error::MutatedIdentity {
            kind: kind.to_string(),
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Make `owner` the managing controller of `dependent`.
///
/// The garbage collector removes `dependent` once `owner` is gone. Fails when
/// another controller already owns `dependent` or the two live in different
/// namespaces.
pub fn set_controller_reference<O, K>(owner: &O, dependent: &mut K) -> Result<()>
where
    O: Resource<DynamicType = ()>,
    K: Resource<DynamicType = ()>,
{
    let fail = |reason: String| Error::OwnerReference {
        kind: K::kind(&()).to_string(),
        name: dependent.meta().name.clone().unwrap_or_default(),
        reason,
    };

    let owner_ref = owner
        .controller_owner_ref(&())
        .ok_or_else(|| fail("owner has no name or uid".into()))?;

    if dependent.meta().namespace.is_some() && owner.meta().namespace != dependent.meta().namespace
    {
        return Err(fail("cross-namespace owner references are disallowed".into()));
    }

    let references = dependent.meta().owner_references.clone().unwrap_or_default();
    if let Some(other) = references
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != owner_ref.uid)
    {
        return Err(fail(format!(
            "already owned by another controller {} {:?}",
            other.kind, other.name
        )));
    }

    let references = dependent
        .meta_mut()
        .owner_references
        .get_or_insert_with(Vec::new);
    match references
        .iter_mut()
        .find(|r| r.kind == owner_ref.kind && r.name == owner_ref.name)
    {
        Some(existing) => *existing = owner_ref,
        None => references.push(owner_ref),
    }

    Ok(())
}
