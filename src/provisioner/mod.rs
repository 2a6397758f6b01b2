//! Bucket provisioning for `ObjectBucketClaim`s.
//!
//! A `BucketController` watches claims, picks the ones whose storage class
//! names its provisioner and hands them to a `Provisioner`, which knows how to
//! create or grant buckets on a particular object store.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::{core::v1::ConfigMap, storage::v1::StorageClass};
use kube::{
    api::{Patch, PatchParams},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
        Controller,
    },
    Api, Client, Resource, ResourceExt,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    cluster::MANAGER,
    meta,
    resources::{ClaimPhase, ObjectBucketClaim},
    Error, Result,
};

/// Finalizer held by every claim a bucket was provisioned for
pub const CLAIM_FINALIZER: &str = "objectbucket.io/finalizer";

/// What a provisioner needs to know about a claimed bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketOptions {
    pub claim_name: String,
    pub claim_namespace: String,

    /// Name of the bucket, generated for new buckets
    pub bucket_name: String,

    /// Parameters of the claim's storage class
    pub parameters: BTreeMap<String, String>,
}

/// A bucket handed out to a claim, along with where to reach it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectBucket {
    pub bucket_name: String,
    pub host: String,
    pub port: i32,
}

impl ObjectBucket {
    /// Connection settings published to the claim's namespace
    pub fn connection_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("BUCKET_HOST".to_string(), self.host.clone()),
            ("BUCKET_PORT".to_string(), self.port.to_string()),
            ("BUCKET_NAME".to_string(), self.bucket_name.clone()),
        ])
    }
}

/// The operations an object store exposes to the bucket controller
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Create a new bucket.
    async fn provision(&self, options: &BucketOptions) -> Result<ObjectBucket>;

    /// Give access to an existing bucket.
    async fn grant(&self, options: &BucketOptions) -> Result<ObjectBucket>;

    /// Delete a bucket created by `provision`.
    async fn delete(&self, options: &BucketOptions) -> Result<()>;

    /// Take back access given by `grant`.
    async fn revoke(&self, options: &BucketOptions) -> Result<()>;
}

/// How a claim asks for its bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimedBucket {
    /// A new bucket, to be provisioned
    Greenfield(String),
    /// An existing bucket, to be granted
    Brownfield(String),
}

impl ClaimedBucket {
    pub fn from_claim(claim: &ObjectBucketClaim) -> Result<Self> {
        let illegal = |reason: &str| Error::IllegalBucketClaim(claim.name_any(), reason.into());

        if let Some(bucket) = claim.spec.bucket_name.as_ref().filter(|b| !b.is_empty()) {
            return Ok(ClaimedBucket::Brownfield(bucket.clone()));
        }

        let prefix = claim
            .spec
            .generate_bucket_name
            .as_ref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| illegal("one of bucketName or generateBucketName is required"))?;

        // Bound claims keep the name they were given
        if let Some(bound) = claim.status.as_ref().and_then(|s| s.bucket_name.clone()) {
            return Ok(ClaimedBucket::Greenfield(bound));
        }

        // Derived from the claim so that retries land on the same bucket
        let uid = claim
            .uid()
            .ok_or_else(|| illegal("claim has no uid yet"))?;
        let suffix: String = uid.chars().filter(|c| *c != '-').take(8).collect();
        Ok(ClaimedBucket::Greenfield(format!("{prefix}-{suffix}")))
    }

    pub fn bucket_name(&self) -> &str {
        match self {
            ClaimedBucket::Greenfield(name) | ClaimedBucket::Brownfield(name) => name,
        }
    }
}

/// Serves the bucket claims of one provisioner
pub struct BucketController<P> {
    client: Client,
    provisioner_name: String,
    provisioner: P,
    namespace: Option<String>,
}

impl<P: Provisioner> BucketController<P> {
    /// A controller for `provisioner_name`, scoped to `namespace` (all namespaces when empty).
    pub fn new(
        client: Client,
        provisioner_name: impl Into<String>,
        provisioner: P,
        namespace: &str,
    ) -> Self {
        Self {
            client,
            provisioner_name: provisioner_name.into(),
            provisioner,
            namespace: Some(namespace.to_string()).filter(|ns| !ns.is_empty()),
        }
    }

    /// Serve claims until `token` is cancelled.
    ///
    /// Returns an error if the watch stops on its own.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        fn error_policy<P>(
            claim: Arc<ObjectBucketClaim>,
            error: &Error,
            _: Arc<BucketController<P>>,
        ) -> Action {
            warn!(r#"Bucket claim "{}" failed: {error}"#, claim.name_any());
            Action::requeue(Duration::from_secs(15))
        }

        let claims = match &self.namespace {
            Some(namespace) => Api::<ObjectBucketClaim>::namespaced(self.client.clone(), namespace),
            None => Api::<ObjectBucketClaim>::all(self.client.clone()),
        };
        info!(
            provisioner = %self.provisioner_name,
            namespace = %self.namespace.as_deref().unwrap_or("<all>"),
            "Starting bucket provisioner"
        );

        let claim_loop = Controller::new(claims, Config::default().any_semantic())
            .run(reconcile_claim::<P>, error_policy::<P>, Arc::new(self))
            .for_each(|_| futures::future::ready(()));

        tokio::select! {
            _ = token.cancelled() => {
                info!("Bucket provisioner stopped");
                Ok(())
            }
            _ = claim_loop => Err(Error::BucketController("claim watch ended".into())),
        }
    }

    /// Provision or grant the bucket of a claim and publish its connection.
    async fn bind(&self, claim: Arc<ObjectBucketClaim>, options: BucketOptions) -> Result<Action> {
        let status = claim.status.clone().unwrap_or_default();
        if status.phase == ClaimPhase::Bound {
            return Ok(Action::await_change());
        }

        let bucket = match ClaimedBucket::from_claim(&claim)? {
            ClaimedBucket::Greenfield(_) => self.provisioner.provision(&options).await?,
            ClaimedBucket::Brownfield(_) => self.provisioner.grant(&options).await?,
        };

        let name = claim.name_any();
        let owner = claim.controller_owner_ref(&()).ok_or_else(|| {
            Error::IllegalBucketClaim(name.clone(), "claim has no uid yet".into())
        })?;
        let connection = ConfigMap {
            metadata: meta! {
                name: Some(name.clone()),
                namespace: Some(options.claim_namespace.clone()),
                owner_references: Some(vec![owner])
            },
            data: Some(bucket.connection_data()),
            ..Default::default()
        };

        let params = PatchParams::apply(MANAGER);
        Api::<ConfigMap>::namespaced(self.client.clone(), &options.claim_namespace)
            .patch(&name, &params, &Patch::Apply(connection))
            .await
            .map_err(Error::store::<ConfigMap>("apply", &name))?;

        let new_status = Patch::Apply(json!({
            "apiVersion": ObjectBucketClaim::api_version(&()),
            "kind": ObjectBucketClaim::kind(&()),
            "status": {
                "phase": ClaimPhase::Bound,
                "bucketName": bucket.bucket_name,
            },
        }));
        Api::<ObjectBucketClaim>::namespaced(self.client.clone(), &options.claim_namespace)
            .patch_status(&name, &params.force(), &new_status)
            .await
            .map_err(Error::store::<ObjectBucketClaim>("update status of", &name))?;

        info!(r#"Bound bucket "{}" to claim "{name}""#, bucket.bucket_name);
        Ok(Action::await_change())
    }

    /// Give back the bucket of a deleted claim.
    async fn release(&self, claim: Arc<ObjectBucketClaim>, options: BucketOptions) -> Result<Action> {
        match ClaimedBucket::from_claim(&claim)? {
            ClaimedBucket::Greenfield(_) => self.provisioner.delete(&options).await?,
            ClaimedBucket::Brownfield(_) => self.provisioner.revoke(&options).await?,
        }

        info!(r#"Released bucket "{}" of claim "{}""#, options.bucket_name, claim.name_any());
        Ok(Action::await_change())
    }
}

#[instrument(skip(claim, ctx), fields(claim = %claim.name_any()))]
async fn reconcile_claim<P: Provisioner>(
    claim: Arc<ObjectBucketClaim>,
    ctx: Arc<BucketController<P>>,
) -> Result<Action> {
    let name = claim.name_any();
    let namespace = claim
        .namespace()
        .ok_or_else(|| Error::IllegalBucketClaim(name.clone(), "missing namespace".into()))?;

    let class_name = &claim.spec.storage_class_name;
    let class = Api::<StorageClass>::all(ctx.client.clone())
        .get_opt(class_name)
        .await
        .map_err(Error::store::<StorageClass>("get", class_name))?;

    // A claim holding our finalizer is released even once its class is gone or changed
    let releasing = claim.meta().deletion_timestamp.is_some()
        && claim.finalizers().iter().any(|f| f == CLAIM_FINALIZER);
    let parameters = match class {
        Some(class) if class.provisioner == ctx.provisioner_name => {
            class.parameters.unwrap_or_default()
        }
        _ if releasing => BTreeMap::new(),
        // Claims of other provisioners are none of our business
        Some(_) => return Ok(Action::await_change()),
        None => {
            warn!(r#"Storage class "{class_name}" of claim "{namespace}/{name}" not found"#);
            return Ok(Action::requeue(Duration::from_secs(60)));
        }
    };

    let options = BucketOptions {
        claim_name: name,
        claim_namespace: namespace.clone(),
        bucket_name: ClaimedBucket::from_claim(&claim)?.bucket_name().to_string(),
        parameters,
    };

    let claims = Api::<ObjectBucketClaim>::namespaced(ctx.client.clone(), &namespace);
    finalizer(&claims, CLAIM_FINALIZER, claim, |event| async {
        match event {
            Finalizer::Apply(claim) => ctx.bind(claim, options).await,
            Finalizer::Cleanup(claim) => ctx.release(claim, options).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}
