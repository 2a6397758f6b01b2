use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{PersistentVolumeClaim, Service},
};
use kube::{
    runtime::{
        controller::Action,
        events::{Event, EventType, Recorder, Reporter},
    },
    Client, Resource, ResourceExt,
};
use serde_json::json;
use tracing::{info, instrument};

use crate::{
    cluster::{
        create_or_update, is_already_exists, set_controller_reference, ClusterApi,
        OperationResult,
    },
    naming::finalizer_name,
    resources::ObjectStore,
    Error, Result,
};

use super::{spec, Reconcile};

/// Phase reported once every resource of a store has converged
pub const PHASE_READY: &str = "Ready";

/// Finalizer token held by every active `ObjectStore`
pub fn finalizer() -> String {
    finalizer_name(&ObjectStore::kind(&()), &ObjectStore::group(&()))
}

/// Work to do before the finalizer of a deleted `ObjectStore` is dropped.
///
/// Owned resources are removed by the garbage collector afterwards; a hook
/// only needs to release state living outside of the cluster.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn cleanup(&self, store: &ObjectStore) -> Result<()>;
}

/// Cleanup for gateways that keep all of their state on their own volume.
///
/// Nothing needs releasing, so this only records the deletion as an event.
pub struct EventCleanup {
    client: Client,
    reporter: Reporter,
}

impl EventCleanup {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl CleanupHook for EventCleanup {
    async fn cleanup(&self, store: &ObjectStore) -> Result<()> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            store.object_ref(&()),
        );

        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", store.name_any())),
                action: "Deleting".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)
    }
}

/// Outcome of one pass over the resources of an active store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Convergence {
    /// `Unchanged` when the claim already existed
    pub claim: OperationResult,
    pub service: OperationResult,
    /// Address assigned to the gateway service
    pub cluster_ip: Option<String>,
    pub deployment: OperationResult,
}

/// Drives the claim, service and deployment of each `ObjectStore`
pub struct ObjectStoreReconciler<C, H> {
    cluster: C,
    cleanup: H,
}

impl<C, H> ObjectStoreReconciler<C, H>
where
    C: ClusterApi,
    H: CleanupHook,
{
    pub fn new(cluster: C, cleanup: H) -> Self {
        Self { cluster, cleanup }
    }

    /// Release a deleted store, then let the store finish deleting it.
    async fn finalize(&self, mut store: ObjectStore, finalizer: &str) -> Result<Action> {
        let name = store.name_any();

        // Without our finalizer the cleanup already ran
        if store.finalizers().iter().any(|f| f == finalizer) {
            self.cleanup
                .cleanup(&store)
                .await
                .map_err(Error::in_step("cleanup"))?;

            store.finalizers_mut().retain(|f| f != finalizer);
            self.cluster
                .replace(&store.require_namespace()?, &store)
                .await
                .map_err(Error::store::<ObjectStore>("remove finalizer from", &name))
                .map_err(Error::in_step("finalizer"))?;
        }

        info!(r#"Successfully deleted ObjectStore "{name}""#);
        Ok(Action::await_change())
    }

    /// Converge every resource of an active store, in order.
    pub(crate) async fn apply(&self, store: ObjectStore, finalizer: &str) -> Result<Convergence> {
        let store = self
            .ensure_finalizer(store, finalizer)
            .await
            .map_err(Error::in_step("finalizer"))?;

        // The deployment mounts the claim, so it goes first
        let claim = self
            .converge_claim(&store)
            .await
            .map_err(Error::in_step("claim"))?;

        let (service, cluster_ip) = self
            .converge_service(&store)
            .await
            .map_err(Error::in_step("service"))?;

        let deployment = self
            .converge_deployment(&store)
            .await
            .map_err(Error::in_step("deployment"))?;
        info!("Gateway deployment {deployment}");

        self.report_phase(&store, PHASE_READY)
            .await
            .map_err(Error::in_step("status"))?;

        Ok(Convergence {
            claim,
            service,
            cluster_ip,
            deployment,
        })
    }

    async fn ensure_finalizer(&self, mut store: ObjectStore, finalizer: &str) -> Result<ObjectStore> {
        if store.finalizers().iter().any(|f| f == finalizer) {
            return Ok(store);
        }

        let name = store.name_any();
        store.finalizers_mut().push(finalizer.to_string());
        self.cluster
            .replace(&store.require_namespace()?, &store)
            .await
            .map_err(Error::store::<ObjectStore>("add finalizer to", &name))
    }

    /// Create the claim once; it is never touched again afterwards.
    async fn converge_claim(&self, store: &ObjectStore) -> Result<OperationResult> {
        let mut claim = spec::claim(store)?;
        set_controller_reference(store, &mut claim)?;
        let name = claim.name_any();

        match self.cluster.create(&store.require_namespace()?, &claim).await {
            Ok(_) => {
                info!(r#"Successfully provisioned PVC "{name}""#);
                Ok(OperationResult::Created)
            }
            Err(e) if is_already_exists(&e) => {
                info!(r#"PVC "{name}" already exists"#);
                Ok(OperationResult::Unchanged)
            }
            Err(e) => Err(Error::store::<PersistentVolumeClaim>("create", &name)(e)),
        }
    }

    async fn converge_service(
        &self,
        store: &ObjectStore,
    ) -> Result<(OperationResult, Option<String>)> {
        let mut service = spec::service(store)?;
        set_controller_reference(store, &mut service)?;

        let (service, result) = create_or_update(&self.cluster, service, |service: &mut Service| {
            set_controller_reference(store, service)?;
            service.labels_mut().extend(store.selector_labels());
            spec::apply_service_spec(store, service.spec.get_or_insert_with(Default::default));
            Ok(())
        })
        .await?;

        let cluster_ip = service.spec.and_then(|spec| spec.cluster_ip);
        info!(
            "Object store gateway service {result} at {}",
            cluster_ip.as_deref().unwrap_or("<pending>")
        );

        Ok((result, cluster_ip))
    }

    async fn converge_deployment(&self, store: &ObjectStore) -> Result<OperationResult> {
        let mut deployment = spec::deployment(store)?;
        set_controller_reference(store, &mut deployment)?;

        let (_, result) = create_or_update(&self.cluster, deployment, |deployment: &mut Deployment| {
            set_controller_reference(store, deployment)?;
            deployment.labels_mut().extend(store.selector_labels());
            spec::apply_deployment_spec(store, deployment.spec.get_or_insert_with(Default::default))
        })
        .await?;

        Ok(result)
    }

    async fn report_phase(&self, store: &ObjectStore, phase: &str) -> Result<()> {
        let current = store.status.as_ref().map(|status| status.phase.as_str());
        if current == Some(phase) {
            return Ok(());
        }

        let name = store.name_any();
        self.cluster
            .patch_status::<ObjectStore>(&store.require_namespace()?, &name, json!({ "phase": phase }))
            .await
            .map_err(Error::store::<ObjectStore>("update status of", &name))?;

        Ok(())
    }
}

#[async_trait]
impl<C, H> Reconcile for ObjectStoreReconciler<C, H>
where
    C: ClusterApi,
    H: CleanupHook,
{
    #[instrument(skip(self))]
    async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        info!(r#"Reconciling ObjectStore "{namespace}/{name}""#);

        let Some(store) = self
            .cluster
            .get::<ObjectStore>(namespace, name)
            .await
            .map_err(Error::store::<ObjectStore>("get", name))?
        else {
            info!(r#"ObjectStore "{namespace}/{name}" not found, it must have been deleted"#);
            return Ok(Action::await_change());
        };

        let finalizer = finalizer();
        if store.meta().deletion_timestamp.is_some() {
            return self.finalize(store, &finalizer).await;
        }

        self.apply(store, &finalizer).await?;
        info!(r#"Successfully reconciled ObjectStore "{namespace}/{name}""#);

        // Check back every hour in case we missed a change
        Ok(Action::requeue(Duration::from_secs(60 * 60)))
    }
}
