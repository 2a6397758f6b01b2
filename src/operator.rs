use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{PersistentVolumeClaim, Service},
};
use kube::{
    api::ListParams,
    runtime::{controller::Action, events::Reporter, watcher::Config, Controller},
    Api, Client, ResourceExt,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, field, info, instrument, warn, Span};

use crate::{
    cluster::KubeCluster,
    config::OperatorConfig,
    reconcilers::{
        bucket::{BucketReconciler, GatewayBuckets},
        object_store::{EventCleanup, ObjectStoreReconciler},
        Context, Reconcile,
    },
    resources::ObjectStore,
    telemetry, Error, Metrics, Result,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "object-store-operator".into(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    fn to_context<R>(&self, reconciler: R, metrics: Metrics) -> Arc<Context<R>> {
        Arc::new(Context {
            reconciler,
            diagnostics: self.diagnostics.clone(),
            metrics,
        })
    }
}

/// Runs the gateway engine and the bucket provisioner over every `ObjectStore`
pub struct ObjectStoreController {
    state: State,
    config: OperatorConfig,
}

impl ObjectStoreController {
    pub fn new(state: State, config: OperatorConfig) -> Self {
        Self { state, config }
    }

    /// Initialize the controllers and shared state (given the crd is installed).
    ///
    /// Returns once both controllers shut down; the bucket provisioner stops
    /// when `token` is cancelled.
    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        // Get a k8s client for communicating with the cluster
        let client = Client::try_default()
            .await
            .context("failed to create kube Client")?;

        let stores = Api::<ObjectStore>::all(client.clone());

        // Test that we can actually query for our CRD (a.k.a. it is installed)
        if let Err(e) = stores.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            anyhow::bail!("ObjectStore CRD is not queryable");
        }

        let metrics = Metrics::new(&self.state.registry)?;
        let reporter = self.state.diagnostics.read().await.reporter.clone();

        let engine = ObjectStoreReconciler::new(
            KubeCluster::new(client.clone()),
            EventCleanup::new(client.clone(), reporter),
        );
        let buckets = BucketReconciler::new(
            GatewayBuckets::new(
                client.clone(),
                self.config.provisioner_name.clone(),
                self.config.watch_namespace.clone(),
            ),
            token,
        );

        // Owned resources wake up the store they belong to
        let watching_config = Config::default().page_size(50).any_semantic();
        let engine = Controller::new(stores.clone(), watching_config.clone())
            .owns(Api::<PersistentVolumeClaim>::all(client.clone()), watching_config.clone())
            .owns(Api::<Service>::all(client.clone()), watching_config.clone())
            .owns(Api::<Deployment>::all(client), watching_config.clone())
            .shutdown_on_signal()
            .run(
                reconcile,
                error_policy,
                self.state.to_context(engine, metrics.clone()),
            )
            .filter_map(|x| async move { Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

        let buckets = Controller::new(stores, watching_config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.state.to_context(buckets, metrics))
            .filter_map(|x| async move { Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

        tokio::join!(engine, buckets);
        Ok(())
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM
pub async fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                warn!("unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
    token.cancel();
}

/// Error handler for failed reconciliations
fn error_policy<R>(store: Arc<ObjectStore>, error: &Error, ctx: Arc<Context<R>>) -> Action {
    error!("reconcile failed: {error}");
    ctx.metrics.reconcile_failure(&store, error);
    Action::requeue(Duration::from_secs(5))
}

/// Entry point shared by every `ObjectStore` controller
#[instrument(skip(ctx, store), fields(trace_id))]
async fn reconcile<R: Reconcile>(store: Arc<ObjectStore>, ctx: Arc<Context<R>>) -> Result<Action> {
    // Add some tracing for debugging's sake
    let trace_id = telemetry::get_trace_id();

    // Take some metrics to see the average reconcile time
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = if ctx.reconciler.measured() {
        Some(ctx.metrics.count_and_measure())
    } else {
        ctx.metrics.count();
        None
    };
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = store.name_any();
    let namespace = store
        .namespace()
        .ok_or_else(|| Error::IllegalObjectStore(name.clone(), "missing namespace".into()))?;

    info!(r#"Starting ObjectStore reconciliation for "{namespace}/{name}""#);
    ctx.reconciler.reconcile(&namespace, &name).await
}
