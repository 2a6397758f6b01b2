use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kube::{runtime::controller::Action, Client};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    naming::instance_name,
    provisioner::{BucketController, BucketOptions, ObjectBucket, Provisioner},
    Error, Result,
};

use super::{spec::SERVICE_PORT, Reconcile};

/// Storage class parameter naming the `ObjectStore` serving its buckets
pub const STORE_NAME_PARAM: &str = "objectStoreName";

/// Storage class parameter naming the namespace of that store, defaults to the claim's
pub const STORE_NAMESPACE_PARAM: &str = "objectStoreNamespace";

/// Hands out buckets of the gateway deployed for an `ObjectStore`
#[derive(Clone, Copy, Debug, Default)]
pub struct GatewayProvisioner;

impl GatewayProvisioner {
    /// Where the claimed bucket can be reached
    pub fn endpoint(&self, options: &BucketOptions) -> Result<ObjectBucket> {
        let param = |key: &str| options.parameters.get(key).filter(|v| !v.is_empty());

        let name = param(STORE_NAME_PARAM).ok_or_else(|| {
            Error::Provisioning(format!(
                "storage class of claim {:?} does not set {STORE_NAME_PARAM}",
                options.claim_name
            ))
        })?;
        let namespace = param(STORE_NAMESPACE_PARAM).unwrap_or(&options.claim_namespace);

        Ok(ObjectBucket {
            bucket_name: options.bucket_name.clone(),
            host: format!("{}.{namespace}.svc", instance_name(name, namespace)),
            port: SERVICE_PORT,
        })
    }
}

#[async_trait]
impl Provisioner for GatewayProvisioner {
    async fn provision(&self, options: &BucketOptions) -> Result<ObjectBucket> {
        self.endpoint(options)
    }

    async fn grant(&self, options: &BucketOptions) -> Result<ObjectBucket> {
        self.endpoint(options)
    }

    async fn delete(&self, options: &BucketOptions) -> Result<()> {
        info!(
            r#"Bucket "{}" of claim "{}/{}" is left on the gateway"#,
            options.bucket_name, options.claim_namespace, options.claim_name
        );
        Ok(())
    }

    async fn revoke(&self, options: &BucketOptions) -> Result<()> {
        info!(
            r#"Access of claim "{}/{}" to bucket "{}" revoked"#,
            options.claim_namespace, options.claim_name, options.bucket_name
        );
        Ok(())
    }
}

/// A long running bucket provisioning loop
#[async_trait]
pub trait BucketLoop: Send + Sync {
    /// Serve claims until `token` is cancelled.
    async fn run(&self, token: CancellationToken) -> Result<()>;
}

/// Bucket loop backed by the gateway provisioner
pub struct GatewayBuckets {
    client: Client,
    provisioner_name: String,
    namespace: String,
}

impl GatewayBuckets {
    pub fn new(client: Client, provisioner_name: String, namespace: String) -> Self {
        Self {
            client,
            provisioner_name,
            namespace,
        }
    }
}

#[async_trait]
impl BucketLoop for GatewayBuckets {
    async fn run(&self, token: CancellationToken) -> Result<()> {
        BucketController::new(
            self.client.clone(),
            self.provisioner_name.clone(),
            GatewayProvisioner,
            &self.namespace,
        )
        .run(token)
        .await
    }
}

/// Starts the bucket loop the first time an `ObjectStore` is reconciled.
///
/// The invocation that started the loop stays with it until the token is
/// cancelled; every other invocation returns straight away.
pub struct BucketReconciler<L> {
    bucket_loop: L,
    token: CancellationToken,
    running: AtomicBool,
}

impl<L: BucketLoop> BucketReconciler<L> {
    pub fn new(bucket_loop: L, token: CancellationToken) -> Self {
        Self {
            bucket_loop,
            token,
            running: AtomicBool::new(false),
        }
    }
}

/// Clears the running flag however the loop ends
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[async_trait]
impl<L: BucketLoop> Reconcile for BucketReconciler<L> {
    async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(Action::await_change());
        }
        let _running = Running(&self.running);

        info!(r#"Starting bucket provisioning on behalf of "{namespace}/{name}""#);
        self.bucket_loop
            .run(self.token.clone())
            .await
            .map_err(Error::in_step("buckets"))?;

        Ok(Action::await_change())
    }

    // Lasts as long as the process
    fn measured(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use tokio::sync::Notify;

    use super::*;

    fn options(parameters: &[(&str, &str)]) -> BucketOptions {
        BucketOptions {
            claim_name: "photos".into(),
            claim_namespace: "apps".into(),
            bucket_name: "photos-0f1e2d3c".into(),
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn endpoint_points_at_the_store_service() {
        let bucket = GatewayProvisioner
            .endpoint(&options(&[
                (STORE_NAME_PARAM, "store"),
                (STORE_NAMESPACE_PARAM, "storage"),
            ]))
            .unwrap();

        assert_eq!(
            bucket,
            ObjectBucket {
                bucket_name: "photos-0f1e2d3c".into(),
                host: "rgw-store-storage.storage.svc".into(),
                port: 8080,
            }
        );
    }

    #[test]
    fn endpoint_defaults_to_the_claim_namespace() {
        let bucket = GatewayProvisioner
            .endpoint(&options(&[(STORE_NAME_PARAM, "store"), (STORE_NAMESPACE_PARAM, "")]))
            .unwrap();
        assert_eq!(bucket.host, "rgw-store-apps.apps.svc");
    }

    #[tokio::test]
    async fn provisioning_needs_a_store() {
        let err = GatewayProvisioner.provision(&options(&[])).await.unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
        assert!(err.to_string().contains(STORE_NAME_PARAM));
    }

    #[derive(Default)]
    struct FakeLoop {
        runs: AtomicUsize,
        started: Notify,
        broken: bool,
    }

    #[async_trait]
    impl BucketLoop for Arc<FakeLoop> {
        async fn run(&self, token: CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(Error::BucketController("claim watch ended".into()));
            }
            self.started.notify_one();
            token.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_loop_runs_until_cancelled() {
        let fake = Arc::new(FakeLoop::default());
        let token = CancellationToken::new();
        let reconciler = Arc::new(BucketReconciler::new(fake.clone(), token.clone()));

        let first = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.reconcile("default", "store").await }
        });
        fake.started.notified().await;

        let second = reconciler.reconcile("default", "other").await.unwrap();
        assert_eq!(second, Action::await_change());
        assert_eq!(fake.runs.load(Ordering::SeqCst), 1);

        token.cancel();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first, Action::await_change());
        assert!(!reconciler.running.load(Ordering::SeqCst));
        assert!(!reconciler.measured());
    }

    #[tokio::test]
    async fn broken_loops_are_reported_and_restarted() {
        let fake = Arc::new(FakeLoop {
            broken: true,
            ..Default::default()
        });
        let reconciler = BucketReconciler::new(fake.clone(), CancellationToken::new());

        let err = reconciler.reconcile("default", "store").await.unwrap_err();
        assert_eq!(err.metric_label(), "reconcile_buckets");

        assert!(reconciler.reconcile("default", "store").await.is_err());
        assert_eq!(fake.runs.load(Ordering::SeqCst), 2);
    }
}
