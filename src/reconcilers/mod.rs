use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use tokio::sync::RwLock;

use crate::{operator::Diagnostics, Error, Metrics};

pub mod bucket;
pub mod object_store;
pub mod spec;

/// Build an `ObjectMeta` from the listed fields, defaulting the rest
#[macro_export]
macro_rules! meta {
    ($($field:ident : $value:expr),* $(,)?) => {{
        ::kube::core::ObjectMeta {
            $($field: $value,)*

            ..Default::default()
        }
    }};
}

/// The context passed around
pub struct Context<R> {
    /// The reconciler driven by the controller
    pub reconciler: R,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,
}

/// Something that can drive an `ObjectStore` towards its desired state
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Attempt to reconcile the object store `namespace/name`.
    ///
    /// Errors are never retried here; the controller runtime requeues them.
    async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action, Error>;

    /// Whether the duration of `reconcile` is observed.
    fn measured(&self) -> bool {
        true
    }
}
