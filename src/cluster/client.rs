use async_trait::async_trait;
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use serde_json::json;

use super::{ClusterApi, ClusterResource, MANAGER};

/// `ClusterApi` backed by a kube client talking to the api server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn params() -> PostParams {
        PostParams {
            field_manager: Some(MANAGER.into()),
            ..Default::default()
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(MANAGER.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, kube::Error> {
        Api::<K>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn create<K: ClusterResource>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, kube::Error> {
        Api::<K>::namespaced(self.client.clone(), namespace)
            .create(&Self::params(), object)
            .await
    }

    async fn replace<K: ClusterResource>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, kube::Error> {
        Api::<K>::namespaced(self.client.clone(), namespace)
            .replace(&object.name_any(), &Self::params(), object)
            .await
    }

    async fn patch_status<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<K, kube::Error> {
        let patch = Patch::Merge(json!({ "status": status }));
        Api::<K>::namespaced(self.client.clone(), namespace)
            .patch_status(name, &Self::patch_params(), &patch)
            .await
    }
}
