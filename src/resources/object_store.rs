use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for an object store gateway instance
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ObjectStore",
    group = "object.rook-s3-nano",
    version = "v1alpha1",
    status = "ObjectStoreStatus",
    doc = "An S3 object store gateway backed by a single volume",
    namespaced,
    printcolumn = r#"{ "name": "image", "type": "string", "description": "gateway image", "jsonPath": ".spec.image" }"#,
    printcolumn = r#"{ "name": "port", "type": "integer", "description": "gateway port", "jsonPath": ".spec.gateway.port" }"#,
    printcolumn = r#"{ "name": "phase", "type": "string", "description": "object store phase", "jsonPath": ".status.phase" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreSpec {
    /// The container image to use for the gateway daemon.
    pub image: String,

    /// Gateway pod configuration.
    #[serde(default)]
    pub gateway: GatewaySpec,

    /// Template for the claim holding the gateway database.
    ///
    /// Access mode and volume mode are always forced to `ReadWriteOnce` and
    /// `Filesystem`; everything else (size, storage class, ...) is used as is.
    pub volume_claim_template: PersistentVolumeClaim,
}

/// Gateway pod configuration
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(default)]
pub struct GatewaySpec {
    /// The port the gateway service listens on (http). 0 leaves it unexposed.
    pub port: i32,
}

/// The observed state of an object store
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
pub struct ObjectStoreStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
}
