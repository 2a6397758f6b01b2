use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A request for a bucket, served by a bucket provisioner
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ObjectBucketClaim",
    group = "objectbucket.io",
    version = "v1alpha1",
    status = "ObjectBucketClaimStatus",
    shortname = "obc",
    namespaced,
    printcolumn = r#"{ "name": "storage-class", "type": "string", "description": "provisioning storage class", "jsonPath": ".spec.storageClassName" }"#,
    printcolumn = r#"{ "name": "phase", "type": "string", "description": "claim phase", "jsonPath": ".status.phase" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectBucketClaimSpec {
    /// Storage class whose provisioner serves this claim.
    pub storage_class_name: String,

    /// Name of an existing bucket to grant access to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,

    /// Prefix of a new bucket to provision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_bucket_name: Option<String>,
}

/// The observed state of a bucket claim
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
pub struct ObjectBucketClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,

    /// Name of the bucket bound to the claim.
    #[serde(default, rename = "bucketName", skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
}

/// The possible phases of an `ObjectBucketClaim`
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClaimPhase {
    /// The claim has not been served yet.
    #[default]
    Pending,

    /// A bucket was provisioned or granted for the claim.
    Bound,

    /// The provisioner gave up on the claim.
    Failed,
}
