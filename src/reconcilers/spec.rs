//! Target specifications for the resources backing an `ObjectStore`.
//!
//! Everything in here is a pure function of the `ObjectStore`: the same input
//! always produces the same objects, which lets the reconciler recompute them
//! from scratch on every pass.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment},
        core::v1::{
            Container, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
            PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
            SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::ResourceExt;

use crate::{
    meta,
    naming::{container_env_var_reference, instance_name, new_flag, stable_hash},
    resources::ObjectStore,
    Error, Result,
};

/// User the gateway daemon runs as
pub const CEPH_UID: i64 = 167;
/// Group the gateway daemon runs as
pub const CEPH_GID: i64 = 167;

/// Where the daemon keeps its sqlite database
pub const DATA_DIR: &str = "/var/lib/ceph/radosgw/data";
/// Port the daemon's beast frontend listens on
pub const INTERNAL_PORT: i32 = 7480;
/// Port exposed by the gateway service
pub const SERVICE_PORT: i32 = 8080;

/// Hash of the pod template last written by the operator
pub const TEMPLATE_HASH_ANNOTATION: &str = "object.rook-s3-nano/template-hash";

const DAEMON_BINARY: &str = "radosgw-sqlite";
const DATA_VOLUME: &str = "ceph-daemon-data";
const POD_NAME_ENV: &str = "POD_NAME";
const CEPH_LIB_DIR: &str = "/usr/lib64/rados-classes";

impl ObjectStore {
    /// Name shared by the claim, service and deployment of this store
    pub fn instance_name(&self) -> Result<String> {
        Ok(instance_name(&self.name_any(), &self.require_namespace()?))
    }

    /// Labels selecting the gateway pods of this store
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("object_store".to_string(), self.name_any())])
    }

    pub(crate) fn require_namespace(&self) -> Result<String> {
        self.namespace()
            .ok_or_else(|| Error::IllegalObjectStore(self.name_any(), "missing namespace".into()))
    }
}

/// The claim holding the gateway database.
///
/// The template is used as is, except that the claim is always a single
/// writer filesystem volume.
pub fn claim(store: &ObjectStore) -> Result<PersistentVolumeClaim> {
    let mut spec = store
        .spec
        .volume_claim_template
        .spec
        .clone()
        .unwrap_or_default();
    spec.access_modes = Some(vec!["ReadWriteOnce".into()]);
    spec.volume_mode = Some("Filesystem".into());

    Ok(PersistentVolumeClaim {
        metadata: meta! {
            name: Some(store.instance_name()?),
            namespace: Some(store.require_namespace()?)
        },
        spec: Some(spec),
        status: None,
    })
}

/// The gateway service, without its spec.
pub fn service(store: &ObjectStore) -> Result<Service> {
    Ok(Service {
        metadata: meta! {
            name: Some(store.instance_name()?),
            namespace: Some(store.require_namespace()?),
            labels: Some(store.selector_labels())
        },
        ..Default::default()
    })
}

/// Set the fields of a service spec owned by the operator.
pub fn apply_service_spec(store: &ObjectStore, spec: &mut ServiceSpec) {
    spec.selector = Some(store.selector_labels());
    spec.ports = None;
    add_port(spec, "http", SERVICE_PORT, INTERNAL_PORT);
}

/// Add a TCP port mapping, unless either side of it is disabled (0).
pub fn add_port(spec: &mut ServiceSpec, name: &str, port: i32, target_port: i32) {
    if port == 0 || target_port == 0 {
        return;
    }

    spec.ports.get_or_insert_with(Vec::new).push(ServicePort {
        name: Some(name.into()),
        port,
        target_port: Some(IntOrString::Int(target_port)),
        protocol: Some("TCP".into()),
        ..Default::default()
    });
}

/// The gateway deployment, without its spec.
pub fn deployment(store: &ObjectStore) -> Result<Deployment> {
    Ok(Deployment {
        metadata: meta! {
            name: Some(store.instance_name()?),
            namespace: Some(store.require_namespace()?),
            labels: Some(store.selector_labels())
        },
        ..Default::default()
    })
}

/// Set the fields of a deployment spec owned by the operator.
///
/// The gateway is a single writer on a `ReadWriteOnce` volume, so the old pod
/// has to go before its replacement starts.
pub fn apply_deployment_spec(store: &ObjectStore, spec: &mut DeploymentSpec) -> Result<()> {
    spec.selector = LabelSelector {
        match_labels: Some(store.selector_labels()),
        match_expressions: None,
    };
    apply_pod_template(pod_template(store)?, &mut spec.template)?;
    spec.replicas = Some(1);
    spec.strategy = Some(DeploymentStrategy {
        type_: Some("RollingUpdate".into()),
        rolling_update: Some(RollingUpdateDeployment {
            max_unavailable: Some(IntOrString::Int(1)),
            max_surge: Some(IntOrString::Int(0)),
        }),
    });

    Ok(())
}

/// Replace `current` with `desired` unless `current` was built from the same target.
///
/// The api server fills in defaults all over a pod template, so the applied
/// template is recognised by the hash of what was sent instead of by comparison.
pub fn apply_pod_template(desired: PodTemplateSpec, current: &mut PodTemplateSpec) -> Result<()> {
    let hash = stable_hash(&serde_json::to_string(&desired)?);

    let applied = current
        .metadata
        .as_ref()
        .and_then(|meta| meta.annotations.as_ref())
        .and_then(|annotations| annotations.get(TEMPLATE_HASH_ANNOTATION));
    if applied == Some(&hash) {
        return Ok(());
    }

    let mut desired = desired;
    desired
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(TEMPLATE_HASH_ANNOTATION.into(), hash);
    *current = desired;

    Ok(())
}

pub fn pod_template(store: &ObjectStore) -> Result<PodTemplateSpec> {
    if store.spec.image.is_empty() {
        return Err(Error::IllegalObjectStore(
            store.name_any(),
            "spec.image must not be empty".into(),
        ));
    }

    let daemon = daemon_container(store);
    if daemon == Container::default() {
        return Err(Error::EmptyDaemonContainer);
    }

    Ok(PodTemplateSpec {
        metadata: Some(meta! {
            name: Some(store.instance_name()?),
            labels: Some(store.selector_labels())
        }),
        spec: Some(PodSpec {
            // Some csi drivers do not honour fsGroup, so the data directory is chowned up front
            init_containers: Some(vec![chown_data_dir_container(&store.spec.image)]),
            containers: vec![daemon],
            restart_policy: Some("Always".into()),
            security_context: Some(PodSecurityContext {
                run_as_user: Some(CEPH_UID),
                run_as_group: Some(CEPH_GID),
                fs_group: Some(CEPH_GID),
                ..Default::default()
            }),
            volumes: Some(vec![Volume {
                name: DATA_VOLUME.into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: store.instance_name()?,
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    })
}

/// The gateway daemon, running in the foreground.
pub fn daemon_container(store: &ObjectStore) -> Container {
    let pod_name = container_env_var_reference(POD_NAME_ENV);

    let mut args = default_daemon_flags();
    args.extend([
        // The socket name gets too long with the raw pod name.
        // NB: this hashes the unexpanded reference, so every pod gets the same id.
        new_flag("id", &stable_hash(&pod_name)),
        new_flag("host", &pod_name),
        new_flag("librados sqlite data dir", DATA_DIR),
        // Shows the database initialization progress
        new_flag("debug rgw", "15"),
    ]);

    Container {
        name: "rgw".into(),
        image: Some(store.spec.image.clone()),
        command: Some(vec![DAEMON_BINARY.into()]),
        args: Some(args),
        volume_mounts: Some(vec![data_volume_mount()]),
        env: Some(daemon_env_vars(&store.spec.image)),
        ..Default::default()
    }
}

fn default_daemon_flags() -> Vec<String> {
    vec![
        // log to stdout
        "-d".into(),
        // there is no monitor to fetch the config from
        "--no-mon-config".into(),
        "--nolockdep".into(),
    ]
}

/// Init container giving the data directory to the daemon user.
///
/// Runs as root, since the volume may come with any ownership.
pub fn chown_data_dir_container(image: &str) -> Container {
    Container {
        name: "chown-container-data-dir".into(),
        image: Some(image.into()),
        command: Some(vec!["chown".into()]),
        args: Some(vec![
            "--verbose".into(),
            "--recursive".into(),
            format!("{CEPH_UID}:{CEPH_GID}"),
            DATA_DIR.into(),
        ]),
        volume_mounts: Some(vec![data_volume_mount()]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            run_as_user: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn data_volume_mount() -> VolumeMount {
    VolumeMount {
        name: DATA_VOLUME.into(),
        mount_path: DATA_DIR.into(),
        ..Default::default()
    }
}

fn daemon_env_vars(image: &str) -> Vec<EnvVar> {
    let field = |name: &str, path: &str| EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.into(),
                api_version: None,
            }),
            ..Default::default()
        }),
        value: None,
    };

    vec![
        EnvVar {
            name: "CONTAINER_IMAGE".into(),
            value: Some(image.into()),
            value_from: None,
        },
        field(POD_NAME_ENV, "metadata.name"),
        field("POD_NAMESPACE", "metadata.namespace"),
        field("NODE_NAME", "spec.nodeName"),
        EnvVar {
            name: "CEPH_LIB".into(),
            value: Some(CEPH_LIB_DIR.into()),
            value_from: None,
        },
    ]
}
