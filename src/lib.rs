use thiserror::Error;

/// Expose all controller components used by main
pub mod operator;
pub mod resources;

/// Runtime configuration read from the environment
pub mod config;

/// Access to the cluster API used by the reconcilers
pub mod cluster;

/// Names, flags and hashes derived from user supplied identifiers
pub mod naming;

/// Bucket provisioning delegate loop
pub mod provisioner;

pub mod reconcilers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("failed to {action} {kind} {name:?}: {source}")]
    Store {
        action: &'static str,
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to reconcile {step}: {source}")]
    Reconcile {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("failed to set owner reference on {kind} {name:?}: {reason}")]
    OwnerReference {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("{kind} is missing {field}")]
    MissingField { kind: String, field: &'static str },

    #[error("mutation changed the identity of {kind} {name:?}")]
    MutatedIdentity { kind: String, name: String },

    #[error("got empty container for the gateway daemon")]
    EmptyDaemonContainer,

    #[error("IllegalObjectStore {0}: {1}")]
    IllegalObjectStore(String, String),

    #[error("IllegalBucketClaim {0}: {1}")]
    IllegalBucketClaim(String, String),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("failed to run bucket controller: {0}")]
    BucketController(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::Reconcile { step, .. } => format!("reconcile_{step}"),
            Error::Store { action, kind, .. } => format!("{action}_{kind}").to_lowercase(),
            _ => format!("{self:?}")
                .split(['(', ' ', '{'])
                .next()
                .unwrap_or_default()
                .to_lowercase(),
        }
    }

    /// Wrap a failed store call with what was being done to which object
    pub(crate) fn store<K: kube::Resource<DynamicType = ()>>(
        action: &'static str,
        name: &str,
    ) -> impl FnOnce(kube::Error) -> Error {
        let kind = K::kind(&()).to_string();
        let name = name.to_string();
        move |source| Error::Store {
            action,
            kind,
            name,
            source,
        }
    }

    /// Wrap an error with the convergence step it happened in
    pub(crate) fn in_step(step: &'static str) -> impl FnOnce(Error) -> Error {
        move |source| Error::Reconcile {
            step,
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e)
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_labels_are_short() {
        assert_eq!(Error::EmptyDaemonContainer.metric_label(), "emptydaemoncontainer");
        assert_eq!(
            Error::IllegalObjectStore("a".into(), "b".into()).metric_label(),
            "illegalobjectstore"
        );

        let wrapped = Error::in_step("service")(Error::EmptyDaemonContainer);
        assert_eq!(wrapped.metric_label(), "reconcile_service");
        assert_eq!(
            wrapped.to_string(),
            "failed to reconcile service: got empty container for the gateway daemon"
        );
    }
}
