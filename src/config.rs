use std::net::SocketAddr;

use anyhow::Context as _;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_PROVISIONER_NAME: &str = "s3.rook.io/bucket";

/// Settings of the operator process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Address of the metrics and diagnostics server
    pub listen_addr: SocketAddr,

    /// Provisioner named by the storage classes whose claims we serve
    pub provisioner_name: String,

    /// Namespace of the claims to serve, all namespaces when empty
    pub watch_namespace: String,
}

impl OperatorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let read = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let listen_addr = read("LISTEN_ADDR", DEFAULT_LISTEN_ADDR);
        let listen_addr: SocketAddr = listen_addr
            .parse()
            .with_context(|| format!("LISTEN_ADDR {listen_addr:?} is not a socket address"))?;

        Ok(Self {
            listen_addr,
            provisioner_name: read("BUCKET_PROVISIONER_NAME", DEFAULT_PROVISIONER_NAME),
            watch_namespace: read("WATCH_NAMESPACE", ""),
        })
    }
}
