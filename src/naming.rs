use sha2::{Digest, Sha256};

/// Prefix shared by every resource derived from an `ObjectStore`
pub const APP_NAME: &str = "rgw";

/// Name shared by the claim, service and deployment of a gateway instance.
pub fn instance_name(name: &str, namespace: &str) -> String {
    format!("{APP_NAME}-{name}-{namespace}")
}

/// Converts a config key written with spaces, hyphens or underscores to its
/// underscore-only form.
///
/// "some config key", "some-config-key" and "some_config_key" all name the
/// same daemon option.
pub fn normalize_key(key: &str) -> String {
    key.replace(' ', "_").replace('-', "_")
}

/// Build a daemon command line flag from a config key and its value.
///
/// "debug rgw" ~normalize~> "debug_rgw" ~to flag~> "--debug-rgw=<value>"
pub fn new_flag(key: &str, value: &str) -> String {
    let flag = normalize_key(key).replace('_', "-");
    format!("--{flag}={value}")
}

/// Reference to a container env var, expanded by the kubelet in commands and arguments.
pub fn container_env_var_reference(env_var_name: &str) -> String {
    format!("$({env_var_name})")
}

/// Stable pseudorandom string suitable for inclusion in object names and daemon ids.
///
/// Do **NOT** change the output of this function: deployed daemons rely on the
/// same seed always mapping to the same value across operator versions.
pub fn stable_hash(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Finalizer token for a kind within an api group.
pub fn finalizer_name(kind: &str, group: &str) -> String {
    format!("{}.{group}", kind.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_joins_app_name_and_identity() {
        assert_eq!(instance_name("store", "default"), "rgw-store-default");
        assert_ne!(instance_name("a-b", "c"), instance_name("a", "b-c-d"));
    }

    #[test]
    fn flags_collapse_all_separator_spellings() {
        assert_eq!(new_flag("debug rgw", "15"), "--debug-rgw=15");
        assert_eq!(new_flag("some-config-key", "x"), "--some-config-key=x");
        assert_eq!(new_flag("some_config_key", "x"), "--some-config-key=x");
        assert_eq!(new_flag("some config-key", "x"), "--some-config-key=x");
        assert_eq!(normalize_key("librados sqlite-data_dir"), "librados_sqlite_data_dir");
    }

    #[test]
    fn env_var_reference() {
        assert_eq!(container_env_var_reference("POD_NAME"), "$(POD_NAME)");
    }

    #[test]
    fn stable_hash_is_truncated_sha256() {
        let hash = stable_hash("$(POD_NAME)");
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let full = format!("{:x}", Sha256::digest(b"$(POD_NAME)"));
        assert_eq!(hash, full[..32]);
        assert_eq!(stable_hash("$(POD_NAME)"), hash);
    }

    #[test]
    fn stable_hash_of_empty_seed() {
        // sha256("") = e3b0c442 98fc1c14 9afbf4c8 996fb924 ...
        assert_eq!(stable_hash(""), "e3b0c44298fc1c149afbf4c8996fb924");
    }

    #[test]
    fn finalizer_is_lowercased_kind_in_group() {
        assert_eq!(
            finalizer_name("ObjectStore", "object.rook-s3-nano"),
            "objectstore.object.rook-s3-nano"
        );
    }
}
