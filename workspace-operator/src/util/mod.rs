use std::time::Duration;

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;

pub(crate) mod colors;

mod error;

pub use error::*;

/// The default interval for requeuing a managed resource.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Poll cadence while waiting for NodeClaims to disappear during delete.
pub(crate) const TERMINATION_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Stable content hash of a serializable spec fragment. Struct field order
/// fixes the encoding, so the same logical content hashes identically across
/// restarts.
pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaito_types::{ResourceSpec, WorkspaceSpec};

    #[test]
    fn hash_is_deterministic_for_equal_content() {
        let a = WorkspaceSpec {
            resource: ResourceSpec {
                instance_type: "Standard_NC24s_v3".into(),
                count: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(hash_spec(&a), hash_spec(&b));
    }

    #[test]
    fn hash_changes_with_content() {
        let a = WorkspaceSpec::default();
        let mut b = a.clone();
        b.resource.count = 3;
        assert_ne!(hash_spec(&a), hash_spec(&b));
    }
}
