use anyhow::{Result, bail};

/// Process-wide feature gates, parsed once at startup from a
/// `key=value,key=value` string (`--feature-gates` / `FEATURE_GATES`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureGates {
    /// When on, the controller never creates NodeClaims and requires the
    /// user-provided nodes to cover the whole target count.
    pub disable_node_auto_provisioning: bool,
    /// When on, inference routing is delegated to the Gateway API inference
    /// extension and no LoadBalancer service is created.
    pub gateway_api_inference_extension: bool,
}

pub const DISABLE_NODE_AUTO_PROVISIONING: &str = "DisableNodeAutoProvisioning";
pub const GATEWAY_API_INFERENCE_EXTENSION: &str = "GatewayAPIInferenceExtension";

impl FeatureGates {
    pub fn parse(s: &str) -> Result<Self> {
        let mut gates = FeatureGates::default();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                bail!("invalid feature gate {pair:?}: expected key=value");
            };
            let enabled = match value.trim().to_lowercase().as_str() {
                "true" => true,
                "false" => false,
                other => bail!("invalid feature gate value {other:?} for {key:?}"),
            };
            match key.trim() {
                DISABLE_NODE_AUTO_PROVISIONING => gates.disable_node_auto_provisioning = enabled,
                GATEWAY_API_INFERENCE_EXTENSION => gates.gateway_api_inference_extension = enabled,
                other => bail!("unknown feature gate {other:?}"),
            }
        }
        Ok(gates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_all_defaults() {
        assert_eq!(FeatureGates::parse("").unwrap(), FeatureGates::default());
    }

    #[test]
    fn parses_known_gates() {
        let gates = FeatureGates::parse(
            "DisableNodeAutoProvisioning=true,GatewayAPIInferenceExtension=false",
        )
        .unwrap();
        assert!(gates.disable_node_auto_provisioning);
        assert!(!gates.gateway_api_inference_extension);
    }

    #[test]
    fn tolerates_whitespace_and_trailing_comma() {
        let gates = FeatureGates::parse(" DisableNodeAutoProvisioning = true ,").unwrap();
        assert!(gates.disable_node_auto_provisioning);
    }

    #[test]
    fn rejects_unknown_gate() {
        assert!(FeatureGates::parse("NotAGate=true").is_err());
    }

    #[test]
    fn rejects_non_boolean_value() {
        assert!(FeatureGates::parse("DisableNodeAutoProvisioning=yes").is_err());
    }
}
