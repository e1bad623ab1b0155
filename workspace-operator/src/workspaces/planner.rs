use kaito_types::Workspace;

use crate::model::PresetMeta;
use crate::sku::SkuConfig;

/// Number of nodes one inference replica spans on the given SKU: enough
/// nodes to cover both the preset's GPU-memory and GPU-count requirements.
pub fn per_replica_node_count(preset: &PresetMeta, sku: &SkuConfig) -> u32 {
    let by_memory = preset
        .total_gpu_memory_gib
        .div_ceil(sku.total_gpu_memory_gib().max(1));
    let by_count = preset.gpu_count_requirement.div_ceil(sku.gpu_count.max(1));
    by_memory.max(by_count).max(1)
}

/// Target worker-node count plus the per-replica span. Tuning is fixed at a
/// single node. Inference scales with the declared replica count; without
/// preset or SKU metadata (templates, BYO pools) the user-declared
/// `resource.count` is authoritative.
pub fn target_node_count(
    instance: &Workspace,
    preset: Option<&PresetMeta>,
    sku: Option<&SkuConfig>,
) -> (u32, u32) {
    if instance.spec.tuning.is_some() {
        return (1, 1);
    }
    let replicas = instance
        .spec
        .inference
        .as_ref()
        .map(|i| i.replicas)
        .unwrap_or(1);
    match (preset, sku) {
        (Some(preset), Some(sku)) => {
            let per_replica = per_replica_node_count(preset, sku);
            (replicas * per_replica, per_replica)
        }
        _ => (instance.spec.resource.count, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PresetRegistry, StaticPresetRegistry};
    use crate::sku::{CloudProvider, SkuHandler};
    use kaito_types::{InferenceSpec, PresetRef, TuningSpec};

    fn inference_workspace(preset: &str, replicas: u32, count: u32) -> Workspace {
        let mut ws = Workspace::new("ws", Default::default());
        ws.spec.resource.count = count;
        ws.spec.resource.instance_type = "Standard_NC24s_v3".into();
        ws.spec.inference = Some(InferenceSpec {
            preset: Some(PresetRef {
                name: preset.into(),
                model_access_secret: None,
            }),
            replicas,
            ..Default::default()
        });
        ws
    }

    fn sku(name: &str) -> &'static SkuConfig {
        SkuHandler::new(CloudProvider::Azure).get(name).unwrap()
    }

    #[test]
    fn replica_span_covers_memory_and_gpu_count() {
        let registry = StaticPresetRegistry;
        let phi3 = registry.get("phi-3").unwrap();
        // One NC24s_v3 holds 16GiB / 1 GPU; phi-3 needs 32GiB across 2 GPUs.
        assert_eq!(per_replica_node_count(phi3, sku("Standard_NC24s_v3")), 2);
        // One A100 node holds all of it.
        assert_eq!(per_replica_node_count(phi3, sku("Standard_NC48ads_A100_v4")), 1);
    }

    #[test]
    fn inference_target_scales_with_replicas() {
        let registry = StaticPresetRegistry;
        let phi3 = registry.get("phi-3").unwrap();
        let ws = inference_workspace("phi-3", 1, 2);
        assert_eq!(
            target_node_count(&ws, Some(phi3), Some(sku("Standard_NC24s_v3"))),
            (2, 2)
        );

        let phi2 = registry.get("phi-2").unwrap();
        let two_replicas = inference_workspace("phi-2", 2, 2);
        assert_eq!(
            target_node_count(&two_replicas, Some(phi2), Some(sku("Standard_NC24s_v3"))),
            (2, 1)
        );
        let one_replica = inference_workspace("phi-2", 1, 2);
        assert_eq!(
            target_node_count(&one_replica, Some(phi2), Some(sku("Standard_NC24s_v3"))),
            (1, 1)
        );
    }

    #[test]
    fn tuning_is_pinned_to_one_node() {
        let mut ws = Workspace::new("ws", Default::default());
        ws.spec.tuning = Some(TuningSpec::default());
        assert_eq!(target_node_count(&ws, None, None), (1, 1));
    }

    #[test]
    fn byo_pools_use_the_declared_count() {
        let mut ws = Workspace::new("ws", Default::default());
        ws.spec.resource.count = 3;
        ws.spec.inference = Some(InferenceSpec::default());
        assert_eq!(target_node_count(&ws, None, None), (3, 1));
    }
}
