use std::time::Duration;

use kaito_types::Workspace;
use kaito_common::annotations;

use crate::util::Error;

/// Default OS-disk size for provisioned nodes when a preset does not ask for
/// more.
pub const DEFAULT_DISK_SIZE_GIB: u32 = 1024;

const DEFAULT_PRESET_REGISTRY: &str = "mcr.microsoft.com/aks/kaito";

/// Metadata the controller needs about a named model preset: how much GPU it
/// takes to host, whether the weights can shard across nodes, and how long a
/// cold start is allowed to take.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresetMeta {
    pub name: &'static str,
    /// Minimum number of GPUs across all nodes backing one replica.
    pub gpu_count_requirement: u32,
    /// Minimum aggregate GPU memory across those nodes, in GiB.
    pub total_gpu_memory_gib: u32,
    /// Working-set memory per GPU, in GiB.
    pub per_gpu_memory_gib: u32,
    pub supports_distributed_inference: bool,
    pub supports_tuning: bool,
    /// Weights are pulled at runtime and need `modelAccessSecret`.
    pub requires_access_secret: bool,
    pub readiness_timeout: Duration,
    pub disk_size_gib: u32,
    pub image_name: &'static str,
    pub image_tag: &'static str,
}

impl PresetMeta {
    /// Fully qualified image reference, prefixed by the configured registry.
    pub fn image(&self) -> String {
        let registry = std::env::var(kaito_common::env::PRESET_REGISTRY_NAME)
            .unwrap_or_else(|_| DEFAULT_PRESET_REGISTRY.to_string());
        format!("{}/{}:{}", registry, self.image_name, self.image_tag)
    }
}

/// Lookup interface over the model registry. The registry itself is an
/// external collaborator; the static catalog below stands in for it.
pub trait PresetRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<&PresetMeta>;

    /// Variant for presets that were admitted earlier: a miss here is
    /// terminal, since the workspace can no longer be realized.
    fn get_admitted(&self, name: &str) -> Result<&PresetMeta, Error> {
        self.get(name)
            .ok_or_else(|| Error::UnknownPreset(name.to_string()))
    }
}

const MIN_10: Duration = Duration::from_secs(10 * 60);
const MIN_30: Duration = Duration::from_secs(30 * 60);
const MIN_60: Duration = Duration::from_secs(60 * 60);
const MIN_90: Duration = Duration::from_secs(90 * 60);

static PRESETS: &[PresetMeta] = &[
    PresetMeta {
        name: "phi-2",
        gpu_count_requirement: 1,
        total_gpu_memory_gib: 12,
        per_gpu_memory_gib: 12,
        supports_distributed_inference: false,
        supports_tuning: true,
        requires_access_secret: false,
        readiness_timeout: MIN_10,
        disk_size_gib: 50,
        image_name: "kaito-phi-2",
        image_tag: "0.1.0",
    },
    PresetMeta {
        name: "phi-3",
        gpu_count_requirement: 2,
        total_gpu_memory_gib: 32,
        per_gpu_memory_gib: 16,
        supports_distributed_inference: false,
        supports_tuning: true,
        requires_access_secret: false,
        readiness_timeout: MIN_10,
        disk_size_gib: 90,
        image_name: "kaito-phi-3",
        image_tag: "0.1.0",
    },
    PresetMeta {
        name: "falcon-7b",
        gpu_count_requirement: 1,
        total_gpu_memory_gib: 15,
        per_gpu_memory_gib: 15,
        supports_distributed_inference: false,
        supports_tuning: true,
        requires_access_secret: false,
        readiness_timeout: MIN_30,
        disk_size_gib: 100,
        image_name: "kaito-falcon-7b",
        image_tag: "0.1.0",
    },
    PresetMeta {
        name: "falcon-40b",
        gpu_count_requirement: 2,
        total_gpu_memory_gib: 90,
        per_gpu_memory_gib: 45,
        supports_distributed_inference: true,
        supports_tuning: true,
        requires_access_secret: false,
        readiness_timeout: MIN_60,
        disk_size_gib: 400,
        image_name: "kaito-falcon-40b",
        image_tag: "0.1.0",
    },
    PresetMeta {
        name: "mistral-7b",
        gpu_count_requirement: 1,
        total_gpu_memory_gib: 16,
        per_gpu_memory_gib: 16,
        supports_distributed_inference: false,
        supports_tuning: true,
        requires_access_secret: false,
        readiness_timeout: MIN_30,
        disk_size_gib: 100,
        image_name: "kaito-mistral-7b",
        image_tag: "0.1.0",
    },
    PresetMeta {
        name: "llama-2-7b",
        gpu_count_requirement: 1,
        total_gpu_memory_gib: 16,
        per_gpu_memory_gib: 16,
        supports_distributed_inference: false,
        supports_tuning: true,
        requires_access_secret: true,
        readiness_timeout: MIN_30,
        disk_size_gib: 100,
        image_name: "kaito-llama-2-7b",
        image_tag: "0.1.0",
    },
    PresetMeta {
        name: "llama-2-13b",
        gpu_count_requirement: 2,
        total_gpu_memory_gib: 30,
        per_gpu_memory_gib: 15,
        supports_distributed_inference: true,
        supports_tuning: false,
        requires_access_secret: true,
        readiness_timeout: MIN_60,
        disk_size_gib: 150,
        image_name: "kaito-llama-2-13b",
        image_tag: "0.1.0",
    },
    PresetMeta {
        name: "llama-2-70b",
        gpu_count_requirement: 8,
        total_gpu_memory_gib: 160,
        per_gpu_memory_gib: 20,
        supports_distributed_inference: true,
        supports_tuning: false,
        requires_access_secret: true,
        readiness_timeout: MIN_90,
        disk_size_gib: 400,
        image_name: "kaito-llama-2-70b",
        image_tag: "0.1.0",
    },
];

/// Built-in stand-in for the external model registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticPresetRegistry;

impl PresetRegistry for StaticPresetRegistry {
    fn get(&self, name: &str) -> Option<&PresetMeta> {
        PRESETS.iter().find(|p| p.name == name)
    }
}

/// Inference runtime hosting the model. The default comes from preset
/// metadata; the `kaito.sh/runtime` annotation overrides it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InferenceRuntime {
    #[default]
    Vllm,
    Transformers,
}

impl InferenceRuntime {
    /// Whether one replica may span multiple nodes.
    pub fn supports_multi_node(&self) -> bool {
        match self {
            InferenceRuntime::Vllm => true,
            InferenceRuntime::Transformers => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceRuntime::Vllm => "vllm",
            InferenceRuntime::Transformers => "transformers",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vllm" => Some(InferenceRuntime::Vllm),
            "transformers" => Some(InferenceRuntime::Transformers),
            _ => None,
        }
    }

    pub fn for_workspace(instance: &Workspace) -> Self {
        instance
            .annotation(annotations::RUNTIME)
            .and_then(InferenceRuntime::parse)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_presets() {
        let registry = StaticPresetRegistry;
        let phi = registry.get("phi-3").expect("phi-3");
        assert_eq!(phi.gpu_count_requirement, 2);
        assert!(!phi.supports_distributed_inference);
        assert!(registry.get("not-a-model").is_none());
    }

    #[test]
    fn admitted_miss_is_terminal() {
        let registry = StaticPresetRegistry;
        let err = registry.get_admitted("ghost").unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn runtime_parse_round_trips() {
        for runtime in [InferenceRuntime::Vllm, InferenceRuntime::Transformers] {
            assert_eq!(InferenceRuntime::parse(runtime.as_str()), Some(runtime));
        }
        assert_eq!(InferenceRuntime::parse("triton"), None);
    }
}
