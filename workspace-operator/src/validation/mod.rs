use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kaito_common::{annotations, features::FeatureGates, labels};
use kaito_types::{
    DataDestination, DataSource, InferenceSpec, ResourceSpec, TuningSpec, Workspace, WorkspaceSpec,
};
use kube::{Client, ResourceExt};

use crate::model::{InferenceRuntime, PresetMeta, PresetRegistry};
use crate::nodes;
use crate::sku::{SkuConfig, SkuHandler};
use crate::util::Error;

pub mod tuning_config;

pub const MAX_ADAPTERS: usize = 10;

/// Cross-field admission validation, invoked synchronously on create/update
/// by the webhook. All findings are collected and returned as one
/// multi-error; nothing is admitted partially.
pub struct Validator {
    pub registry: Arc<dyn PresetRegistry>,
    pub sku: SkuHandler,
    pub gates: FeatureGates,
}

impl Validator {
    pub async fn validate_create(
        &self,
        client: Client,
        instance: &Workspace,
    ) -> Result<Vec<String>, Error> {
        let (errors, warnings) = self.collect(client, instance).await?;
        finish(errors, warnings)
    }

    pub async fn validate_update(
        &self,
        client: Client,
        instance: &Workspace,
        old: &Workspace,
    ) -> Result<Vec<String>, Error> {
        let mut errors = check_immutable(&instance.spec, &old.spec);
        let (common, warnings) = self.collect(client, instance).await?;
        errors.extend(common);
        finish(errors, warnings)
    }

    async fn collect(
        &self,
        client: Client,
        instance: &Workspace,
    ) -> Result<(Vec<String>, Vec<String>), Error> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let bypass = instance.bool_annotation(annotations::BYPASS_RESOURCE_CHECKS);

        errors.extend(check_name(&instance.name_any()));
        errors.extend(check_instance_type_presence(
            &instance.spec.resource,
            self.gates,
        ));
        errors.extend(check_workload_choice(&instance.spec));

        if let Some(inference) = &instance.spec.inference {
            errors.extend(check_inference(inference, self.registry.as_ref()));
            if let Some(preset_ref) = &inference.preset
                && let Some(preset) = self.registry.get(&preset_ref.name)
            {
                let runtime = InferenceRuntime::for_workspace(instance);
                if let Some(sku) = self.sku.get(&instance.spec.resource.instance_type) {
                    let (errs, warns) = check_resource_fit(
                        instance.spec.resource.count,
                        sku,
                        preset,
                        runtime,
                        bypass,
                    );
                    errors.extend(errs);
                    warnings.extend(warns);
                } else if instance.spec.resource.instance_type.is_empty()
                    && self.gates.disable_node_auto_provisioning
                {
                    let byo = self.byo_nodes(client.clone(), instance).await?;
                    let (errs, warns) = check_byo(&byo, preset, bypass);
                    errors.extend(errs);
                    warnings.extend(warns);
                }
            }
        }

        if let Some(tuning) = &instance.spec.tuning {
            errors.extend(check_tuning(
                tuning,
                &instance.spec.resource,
                self.registry.as_ref(),
            ));
            let config_name = tuning
                .config
                .clone()
                .unwrap_or_else(|| tuning_config::default_config_name(tuning.method));
            let namespace = instance.namespace().unwrap_or_default();
            errors.extend(
                tuning_config::fetch_and_validate(client, &namespace, &config_name, tuning.method)
                    .await?,
            );
        }
        Ok((errors, warnings))
    }

    async fn byo_nodes(&self, client: Client, instance: &Workspace) -> Result<Vec<Node>, Error> {
        let all = nodes::list_all(client).await?;
        Ok(all
            .into_iter()
            .filter(|n| {
                nodes::matches_selector(n, instance.spec.resource.label_selector.as_ref())
            })
            .collect())
    }
}

fn finish(errors: Vec<String>, warnings: Vec<String>) -> Result<Vec<String>, Error> {
    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(Error::Validation(errors.join("; ")))
    }
}

fn check_name(name: &str) -> Vec<String> {
    if is_dns1123_label(name) {
        Vec::new()
    } else {
        vec![format!("name '{name}' is not a valid DNS-1123 label")]
    }
}

fn is_dns1123_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

fn check_instance_type_presence(resource: &ResourceSpec, gates: FeatureGates) -> Vec<String> {
    let mut errors = Vec::new();
    if gates.disable_node_auto_provisioning {
        if !resource.instance_type.is_empty() {
            errors.push(
                "instanceType must be empty when node auto-provisioning is disabled".to_string(),
            );
        }
        if resource.label_selector.is_none() {
            errors.push(
                "labelSelector is required when node auto-provisioning is disabled".to_string(),
            );
        }
    } else if resource.instance_type.is_empty() {
        errors.push("instanceType is required when node auto-provisioning is enabled".to_string());
    }
    errors
}

fn check_workload_choice(spec: &WorkspaceSpec) -> Vec<String> {
    match (&spec.inference, &spec.tuning) {
        (Some(_), Some(_)) => vec!["exactly one of inference or tuning may be set".to_string()],
        (None, None) => vec!["one of inference or tuning must be set".to_string()],
        _ => Vec::new(),
    }
}

fn check_inference(inference: &InferenceSpec, registry: &dyn PresetRegistry) -> Vec<String> {
    let mut errors = Vec::new();
    match (&inference.preset, &inference.template) {
        (Some(_), Some(_)) => {
            errors.push("exactly one of inference.preset or inference.template may be set".into());
        }
        (None, None) => {
            errors.push("one of inference.preset or inference.template must be set".into());
        }
        _ => {}
    }
    if let Some(preset_ref) = &inference.preset {
        match registry.get(&preset_ref.name) {
            None => errors.push(format!("unknown inference preset '{}'", preset_ref.name)),
            Some(preset) => {
                if preset.requires_access_secret && preset_ref.model_access_secret.is_none() {
                    errors.push(format!(
                        "preset '{}' downloads weights at runtime and requires modelAccessSecret",
                        preset_ref.name
                    ));
                }
                if !preset.requires_access_secret && preset_ref.model_access_secret.is_some() {
                    errors.push(format!(
                        "preset '{}' does not take a modelAccessSecret",
                        preset_ref.name
                    ));
                }
            }
        }
    }
    errors.extend(check_adapters(inference));
    errors
}

fn check_adapters(inference: &InferenceSpec) -> Vec<String> {
    let mut errors = Vec::new();
    if inference.adapters.len() > MAX_ADAPTERS {
        errors.push(format!(
            "at most {MAX_ADAPTERS} adapters are supported, got {}",
            inference.adapters.len()
        ));
    }
    let mut seen = BTreeSet::new();
    for adapter in &inference.adapters {
        if !seen.insert(adapter.source.name.clone()) {
            errors.push(format!("duplicate adapter name '{}'", adapter.source.name));
        }
        if let Err(e) = validate_image_ref(&adapter.source.image) {
            errors.push(format!("adapter '{}': {e}", adapter.source.name));
        }
        let strength = adapter.strength.as_deref().unwrap_or("1.0");
        match strength.parse::<f64>() {
            Ok(v) if (0.0..=1.0).contains(&v) => {}
            _ => errors.push(format!(
                "adapter '{}': strength '{strength}' must be a decimal in [0.0, 1.0]",
                adapter.source.name
            )),
        }
    }
    errors
}

fn check_tuning(
    tuning: &TuningSpec,
    resource: &ResourceSpec,
    registry: &dyn PresetRegistry,
) -> Vec<String> {
    let mut errors = Vec::new();
    if resource.count != 1 {
        errors.push(format!(
            "tuning workspaces are fixed at one node, got count {}",
            resource.count
        ));
    }
    match registry.get(&tuning.preset.name) {
        None => errors.push(format!("unknown tuning preset '{}'", tuning.preset.name)),
        Some(preset) if !preset.supports_tuning => {
            errors.push(format!("preset '{}' does not support tuning", tuning.preset.name));
        }
        Some(_) => {}
    }
    errors.extend(check_data_source(&tuning.input));
    errors.extend(check_data_destination(&tuning.output));
    errors
}

fn check_data_source(input: &DataSource) -> Vec<String> {
    let mut errors = Vec::new();
    let set = usize::from(!input.urls.is_empty())
        + usize::from(input.image.is_some())
        + usize::from(input.volume.is_some());
    if set != 1 {
        errors.push("tuning input must set exactly one of urls, image or volume".to_string());
    }
    if let Some(image) = &input.image
        && let Err(e) = validate_image_ref(image)
    {
        errors.push(format!("tuning input image: {e}"));
    }
    errors
}

fn check_data_destination(output: &DataDestination) -> Vec<String> {
    let mut errors = Vec::new();
    let set = usize::from(output.volume.is_some()) + usize::from(output.image.is_some());
    if set != 1 {
        errors.push("tuning output must set exactly one of volume or image".to_string());
    }
    if let Some(image) = &output.image {
        if let Err(e) = validate_image_ref(image) {
            errors.push(format!("tuning output image: {e}"));
        }
        if output.image_push_secret.is_none() {
            errors.push("tuning output to an image requires imagePushSecret".to_string());
        }
    }
    errors
}

/// Resource-fit arithmetic for a known GPU SKU. With the bypass annotation
/// the findings demote to warnings.
fn check_resource_fit(
    count: u32,
    sku: &SkuConfig,
    preset: &PresetMeta,
    runtime: InferenceRuntime,
    bypass: bool,
) -> (Vec<String>, Vec<String>) {
    let mut findings = Vec::new();
    let total_gpus = count * sku.gpu_count;
    let total_memory = count * sku.total_gpu_memory_gib();
    if total_memory < preset.total_gpu_memory_gib {
        findings.push(format!(
            "{count} x {} provides {total_memory}GiB of GPU memory but preset '{}' needs {}GiB",
            sku.name, preset.name, preset.total_gpu_memory_gib
        ));
    }
    if total_gpus < preset.gpu_count_requirement {
        findings.push(format!(
            "{count} x {} provides {total_gpus} GPUs but preset '{}' needs {}",
            sku.name, preset.name, preset.gpu_count_requirement
        ));
    }
    let mut errors = Vec::new();
    // A model that cannot shard needs either one node that fits it or a
    // runtime able to span nodes; neither is bypassable.
    if !preset.supports_distributed_inference
        && sku.total_gpu_memory_gib() < preset.total_gpu_memory_gib
        && !runtime.supports_multi_node()
    {
        errors.push(format!(
            "preset '{}' does not support distributed inference and runtime '{}' cannot span nodes, but one {} holds only {}GiB of the {}GiB required",
            preset.name,
            runtime.as_str(),
            sku.name,
            sku.total_gpu_memory_gib(),
            preset.total_gpu_memory_gib
        ));
    }
    if bypass {
        (errors, findings)
    } else {
        errors.extend(findings);
        (errors, Vec::new())
    }
}

/// GPU shape parsed from a BYO node's discovery labels.
#[derive(Debug, PartialEq, Eq)]
struct GpuProfile {
    product: String,
    count: u32,
    memory_gib: u32,
}

fn gpu_profile(node: &Node) -> Result<GpuProfile, String> {
    let name = node.name_any();
    let node_labels = node.labels();
    let product = node_labels
        .get(labels::NODE_GPU_PRODUCT)
        .ok_or_else(|| format!("node '{name}' is missing label '{}'", labels::NODE_GPU_PRODUCT))?;
    let count = node_labels
        .get(labels::NODE_GPU_COUNT)
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| format!("node '{name}' is missing label '{}'", labels::NODE_GPU_COUNT))?;
    let memory = node_labels
        .get(labels::NODE_GPU_MEMORY)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| format!("node '{name}' is missing label '{}'", labels::NODE_GPU_MEMORY))?;
    // GPU feature discovery reports MiB; small values are taken as GiB.
    let memory_gib = if memory >= 1024 { memory / 1024 } else { memory } as u32;
    Ok(GpuProfile {
        product: product.clone(),
        count,
        memory_gib,
    })
}

/// BYO admission: at least one matched node, identical GPU shape across all
/// of them, and enough aggregate GPU to host the preset.
fn check_byo(byo_nodes: &[Node], preset: &PresetMeta, bypass: bool) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    if byo_nodes.is_empty() {
        return (
            vec!["no nodes match the workspace label selector".to_string()],
            Vec::new(),
        );
    }
    let mut profiles = Vec::new();
    for node in byo_nodes {
        match gpu_profile(node) {
            Ok(profile) => profiles.push(profile),
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        return (errors, Vec::new());
    }

    let products: BTreeSet<&str> = profiles.iter().map(|p| p.product.as_str()).collect();
    if products.len() > 1 {
        errors.push(format!(
            "Non-uniform GPU product across matched nodes: {:?}",
            products
        ));
    }
    let counts: BTreeSet<u32> = profiles.iter().map(|p| p.count).collect();
    if counts.len() > 1 {
        errors.push(format!("Non-uniform GPU count across matched nodes: {:?}", counts));
    }
    let memories: BTreeSet<u32> = profiles.iter().map(|p| p.memory_gib).collect();
    if memories.len() > 1 {
        errors.push(format!(
            "Non-uniform GPU memory across matched nodes: {:?}",
            memories
        ));
    }
    if !errors.is_empty() {
        return (errors, Vec::new());
    }

    let profile = &profiles[0];
    let per_node_total = profile.count * profile.memory_gib;
    let node_count = byo_nodes.len() as u32;
    let mut findings = Vec::new();
    if per_node_total * node_count < preset.total_gpu_memory_gib {
        findings.push(format!(
            "{node_count} matched nodes provide {}GiB of GPU memory but preset '{}' needs {}GiB",
            per_node_total * node_count,
            preset.name,
            preset.total_gpu_memory_gib
        ));
    }
    if profile.count * node_count < preset.gpu_count_requirement {
        findings.push(format!(
            "{node_count} matched nodes provide {} GPUs but preset '{}' needs {}",
            profile.count * node_count,
            preset.name,
            preset.gpu_count_requirement
        ));
    }
    if !preset.supports_distributed_inference && per_node_total < preset.total_gpu_memory_gib {
        errors.push(format!(
            "preset '{}' does not support distributed inference but one node holds only {per_node_total}GiB of the {}GiB required",
            preset.name, preset.total_gpu_memory_gib
        ));
    }
    if bypass {
        (errors, findings)
    } else {
        errors.extend(findings);
        (errors, Vec::new())
    }
}

/// Fields frozen after create.
fn check_immutable(new: &WorkspaceSpec, old: &WorkspaceSpec) -> Vec<String> {
    let mut errors = Vec::new();
    if new.resource.instance_type != old.resource.instance_type {
        errors.push("resource.instanceType is immutable".to_string());
    }
    if new.resource.count != old.resource.count {
        errors.push("resource.count is immutable".to_string());
    }
    if new.resource.label_selector != old.resource.label_selector {
        errors.push("resource.labelSelector is immutable".to_string());
    }
    if new.inference.is_some() != old.inference.is_some()
        || new.tuning.is_some() != old.tuning.is_some()
    {
        errors.push("the inference/tuning choice is immutable".to_string());
    }
    if let (Some(new_inference), Some(old_inference)) = (&new.inference, &old.inference) {
        if new_inference.preset != old_inference.preset {
            errors.push("inference.preset is immutable".to_string());
        }
        if new_inference.template.is_some() != old_inference.template.is_some() {
            errors.push("inference.template cannot be set or unset after create".to_string());
        }
    }
    if let (Some(new_tuning), Some(old_tuning)) = (&new.tuning, &old.tuning) {
        if new_tuning.preset != old_tuning.preset {
            errors.push("tuning.preset is immutable".to_string());
        }
        if new_tuning.method != old_tuning.method {
            errors.push("tuning.method is immutable".to_string());
        }
    }
    errors
}

/// Light structural check of an OCI image reference: `[registry/]repo[:tag][@sha256:digest]`.
fn validate_image_ref(image: &str) -> Result<(), String> {
    if image.is_empty() {
        return Err("image reference is empty".to_string());
    }
    if image.chars().any(char::is_whitespace) {
        return Err(format!("image reference '{image}' contains whitespace"));
    }
    let (name_and_tag, digest) = match image.split_once('@') {
        Some((n, d)) => (n, Some(d)),
        None => (image, None),
    };
    if let Some(digest) = digest {
        let valid = digest
            .strip_prefix("sha256:")
            .is_some_and(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(format!("image reference '{image}' has an invalid digest"));
        }
    }
    let (repository, tag) = match name_and_tag.rsplit_once(':') {
        // A colon inside the registry host (port) is not a tag separator.
        Some((r, t)) if !t.contains('/') => (r, Some(t)),
        _ => (name_and_tag, None),
    };
    if repository.is_empty() {
        return Err(format!("image reference '{image}' has an empty repository"));
    }
    if let Some(tag) = tag {
        let valid = !tag.is_empty()
            && tag.len() <= 128
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid {
            return Err(format!("image reference '{image}' has an invalid tag"));
        }
    }
    let path = match repository.split_once('/') {
        // The first component may be a registry host with uppercase or a port.
        Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            rest
        }
        _ => repository,
    };
    let valid_path = path.split('/').all(|part| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
    });
    if !valid_path {
        return Err(format!("image reference '{image}' has an invalid repository path"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StaticPresetRegistry;
    use crate::sku::{CloudProvider, SkuHandler};
    use kaito_types::{AdapterSource, AdapterSpec, PresetRef};

    fn registry() -> StaticPresetRegistry {
        StaticPresetRegistry
    }

    fn preset(name: &str) -> PresetMeta {
        StaticPresetRegistry.get(name).unwrap().clone()
    }

    fn inference(preset_name: &str) -> InferenceSpec {
        InferenceSpec {
            preset: Some(PresetRef {
                name: preset_name.into(),
                model_access_secret: None,
            }),
            ..Default::default()
        }
    }

    fn adapter(name: &str, strength: Option<&str>) -> AdapterSpec {
        AdapterSpec {
            source: AdapterSource {
                name: name.into(),
                image: format!("registry.example.com/adapters/{name}:v1"),
                image_pull_secrets: Vec::new(),
            },
            strength: strength.map(String::from),
        }
    }

    #[test]
    fn dns_labels_are_enforced() {
        assert!(check_name("phi-3-serving").is_empty());
        assert!(!check_name("Has-Caps").is_empty());
        assert!(!check_name("-leading").is_empty());
        assert!(!check_name(&"x".repeat(64)).is_empty());
    }

    #[test]
    fn instance_type_presence_follows_the_feature_gate() {
        let enabled = FeatureGates::default();
        let disabled = FeatureGates {
            disable_node_auto_provisioning: true,
            ..Default::default()
        };
        let with_type = ResourceSpec {
            instance_type: "Standard_NC24s_v3".into(),
            ..Default::default()
        };
        let without = ResourceSpec::default();
        assert!(check_instance_type_presence(&with_type, enabled).is_empty());
        assert!(!check_instance_type_presence(&without, enabled).is_empty());
        assert!(!check_instance_type_presence(&with_type, disabled).is_empty());
    }

    #[test]
    fn exactly_one_workload_must_be_chosen() {
        let neither = WorkspaceSpec::default();
        assert_eq!(check_workload_choice(&neither).len(), 1);
        let both = WorkspaceSpec {
            inference: Some(inference("phi-2")),
            tuning: Some(TuningSpec::default()),
            ..Default::default()
        };
        assert_eq!(check_workload_choice(&both).len(), 1);
        let one = WorkspaceSpec {
            inference: Some(inference("phi-2")),
            ..Default::default()
        };
        assert!(check_workload_choice(&one).is_empty());
    }

    #[test]
    fn access_secret_must_match_preset_requirements() {
        let missing = inference("llama-2-7b");
        assert!(
            check_inference(&missing, &registry())
                .iter()
                .any(|e| e.contains("modelAccessSecret"))
        );
        let mut superfluous = inference("phi-2");
        superfluous.preset.as_mut().unwrap().model_access_secret = Some("hf-token".into());
        assert!(
            check_inference(&superfluous, &registry())
                .iter()
                .any(|e| e.contains("does not take"))
        );
    }

    #[test]
    fn adapters_are_bounded_unique_and_in_range() {
        let mut spec = inference("phi-2");
        spec.adapters = (0..11).map(|i| adapter(&format!("a{i}"), None)).collect();
        assert!(
            check_adapters(&spec)
                .iter()
                .any(|e| e.contains("at most 10"))
        );

        spec.adapters = vec![adapter("dup", None), adapter("dup", None)];
        assert!(
            check_adapters(&spec)
                .iter()
                .any(|e| e.contains("duplicate adapter name"))
        );

        spec.adapters = vec![adapter("hot", Some("1.5"))];
        assert!(
            check_adapters(&spec)
                .iter()
                .any(|e| e.contains("[0.0, 1.0]"))
        );

        spec.adapters = vec![adapter("ok", Some("0.25"))];
        assert!(check_adapters(&spec).is_empty());
    }

    #[test]
    fn tuning_requires_one_node_and_a_tunable_preset() {
        let tuning = TuningSpec {
            preset: PresetRef {
                name: "llama-2-13b".into(),
                model_access_secret: None,
            },
            input: DataSource {
                urls: vec!["https://data.example.com/set.parquet".into()],
                ..Default::default()
            },
            output: DataDestination {
                volume: Some(Default::default()),
                ..Default::default()
            },
            ..Default::default()
        };
        let resource = ResourceSpec {
            count: 2,
            ..Default::default()
        };
        let errors = check_tuning(&tuning, &resource, &registry());
        assert!(errors.iter().any(|e| e.contains("fixed at one node")));
        assert!(errors.iter().any(|e| e.contains("does not support tuning")));
    }

    #[test]
    fn data_source_and_destination_follow_exactly_one() {
        let empty = DataSource::default();
        assert_eq!(check_data_source(&empty).len(), 1);
        let two = DataSource {
            urls: vec!["https://x".into()],
            image: Some("repo/data:1".into()),
            ..Default::default()
        };
        assert_eq!(check_data_source(&two).len(), 1);

        let image_no_secret = DataDestination {
            image: Some("repo/out:1".into()),
            ..Default::default()
        };
        assert!(
            check_data_destination(&image_no_secret)
                .iter()
                .any(|e| e.contains("imagePushSecret"))
        );
    }

    #[test]
    fn resource_fit_is_enforced_and_bypassable() {
        let sku = SkuHandler::new(CloudProvider::Azure)
            .get("Standard_NC24s_v3")
            .unwrap();
        let phi3 = preset("phi-3");
        let (errors, warnings) =
            check_resource_fit(1, sku, &phi3, InferenceRuntime::Vllm, false);
        assert_eq!(warnings.len(), 0);
        assert!(errors.iter().any(|e| e.contains("GPU memory")));

        let (errors, warnings) = check_resource_fit(1, sku, &phi3, InferenceRuntime::Vllm, true);
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 2);

        let (errors, _) = check_resource_fit(2, sku, &phi3, InferenceRuntime::Vllm, false);
        assert!(errors.is_empty());
    }

    #[test]
    fn undistributable_preset_needs_a_spanning_runtime() {
        let sku = SkuHandler::new(CloudProvider::Azure)
            .get("Standard_NC24s_v3")
            .unwrap();
        let phi3 = preset("phi-3");
        let (errors, _) =
            check_resource_fit(2, sku, &phi3, InferenceRuntime::Transformers, true);
        assert!(errors.iter().any(|e| e.contains("cannot span nodes")));
    }

    fn gpu_node(name: &str, product: &str, count: &str, memory: &str) -> Node {
        crate::nodes::fixtures::node(
            name,
            &[
                (labels::NODE_GPU_PRODUCT, product),
                (labels::NODE_GPU_COUNT, count),
                (labels::NODE_GPU_MEMORY, memory),
            ],
            true,
        )
    }

    #[test]
    fn byo_homogeneity_violation_is_rejected() {
        let nodes = vec![
            gpu_node("n1", "A100", "2", "81920"),
            gpu_node("n2", "A100", "2", "81920"),
            gpu_node("n3", "H100", "2", "81920"),
        ];
        let (errors, _) = check_byo(&nodes, &preset("falcon-40b"), false);
        assert!(errors.iter().any(|e| e.contains("Non-uniform GPU product")));
    }

    #[test]
    fn byo_aggregate_fit_is_enforced() {
        let nodes = vec![gpu_node("n1", "V100", "1", "16384")];
        let (errors, _) = check_byo(&nodes, &preset("falcon-40b"), false);
        assert!(errors.iter().any(|e| e.contains("GPU memory")));

        let plenty = vec![
            gpu_node("n1", "A100", "4", "81920"),
            gpu_node("n2", "A100", "4", "81920"),
        ];
        let (errors, _) = check_byo(&plenty, &preset("falcon-40b"), false);
        assert!(errors.is_empty());
    }

    #[test]
    fn byo_undistributable_preset_must_fit_one_node() {
        // Aggregate memory is fine, but phi-3 cannot shard across nodes.
        let nodes = vec![
            gpu_node("n1", "V100", "1", "16384"),
            gpu_node("n2", "V100", "1", "16384"),
        ];
        let (errors, _) = check_byo(&nodes, &preset("phi-3"), true);
        assert!(
            errors
                .iter()
                .any(|e| e.contains("does not support distributed inference"))
        );
    }

    #[test]
    fn byo_requires_at_least_one_matched_node() {
        let (errors, _) = check_byo(&[], &preset("phi-2"), false);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("no nodes match"));
    }

    #[test]
    fn immutable_fields_reject_updates() {
        let old = WorkspaceSpec {
            resource: ResourceSpec {
                instance_type: "Standard_NC24s_v3".into(),
                count: 2,
                ..Default::default()
            },
            inference: Some(inference("phi-3")),
            ..Default::default()
        };
        let mut new = old.clone();
        new.resource.instance_type = "Standard_NC48ads_A100_v4".into();
        new.resource.count = 3;
        new.inference.as_mut().unwrap().preset = Some(PresetRef {
            name: "phi-2".into(),
            model_access_secret: None,
        });
        let errors = check_immutable(&new, &old);
        assert!(errors.iter().any(|e| e.contains("instanceType")));
        assert!(errors.iter().any(|e| e.contains("resource.count")));
        assert!(errors.iter().any(|e| e.contains("inference.preset")));

        let mut toggled = old.clone();
        toggled.inference = None;
        toggled.tuning = Some(TuningSpec::default());
        let errors = check_immutable(&toggled, &old);
        assert!(errors.iter().any(|e| e.contains("choice is immutable")));
    }

    #[test]
    fn image_references_are_parsed_structurally() {
        assert!(validate_image_ref("nginx").is_ok());
        assert!(validate_image_ref("library/nginx:1.27").is_ok());
        assert!(validate_image_ref("registry.example.com:5000/team/model:v1").is_ok());
        assert!(
            validate_image_ref(&format!("repo/app@sha256:{}", "a".repeat(64))).is_ok()
        );
        assert!(validate_image_ref("").is_err());
        assert!(validate_image_ref("has space").is_err());
        assert!(validate_image_ref("repo/app@sha256:short").is_err());
        assert!(validate_image_ref("repo/UpperCase:v1").is_err());
        assert!(validate_image_ref("repo/app:bad tag").is_err());
    }
}
