use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction,
    LocalObjectReference, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kaito_common::{GPU_RESOURCE_NAME, annotations, labels};
use kaito_types::Workspace;
use kube::ResourceExt;
use kube::api::{ObjectMeta, Resource};

use crate::model::{InferenceRuntime, PresetMeta};

pub const INFERENCE_PORT: i32 = 5000;
const ADAPTER_VOLUME: &str = "adapter-volume";
const ADAPTER_MOUNT_PATH: &str = "/mnt/adapters";

pub fn workload_labels(instance: &Workspace) -> BTreeMap<String, String> {
    [(labels::WORKSPACE_NAME.to_string(), instance.name_any())]
        .into_iter()
        .collect()
}

pub fn revision_annotations(revision: &str) -> BTreeMap<String, String> {
    [(
        annotations::WORKSPACE_REVISION.to_string(),
        revision.to_string(),
    )]
    .into_iter()
    .collect()
}

/// Pod template for the inference workload. A user-supplied template is taken
/// as-is apart from the selector labels and revision annotation; preset-based
/// workspaces get the full preset container.
pub fn build_pod_template(
    instance: &Workspace,
    preset: Option<&PresetMeta>,
    runtime: InferenceRuntime,
    gpus_per_node: Option<u32>,
    revision: &str,
) -> PodTemplateSpec {
    let inference = instance.spec.inference.as_ref();
    let mut template = match inference.and_then(|i| i.template.clone()) {
        Some(user_template) => user_template,
        None => preset_pod_template(instance, preset, runtime, gpus_per_node),
    };

    let metadata = template.metadata.get_or_insert_with(Default::default);
    metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(workload_labels(instance));
    metadata
        .annotations
        .get_or_insert_with(Default::default)
        .extend(revision_annotations(revision));
    template
}

fn preset_pod_template(
    instance: &Workspace,
    preset: Option<&PresetMeta>,
    runtime: InferenceRuntime,
    gpus_per_node: Option<u32>,
) -> PodTemplateSpec {
    let inference = instance.spec.inference.as_ref();
    let image = preset.map(|p| p.image()).unwrap_or_default();

    let mut env = vec![
        EnvVar {
            name: "RUNTIME".into(),
            value: Some(runtime.as_str().into()),
            ..Default::default()
        },
        EnvVar {
            name: "MODEL_NAME".into(),
            value: preset.map(|p| p.name.to_string()),
            ..Default::default()
        },
    ];
    if let Some(gpus) = gpus_per_node {
        env.push(EnvVar {
            name: "TENSOR_PARALLEL_SIZE".into(),
            value: Some(gpus.to_string()),
            ..Default::default()
        });
    }
    if let Some(secret) = inference
        .and_then(|i| i.preset.as_ref())
        .and_then(|p| p.model_access_secret.as_ref())
    {
        env.push(EnvVar {
            name: "HF_TOKEN".into(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.clone(),
                    key: "token".into(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let adapters = inference.map(|i| i.adapters.as_slice()).unwrap_or_default();
    let mut volume_mounts = vec![VolumeMount {
        name: "dshm".into(),
        mount_path: "/dev/shm".into(),
        ..Default::default()
    }];
    let mut volumes = vec![Volume {
        name: "dshm".into(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".into()),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut init_containers = Vec::new();
    let mut pull_secrets: Vec<LocalObjectReference> = Vec::new();
    if !adapters.is_empty() {
        volumes.push(Volume {
            name: ADAPTER_VOLUME.into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: ADAPTER_VOLUME.into(),
            mount_path: ADAPTER_MOUNT_PATH.into(),
            ..Default::default()
        });
        for adapter in adapters {
            init_containers.push(Container {
                name: format!("adapter-{}", adapter.source.name),
                image: Some(adapter.source.image.clone()),
                command: Some(vec![
                    "sh".into(),
                    "-c".into(),
                    format!(
                        "mkdir -p {ADAPTER_MOUNT_PATH}/{} && cp -r /data/. {ADAPTER_MOUNT_PATH}/{}",
                        adapter.source.name, adapter.source.name
                    ),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: ADAPTER_VOLUME.into(),
                    mount_path: ADAPTER_MOUNT_PATH.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
            env.push(EnvVar {
                name: format!(
                    "ADAPTER_STRENGTH_{}",
                    adapter.source.name.replace('-', "_").to_uppercase()
                ),
                value: Some(adapter.strength.clone().unwrap_or_else(|| "1.0".into())),
                ..Default::default()
            });
            for secret in &adapter.source.image_pull_secrets {
                pull_secrets.push(LocalObjectReference {
                    name: secret.clone(),
                });
            }
        }
    }

    let gpu_limit = gpus_per_node.unwrap_or(1);
    let container = Container {
        name: "inference".into(),
        image: Some(image),
        ports: Some(vec![ContainerPort {
            container_port: INFERENCE_PORT,
            name: Some("http".into()),
            ..Default::default()
        }]),
        env: Some(env),
        volume_mounts: Some(volume_mounts),
        resources: Some(ResourceRequirements {
            limits: Some(
                [(
                    GPU_RESOURCE_NAME.to_string(),
                    Quantity(gpu_limit.to_string()),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        }),
        readiness_probe: Some(http_probe(5, 10)),
        liveness_probe: Some(http_probe(600, 10)),
        ..Default::default()
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta::default()),
        spec: Some(PodSpec {
            containers: vec![container],
            init_containers: (!init_containers.is_empty()).then_some(init_containers),
            volumes: Some(volumes),
            image_pull_secrets: (!pull_secrets.is_empty()).then_some(pull_secrets),
            ..Default::default()
        }),
    }
}

fn http_probe(initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".into()),
            port: IntOrString::Int(INFERENCE_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

pub(crate) fn base_meta(instance: &Workspace) -> ObjectMeta {
    ObjectMeta {
        name: Some(instance.name_any()),
        namespace: instance.namespace(),
        labels: Some(workload_labels(instance)),
        owner_references: instance.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

pub(crate) fn workload_meta(instance: &Workspace, revision: &str) -> ObjectMeta {
    ObjectMeta {
        annotations: Some(revision_annotations(revision)),
        ..base_meta(instance)
    }
}

/// Replicated singleton shape: one Deployment, each replica self-contained.
pub fn build_deployment(
    instance: &Workspace,
    template: PodTemplateSpec,
    replicas: i32,
    revision: &str,
) -> Deployment {
    Deployment {
        metadata: workload_meta(instance, revision),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(workload_labels(instance)),
                match_expressions: None,
            },
            template,
            ..Default::default()
        }),
        status: None,
    }
}

/// Distributed shape: a StatefulSet with stable pod identity so shards can
/// address each other through the headless service.
pub fn build_statefulset(
    instance: &Workspace,
    template: PodTemplateSpec,
    replicas: i32,
    revision: &str,
) -> StatefulSet {
    StatefulSet {
        metadata: workload_meta(instance, revision),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(workload_labels(instance)),
                match_expressions: None,
            },
            service_name: Some(headless_service_name(instance)),
            pod_management_policy: Some("Parallel".into()),
            template,
            ..Default::default()
        }),
        status: None,
    }
}

pub fn headless_service_name(instance: &Workspace) -> String {
    format!("{}-headless", instance.name_any())
}

/// In-place update limited to the fields the controller owns. Everything
/// else in the pod spec (tolerations, image overrides, node selectors the
/// user patched in) survives the rollout.
pub fn selective_update(current: &mut PodSpec, desired: &PodSpec) {
    if let (Some(current_main), Some(desired_main)) =
        (current.containers.get_mut(0), desired.containers.first())
    {
        current_main.env = desired_main.env.clone();
        current_main.volume_mounts = desired_main.volume_mounts.clone();
    }
    current.init_containers = desired.init_containers.clone();
    current.volumes = desired.volumes.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PresetRegistry, StaticPresetRegistry};
    use kaito_types::{AdapterSource, AdapterSpec, InferenceSpec, PresetRef};

    fn workspace(preset: &str, adapters: Vec<AdapterSpec>) -> Workspace {
        let mut ws = Workspace::new("phi-serving", Default::default());
        ws.metadata.namespace = Some("default".into());
        ws.metadata.uid = Some("uid-1".into());
        ws.spec.inference = Some(InferenceSpec {
            preset: Some(PresetRef {
                name: preset.into(),
                model_access_secret: None,
            }),
            adapters,
            ..Default::default()
        });
        ws
    }

    fn adapter(name: &str, strength: Option<&str>) -> AdapterSpec {
        AdapterSpec {
            source: AdapterSource {
                name: name.into(),
                image: format!("registry.example.com/{name}:v1"),
                image_pull_secrets: vec![],
            },
            strength: strength.map(String::from),
        }
    }

    #[test]
    fn preset_template_carries_runtime_and_revision() {
        let ws = workspace("phi-3", vec![]);
        let preset = StaticPresetRegistry.get("phi-3").unwrap().clone();
        let template = build_pod_template(
            &ws,
            Some(&preset),
            InferenceRuntime::Vllm,
            Some(1),
            "4",
        );
        let annotations_map = template.metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert_eq!(annotations_map.get(annotations::WORKSPACE_REVISION).unwrap(), "4");
        let spec = template.spec.as_ref().unwrap();
        let env = spec.containers[0].env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "RUNTIME" && e.value.as_deref() == Some("vllm")));
        assert!(env.iter().any(|e| e.name == "MODEL_NAME" && e.value.as_deref() == Some("phi-3")));
    }

    #[test]
    fn adapters_become_init_containers_with_strength_envs() {
        let ws = workspace("phi-3", vec![adapter("style", Some("0.4")), adapter("tone", None)]);
        let template = build_pod_template(&ws, None, InferenceRuntime::Vllm, None, "1");
        let spec = template.spec.unwrap();
        let inits = spec.init_containers.unwrap();
        assert_eq!(inits.len(), 2);
        assert_eq!(inits[0].name, "adapter-style");
        let env = spec.containers[0].env.as_ref().unwrap();
        assert!(
            env.iter()
                .any(|e| e.name == "ADAPTER_STRENGTH_STYLE" && e.value.as_deref() == Some("0.4"))
        );
        assert!(
            env.iter()
                .any(|e| e.name == "ADAPTER_STRENGTH_TONE" && e.value.as_deref() == Some("1.0"))
        );
    }

    #[test]
    fn user_template_is_preserved_but_labeled() {
        let mut ws = workspace("phi-3", vec![]);
        let custom = PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "custom".into(),
                    image: Some("registry.example.com/custom:1".into()),
                    ..Default::default()
                }],
                node_selector: Some(
                    [("disktype".to_string(), "ssd".to_string())].into_iter().collect(),
                ),
                ..Default::default()
            }),
        };
        ws.spec.inference.as_mut().unwrap().preset = None;
        ws.spec.inference.as_mut().unwrap().template = Some(custom);
        let template = build_pod_template(&ws, None, InferenceRuntime::Vllm, None, "2");
        let spec = template.spec.as_ref().unwrap();
        assert_eq!(spec.containers[0].name, "custom");
        assert!(spec.node_selector.is_some());
        let labels_map = template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(labels_map.get(labels::WORKSPACE_NAME).unwrap(), "phi-serving");
    }

    #[test]
    fn selective_update_replaces_only_owned_fields() {
        let ws = workspace("phi-3", vec![adapter("style", None)]);
        let preset = StaticPresetRegistry.get("phi-3").unwrap().clone();
        let desired = build_pod_template(&ws, Some(&preset), InferenceRuntime::Vllm, Some(1), "2")
            .spec
            .unwrap();

        let mut current = build_pod_template(
            &workspace("phi-3", vec![]),
            Some(&preset),
            InferenceRuntime::Transformers,
            Some(1),
            "1",
        )
        .spec
        .unwrap();
        // User customizations on fields the controller does not own.
        current.node_selector =
            Some([("disktype".to_string(), "ssd".to_string())].into_iter().collect());
        current.containers[0].image = Some("registry.example.com/patched:9".into());

        selective_update(&mut current, &desired);

        assert_eq!(current.node_selector.as_ref().unwrap().get("disktype").unwrap(), "ssd");
        assert_eq!(
            current.containers[0].image.as_deref(),
            Some("registry.example.com/patched:9")
        );
        assert_eq!(current.containers[0].env, desired.containers[0].env);
        assert_eq!(current.init_containers, desired.init_containers);
        assert_eq!(current.volumes, desired.volumes);
    }

    #[test]
    fn statefulset_uses_the_headless_service() {
        let ws = workspace("llama-2-70b", vec![]);
        let preset = StaticPresetRegistry.get("llama-2-70b").unwrap().clone();
        let template = build_pod_template(&ws, Some(&preset), InferenceRuntime::Vllm, Some(8), "1");
        let sts = build_statefulset(&ws, template, 2, "1");
        let spec = sts.spec.unwrap();
        assert_eq!(spec.service_name.as_deref(), Some("phi-serving-headless"));
        assert_eq!(spec.replicas, Some(2));
    }
}
