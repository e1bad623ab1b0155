use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kaito_common::GPU_RESOURCE_NAME;
use kaito_types::Workspace;
use kube::api::ObjectMeta;

use super::inference::{revision_annotations, workload_labels, workload_meta};
use crate::model::PresetMeta;
use crate::validation::tuning_config::TRAINING_CONFIG_KEY;

const CONFIG_MOUNT_PATH: &str = "/mnt/config";
const DATA_MOUNT_PATH: &str = "/mnt/data";
const RESULTS_MOUNT_PATH: &str = "/mnt/results";
const DOWNLOADER_IMAGE: &str = "busybox:1.36";

/// One-shot fine-tuning batch job. The job runs on a single node; the input
/// dataset and the result destination are wired up from the workspace's
/// DataSource/DataDestination.
pub fn build_tuning_job(
    instance: &Workspace,
    preset: &PresetMeta,
    revision: &str,
    config_name: &str,
    gpus_per_node: Option<u32>,
) -> Job {
    let tuning = instance.spec.tuning.as_ref();

    let mut volumes = vec![
        Volume {
            name: "config".into(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "results".into(),
            ..results_volume(instance)
        },
    ];
    let mut volume_mounts = vec![
        VolumeMount {
            name: "config".into(),
            mount_path: CONFIG_MOUNT_PATH.into(),
            ..Default::default()
        },
        VolumeMount {
            name: "results".into(),
            mount_path: RESULTS_MOUNT_PATH.into(),
            ..Default::default()
        },
    ];
    let mut env = vec![
        EnvVar {
            name: "TUNING_METHOD".into(),
            value: tuning.map(|t| t.method.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "MODEL_NAME".into(),
            value: Some(preset.name.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "CONFIG_FILE".into(),
            value: Some(format!("{CONFIG_MOUNT_PATH}/{TRAINING_CONFIG_KEY}")),
            ..Default::default()
        },
        EnvVar {
            name: "OUTPUT_DIR".into(),
            value: Some(RESULTS_MOUNT_PATH.into()),
            ..Default::default()
        },
    ];

    let mut init_containers = Vec::new();
    if let Some(input) = tuning.map(|t| &t.input) {
        let input_volume = match input.volume.clone() {
            Some(source) => Volume {
                name: "input-data".into(),
                ..volume_from_source(source)
            },
            None => Volume {
                name: "input-data".into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        };
        volumes.push(input_volume);
        volume_mounts.push(VolumeMount {
            name: "input-data".into(),
            mount_path: DATA_MOUNT_PATH.into(),
            ..Default::default()
        });
        env.push(EnvVar {
            name: "DATASET_DIR".into(),
            value: Some(DATA_MOUNT_PATH.into()),
            ..Default::default()
        });
        if !input.urls.is_empty() {
            init_containers.push(download_container(&input.urls));
        }
        if let Some(image) = &input.image {
            init_containers.push(Container {
                name: "data-image".into(),
                image: Some(image.clone()),
                command: Some(vec![
                    "sh".into(),
                    "-c".into(),
                    format!("cp -r /data/. {DATA_MOUNT_PATH}"),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "input-data".into(),
                    mount_path: DATA_MOUNT_PATH.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    if let Some(output) = tuning.map(|t| &t.output)
        && let Some(image) = &output.image
    {
        env.push(EnvVar {
            name: "OUTPUT_IMAGE".into(),
            value: Some(image.clone()),
            ..Default::default()
        });
        if let Some(secret) = &output.image_push_secret {
            volumes.push(Volume {
                name: "push-secret".into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: "push-secret".into(),
                mount_path: "/root/.docker".into(),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }

    let container = Container {
        name: "tuning".into(),
        image: Some(preset.image()),
        env: Some(env),
        volume_mounts: Some(volume_mounts),
        resources: Some(ResourceRequirements {
            limits: Some(
                [(
                    GPU_RESOURCE_NAME.to_string(),
                    Quantity(gpus_per_node.unwrap_or(1).to_string()),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };

    Job {
        metadata: workload_meta(instance, revision),
        spec: Some(JobSpec {
            parallelism: Some(1),
            completions: Some(1),
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(workload_labels(instance)),
                    annotations: Some(revision_annotations(revision)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    init_containers: (!init_containers.is_empty()).then_some(init_containers),
                    volumes: Some(volumes),
                    restart_policy: Some("Never".into()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn results_volume(instance: &Workspace) -> Volume {
    let output_volume = instance
        .spec
        .tuning
        .as_ref()
        .and_then(|t| t.output.volume.clone());
    match output_volume {
        Some(source) => volume_from_source(source),
        None => Volume {
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    }
}

fn volume_from_source(source: k8s_openapi::api::core::v1::VolumeSource) -> Volume {
    Volume {
        host_path: source.host_path,
        empty_dir: source.empty_dir,
        persistent_volume_claim: source.persistent_volume_claim,
        nfs: source.nfs,
        azure_file: source.azure_file,
        csi: source.csi,
        ..Default::default()
    }
}

fn download_container(urls: &[String]) -> Container {
    let script = format!(
        "cd {DATA_MOUNT_PATH} && for url in $DATASET_URLS; do wget \"$url\"; done",
    );
    Container {
        name: "data-downloader".into(),
        image: Some(DOWNLOADER_IMAGE.into()),
        command: Some(vec!["sh".into(), "-c".into(), script]),
        env: Some(vec![EnvVar {
            name: "DATASET_URLS".into(),
            value: Some(urls.join(" ")),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "input-data".into(),
            mount_path: DATA_MOUNT_PATH.into(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PresetRegistry, StaticPresetRegistry};
    use kaito_common::annotations;
    use kaito_types::{DataDestination, DataSource, PresetRef, TuningMethod, TuningSpec};

    fn workspace(urls: Vec<String>, output_image: Option<&str>) -> Workspace {
        let mut ws = Workspace::new("tuner", Default::default());
        ws.metadata.namespace = Some("default".into());
        ws.metadata.uid = Some("uid-2".into());
        ws.spec.tuning = Some(TuningSpec {
            preset: PresetRef {
                name: "phi-2".into(),
                model_access_secret: None,
            },
            method: TuningMethod::Qlora,
            config: None,
            input: DataSource {
                urls,
                ..Default::default()
            },
            output: DataDestination {
                image: output_image.map(String::from),
                image_push_secret: output_image.map(|_| "push-secret".to_string()),
                volume: output_image.is_none().then_some(Default::default()),
                ..Default::default()
            },
        });
        ws
    }

    #[test]
    fn job_is_single_shot_and_revision_stamped() {
        let preset = StaticPresetRegistry.get("phi-2").unwrap().clone();
        let job = build_tuning_job(
            &workspace(vec!["https://data.example.com/a.parquet".into()], None),
            &preset,
            "3",
            "qlora-params-template",
            Some(1),
        );
        assert_eq!(
            job.metadata.annotations.as_ref().unwrap()[annotations::WORKSPACE_REVISION],
            "3"
        );
        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.completions, Some(1));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn url_inputs_get_a_downloader_init_container() {
        let preset = StaticPresetRegistry.get("phi-2").unwrap().clone();
        let job = build_tuning_job(
            &workspace(vec!["https://data.example.com/a.parquet".into()], None),
            &preset,
            "1",
            "qlora-params-template",
            None,
        );
        let pod = job.spec.unwrap().template.spec.unwrap();
        let inits = pod.init_containers.unwrap();
        assert_eq!(inits[0].name, "data-downloader");
        assert!(
            inits[0].env.as_ref().unwrap()[0]
                .value
                .as_deref()
                .unwrap()
                .contains("a.parquet")
        );
    }

    #[test]
    fn image_output_mounts_the_push_secret() {
        let preset = StaticPresetRegistry.get("phi-2").unwrap().clone();
        let job = build_tuning_job(
            &workspace(vec!["https://x".into()], Some("registry.example.com/out:v1")),
            &preset,
            "1",
            "qlora-params-template",
            None,
        );
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert!(pod.volumes.as_ref().unwrap().iter().any(|v| v.name == "push-secret"));
        let env = pod.containers[0].env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "OUTPUT_IMAGE"));
    }
}
