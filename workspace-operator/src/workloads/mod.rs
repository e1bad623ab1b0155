use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kaito_common::{annotations, features::FeatureGates};
use kaito_types::Workspace;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, PostParams, PropagationPolicy},
};

use crate::events::EventSink;
use crate::model::{InferenceRuntime, PresetMeta};
use crate::util::Error;

pub mod inference;
pub mod tuning;

/// Shape of the inference workload, fully determined by preset metadata: a
/// model that shards across nodes runs as a StatefulSet, everything else as a
/// Deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

pub fn inference_kind(preset: Option<&PresetMeta>) -> WorkloadKind {
    match preset {
        Some(p) if p.supports_distributed_inference => WorkloadKind::StatefulSet,
        _ => WorkloadKind::Deployment,
    }
}

/// Observed state of the inference workload after an apply pass.
pub struct InferenceSync {
    pub desired: i32,
    pub ready: i32,
    /// Set when the workload kind changed and the old workload was replaced.
    pub migrated: bool,
    /// Creation time of the live workload, for readiness-timeout accounting.
    pub created_at: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>,
}

/// Observed state of the tuning job after an apply pass.
pub struct TuningSync {
    pub active: i32,
    pub succeeded: bool,
    pub failed: bool,
    /// The job is being torn down for a revision change.
    pub recreating: bool,
}

pub struct WorkloadApplier {
    pub gates: FeatureGates,
}

impl WorkloadApplier {
    /// Converges the inference workload to the current revision. Unchanged
    /// revisions are a no-op; changed revisions get a selective in-place
    /// update; a kind change deletes the old workload first and tolerates the
    /// brief gap.
    pub async fn apply_inference(
        &self,
        client: Client,
        events: &EventSink,
        instance: &Workspace,
        preset: Option<&PresetMeta>,
        runtime: InferenceRuntime,
        gpus_per_node: Option<u32>,
        replicas: i32,
        revision: &str,
    ) -> Result<InferenceSync, Error> {
        let namespace = instance.namespace().unwrap_or_default();
        let name = instance.name_any();
        let kind = inference_kind(preset);

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
        let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);

        let mut migrated = false;
        match kind {
            WorkloadKind::Deployment => {
                if statefulsets.get_opt(&name).await?.is_some() {
                    migrated = true;
                    events
                        .warning(
                            instance,
                            "WorkloadMigration",
                            "MigrateWorkload",
                            "workload kind changed; deleting the StatefulSet and recreating as a Deployment (brief unavailability)"
                                .to_string(),
                        )
                        .await;
                    statefulsets.delete(&name, &Default::default()).await?;
                }
            }
            WorkloadKind::StatefulSet => {
                if deployments.get_opt(&name).await?.is_some() {
                    migrated = true;
                    events
                        .warning(
                            instance,
                            "WorkloadMigration",
                            "MigrateWorkload",
                            "workload kind changed; deleting the Deployment and recreating as a StatefulSet (brief unavailability)"
                                .to_string(),
                        )
                        .await;
                    deployments.delete(&name, &Default::default()).await?;
                }
            }
        }

        self.ensure_services(client.clone(), instance, kind).await?;

        let template =
            inference::build_pod_template(instance, preset, runtime, gpus_per_node, revision);
        match kind {
            WorkloadKind::Deployment => {
                let existing = deployments.get_opt(&name).await?;
                match existing {
                    None => {
                        let desired =
                            inference::build_deployment(instance, template, replicas, revision);
                        create_tolerant(&deployments, &desired).await?;
                        Ok(InferenceSync {
                            desired: replicas,
                            ready: 0,
                            migrated,
                            created_at: None,
                        })
                    }
                    Some(mut current) => {
                        let ready = current
                            .status
                            .as_ref()
                            .and_then(|s| s.ready_replicas)
                            .unwrap_or(0);
                        let created_at = current.metadata.creation_timestamp.clone();
                        if workload_revision(current.annotations()) != Some(revision) {
                            let spec = current.spec.get_or_insert_with(Default::default);
                            spec.replicas = Some(replicas);
                            if let (Some(current_pod), Some(desired_pod)) =
                                (spec.template.spec.as_mut(), template.spec.as_ref())
                            {
                                inference::selective_update(current_pod, desired_pod);
                            }
                            stamp_revision(&mut current.metadata.annotations, revision);
                            stamp_revision(
                                &mut spec
                                    .template
                                    .metadata
                                    .get_or_insert_with(Default::default)
                                    .annotations,
                                revision,
                            );
                            deployments
                                .replace(&name, &PostParams::default(), &current)
                                .await?;
                        }
                        Ok(InferenceSync {
                            desired: replicas,
                            ready,
                            migrated,
                            created_at,
                        })
                    }
                }
            }
            WorkloadKind::StatefulSet => {
                let existing = statefulsets.get_opt(&name).await?;
                match existing {
                    None => {
                        let desired =
                            inference::build_statefulset(instance, template, replicas, revision);
                        create_tolerant(&statefulsets, &desired).await?;
                        Ok(InferenceSync {
                            desired: replicas,
                            ready: 0,
                            migrated,
                            created_at: None,
                        })
                    }
                    Some(mut current) => {
                        let ready = current
                            .status
                            .as_ref()
                            .and_then(|s| s.ready_replicas)
                            .unwrap_or(0);
                        let created_at = current.metadata.creation_timestamp.clone();
                        if workload_revision(current.annotations()) != Some(revision) {
                            let spec = current.spec.get_or_insert_with(Default::default);
                            spec.replicas = Some(replicas);
                            if let (Some(current_pod), Some(desired_pod)) =
                                (spec.template.spec.as_mut(), template.spec.as_ref())
                            {
                                inference::selective_update(current_pod, desired_pod);
                            }
                            stamp_revision(&mut current.metadata.annotations, revision);
                            stamp_revision(
                                &mut spec
                                    .template
                                    .metadata
                                    .get_or_insert_with(Default::default)
                                    .annotations,
                                revision,
                            );
                            statefulsets
                                .replace(&name, &PostParams::default(), &current)
                                .await?;
                        }
                        Ok(InferenceSync {
                            desired: replicas,
                            ready,
                            migrated,
                            created_at,
                        })
                    }
                }
            }
        }
    }

    /// Converges the tuning job. Jobs are immutable, so a revision change
    /// deletes the old job with foreground propagation and recreates it on
    /// the next pass. A finished job with the current revision stays as-is.
    pub async fn apply_tuning(
        &self,
        client: Client,
        instance: &Workspace,
        preset: &PresetMeta,
        revision: &str,
        config_name: &str,
        gpus_per_node: Option<u32>,
    ) -> Result<TuningSync, Error> {
        let namespace = instance.namespace().unwrap_or_default();
        let name = instance.name_any();
        let jobs: Api<Job> = Api::namespaced(client, &namespace);
        let Some(job) = jobs.get_opt(&name).await? else {
            let desired =
                tuning::build_tuning_job(instance, preset, revision, config_name, gpus_per_node);
            create_tolerant(&jobs, &desired).await?;
            return Ok(TuningSync {
                active: 0,
                succeeded: false,
                failed: false,
                recreating: false,
            });
        };

        if workload_revision(job.annotations()) != Some(revision) {
            if job.metadata.deletion_timestamp.is_none() {
                jobs.delete(
                    &name,
                    &DeleteParams {
                        propagation_policy: Some(PropagationPolicy::Foreground),
                        ..Default::default()
                    },
                )
                .await?;
            }
            return Ok(TuningSync {
                active: 0,
                succeeded: false,
                failed: false,
                recreating: true,
            });
        }

        let status = job.status.as_ref();
        Ok(TuningSync {
            active: status.and_then(|s| s.active).unwrap_or(0),
            succeeded: status.and_then(|s| s.succeeded).unwrap_or(0) > 0,
            failed: status.and_then(|s| s.failed).unwrap_or(0) > 0,
            recreating: false,
        })
    }

    async fn ensure_services(
        &self,
        client: Client,
        instance: &Workspace,
        kind: WorkloadKind,
    ) -> Result<(), Error> {
        let namespace = instance.namespace().unwrap_or_default();
        let services: Api<Service> = Api::namespaced(client, &namespace);
        let load_balancer = instance.bool_annotation(annotations::ENABLE_LOAD_BALANCER)
            && !self.gates.gateway_api_inference_extension;
        create_tolerant(&services, &build_service(instance, load_balancer)).await?;
        if kind == WorkloadKind::StatefulSet {
            create_tolerant(&services, &build_headless_service(instance)).await?;
        }
        Ok(())
    }
}

fn workload_revision(object_annotations: &std::collections::BTreeMap<String, String>) -> Option<&str> {
    object_annotations
        .get(annotations::WORKSPACE_REVISION)
        .map(String::as_str)
}

fn stamp_revision(
    object_annotations: &mut Option<std::collections::BTreeMap<String, String>>,
    revision: &str,
) {
    object_annotations
        .get_or_insert_with(Default::default)
        .insert(annotations::WORKSPACE_REVISION.to_string(), revision.to_string());
}

async fn create_tolerant<K>(api: &Api<K>, desired: &K) -> Result<(), Error>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), desired).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn build_service(instance: &Workspace, load_balancer: bool) -> Service {
    Service {
        metadata: inference::base_meta(instance),
        spec: Some(ServiceSpec {
            type_: Some(if load_balancer { "LoadBalancer" } else { "ClusterIP" }.into()),
            selector: Some(inference::workload_labels(instance)),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: 80,
                target_port: Some(IntOrString::Int(inference::INFERENCE_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_headless_service(instance: &Workspace) -> Service {
    let mut service = build_service(instance, false);
    service.metadata.name = Some(inference::headless_service_name(instance));
    if let Some(spec) = service.spec.as_mut() {
        spec.cluster_ip = Some("None".into());
        spec.type_ = Some("ClusterIP".into());
    }
    service
}
