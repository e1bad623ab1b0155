use k8s_openapi::api::core::v1::{PodTemplateSpec, VolumeSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

mod nodeclaim;
pub use nodeclaim::*;

/// Compute resources claimed by a Workspace: either a GPU SKU to provision
/// (`instance_type` set) or a pool of user-provided nodes matched by
/// `label_selector` when auto-provisioning is disabled.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default)]
    pub instance_type: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_nodes: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresetRef {
    pub name: String,
    /// Secret holding credentials for presets that download weights at runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_access_secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdapterSource {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdapterSpec {
    pub source: AdapterSource,
    /// Blend weight in [0.0, 1.0], carried as a decimal string.
    #[serde(default = "default_strength", skip_serializing_if = "Option::is_none")]
    pub strength: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InferenceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<PresetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adapters: Vec<AdapterSpec>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum TuningMethod {
    #[default]
    Lora,
    Qlora,
}

impl fmt::Display for TuningMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuningMethod::Lora => write!(f, "lora"),
            TuningMethod::Qlora => write!(f, "qlora"),
        }
    }
}

impl FromStr for TuningMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lora" => Ok(TuningMethod::Lora),
            "qlora" => Ok(TuningMethod::Qlora),
            _ => Err(()),
        }
    }
}

/// Where a tuning job reads its dataset from. Exactly one member is set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeSource>,
}

/// Where a tuning job writes its adapter output. Exactly one of
/// `volume`/`image`; pushing to an image requires `image_push_secret`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_push_secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TuningSpec {
    pub preset: PresetRef,
    #[serde(default)]
    pub method: TuningMethod,
    /// Name of the ConfigMap holding `training_config.yaml`. Defaults to
    /// `<method>-params-template` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default)]
    pub input: DataSource,
    #[serde(default)]
    pub output: DataDestination,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "kaito.sh",
    version = "v1beta1",
    kind = "Workspace",
    plural = "workspaces",
    derive = "PartialEq",
    status = "WorkspaceStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.resource.instanceType\", \"name\": \"INSTANCE\", \"type\": \"string\" }"
)]
#[kube(printcolumn = "{\"jsonPath\": \".status.state\", \"name\": \"STATE\", \"type\": \"string\" }")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.targetNodeCount\", \"name\": \"NODES\", \"type\": \"integer\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    #[serde(default)]
    pub resource: ResourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference: Option<InferenceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuning: Option<TuningSpec>,
}

/// Observed rollout shape of the inference workload.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InferenceStatus {
    pub replicas: u32,
    pub selector: String,
    pub per_replica_node_count: u32,
    pub target_node_count: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    #[serde(default)]
    pub state: WorkspaceState,
    #[serde(default)]
    pub target_node_count: u32,
    /// Names of the nodes currently backing the workload, sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference: Option<InferenceStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum WorkspaceState {
    #[default]
    Pending,
    Running,
    Ready,
    NotReady,
    Succeeded,
    Failed,
}

impl FromStr for WorkspaceState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(WorkspaceState::Pending),
            "Running" => Ok(WorkspaceState::Running),
            "Ready" => Ok(WorkspaceState::Ready),
            "NotReady" => Ok(WorkspaceState::NotReady),
            "Succeeded" => Ok(WorkspaceState::Succeeded),
            "Failed" => Ok(WorkspaceState::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceState::Pending => write!(f, "Pending"),
            WorkspaceState::Running => write!(f, "Running"),
            WorkspaceState::Ready => write!(f, "Ready"),
            WorkspaceState::NotReady => write!(f, "NotReady"),
            WorkspaceState::Succeeded => write!(f, "Succeeded"),
            WorkspaceState::Failed => write!(f, "Failed"),
        }
    }
}

/// Typed names for `status.conditions` entries. At most one condition exists
/// per type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    NodeStatus,
    NodeClaimStatus,
    ResourceStatus,
    InferenceStatus,
    TuningJobStatus,
    Succeeded,
    Deleting,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::NodeStatus => "NodeStatus",
            ConditionType::NodeClaimStatus => "NodeClaimStatus",
            ConditionType::ResourceStatus => "ResourceStatus",
            ConditionType::InferenceStatus => "InferenceStatus",
            ConditionType::TuningJobStatus => "TuningJobStatus",
            ConditionType::Succeeded => "Succeeded",
            ConditionType::Deleting => "Deleting",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_count() -> u32 {
    1
}

fn default_replicas() -> u32 {
    1
}

fn default_strength() -> Option<String> {
    Some("1.0".to_string())
}

impl Workspace {
    /// True when the annotation is present and set to a truthy value.
    pub fn bool_annotation(&self, key: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .is_some_and(|v| ["1", "true"].contains(&v.to_lowercase().as_str()))
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}
