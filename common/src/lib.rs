pub mod features;
pub mod shutdown;

/// Finalizer attached to every admitted Workspace. Its presence on a deleting
/// Workspace is the signal to run NodeClaim cleanup; removing it completes the
/// delete.
pub const WORKSPACE_FINALIZER: &str = "workspace.finalizer.kaito.sh";

/// Kubernetes field manager used for all patches issued by the operator.
pub const MANAGER_NAME: &str = "kaito-workspace-operator";

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

pub mod annotations {
    /// Content hash of `(resource, inference, tuning)` for the current spec.
    pub const WORKSPACE_HASH: &str = "workspace.kaito.io/hash";
    /// Monotonic revision number assigned by the revision store.
    pub const WORKSPACE_REVISION: &str = "workspace.kaito.io/revision";
    /// When set, resource-fit admission checks only warn instead of rejecting.
    pub const BYPASS_RESOURCE_CHECKS: &str = "kaito.sh/bypass-resource-checks";
    /// Overrides the inference runtime selected from preset metadata.
    pub const RUNTIME: &str = "kaito.sh/runtime";
    /// Exposes the inference service through a LoadBalancer.
    pub const ENABLE_LOAD_BALANCER: &str = "kaito.sh/enablelb";
}

pub mod labels {
    /// Name of the owning Workspace, applied to NodeClaims and workloads.
    pub const WORKSPACE_NAME: &str = "kaito.sh/workspace";
    /// Namespace of the owning Workspace (NodeClaims are cluster-scoped).
    pub const WORKSPACE_NAMESPACE: &str = "kaito.sh/workspace-namespace";
    /// Marks nodes produced by one of our NodeClaims.
    pub const MACHINE_TYPE: &str = "kaito.sh/machine-type";
    pub const MACHINE_TYPE_GPU: &str = "gpu";
    /// Required by the NVIDIA device plugin before it advertises capacity.
    pub const ACCELERATOR: &str = "accelerator";
    pub const ACCELERATOR_NVIDIA: &str = "nvidia";

    pub const NODE_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
    pub const NODE_GPU_PRODUCT: &str = "nvidia.com/gpu.product";
    pub const NODE_GPU_COUNT: &str = "nvidia.com/gpu.count";
    pub const NODE_GPU_MEMORY: &str = "nvidia.com/gpu.memory";
}

/// Resource name under which the device plugin advertises GPUs.
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

pub mod env {
    /// Selects the instance-type catalog (`azure` or `aws`).
    pub const CLOUD_PROVIDER: &str = "CLOUD_PROVIDER";
    /// Image registry prefix for preset images.
    pub const PRESET_REGISTRY_NAME: &str = "PRESET_REGISTRY_NAME";
}
