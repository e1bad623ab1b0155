use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::jiff::Timestamp;
use kaito_types::{ConditionType, WorkspaceState, WorkspaceStatus};

pub mod reason {
    /// Terminal reconcile failure (revision collision, registry miss).
    pub const WORKSPACE_FAILED: &str = "workspaceFailed";
    pub const WORKSPACE_SUCCEEDED: &str = "workspaceSucceeded";
    pub const JOB_FAILED: &str = "TuningJobFailed";
    pub const JOB_RUNNING: &str = "TuningJobRunning";
    pub const JOB_SUCCEEDED: &str = "TuningJobSucceeded";
    pub const NODES_READY: &str = "NodesReady";
    pub const NODES_NOT_READY: &str = "NodesNotReady";
    pub const RESOURCES_READY: &str = "ResourcesReady";
    pub const RESOURCES_NOT_READY: &str = "ResourcesNotReady";
    pub const INFERENCE_READY: &str = "InferenceReady";
    pub const INFERENCE_NOT_READY: &str = "InferenceNotReady";
    pub const READINESS_TIMEOUT: &str = "ReadinessTimeout";
    pub const DELETING: &str = "WorkspaceDeleting";
}

/// Upserts the condition of the given type. At most one condition exists per
/// type; `lastTransitionTime` moves only when the status value flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    observed_generation: Option<i64>,
    type_: ConditionType,
    status: bool,
    reason: &str,
    message: &str,
) {
    let status_str = if status { "True" } else { "False" };
    match conditions.iter_mut().find(|c| c.type_ == type_.as_str()) {
        Some(existing) => {
            if existing.status != status_str {
                existing.last_transition_time = Time(Timestamp::now());
            }
            existing.status = status_str.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = observed_generation;
        }
        None => conditions.push(Condition {
            type_: type_.as_str().to_string(),
            status: status_str.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
            last_transition_time: Time(Timestamp::now()),
        }),
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: ConditionType) {
    conditions.retain(|c| c.type_ != type_.as_str());
}

pub fn condition<'a>(conditions: &'a [Condition], type_: ConditionType) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_str())
}

pub fn condition_is_true(conditions: &[Condition], type_: ConditionType) -> bool {
    condition(conditions, type_).is_some_and(|c| c.status == "True")
}

/// Derives the high-level state from the composed conditions. `previous`
/// distinguishes a workspace that never became ready (Pending) from one that
/// lost readiness (NotReady).
pub fn derive_state(status: &WorkspaceStatus, previous: WorkspaceState) -> WorkspaceState {
    let conditions = &status.conditions;
    if condition_is_true(conditions, ConditionType::Succeeded) {
        return WorkspaceState::Succeeded;
    }
    if condition(conditions, ConditionType::TuningJobStatus)
        .is_some_and(|c| c.status == "False" && c.reason == reason::JOB_FAILED)
    {
        return WorkspaceState::Failed;
    }
    if condition(conditions, ConditionType::Succeeded)
        .is_some_and(|c| c.status == "False" && c.reason == reason::WORKSPACE_FAILED)
    {
        return WorkspaceState::Failed;
    }
    if condition_is_true(conditions, ConditionType::InferenceStatus)
        && condition_is_true(conditions, ConditionType::ResourceStatus)
    {
        return WorkspaceState::Ready;
    }
    if condition(conditions, ConditionType::InferenceStatus).is_some()
        && matches!(previous, WorkspaceState::Ready | WorkspaceState::NotReady)
    {
        return WorkspaceState::NotReady;
    }
    if condition_is_true(conditions, ConditionType::TuningJobStatus) {
        return WorkspaceState::Running;
    }
    WorkspaceState::Pending
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> Time {
        Time(Timestamp::from_second(0).unwrap())
    }

    fn base_status(entries: &[(ConditionType, bool, &str)]) -> WorkspaceStatus {
        let mut status = WorkspaceStatus::default();
        for (type_, value, why) in entries {
            set_condition(&mut status.conditions, Some(1), *type_, *value, why, why);
        }
        status
    }

    #[test]
    fn at_most_one_condition_per_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Some(1), ConditionType::NodeStatus, false, "a", "a");
        set_condition(&mut conditions, Some(2), ConditionType::NodeStatus, true, "b", "b");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn transition_time_moves_only_on_status_flips() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Some(1), ConditionType::NodeStatus, false, "a", "a");
        conditions[0].last_transition_time = epoch();

        set_condition(&mut conditions, Some(2), ConditionType::NodeStatus, false, "b", "b");
        assert_eq!(conditions[0].last_transition_time, epoch());
        assert_eq!(conditions[0].reason, "b");

        set_condition(&mut conditions, Some(3), ConditionType::NodeStatus, true, "c", "c");
        assert_ne!(conditions[0].last_transition_time, epoch());
    }

    #[test]
    fn succeeded_condition_wins() {
        let status = base_status(&[
            (ConditionType::Succeeded, true, reason::WORKSPACE_SUCCEEDED),
            (ConditionType::InferenceStatus, false, reason::INFERENCE_NOT_READY),
        ]);
        assert_eq!(derive_state(&status, WorkspaceState::Pending), WorkspaceState::Succeeded);
    }

    #[test]
    fn terminal_failure_maps_to_failed() {
        let status = base_status(&[(ConditionType::Succeeded, false, reason::WORKSPACE_FAILED)]);
        assert_eq!(derive_state(&status, WorkspaceState::Ready), WorkspaceState::Failed);
    }

    #[test]
    fn failed_tuning_job_maps_to_failed() {
        let status = base_status(&[(ConditionType::TuningJobStatus, false, reason::JOB_FAILED)]);
        assert_eq!(derive_state(&status, WorkspaceState::Running), WorkspaceState::Failed);
    }

    #[test]
    fn ready_requires_inference_and_resources() {
        let status = base_status(&[
            (ConditionType::InferenceStatus, true, reason::INFERENCE_READY),
            (ConditionType::ResourceStatus, true, reason::RESOURCES_READY),
        ]);
        assert_eq!(derive_state(&status, WorkspaceState::Pending), WorkspaceState::Ready);
    }

    #[test]
    fn lost_readiness_is_not_ready_not_pending() {
        let status = base_status(&[
            (ConditionType::InferenceStatus, false, reason::INFERENCE_NOT_READY),
            (ConditionType::ResourceStatus, true, reason::RESOURCES_READY),
        ]);
        assert_eq!(derive_state(&status, WorkspaceState::Ready), WorkspaceState::NotReady);
        assert_eq!(derive_state(&status, WorkspaceState::Pending), WorkspaceState::Pending);
    }

    #[test]
    fn active_tuning_job_is_running() {
        let status = base_status(&[(ConditionType::TuningJobStatus, true, reason::JOB_RUNNING)]);
        assert_eq!(derive_state(&status, WorkspaceState::Pending), WorkspaceState::Running);
    }
}
