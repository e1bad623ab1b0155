use futures::stream::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kaito_common::{
    MANAGER_NAME, WORKSPACE_FINALIZER, annotations, features::FeatureGates, labels,
};
use kaito_types::{ConditionType, NodeClaim, Workspace, WorkspaceState, WorkspaceStatus};
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    client::Client,
    runtime::{Controller, controller::Action, reflector::ObjectRef, watcher},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::planner;
use crate::events::EventSink;
use crate::expectations::{self, Expectations};
use crate::model::{DEFAULT_DISK_SIZE_GIB, InferenceRuntime, PresetMeta, PresetRegistry};
use crate::nodeclaim::{self, NodeClaimManager, reason as claim_reason};
use crate::nodes::{self, PluginGate, selector};
use crate::revision::RevisionStore;
use crate::sku::SkuHandler;
use crate::status::{self, reason};
use crate::util::{
    Error, PROBE_INTERVAL, TERMINATION_POLL_INTERVAL,
    colors::{FG1, FG2},
    patch::update_status_with_retry,
};
use crate::workloads::WorkloadApplier;

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Startup knobs threaded through from the CLI.
pub struct Settings {
    pub gates: FeatureGates,
    pub revision_hash_width: usize,
    pub max_revision_history: usize,
}

/// Entrypoint for the `Workspace` controller.
pub async fn run(
    client: Client,
    registry: Arc<dyn PresetRegistry>,
    expectations: Arc<Expectations>,
    settings: Settings,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Workspace controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(
        client.clone(),
        registry,
        expectations,
        settings,
    ));

    // Namespace for the leader-election Lease; the controller itself watches
    // Workspaces cluster-wide.
    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("kaito-workspace-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "kaito-workspace-controller-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    kaito_common::signal_ready();
    // We run indefinitely; only the leader runs the controller.
    // On leadership loss, we abort the controller and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Workspace controller started.".green());
                    Controller::new(
                        Api::<Workspace>::all(client_for_controller.clone()),
                        Default::default(),
                    )
                    .owns(
                        Api::<Deployment>::all(client_for_controller.clone()),
                        Default::default(),
                    )
                    .owns(
                        Api::<StatefulSet>::all(client_for_controller.clone()),
                        Default::default(),
                    )
                    .owns(
                        Api::<Job>::all(client_for_controller.clone()),
                        Default::default(),
                    )
                    .watches(
                        Api::<NodeClaim>::all(client_for_controller),
                        watcher::Config::default().labels(labels::WORKSPACE_NAME),
                        |claim| {
                            let claim_labels = claim.labels();
                            match (
                                claim_labels.get(labels::WORKSPACE_NAME),
                                claim_labels.get(labels::WORKSPACE_NAMESPACE),
                            ) {
                                (Some(name), Some(namespace)) => {
                                    Some(ObjectRef::new(name).within(namespace))
                                }
                                _ => None,
                            }
                        },
                    )
                    .run(reconcile, on_error, context_for_controller)
                    .for_each(|_res| async move {})
                    .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile` and `on_error` method invocation.
pub struct ContextData {
    client: Client,
    events: EventSink,
    expectations: Arc<Expectations>,
    registry: Arc<dyn PresetRegistry>,
    sku: SkuHandler,
    gates: FeatureGates,
    revisions: RevisionStore,
    claims: NodeClaimManager,
    applier: WorkloadApplier,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_state: Mutex<HashMap<(String, String), (String, Instant)>>,
}

impl ContextData {
    pub fn new(
        client: Client,
        registry: Arc<dyn PresetRegistry>,
        expectations: Arc<Expectations>,
        settings: Settings,
    ) -> Self {
        let sku = SkuHandler::from_env();
        ContextData {
            events: EventSink::new(client.clone()),
            claims: NodeClaimManager {
                expectations: expectations.clone(),
                provider: crate::sku::CloudProvider::from_env(),
            },
            applier: WorkloadApplier {
                gates: settings.gates,
            },
            revisions: RevisionStore {
                hash_width: settings.revision_hash_width,
                max_history: settings.max_revision_history,
            },
            gates: settings.gates,
            sku,
            registry,
            expectations,
            client,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new("workspaces"),
            last_state: Mutex::new(HashMap::new()),
        }
    }
}

/// Reconciliation function for the `Workspace` resource.
async fn reconcile(instance: Arc<Workspace>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected Workspace resource to be namespaced. Can't reconcile an unknown namespace."
                    .to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    if instance.metadata.deletion_timestamp.is_some() {
        return finalize(&instance, &context).await;
    }

    let instance = ensure_finalizer(&client, &context.events, &instance).await?;

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Read-and-mutate phase: every subsystem contributes to the status draft,
    // which is written exactly once at the end (also on the error path).
    let (status, requeue, error) = determine(&instance, &context).await;

    let state_label = status.state.to_string();
    log_state_change(&context, &namespace, &name, &state_label).await;

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, &state_label])
        .observe(start.elapsed().as_secs_f64());
    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, &state_label])
        .inc();

    // Deferred status sync: a failed status write replaces a nil primary
    // error, never a real one.
    #[cfg(feature = "metrics")]
    let timer = context
        .metrics
        .write_histogram
        .with_label_values(&[&name, &namespace, &state_label])
        .start_timer();
    let draft = status.clone();
    let write_result =
        update_status_with_retry(client, &instance, move |s| *s = draft.clone()).await;
    #[cfg(feature = "metrics")]
    timer.observe_duration();
    let error = match (error, write_result) {
        (Some(primary), _) => Some(primary),
        (None, Err(e)) => Some(e),
        (None, Ok(())) => None,
    };

    match error {
        Some(e) if e.is_terminal() => {
            // Surfaced through Succeeded=False/workspaceFailed; retrying
            // faster than the normal cadence will not help.
            eprintln!(
                "{}",
                format!("workspace {namespace}/{name} failed: {e}").red()
            );
            Ok(Action::requeue(PROBE_INTERVAL))
        }
        Some(e) => Err(e),
        None => Ok(Action::requeue(requeue.unwrap_or(PROBE_INTERVAL))),
    }
}

async fn log_state_change(context: &ContextData, namespace: &str, name: &str, state: &str) {
    let value = {
        let mut states = context.last_state.lock().await;
        states.insert(
            (namespace.to_string(), name.to_string()),
            (state.to_string(), Instant::now()),
        )
    };
    let changed = match value {
        Some((last, at)) => last != state || at.elapsed() > Duration::from_secs(300),
        None => true,
    };
    if changed {
        println!(
            "🔧 {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " STATE: ".color(FG1),
            state.color(FG2),
        );
    }
}

/// Core sync pipeline. Never early-returns without a status draft: whatever
/// happened, the caller persists the draft and routes the error.
async fn determine(
    instance: &Workspace,
    context: &ContextData,
) -> (WorkspaceStatus, Option<Duration>, Option<Error>) {
    let client = context.client.clone();
    let mut status = instance.status.clone().unwrap_or_default();
    let generation = instance.metadata.generation;
    let previous_state = status.state;

    status::set_condition(
        &mut status.conditions,
        generation,
        ConditionType::Deleting,
        false,
        "WorkspaceActive",
        "workspace is not being deleted",
    );

    // Revision sync (spec drift tracking).
    let instance = match context.revisions.sync(client.clone(), instance).await {
        Ok(updated) => updated,
        Err(e) => return fail(status, previous_state, generation, e),
    };
    let revision = instance
        .annotation(annotations::WORKSPACE_REVISION)
        .unwrap_or("0")
        .to_string();

    // Resolve preset metadata; a registry miss after admission is terminal.
    let preset: Option<PresetMeta> = {
        let preset_name = if let Some(tuning) = &instance.spec.tuning {
            Some(tuning.preset.name.clone())
        } else {
            instance
                .spec
                .inference
                .as_ref()
                .and_then(|i| i.preset.as_ref())
                .map(|p| p.name.clone())
        };
        match preset_name {
            Some(name) => match context.registry.get_admitted(&name) {
                Ok(meta) => Some(meta.clone()),
                Err(e) => return fail(status, previous_state, generation, e),
            },
            None => None,
        }
    };

    let sku = context.sku.get(&instance.spec.resource.instance_type);
    let (target, per_replica) = planner::target_node_count(&instance, preset.as_ref(), sku);
    status.target_node_count = target;

    let all_nodes = match nodes::list_all(client.clone()).await {
        Ok(nodes) => nodes,
        Err(e) => return finish(status, previous_state, generation, None, Some(e)),
    };
    let auto_provisioning = !context.gates.disable_node_auto_provisioning;
    let byo = nodes::available_byo(&all_nodes, &instance, auto_provisioning);

    let mut claim_nodes: Vec<String> = Vec::new();
    let mut claims_ready = true;
    let mut primary_error = None;
    if auto_provisioning {
        let disk = preset
            .as_ref()
            .map(|p| p.disk_size_gib)
            .unwrap_or(DEFAULT_DISK_SIZE_GIB);
        let sync = match context
            .claims
            .sync(
                client.clone(),
                &context.events,
                &instance,
                target,
                byo.len() as u32,
                disk,
            )
            .await
        {
            Ok(sync) => sync,
            Err(e) => return finish(status, previous_state, generation, None, Some(e)),
        };
        status::set_condition(
            &mut status.conditions,
            generation,
            ConditionType::NodeClaimStatus,
            sync.ready,
            sync.reason,
            &sync.message,
        );
        claims_ready = sync.ready;
        primary_error = sync.error;
        claim_nodes = sync
            .claims
            .iter()
            .filter_map(|c| c.node_name().map(String::from))
            .collect();
    } else {
        // No NodeClaims exist in BYO mode; the condition is omitted entirely.
        status::remove_condition(&mut status.conditions, ConditionType::NodeClaimStatus);
        if (byo.len() as u32) < target {
            status::set_condition(
                &mut status.conditions,
                generation,
                ConditionType::NodeStatus,
                false,
                claim_reason::BYO_NOT_ENOUGH,
                &format!(
                    "{} matching nodes available, {} required",
                    byo.len(),
                    target
                ),
            );
            return finish(
                status,
                previous_state,
                generation,
                Some(TERMINATION_POLL_INTERVAL),
                primary_error,
            );
        }
    }

    // Device-plugin gate over the nodes backing ready claims.
    let mut node_gate_ok = true;
    if auto_provisioning && claims_ready {
        match nodes::ensure_plugins_ready(client.clone(), &instance, sku, &claim_nodes).await {
            Ok(PluginGate::Ready) => {}
            Ok(PluginGate::NotReady { reason, message }) => {
                node_gate_ok = false;
                status::set_condition(
                    &mut status.conditions,
                    generation,
                    ConditionType::NodeStatus,
                    false,
                    reason,
                    &message,
                );
            }
            Err(e) => return finish(status, previous_state, generation, None, Some(e)),
        }
    }

    let matching = nodes::ready_matching(&all_nodes, &instance, auto_provisioning);
    if node_gate_ok {
        let enough = matching.len() as u32 >= target;
        status::set_condition(
            &mut status.conditions,
            generation,
            ConditionType::NodeStatus,
            enough,
            if enough {
                reason::NODES_READY
            } else {
                reason::NODES_NOT_READY
            },
            &format!("{} of {} required nodes are ready", matching.len(), target),
        );
    }

    // Pick worker nodes deterministically; previous workers stay sticky.
    let candidates: Vec<&Node> = all_nodes
        .iter()
        .filter(|n| matching.contains(&n.name_any()))
        .collect();
    let mut workers: Vec<String> = selector::select(
        &candidates,
        &instance.spec.resource.preferred_nodes,
        &status.worker_nodes,
        target as usize,
    )
    .iter()
    .map(|n| n.name_any())
    .collect();
    workers.sort();
    status.worker_nodes = workers;

    let node_ready = status::condition_is_true(&status.conditions, ConditionType::NodeStatus);
    let resources_ready = node_ready && (claims_ready || !auto_provisioning);
    status::set_condition(
        &mut status.conditions,
        generation,
        ConditionType::ResourceStatus,
        resources_ready,
        if resources_ready {
            reason::RESOURCES_READY
        } else {
            reason::RESOURCES_NOT_READY
        },
        if resources_ready {
            "all required nodes are provisioned and ready"
        } else {
            "waiting for nodes to be provisioned and ready"
        },
    );
    if !resources_ready {
        return finish(
            status,
            previous_state,
            generation,
            Some(TERMINATION_POLL_INTERVAL),
            primary_error,
        );
    }

    // Workload apply, now that the compute is in place.
    let requeue = if instance.spec.tuning.is_some() {
        match sync_tuning(&client, context, &instance, preset.as_ref(), &revision, sku, &mut status, generation).await
        {
            Ok(requeue) => requeue,
            Err(e) => return finish(status, previous_state, generation, None, Some(e)),
        }
    } else {
        match sync_inference(
            &client,
            context,
            &instance,
            preset.as_ref(),
            &revision,
            sku,
            target,
            per_replica,
            &mut status,
            generation,
        )
        .await
        {
            Ok(requeue) => requeue,
            Err(e) => return finish(status, previous_state, generation, None, Some(e)),
        }
    };

    finish(status, previous_state, generation, requeue, primary_error)
}

#[allow(clippy::too_many_arguments)]
async fn sync_inference(
    client: &Client,
    context: &ContextData,
    instance: &Workspace,
    preset: Option<&PresetMeta>,
    revision: &str,
    sku: Option<&crate::sku::SkuConfig>,
    target: u32,
    per_replica: u32,
    status: &mut WorkspaceStatus,
    generation: Option<i64>,
) -> Result<Option<Duration>, Error> {
    let replicas = instance
        .spec
        .inference
        .as_ref()
        .map(|i| i.replicas)
        .unwrap_or(1) as i32;
    let runtime = InferenceRuntime::for_workspace(instance);
    let sync = context
        .applier
        .apply_inference(
            client.clone(),
            &context.events,
            instance,
            preset,
            runtime,
            sku.map(|s| s.gpu_count),
            replicas,
            revision,
        )
        .await?;

    status.inference = Some(kaito_types::InferenceStatus {
        replicas: sync.desired.max(0) as u32,
        selector: format!("{}={}", labels::WORKSPACE_NAME, instance.name_any()),
        per_replica_node_count: per_replica,
        target_node_count: target,
    });

    let ready = sync.desired > 0 && sync.ready >= sync.desired;
    let timed_out = !ready
        && preset.is_some_and(|p| {
            sync.created_at.as_ref().is_some_and(|t| {
                let age = k8s_openapi::jiff::Timestamp::now().duration_since(t.0);
                age.as_secs() >= 0 && age.as_secs() as u64 >= p.readiness_timeout.as_secs()
            })
        });
    status::set_condition(
        &mut status.conditions,
        generation,
        ConditionType::InferenceStatus,
        ready,
        if ready {
            reason::INFERENCE_READY
        } else if timed_out {
            reason::READINESS_TIMEOUT
        } else {
            reason::INFERENCE_NOT_READY
        },
        &format!("{}/{} replicas are ready", sync.ready, sync.desired),
    );
    status::set_condition(
        &mut status.conditions,
        generation,
        ConditionType::Succeeded,
        ready,
        if ready {
            reason::WORKSPACE_SUCCEEDED
        } else {
            "workspacePending"
        },
        if ready {
            "inference workload is serving"
        } else {
            "waiting for the inference workload to become ready"
        },
    );
    Ok((!ready).then_some(TERMINATION_POLL_INTERVAL))
}

#[allow(clippy::too_many_arguments)]
async fn sync_tuning(
    client: &Client,
    context: &ContextData,
    instance: &Workspace,
    preset: Option<&PresetMeta>,
    revision: &str,
    sku: Option<&crate::sku::SkuConfig>,
    status: &mut WorkspaceStatus,
    generation: Option<i64>,
) -> Result<Option<Duration>, Error> {
    let Some(preset) = preset else {
        return Err(Error::UserInput(
            "tuning workspaces always carry a preset".to_string(),
        ));
    };
    let Some(tuning) = instance.spec.tuning.as_ref() else {
        return Err(Error::UserInput(
            "sync_tuning called without a tuning spec".to_string(),
        ));
    };
    let config_name = tuning
        .config
        .clone()
        .unwrap_or_else(|| crate::validation::tuning_config::default_config_name(tuning.method));
    let sync = context
        .applier
        .apply_tuning(
            client.clone(),
            instance,
            preset,
            revision,
            &config_name,
            sku.map(|s| s.gpu_count),
        )
        .await?;

    if sync.failed {
        status::set_condition(
            &mut status.conditions,
            generation,
            ConditionType::TuningJobStatus,
            false,
            reason::JOB_FAILED,
            "tuning job failed",
        );
        return Ok(None);
    }
    if sync.succeeded {
        status::set_condition(
            &mut status.conditions,
            generation,
            ConditionType::TuningJobStatus,
            false,
            reason::JOB_SUCCEEDED,
            "tuning job completed",
        );
        status::set_condition(
            &mut status.conditions,
            generation,
            ConditionType::Succeeded,
            true,
            reason::JOB_SUCCEEDED,
            "tuning job completed successfully",
        );
        return Ok(None);
    }
    status::set_condition(
        &mut status.conditions,
        generation,
        ConditionType::TuningJobStatus,
        sync.active > 0,
        reason::JOB_RUNNING,
        &format!("{} active tuning pods", sync.active),
    );
    Ok(Some(TERMINATION_POLL_INTERVAL))
}

/// Terminal failure: surfaced as Succeeded=False/workspaceFailed.
fn fail(
    mut status: WorkspaceStatus,
    previous_state: WorkspaceState,
    generation: Option<i64>,
    error: Error,
) -> (WorkspaceStatus, Option<Duration>, Option<Error>) {
    if error.is_terminal() {
        status::set_condition(
            &mut status.conditions,
            generation,
            ConditionType::Succeeded,
            false,
            reason::WORKSPACE_FAILED,
            &error.to_string(),
        );
    }
    finish(status, previous_state, generation, None, Some(error))
}

fn finish(
    mut status: WorkspaceStatus,
    previous_state: WorkspaceState,
    _generation: Option<i64>,
    requeue: Option<Duration>,
    error: Option<Error>,
) -> (WorkspaceStatus, Option<Duration>, Option<Error>) {
    status.state = status::derive_state(&status, previous_state);
    (status, requeue, error)
}

/// Delete flow: tear down referenced NodeClaims with a strongly-consistent
/// read, poll until they are gone, then release the finalizer.
async fn finalize(instance: &Workspace, context: &ContextData) -> Result<Action, Error> {
    if !instance
        .finalizers()
        .iter()
        .any(|f| f == WORKSPACE_FINALIZER)
    {
        return Ok(Action::await_change());
    }
    let client = context.client.clone();
    let namespace = instance.namespace().unwrap_or_default();
    let name = instance.name_any();

    let generation = instance.metadata.generation;
    let deleting_status = {
        let mut status = instance.status.clone().unwrap_or_default();
        status::set_condition(
            &mut status.conditions,
            generation,
            ConditionType::Deleting,
            true,
            reason::DELETING,
            "workspace is being deleted; cleaning up NodeClaims",
        );
        status
    };
    // Best effort: the object is going away, so a failed write only costs us
    // the observable condition.
    if let Err(e) = update_status_with_retry(client.clone(), instance, move |s| {
        *s = deleting_status.clone()
    })
    .await
    {
        eprintln!("failed to record Deleting condition for {namespace}/{name}: {e}");
    }

    let remaining = nodeclaim::cleanup(client.clone(), &context.events, instance).await?;
    if remaining > 0 {
        return Ok(Action::requeue(TERMINATION_POLL_INTERVAL));
    }

    context
        .expectations
        .delete(&expectations::key(&namespace, &name));

    let finalizers: Vec<String> = instance
        .finalizers()
        .iter()
        .filter(|f| *f != WORKSPACE_FINALIZER)
        .cloned()
        .collect();
    let api: Api<Workspace> = Api::namespaced(client, &namespace);
    let patch = Patch::Merge(json!({ "metadata": { "finalizers": finalizers } }));
    match api.patch(&name, &PatchParams::apply(MANAGER_NAME), &patch).await {
        Ok(_) => {
            context
                .events
                .normal(
                    instance,
                    "FinalizerRemoved",
                    "RemoveFinalizer",
                    format!("Removed finalizer '{WORKSPACE_FINALIZER}'"),
                )
                .await;
            Ok(Action::await_change())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Action::await_change()),
        Err(e) => {
            context
                .events
                .warning(
                    instance,
                    "FinalizerRemovalFailed",
                    "RemoveFinalizer",
                    e.to_string(),
                )
                .await;
            Err(e.into())
        }
    }
}

/// Attaches the cleanup finalizer before any provisioning happens, so a
/// delete can never orphan NodeClaims.
async fn ensure_finalizer(
    client: &Client,
    events: &EventSink,
    instance: &Workspace,
) -> Result<Workspace, Error> {
    if instance
        .finalizers()
        .iter()
        .any(|f| f == WORKSPACE_FINALIZER)
    {
        return Ok(instance.clone());
    }
    let namespace = instance.namespace().unwrap_or_default();
    let mut finalizers = instance.finalizers().to_vec();
    finalizers.push(WORKSPACE_FINALIZER.to_string());
    let api: Api<Workspace> = Api::namespaced(client.clone(), &namespace);
    let patch = Patch::Merge(json!({ "metadata": { "finalizers": finalizers } }));
    match api
        .patch(&instance.name_any(), &PatchParams::apply(MANAGER_NAME), &patch)
        .await
    {
        Ok(updated) => {
            events
                .normal(
                    instance,
                    "FinalizerAdded",
                    "AddFinalizer",
                    format!("Added finalizer '{WORKSPACE_FINALIZER}'"),
                )
                .await;
            Ok(updated)
        }
        Err(e) => {
            events
                .warning(
                    instance,
                    "FinalizerAdditionFailed",
                    "AddFinalizer",
                    e.to_string(),
                )
                .await;
            Err(e.into())
        }
    }
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Prints out the error to `stderr` and requeues the resource for another
/// reconciliation after five seconds.
fn on_error(instance: Arc<Workspace>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error for {}/{}: {:?}",
            instance.namespace().unwrap_or_default(),
            instance.name_any(),
            error
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}
