use futures::StreamExt;
use futures::TryStreamExt;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kaito_common::labels;
use kaito_types::{
    NodeClaim, NodeClaimRequirement, NodeClaimResources, NodeClaimSpec, NodeClassRef, Workspace,
};
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, PostParams},
    runtime::watcher::{self, Event as WatchEvent, watcher},
};
use rand::distr::{Alphanumeric, SampleString};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::events::EventSink;
use crate::expectations::{self, Expectations};
use crate::sku::CloudProvider;
use crate::util::Error;

const CREATE_RETRIES: u32 = 5;
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Reasons surfaced through the NodeClaimStatus condition.
pub mod reason {
    pub const CREATING: &str = "CreatingNodeClaims";
    pub const DELETING: &str = "DeletingNodeClaims";
    pub const COUNT_MISMATCH: &str = "NodeClaimCountMismatch";
    pub const NOT_READY: &str = "NodeClaimNotReady";
    pub const READY: &str = "NodeClaimsReady";
    pub const BYO_NOT_ENOUGH: &str = "BYONodesNotEnough";
    pub const LIST_ERROR: &str = "NodeClaimListError";
}

/// Result of one claim sync pass. `error` carries partial failures so the
/// caller can both reflect the shortfall in status and hand the error to the
/// work queue.
pub struct ClaimSync {
    pub ready: bool,
    pub reason: &'static str,
    pub message: String,
    pub claims: Vec<NodeClaim>,
    pub error: Option<Error>,
}

impl ClaimSync {
    fn waiting(reason: &'static str, message: String, claims: Vec<NodeClaim>) -> Self {
        ClaimSync {
            ready: false,
            reason,
            message,
            claims,
            error: None,
        }
    }
}

/// Claims required on top of the user-provided nodes.
pub fn required_claims(target_node_count: u32, available_byo: u32) -> usize {
    target_node_count.saturating_sub(available_byo) as usize
}

pub fn workspace_selector(instance: &Workspace) -> String {
    format!(
        "{}={},{}={}",
        labels::WORKSPACE_NAME,
        instance.name_any(),
        labels::WORKSPACE_NAMESPACE,
        instance.namespace().unwrap_or_default(),
    )
}

/// Drives `|claims| == required` for one workspace, guarded by the
/// expectations tracker so a reconcile racing its own watch events cannot
/// over-create or over-delete.
pub struct NodeClaimManager {
    pub expectations: Arc<Expectations>,
    pub provider: CloudProvider,
}

impl NodeClaimManager {
    pub async fn sync(
        &self,
        client: Client,
        events: &EventSink,
        instance: &Workspace,
        target_node_count: u32,
        available_byo: u32,
        disk_size_gib: u32,
    ) -> Result<ClaimSync, Error> {
        let namespace = instance.namespace().unwrap_or_default();
        let name = instance.name_any();
        let key = expectations::key(&namespace, &name);

        // Declared mutations that have not been observed yet block any
        // further mutation for this workspace.
        if let Some((creations, deletions)) = self.expectations.pending(&key) {
            let (reason, message) = if deletions > 0 {
                (
                    reason::DELETING,
                    format!("waiting for {deletions} NodeClaim deletions to be observed"),
                )
            } else {
                (
                    reason::CREATING,
                    format!("waiting for {creations} NodeClaim creations to be observed"),
                )
            };
            return Ok(ClaimSync::waiting(reason, message, Vec::new()));
        }

        let api: Api<NodeClaim> = Api::all(client);
        let params = ListParams::default().labels(&workspace_selector(instance));
        let claims = match api.list(&params).await {
            Ok(list) => list.items,
            Err(e) => {
                return Ok(ClaimSync {
                    ready: false,
                    reason: reason::LIST_ERROR,
                    message: format!("failed to list NodeClaims: {e}"),
                    claims: Vec::new(),
                    error: Some(e.into()),
                });
            }
        };

        let required = required_claims(target_node_count, available_byo);
        if claims.len() < required {
            return Ok(self
                .create_missing(&api, events, instance, &key, claims, required, disk_size_gib)
                .await);
        }
        if claims.len() > required {
            return Ok(self
                .delete_excess(&api, events, instance, &key, claims, required)
                .await);
        }

        if let Some(unready) = claims.iter().find(|c| !c.is_ready()) {
            let message = format!("NodeClaim '{}' is not ready yet", unready.name_any());
            return Ok(ClaimSync::waiting(reason::NOT_READY, message, claims));
        }
        Ok(ClaimSync {
            ready: true,
            reason: reason::READY,
            message: format!("all {} required NodeClaims are ready", claims.len()),
            claims,
            error: None,
        })
    }

    async fn create_missing(
        &self,
        api: &Api<NodeClaim>,
        events: &EventSink,
        instance: &Workspace,
        key: &str,
        claims: Vec<NodeClaim>,
        required: usize,
        disk_size_gib: u32,
    ) -> ClaimSync {
        let delta = required - claims.len();
        self.expectations.expect_creations(key, delta as i64);
        let mut errors = Vec::new();
        for _ in 0..delta {
            match self.create_one(api, instance, disk_size_gib).await {
                Ok(claim_name) => {
                    events
                        .normal(
                            instance,
                            "NodeClaimCreated",
                            "CreateNodeClaim",
                            format!("Created NodeClaim '{claim_name}'"),
                        )
                        .await;
                }
                Err(e) => {
                    // The api server rejected the create, so no watch event
                    // will ever pay this expectation down.
                    self.expectations.lower_creations(key, 1);
                    events
                        .warning(
                            instance,
                            "NodeClaimCreationFailed",
                            "CreateNodeClaim",
                            e.to_string(),
                        )
                        .await;
                    errors.push(e.to_string());
                }
            }
        }
        if errors.is_empty() {
            ClaimSync {
                ready: false,
                reason: reason::CREATING,
                message: format!("creating {delta} NodeClaims"),
                claims,
                error: None,
            }
        } else {
            // Some creates were rejected; the claim count still disagrees
            // with the target and the next reconcile fills the gap.
            ClaimSync {
                ready: false,
                reason: reason::COUNT_MISMATCH,
                message: format!("failed to create {} of {delta} NodeClaims", errors.len()),
                claims,
                error: Some(Error::NodeClaim(errors.join("; "))),
            }
        }
    }

    async fn create_one(
        &self,
        api: &Api<NodeClaim>,
        instance: &Workspace,
        disk_size_gib: u32,
    ) -> Result<String, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            // A fresh suffix per attempt sidesteps name collisions.
            let claim = generate_claim(instance, self.provider, disk_size_gib);
            let claim_name = claim.name_any();
            match api.create(&PostParams::default(), &claim).await {
                Ok(_) => return Ok(claim_name),
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < CREATE_RETRIES => {
                    tokio::time::sleep(CREATE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete_excess(
        &self,
        api: &Api<NodeClaim>,
        events: &EventSink,
        instance: &Workspace,
        key: &str,
        mut claims: Vec<NodeClaim>,
        required: usize,
    ) -> ClaimSync {
        let delta = claims.len() - required;
        sort_for_deletion(&mut claims);
        self.expectations.expect_deletions(key, delta as i64);
        let mut errors = Vec::new();
        for claim in claims.iter().take(delta) {
            let uid = claim.uid().unwrap_or_default();
            if claim.metadata.deletion_timestamp.is_some() {
                // Already on its way out; consume the expectation instead of
                // issuing another delete.
                self.expectations.deletion_observed(key, &uid);
                continue;
            }
            match api.delete(&claim.name_any(), &Default::default()).await {
                Ok(_) => {
                    events
                        .normal(
                            instance,
                            "NodeClaimDeleted",
                            "DeleteNodeClaim",
                            format!("Deleted NodeClaim '{}'", claim.name_any()),
                        )
                        .await;
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    self.expectations.deletion_observed(key, &uid);
                }
                Err(e) => {
                    self.expectations.lower_deletions(key, 1);
                    events
                        .warning(
                            instance,
                            "NodeClaimDeletionFailed",
                            "DeleteNodeClaim",
                            e.to_string(),
                        )
                        .await;
                    errors.push(e.to_string());
                }
            }
        }
        if errors.is_empty() {
            ClaimSync {
                ready: false,
                reason: reason::DELETING,
                message: format!("deleting {delta} NodeClaims"),
                claims,
                error: None,
            }
        } else {
            ClaimSync {
                ready: false,
                reason: reason::COUNT_MISMATCH,
                message: format!("failed to delete {} of {delta} NodeClaims", errors.len()),
                claims,
                error: Some(Error::NodeClaim(errors.join("; "))),
            }
        }
    }
}

/// Deletion priority: claims already deleting, then claims that never became
/// ready, then the newest by creation timestamp. Name breaks remaining ties
/// so repeated reconciles pick the same victims.
fn sort_for_deletion(claims: &mut [NodeClaim]) {
    claims.sort_by_key(|claim| {
        (
            u8::from(claim.metadata.deletion_timestamp.is_none()),
            u8::from(claim.is_ready()),
            std::cmp::Reverse(claim.metadata.creation_timestamp.clone().map(|t| t.0)),
            claim.name_any(),
        )
    });
}

/// Builds a claim for one node of the workspace's instance type. The labels
/// flow through the provisioner onto the node, which is how provisioned nodes
/// end up carrying the machine-type marker.
pub fn generate_claim(
    instance: &Workspace,
    provider: CloudProvider,
    disk_size_gib: u32,
) -> NodeClaim {
    let name = instance.name_any();
    let base: String = name.chars().take(20).collect();
    let claim_name = format!("{}-{}", base, random_suffix());

    let node_class_ref = match provider {
        CloudProvider::Azure => NodeClassRef {
            group: "karpenter.azure.com".into(),
            kind: "AKSNodeClass".into(),
            name: "default".into(),
        },
        CloudProvider::Aws => NodeClassRef {
            group: "karpenter.k8s.aws".into(),
            kind: "EC2NodeClass".into(),
            name: "default".into(),
        },
    };

    let spec = NodeClaimSpec {
        requirements: vec![NodeClaimRequirement {
            key: labels::NODE_INSTANCE_TYPE.into(),
            operator: "In".into(),
            values: vec![instance.spec.resource.instance_type.clone()],
        }],
        resources: Some(NodeClaimResources {
            requests: [(
                "storage".to_string(),
                Quantity(format!("{disk_size_gib}Gi")),
            )]
            .into_iter()
            .collect(),
        }),
        node_class_ref: Some(node_class_ref),
    };

    let mut claim = NodeClaim::new(&claim_name, spec);
    claim.metadata.labels = Some(
        [
            (labels::WORKSPACE_NAME.to_string(), name),
            (
                labels::WORKSPACE_NAMESPACE.to_string(),
                instance.namespace().unwrap_or_default(),
            ),
            (
                labels::MACHINE_TYPE.to_string(),
                labels::MACHINE_TYPE_GPU.to_string(),
            ),
        ]
        .into_iter()
        .collect(),
    );
    claim
}

fn random_suffix() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 5).to_lowercase()
}

/// Feeds claim watch events into the expectations tracker. Runs for the
/// lifetime of the process; the tracker deduplicates re-deliveries by UID.
pub async fn run_claim_observer(
    client: Client,
    expectations: Arc<Expectations>,
    shutdown: CancellationToken,
) {
    let api: Api<NodeClaim> = Api::all(client);
    let config = watcher::Config::default().labels(labels::WORKSPACE_NAME);
    let mut stream = watcher(api, config).boxed();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.try_next() => match event {
                Ok(Some(WatchEvent::Apply(claim))) | Ok(Some(WatchEvent::InitApply(claim))) => {
                    observe(&expectations, &claim, true);
                }
                Ok(Some(WatchEvent::Delete(claim))) => {
                    observe(&expectations, &claim, false);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    eprintln!("NodeClaim watch failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

fn observe(expectations: &Expectations, claim: &NodeClaim, creation: bool) {
    let claim_labels = claim.labels();
    let (Some(name), Some(namespace)) = (
        claim_labels.get(labels::WORKSPACE_NAME),
        claim_labels.get(labels::WORKSPACE_NAMESPACE),
    ) else {
        return;
    };
    let Some(uid) = claim.uid() else {
        return;
    };
    let key = expectations::key(namespace, name);
    if creation {
        expectations.creation_observed(&key, &uid);
    } else {
        expectations.deletion_observed(&key, &uid);
    }
}

/// Deletes every claim referenced by a deleting workspace, using a
/// strongly-consistent list rather than the watch cache. Returns the number
/// of claims still present; the finalizer comes off once this reaches zero.
pub async fn cleanup(
    client: Client,
    events: &EventSink,
    instance: &Workspace,
) -> Result<usize, Error> {
    let api: Api<NodeClaim> = Api::all(client);
    let params = ListParams::default().labels(&workspace_selector(instance));
    let claims = api.list(&params).await?.items;
    let mut remaining = 0;
    for claim in &claims {
        remaining += 1;
        if claim.metadata.deletion_timestamp.is_some() {
            continue;
        }
        match api.delete(&claim.name_any(), &Default::default()).await {
            Ok(_) => {
                events
                    .normal(
                        instance,
                        "NodeClaimDeleted",
                        "DeleteNodeClaim",
                        format!("Deleted NodeClaim '{}'", claim.name_any()),
                    )
                    .await;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => remaining -= 1,
            Err(e) => {
                events
                    .warning(
                        instance,
                        "NodeClaimDeletionFailed",
                        "DeleteNodeClaim",
                        e.to_string(),
                    )
                    .await;
                return Err(e.into());
            }
        }
    }
    Ok(remaining)
}
