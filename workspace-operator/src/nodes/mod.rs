use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kaito_common::{GPU_RESOURCE_NAME, MANAGER_NAME, labels};
use kaito_types::Workspace;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use serde_json::json;

use crate::sku::SkuConfig;
use crate::util::Error;

pub mod selector;

pub fn is_ready(node: &Node) -> bool {
    if node.metadata.deletion_timestamp.is_some() {
        return false;
    }
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

pub fn instance_type(node: &Node) -> Option<&str> {
    node.labels()
        .get(labels::NODE_INSTANCE_TYPE)
        .map(String::as_str)
}

/// GPUs the device plugin currently advertises on the node.
pub fn gpu_capacity(node: &Node) -> i64 {
    node.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get(GPU_RESOURCE_NAME))
        .and_then(|q| q.0.parse::<i64>().ok())
        .unwrap_or(0)
}

/// Standard Kubernetes label-selector semantics over the node's labels. A nil
/// selector matches nothing here: a Workspace without a selector claims no
/// BYO nodes.
pub fn matches_selector(node: &Node, selector: Option<&LabelSelector>) -> bool {
    let Some(selector) = selector else {
        return false;
    };
    let node_labels = node.labels();
    if let Some(match_labels) = selector.match_labels.as_ref() {
        for (key, value) in match_labels {
            if node_labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    for requirement in selector.match_expressions.iter().flatten() {
        let actual = node_labels.get(&requirement.key);
        let values = requirement.values.as_deref().unwrap_or_default();
        let ok = match requirement.operator.as_str() {
            "In" => actual.is_some_and(|v| values.contains(v)),
            "NotIn" => actual.is_none_or(|v| !values.contains(v)),
            "Exists" => actual.is_some(),
            "DoesNotExist" => actual.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Nodes the user brought that can back the workload right now. With
/// auto-provisioning enabled only `preferredNodes` members count (the rest of
/// the pool is left to user intent); with it disabled every selector match
/// counts and `preferredNodes` is just a ranking hint.
pub fn available_byo<'a>(
    all: &'a [Node],
    instance: &Workspace,
    auto_provisioning_enabled: bool,
) -> Vec<&'a Node> {
    all.iter()
        .filter(|n| is_ready(n))
        .filter(|n| matches_selector(n, instance.spec.resource.label_selector.as_ref()))
        .filter(|n| {
            !auto_provisioning_enabled
                || instance
                    .spec
                    .resource
                    .preferred_nodes
                    .contains(&n.name_any())
        })
        .collect()
}

/// A node counts toward `NodeStatus` when it is ready, matches the selector
/// or carries our machine-type label, and (under auto-provisioning) runs the
/// requested instance type unless the user explicitly listed it.
pub fn ready_matching(all: &[Node], instance: &Workspace, auto_provisioning_enabled: bool) -> Vec<String> {
    let mut names: Vec<String> = all
        .iter()
        .filter(|n| is_ready(n))
        .filter(|n| {
            matches_selector(n, instance.spec.resource.label_selector.as_ref())
                || n.labels().get(labels::MACHINE_TYPE).map(String::as_str)
                    == Some(labels::MACHINE_TYPE_GPU)
        })
        .filter(|n| {
            if !auto_provisioning_enabled {
                return true;
            }
            instance.spec.resource.preferred_nodes.contains(&n.name_any())
                || instance_type(n) == Some(instance.spec.resource.instance_type.as_str())
        })
        .map(|n| n.name_any())
        .collect();
    names.sort();
    names
}

pub async fn list_all(client: Client) -> Result<Vec<Node>, Error> {
    let api: Api<Node> = Api::all(client);
    Ok(api.list(&Default::default()).await?.items)
}

/// Outcome of the device-plugin gate, feeding the NodeStatus condition.
#[derive(Debug, PartialEq, Eq)]
pub enum PluginGate {
    Ready,
    NotReady { reason: &'static str, message: String },
}

/// Ensures the NVIDIA device plugin is serving on every node backing the
/// workload: label the node for the plugin daemonset, then wait for GPU
/// capacity to appear. Nodes whose instance type disagrees with the spec do
/// not count and are waited out. Skipped entirely for unknown (non-GPU) SKUs.
pub async fn ensure_plugins_ready(
    client: Client,
    instance: &Workspace,
    sku: Option<&SkuConfig>,
    node_names: &[String],
) -> Result<PluginGate, Error> {
    let Some(_sku) = sku else {
        return Ok(PluginGate::Ready);
    };
    let api: Api<Node> = Api::all(client);
    for name in node_names {
        let node = match api.get(name).await {
            Ok(node) => node,
            // The claim said launched but the node is not visible yet.
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Ok(PluginGate::NotReady {
                    reason: "NodeNotFound",
                    message: format!("node '{}' has not been observed yet", name),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if node.labels().get(labels::ACCELERATOR).map(String::as_str)
            != Some(labels::ACCELERATOR_NVIDIA)
        {
            if let Err(e) = label_accelerator(&api, name).await {
                eprintln!("failed to label node '{}': {}", name, e);
                return Ok(PluginGate::NotReady {
                    reason: "NodeUpdateError",
                    message: format!("failed to label node '{}' for the device plugin", name),
                });
            }
        }
        if instance_type(&node) != Some(instance.spec.resource.instance_type.as_str()) {
            return Ok(PluginGate::NotReady {
                reason: "NodeInstanceTypeMismatch",
                message: format!(
                    "node '{}' does not run instance type '{}'",
                    name, instance.spec.resource.instance_type
                ),
            });
        }
        if gpu_capacity(&node) == 0 {
            return Ok(PluginGate::NotReady {
                reason: "GPUCapacityNotReady",
                message: format!("node '{}' does not advertise any '{}' capacity yet", name, GPU_RESOURCE_NAME),
            });
        }
    }
    Ok(PluginGate::Ready)
}

async fn label_accelerator(api: &Api<Node>, name: &str) -> Result<(), kube::Error> {
    let patch = Patch::Merge(json!({
        "metadata": {
            "labels": { labels::ACCELERATOR: labels::ACCELERATOR_NVIDIA }
        }
    }));
    api.patch(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await?;
    Ok(())
}

/// Test-only node constructor shared across the crate's unit tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn node(name: &str, labels: &[(&str, &str)], ready: bool) -> Node {
        let mut n = Node::default();
        n.metadata.name = Some(name.to_string());
        n.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        n.status = Some(k8s_openapi::api::core::v1::NodeStatus {
            conditions: Some(vec![k8s_openapi::api::core::v1::NodeCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        n
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::node;
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use std::collections::BTreeMap;

    fn selector(match_labels: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                match_labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            match_expressions: None,
        }
    }

    #[test]
    fn selector_matches_labels_and_expressions() {
        let n = node("n1", &[("pool", "gpu"), ("zone", "a")], true);
        assert!(matches_selector(&n, Some(&selector(&[("pool", "gpu")]))));
        assert!(!matches_selector(&n, Some(&selector(&[("pool", "cpu")]))));
        assert!(!matches_selector(&n, None));

        let expr = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "zone".into(),
                operator: "In".into(),
                values: Some(vec!["a".into(), "b".into()]),
            }]),
        };
        assert!(matches_selector(&n, Some(&expr)));
        let missing = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".into(),
                operator: "DoesNotExist".into(),
                values: None,
            }]),
        };
        assert!(matches_selector(&n, Some(&missing)));
    }

    #[test]
    fn gpu_capacity_reads_the_resource_quantity() {
        let mut n = node("n1", &[], true);
        let mut capacity = BTreeMap::new();
        capacity.insert(GPU_RESOURCE_NAME.to_string(), Quantity("4".into()));
        n.status.as_mut().unwrap().capacity = Some(capacity);
        assert_eq!(gpu_capacity(&n), 4);
        assert_eq!(gpu_capacity(&node("n2", &[], true)), 0);
    }

    #[test]
    fn byo_requires_preferred_membership_only_when_provisioning() {
        let mut ws = Workspace::new("ws", Default::default());
        ws.spec.resource.label_selector = Some(selector(&[("pool", "gpu")]));
        ws.spec.resource.preferred_nodes = vec!["n1".into()];
        let nodes = vec![
            node("n1", &[("pool", "gpu")], true),
            node("n2", &[("pool", "gpu")], true),
            node("n3", &[("pool", "gpu")], false),
        ];
        let with_provisioning = available_byo(&nodes, &ws, true);
        assert_eq!(with_provisioning.len(), 1);
        assert_eq!(with_provisioning[0].name_any(), "n1");

        let without = available_byo(&nodes, &ws, false);
        assert_eq!(without.len(), 2);
    }

    #[test]
    fn ready_matching_checks_instance_type_under_provisioning() {
        let mut ws = Workspace::new("ws", Default::default());
        ws.spec.resource.instance_type = "Standard_NC24s_v3".into();
        ws.spec.resource.label_selector = Some(selector(&[("pool", "gpu")]));
        let nodes = vec![
            node(
                "provisioned",
                &[
                    (labels::MACHINE_TYPE, labels::MACHINE_TYPE_GPU),
                    (labels::NODE_INSTANCE_TYPE, "Standard_NC24s_v3"),
                ],
                true,
            ),
            node("wrong-sku", &[("pool", "gpu"), (labels::NODE_INSTANCE_TYPE, "Standard_D4s_v5")], true),
        ];
        assert_eq!(ready_matching(&nodes, &ws, true), vec!["provisioned".to_string()]);
        let mut both = ready_matching(&nodes, &ws, false);
        both.sort();
        assert_eq!(both, vec!["provisioned".to_string(), "wrong-sku".to_string()]);
    }
}
