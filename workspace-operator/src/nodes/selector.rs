use k8s_openapi::api::core::v1::Node;
use kaito_common::labels;
use kube::ResourceExt;

/// Picks `count` nodes out of `candidates` with a stable preference order:
/// nodes the user asked for (or that already back the workload) first, then
/// nodes we provisioned ourselves so that untouched BYO capacity stays
/// reserved for user intent, then everything else lexicographically. The
/// whole order is deterministic so repeated reconciles over an unchanged
/// world pick the same set.
pub fn select<'a>(
    candidates: &'a [&'a Node],
    preferred: &[String],
    previous: &[String],
    count: usize,
) -> Vec<&'a Node> {
    let mut ranked: Vec<(u8, String, &Node)> = candidates
        .iter()
        .map(|node| {
            let name = node.name_any();
            let tier = if preferred.contains(&name) || previous.contains(&name) {
                0
            } else if node.labels().get(labels::MACHINE_TYPE).map(String::as_str)
                == Some(labels::MACHINE_TYPE_GPU)
            {
                1
            } else {
                2
            };
            (tier, name, *node)
        })
        .collect();
    ranked.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    ranked
        .into_iter()
        .take(count)
        .map(|(_, _, node)| node)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::fixtures::node;

    #[test]
    fn returns_at_most_count_nodes() {
        let a = node("a", &[], true);
        let b = node("b", &[], true);
        let candidates = vec![&a, &b];
        assert_eq!(select(&candidates, &[], &[], 1).len(), 1);
        assert_eq!(select(&candidates, &[], &[], 5).len(), 2);
    }

    #[test]
    fn preferred_and_previous_outrank_everything() {
        let a = node("a", &[(labels::MACHINE_TYPE, labels::MACHINE_TYPE_GPU)], true);
        let b = node("b", &[], true);
        let c = node("c", &[], true);
        let candidates = vec![&a, &b, &c];
        let picked = select(&candidates, &["c".to_string()], &["b".to_string()], 2);
        let names: Vec<String> = picked.iter().map(|n| n.name_any()).collect();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn provisioned_nodes_beat_plain_byo_nodes() {
        let byo = node("aaa-byo", &[], true);
        let provisioned = node(
            "zzz-provisioned",
            &[(labels::MACHINE_TYPE, labels::MACHINE_TYPE_GPU)],
            true,
        );
        let candidates = vec![&byo, &provisioned];
        let picked = select(&candidates, &[], &[], 1);
        assert_eq!(picked[0].name_any(), "zzz-provisioned");
    }

    #[test]
    fn ties_break_lexicographically() {
        let b = node("b", &[], true);
        let a = node("a", &[], true);
        let c = node("c", &[], true);
        let candidates = vec![&b, &a, &c];
        let names: Vec<String> = select(&candidates, &[], &[], 3)
            .iter()
            .map(|n| n.name_any())
            .collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn selection_is_stable_across_calls() {
        let a = node("a", &[], true);
        let b = node("b", &[(labels::MACHINE_TYPE, labels::MACHINE_TYPE_GPU)], true);
        let c = node("c", &[], true);
        let candidates = vec![&a, &b, &c];
        let first: Vec<String> = select(&candidates, &[], &[], 2)
            .iter()
            .map(|n| n.name_any())
            .collect();
        let second: Vec<String> = select(&candidates, &[], &[], 2)
            .iter()
            .map(|n| n.name_any())
            .collect();
        assert_eq!(first, second);
    }
}
