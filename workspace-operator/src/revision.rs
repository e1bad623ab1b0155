use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kaito_common::{MANAGER_NAME, annotations, labels};
use kaito_types::Workspace;
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource},
};
use serde_json::json;

use crate::util::{self, Error};

/// Tracks spec drift as a chain of ControllerRevisions owned by the
/// Workspace. Each distinct `(resource, inference, tuning)` content gets a
/// strictly increasing revision number; the revision name embeds a prefix of
/// the content hash.
pub struct RevisionStore {
    /// Number of hash characters carried in the revision name. Wider prefixes
    /// trade longer names for fewer collisions; a collision is terminal.
    pub hash_width: usize,
    /// Revisions kept per workspace before pruning, oldest first.
    pub max_history: usize,
}

impl Default for RevisionStore {
    fn default() -> Self {
        RevisionStore {
            hash_width: 5,
            max_history: 10,
        }
    }
}

/// Outcome of matching the target revision name against existing revisions.
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    /// Content already recorded under this name; reuse its number.
    Reuse(i64),
    /// New content; create with the given number.
    Create(i64),
}

/// Existing revision as seen by the decision logic.
#[derive(Debug, Clone)]
struct Existing {
    name: String,
    hash: String,
    revision: i64,
}

fn decide(existing: &[Existing], target_name: &str, current_hash: &str) -> Result<Decision, Error> {
    if let Some(found) = existing.iter().find(|r| r.name == target_name) {
        if found.hash != current_hash {
            // Same truncated name, different content: the prefix collided.
            return Err(Error::RevisionNameConflict {
                name: target_name.to_string(),
            });
        }
        return Ok(Decision::Reuse(found.revision));
    }
    let next = existing.iter().map(|r| r.revision).max().unwrap_or(0) + 1;
    Ok(Decision::Create(next))
}

/// Names of revisions to delete once the history limit is exceeded, oldest
/// first. `revisions` must be sorted by revision number ascending.
fn prune_candidates(revisions: &[Existing], max_history: usize) -> Vec<String> {
    if revisions.len() <= max_history {
        return Vec::new();
    }
    revisions[..revisions.len() - max_history]
        .iter()
        .map(|r| r.name.clone())
        .collect()
}

impl RevisionStore {
    pub fn revision_name(&self, workspace_name: &str, hash: &str) -> String {
        let width = self.hash_width.min(hash.len());
        format!("{}-{}", workspace_name, &hash[..width])
    }

    /// Records the current spec content and stamps the workspace annotations
    /// with the content hash and the assigned revision number. Returns the
    /// annotated workspace.
    pub async fn sync(&self, client: Client, instance: &Workspace) -> Result<Workspace, Error> {
        let name = instance.name_any();
        let namespace = instance
            .namespace()
            .ok_or_else(|| Error::UserInput("Workspace is missing metadata.namespace".into()))?;

        let hash = util::hash_spec(&instance.spec);
        let target_name = self.revision_name(&name, &hash);

        let api: Api<ControllerRevision> = Api::namespaced(client.clone(), &namespace);
        let params =
            ListParams::default().labels(&format!("{}={}", labels::WORKSPACE_NAME, name));
        let mut revisions: Vec<Existing> = api
            .list(&params)
            .await?
            .items
            .into_iter()
            .map(|r| Existing {
                name: r.name_any(),
                hash: r
                    .annotations()
                    .get(annotations::WORKSPACE_HASH)
                    .cloned()
                    .unwrap_or_default(),
                revision: r.revision,
            })
            .collect();
        revisions.sort_by_key(|r| r.revision);

        let number = match decide(&revisions, &target_name, &hash)? {
            Decision::Reuse(n) => n,
            Decision::Create(n) => {
                self.create(&api, instance, &target_name, &hash, n).await?;
                revisions.push(Existing {
                    name: target_name.clone(),
                    hash: hash.clone(),
                    revision: n,
                });
                n
            }
        };

        for stale in prune_candidates(&revisions, self.max_history) {
            match api.delete(&stale, &Default::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.annotate(client, instance, &hash, number).await
    }

    async fn create(
        &self,
        api: &Api<ControllerRevision>,
        instance: &Workspace,
        target_name: &str,
        hash: &str,
        number: i64,
    ) -> Result<(), Error> {
        let revision = ControllerRevision {
            metadata: ObjectMeta {
                name: Some(target_name.to_string()),
                namespace: instance.namespace(),
                labels: Some(
                    [(labels::WORKSPACE_NAME.to_string(), instance.name_any())]
                        .into_iter()
                        .collect(),
                ),
                annotations: Some(
                    [(annotations::WORKSPACE_HASH.to_string(), hash.to_string())]
                        .into_iter()
                        .collect(),
                ),
                owner_references: Some(vec![instance.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            data: Some(RawExtension(serde_json::to_value(&instance.spec)?)),
            revision: number,
        };
        match api.create(&PostParams::default(), &revision).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Lost a race with a concurrent reconcile; accept the winner
                // if it recorded the same content.
                let winner = api.get(target_name).await?;
                let winner_hash = winner
                    .annotations()
                    .get(annotations::WORKSPACE_HASH)
                    .cloned()
                    .unwrap_or_default();
                if winner_hash != hash {
                    return Err(Error::RevisionNameConflict {
                        name: target_name.to_string(),
                    });
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the hash/revision annotations, retrying conflicts against a
    /// fresh read.
    async fn annotate(
        &self,
        client: Client,
        instance: &Workspace,
        hash: &str,
        number: i64,
    ) -> Result<Workspace, Error> {
        let namespace = instance.namespace().unwrap_or_default();
        let api: Api<Workspace> = Api::namespaced(client, &namespace);
        let patch = Patch::Merge(json!({
            "metadata": {
                "annotations": {
                    annotations::WORKSPACE_HASH: hash,
                    annotations::WORKSPACE_REVISION: number.to_string(),
                }
            }
        }));
        let params = PatchParams::apply(MANAGER_NAME);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match api.patch(&instance.name_any(), &params, &patch).await {
                Ok(updated) => return Ok(updated),
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < 3 => {
                    // Annotation writes race with user updates; re-read to
                    // pick up the latest resourceVersion and try again.
                    let _ = api.get(&instance.name_any()).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing(name: &str, hash: &str, revision: i64) -> Existing {
        Existing {
            name: name.to_string(),
            hash: hash.to_string(),
            revision,
        }
    }

    #[test]
    fn first_revision_is_one() {
        assert_eq!(decide(&[], "ws-abcde", "abcde111").unwrap(), Decision::Create(1));
    }

    #[test]
    fn numbers_strictly_increase() {
        let revisions = vec![
            existing("ws-aaaaa", "aaaaa000", 1),
            existing("ws-bbbbb", "bbbbb000", 4),
        ];
        assert_eq!(
            decide(&revisions, "ws-ccccc", "ccccc000").unwrap(),
            Decision::Create(5)
        );
    }

    #[test]
    fn same_content_reuses_the_number() {
        let revisions = vec![
            existing("ws-aaaaa", "aaaaa000", 1),
            existing("ws-bbbbb", "bbbbb000", 2),
        ];
        assert_eq!(
            decide(&revisions, "ws-aaaaa", "aaaaa000").unwrap(),
            Decision::Reuse(1)
        );
    }

    #[test]
    fn prefix_collision_is_fatal() {
        let revisions = vec![existing("ws-abcde", "abcdeffff", 3)];
        let err = decide(&revisions, "ws-abcde", "abcde0000").unwrap_err();
        assert!(matches!(err, Error::RevisionNameConflict { name } if name == "ws-abcde"));
    }

    #[test]
    fn prune_removes_oldest_beyond_limit() {
        let revisions: Vec<Existing> = (1..=12)
            .map(|n| existing(&format!("ws-{n:05}"), &format!("{n:09}"), n))
            .collect();
        let stale = prune_candidates(&revisions, 10);
        assert_eq!(stale, vec!["ws-00001".to_string(), "ws-00002".to_string()]);
        assert!(prune_candidates(&revisions[..10], 10).is_empty());
    }

    #[test]
    fn revision_name_truncates_to_width() {
        let store = RevisionStore::default();
        assert_eq!(store.revision_name("ws", "abcdef0123"), "ws-abcde");
        let wide = RevisionStore {
            hash_width: 8,
            max_history: 10,
        };
        assert_eq!(wide.revision_name("ws", "abcdef0123"), "ws-abcdef01");
    }
}
