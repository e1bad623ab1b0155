use super::{Error, is_transient_code};
use kaito_common::MANAGER_NAME;
use kaito_types::*;
use kube::{
    Api, Client,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, fmt::Debug};
use tokio::time::Duration;

pub trait Object<S> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

impl Object<WorkspaceStatus> for Workspace {
    fn mut_status(&mut self) -> &mut WorkspaceStatus {
        if self.status.is_some() {
            return self.status.as_mut().unwrap();
        }
        self.status = Some(Default::default());
        self.status.as_mut().unwrap()
    }
}

/// Patch the resource's status object with the provided function. The
/// function is passed a mutable reference to the status object, which is to
/// be mutated in-place. When the mutation leaves the serialized status
/// unchanged, no request is issued at all, so an unchanged world produces no
/// writes.
pub async fn patch_status<S, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, kube::Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let mut modified = instance.clone();
    f(modified.mut_status());
    let diff = json_patch::diff(
        &serde_json::to_value(instance).unwrap(),
        &serde_json::to_value(&modified).unwrap(),
    );
    if diff.0.is_empty() {
        return Ok(modified);
    }
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &Patch::Json::<T>(diff))
        .await
}

/// Status writes race with other status writers. Retry transient failures
/// (conflict, 429, 503, 504) with capped exponential backoff; a conflict
/// re-reads the object so the recompute runs against fresh state.
pub async fn update_status_with_retry(
    client: Client,
    instance: &Workspace,
    f: impl Fn(&mut WorkspaceStatus),
) -> Result<(), Error> {
    const MAX_ATTEMPTS: u32 = 5;
    let mut current = instance.clone();
    let mut delay = Duration::from_millis(100);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match patch_status(client.clone(), &current, &f).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        let retryable = match &err {
            kube::Error::Api(ae) => is_transient_code(ae.code),
            _ => false,
        };
        if !retryable || attempt >= MAX_ATTEMPTS {
            return Err(err.into());
        }
        if let kube::Error::Api(ae) = &err
            && ae.code == 409
        {
            let namespace = current.meta().namespace.clone().unwrap_or_default();
            let name = current.meta().name.clone().unwrap_or_default();
            let api: Api<Workspace> = Api::namespaced(client.clone(), &namespace);
            match api.get(&name).await {
                Ok(fresh) => current = fresh,
                // Object disappeared under us; nothing left to update.
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(2));
    }
}
