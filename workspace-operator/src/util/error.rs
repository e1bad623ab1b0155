#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Workspace validation failed: {0}")]
    Validation(String),

    #[error("revision '{name}' already exists with different content")]
    RevisionNameConflict { name: String },

    #[error("preset '{0}' is not known to the model registry")]
    UnknownPreset(String),

    #[error("NodeClaim provisioning failed: {0}")]
    NodeClaim(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Yaml error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
}

impl Error {
    /// Terminal errors surface as `Succeeded=False, reason=workspaceFailed`
    /// and are not retried beyond the normal reconcile cadence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::RevisionNameConflict { .. } | Error::UnknownPreset(_)
        )
    }
}

/// Status codes worth retrying inside a single reconcile: conflict,
/// too-many-requests, service-unavailable, server-timeout.
pub fn is_transient_code(code: u16) -> bool {
    matches!(code, 409 | 429 | 503 | 504)
}

pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => is_transient_code(ae.code),
        _ => false,
    }
}
