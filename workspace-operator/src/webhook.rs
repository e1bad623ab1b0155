use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::{get, post}};
use kaito_types::Workspace;
use kube::Client;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use crate::validation::Validator;

/// Admission endpoint wiring the validator into the apiserver's
/// ValidatingWebhookConfiguration. TLS is terminated in front of the pod by
/// the deployment layer.
pub struct WebhookState {
    pub client: Client,
    pub validator: Validator,
}

pub async fn run(state: Arc<WebhookState>, port: u16, shutdown: CancellationToken) {
    let app = Router::new()
        .route("/validate-workspace", post(validate))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("{}", format!("🛑 Failed to bind webhook to port {port}: {e}").red());
            return;
        }
    };
    println!(
        "{}{}",
        "🛡️ Starting admission webhook • port=".green(),
        format!("{port}").green().dimmed(),
    );
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        eprintln!("webhook server error: {e}");
    }
}

async fn validate(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Workspace>>,
) -> Json<AdmissionReview<Workspace>> {
    let request: AdmissionRequest<Workspace> = match review.try_into() {
        Ok(request) => request,
        Err(e) => return Json(AdmissionResponse::invalid(e.to_string()).into_review()),
    };
    let mut response = AdmissionResponse::from(&request);
    let outcome = match (&request.operation, &request.object) {
        (Operation::Create, Some(instance)) => Some(
            state
                .validator
                .validate_create(state.client.clone(), instance)
                .await,
        ),
        (Operation::Update, Some(instance)) => match &request.old_object {
            Some(old) => Some(
                state
                    .validator
                    .validate_update(state.client.clone(), instance, old)
                    .await,
            ),
            None => None,
        },
        _ => None,
    };
    match outcome {
        Some(Ok(warnings)) => {
            if !warnings.is_empty() {
                response.warnings = Some(warnings);
            }
        }
        Some(Err(e)) => {
            println!(
                "{} {}",
                "🛡️ Denied workspace admission:".yellow(),
                e.to_string().yellow().dimmed(),
            );
            response = response.deny(e.to_string());
        }
        None => {}
    }
    Json(response.into_review())
}
