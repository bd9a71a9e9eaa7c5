use crate::deck::DeckId;
use crate::error::PreviewError;
use crate::source::DeckSource;
use crate::supervisor::Supervisor;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use preview_common::{
    ErrorResponse, GeneratePreviewRequest, GeneratePreviewResponse, InstanceInfo, LeaseInfo, StopRequest,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub source: Arc<dyn DeckSource>,
    pub public_host: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/generate-preview", post(generate_preview))
        .route("/stop", post(stop_preview))
        .route("/instances", get(list_instances))
        .route("/leases", get(list_leases))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        let status = match &self {
            PreviewError::InvalidDeck(_) => StatusCode::BAD_REQUEST,
            PreviewError::ContentFetchFailed { .. } => StatusCode::NOT_FOUND,
            PreviewError::PortAllocationFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            message: format!("Failed to update preview: {self}"),
            details: self.details().map(str::to_string),
        });

        (status, body).into_response()
    }
}

/// Fetch the deck, make sure a renderer serves it, and return its URL.
///
/// Nothing is started unless the content fetch succeeds.
pub async fn preview(state: &AppState, filename: &str) -> Result<GeneratePreviewResponse, PreviewError> {
    let deck = DeckId::parse(filename)?;
    let markdown = state.source.fetch(&deck).await?;
    let port = state.supervisor.ensure(&deck, &markdown).await?;
    Ok(GeneratePreviewResponse {
        preview_url: format!("http://{}:{}", state.public_host, port),
        port,
    })
}

async fn generate_preview(
    State(state): State<AppState>,
    Json(payload): Json<GeneratePreviewRequest>,
) -> Result<Json<GeneratePreviewResponse>, PreviewError> {
    info!(deck = %payload.filename, "preview requested");

    // Run detached so a client hanging up cannot cancel a launch halfway.
    let task_state = state.clone();
    let result = tokio::spawn(async move { preview(&task_state, &payload.filename).await }).await?;

    match result {
        Ok(resp) => {
            info!(url = %resp.preview_url, "returning preview URL");
            Ok(Json(resp))
        }
        Err(e) => {
            error!("Error updating preview: {}", e);
            Err(e)
        }
    }
}

async fn stop_preview(
    State(state): State<AppState>,
    Json(payload): Json<StopRequest>,
) -> Result<StatusCode, PreviewError> {
    let deck = DeckId::parse(&payload.filename)?;
    state.supervisor.stop(&deck).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceInfo>> {
    Json(state.supervisor.instances())
}

async fn list_leases(State(state): State<AppState>) -> Result<Json<Vec<LeaseInfo>>, PreviewError> {
    Ok(Json(state.supervisor.registry().leases().await?))
}
