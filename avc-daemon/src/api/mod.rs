//! Local control API for applications on the device.

pub mod error;

use avc_core::{NotificationPending, UpdateResult, UpdateState, UpdateType};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use tracing::info;

use crate::notify::Reporter;
use crate::session::{SessionHandle, SessionStatus};
use crate::storage::Storage;
use crate::update::UpdateStateMachine;

use error::ApiError;

#[derive(Clone)]
pub struct ApiState<S> {
    pub session: SessionHandle,
    pub update: UpdateStateMachine<S>,
    pub reporter: Reporter<S>,
}

#[derive(Debug, Serialize)]
pub struct UpdateView {
    pub kind: UpdateType,
    pub state: UpdateState,
    pub result: Option<UpdateResult>,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub session: SessionStatus,
    pub updates: Vec<UpdateView>,
    pub notification: Option<NotificationPending>,
}

pub fn api_router<S>(state: ApiState<S>) -> Router
where
    S: Storage + Clone,
{
    Router::new()
        .route("/status", get(status::<S>))
        .route("/updates/{kind}", get(update_record::<S>))
        .route(
            "/session",
            post(request_session::<S>).delete(release_session::<S>),
        )
        .route("/download/accept", post(accept_download::<S>))
        .route("/download/{kind}/abort", post(abort_download::<S>))
        .with_state(state)
}

fn parse_kind(kind: &str) -> Result<UpdateType, ApiError> {
    kind.parse()
        .map_err(|e: avc_core::UnknownUpdateType| ApiError::BadRequest(e.to_string()))
}

async fn view<S: Storage + Clone>(update: &UpdateStateMachine<S>, kind: UpdateType) -> UpdateView {
    let record = update.record(kind).await;
    UpdateView {
        kind,
        state: record.state,
        result: record.result,
        updated_at: record.updated_at.to_string(),
    }
}

async fn status<S: Storage + Clone>(
    State(state): State<ApiState<S>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let session = state.session.status().await?;

    let mut updates = Vec::with_capacity(UpdateType::ALL.len());
    for kind in UpdateType::ALL {
        updates.push(view(&state.update, kind).await);
    }

    let notification = state
        .reporter
        .pending()
        .await
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?;

    Ok(Json(StatusResponse {
        session,
        updates,
        notification,
    }))
}

async fn update_record<S: Storage + Clone>(
    State(state): State<ApiState<S>>,
    Path(kind): Path<String>,
) -> Result<Json<UpdateView>, ApiError> {
    let kind = parse_kind(&kind)?;
    Ok(Json(view(&state.update, kind).await))
}

async fn request_session<S: Storage + Clone>(
    State(state): State<ApiState<S>>,
) -> Result<StatusCode, ApiError> {
    state.session.request_session().await?;
    info!("session requested through the control api");
    Ok(StatusCode::ACCEPTED)
}

async fn release_session<S: Storage + Clone>(
    State(state): State<ApiState<S>>,
) -> Result<StatusCode, ApiError> {
    state.session.release_session().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn accept_download<S: Storage + Clone>(
    State(state): State<ApiState<S>>,
) -> Result<StatusCode, ApiError> {
    state.session.accept_download().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn abort_download<S: Storage + Clone>(
    State(state): State<ApiState<S>>,
    Path(kind): Path<String>,
) -> Result<StatusCode, ApiError> {
    let kind = parse_kind(&kind)?;
    state.session.abort_download(kind).await?;
    Ok(StatusCode::ACCEPTED)
}
