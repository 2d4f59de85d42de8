use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::{error::ApiError, AppState};
use crate::controller::Event;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/view", get(get_view))
        .route("/presence", post(set_presence))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// Latest dashboard view as JSON
pub async fn get_view(State(st): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let view = st.view.borrow().clone();
    if view.updated_at.is_none() {
        return Err(ApiError::NotReady);
    }
    Ok(Json(view.as_ref().clone()))
}

#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    pub present: bool,
}

/// A viewer arrived or left; polling is suspended while nobody watches
pub async fn set_presence(
    State(st): State<AppState>,
    Json(req): Json<PresenceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    st.events.send(Event::Presence(req.present)).map_err(|_| ApiError::Stopped)?;
    Ok(StatusCode::ACCEPTED)
}
