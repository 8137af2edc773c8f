//! HTTP signaling surface

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{unix_millis, CandidateRequest, OfferRequest, Signaling, SignalingError};
use crate::error::Error;
use crate::registry::{RegistryError, Role};
use crate::stats::StatsSnapshot;
use crate::transport::{IceCandidate, SessionDescription, TransportError};

type SharedSignaling = Arc<Signaling>;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the signaling router
pub fn router(signaling: Signaling) -> Router {
    Router::new()
        .route("/car", post(car_offer))
        .route("/car/ice", post(car_candidate))
        .route("/client", post(client_offer))
        .route("/client/ice", post(client_candidate))
        .route("/health", get(health))
        .with_state(Arc::new(signaling))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Unwrap a JSON body, turning any rejection into a validation error
fn request_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(request)) => Ok(request),
        Err(rejection) => {
            Err(Error::from(SignalingError::Validation(rejection.body_text())).into())
        }
    }
}

async fn car_offer(
    State(signaling): State<SharedSignaling>,
    payload: Result<Json<OfferRequest>, JsonRejection>,
) -> ApiResult<SessionDescription> {
    let received_at = unix_millis();
    let request = request_body(payload)?;
    let answer = signaling
        .submit_offer(Role::Producer, request, received_at)
        .await?;
    Ok(Json(answer))
}

async fn car_candidate(
    State(signaling): State<SharedSignaling>,
    payload: Result<Json<CandidateRequest>, JsonRejection>,
) -> ApiResult<Vec<IceCandidate>> {
    let request = request_body(payload)?;
    Ok(Json(signaling.submit_candidate(Role::Producer, request).await?))
}

async fn client_offer(
    State(signaling): State<SharedSignaling>,
    payload: Result<Json<OfferRequest>, JsonRejection>,
) -> ApiResult<SessionDescription> {
    let received_at = unix_millis();
    let request = request_body(payload)?;
    let answer = signaling
        .submit_offer(Role::Client, request, received_at)
        .await?;
    Ok(Json(answer))
}

async fn client_candidate(
    State(signaling): State<SharedSignaling>,
    payload: Result<Json<CandidateRequest>, JsonRejection>,
) -> ApiResult<Vec<IceCandidate>> {
    let request = request_body(payload)?;
    Ok(Json(signaling.submit_candidate(Role::Client, request).await?))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    peers: usize,
    active_controller: Option<String>,
    stats: StatsSnapshot,
}

async fn health(State(signaling): State<SharedSignaling>) -> ApiResult<HealthResponse> {
    let session = signaling.session();
    let peers = session.snapshot().await?.len();
    let active_controller = session
        .active_controller()
        .await?
        .map(|id| id.as_str().to_string());

    Ok(Json(HealthResponse {
        status: "ok",
        peers,
        active_controller,
        stats: session.stats(),
    }))
}

/// Signaling failure as an HTTP response
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::Signaling(SignalingError::Validation(_))
            | Error::Transport(TransportError::InvalidOffer(_))
            | Error::Transport(TransportError::InvalidCandidate(_)) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            Error::Signaling(SignalingError::NotFound(_))
            | Error::Registry(RegistryError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Registry(RegistryError::DuplicateProducer(_))
            | Error::Registry(RegistryError::DuplicatePeer(_)) => (StatusCode::CONFLICT, "conflict"),
            Error::SessionClosed => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Signaling request failed");
        } else {
            tracing::info!(error = %self.0, "Signaling request rejected");
        }

        (
            status,
            Json(ApiErrorBody {
                error,
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
