// HTTP server for the fleet orchestrator
// Operator API plus the agent transport endpoints

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router, Server,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::ServerSettings;
use crate::engine::hunts::{HuntDispatch, HuntStats};
use crate::engine::storage::{ClientStore, FlowStateStore};
use crate::engine::FleetEngine;
use crate::models::{
    AgentRequest, AuthState, ClientId, CrashRecord, FlowInstance, FlowStartRequest, Hunt, HuntId,
    HuntSpec, MessageEnvelope, SessionId,
};
use crate::{FleetError, Result};

/// Upper bound of requests handed to an agent per poll
const MAX_REQUESTS_PER_POLL: usize = 1000;
const DEFAULT_REQUESTS_PER_POLL: usize = 100;

/// `FleetError` as an HTTP response
#[derive(Debug)]
pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            FleetError::FlowNotFound(_) | FleetError::HuntNotFound(_) => StatusCode::NOT_FOUND,
            FleetError::UnknownFlowClass(_)
            | FleetError::InvalidArgs { .. }
            | FleetError::InvalidInput(_)
            | FleetError::InvalidAction { .. }
            | FleetError::Protocol(_)
            | FleetError::Serialization(_) => StatusCode::BAD_REQUEST,
            FleetError::AlreadyExists(_)
            | FleetError::ConcurrentModification { .. }
            | FleetError::InvalidState(_) => StatusCode::CONFLICT,
            FleetError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }
        let error_type = format!("{:?}", self.0);
        let error_type = error_type
            .split(|c: char| c == '(' || c == ' ' || c == '{')
            .next()
            .unwrap_or("Unknown")
            .to_string();
        let body = json!({
            "error": self.0.to_string(),
            "error_type": error_type,
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn client_id(raw: &str) -> std::result::Result<ClientId, ApiError> {
    Ok(ClientId::parse(raw)?)
}

// Request and response types

#[derive(Debug, Deserialize)]
pub struct FlowQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelFlowRequest {
    pub session_id: SessionId,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddClientsRequest {
    pub client_ids: Vec<ClientId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PauseHuntRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HuntResponse {
    pub hunt: Hunt,
    pub stats: HuntStats,
}

#[derive(Debug, Deserialize)]
pub struct DrainQuery {
    pub max: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub accepted: usize,
}

// Handler functions

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// POST /api/flows
async fn start_flow(
    State(engine): State<FleetEngine>,
    Json(request): Json<FlowStartRequest>,
) -> ApiResult<FlowInstance> {
    info!(client_id = %request.client_id, flow_name = %request.flow.flow_name, "POST /api/flows");
    Ok(Json(engine.runner().start_flow(request).await?))
}

/// GET /api/flows?session_id=
async fn read_flow(State(engine): State<FleetEngine>, Query(query): Query<FlowQuery>) -> ApiResult<FlowInstance> {
    Ok(Json(engine.runner().read_flow(&SessionId(query.session_id)).await?))
}

/// POST /api/flows/cancel
async fn cancel_flow(
    State(engine): State<FleetEngine>,
    Json(request): Json<CancelFlowRequest>,
) -> ApiResult<FlowInstance> {
    let reason = request.reason.unwrap_or_else(|| "Cancelled by operator".to_string());
    info!(session_id = %request.session_id, reason = %reason, "POST /api/flows/cancel");
    Ok(Json(engine.runner().cancel_flow(&request.session_id, &reason).await?))
}

/// GET /api/clients/:client_id/flows
async fn list_client_flows(
    State(engine): State<FleetEngine>,
    Path(raw): Path<String>,
) -> ApiResult<Vec<FlowInstance>> {
    let client_id = client_id(&raw)?;
    Ok(Json(engine.store().list_flows(Some(&client_id)).await?))
}

/// GET /api/clients/:client_id/crashes
async fn list_client_crashes(
    State(engine): State<FleetEngine>,
    Path(raw): Path<String>,
) -> ApiResult<Vec<CrashRecord>> {
    let client_id = client_id(&raw)?;
    Ok(Json(engine.store().list_client_crashes(&client_id).await?))
}

/// POST /api/hunts
async fn start_hunt(State(engine): State<FleetEngine>, Json(spec): Json<HuntSpec>) -> ApiResult<Hunt> {
    info!(flow_name = %spec.flow.flow_name, "POST /api/hunts");
    Ok(Json(engine.hunts().start_hunt(spec).await?))
}

/// GET /api/hunts/:hunt_id
async fn read_hunt(State(engine): State<FleetEngine>, Path(hunt_id): Path<String>) -> ApiResult<HuntResponse> {
    let hunt = engine.hunts().read_hunt(&HuntId(hunt_id)).await?;
    let stats = HuntStats::from(&hunt);
    Ok(Json(HuntResponse { hunt, stats }))
}

/// POST /api/hunts/:hunt_id/clients
async fn add_hunt_clients(
    State(engine): State<FleetEngine>,
    Path(hunt_id): Path<String>,
    Json(request): Json<AddClientsRequest>,
) -> ApiResult<HuntDispatch> {
    let dispatch = engine
        .hunts()
        .start_clients(&HuntId(hunt_id), request.client_ids)
        .await?;
    Ok(Json(dispatch))
}

/// POST /api/hunts/:hunt_id/tick
async fn tick_hunt(State(engine): State<FleetEngine>, Path(hunt_id): Path<String>) -> ApiResult<HuntDispatch> {
    Ok(Json(engine.hunts().tick(&HuntId(hunt_id)).await?))
}

/// POST /api/hunts/:hunt_id/pause
async fn pause_hunt(
    State(engine): State<FleetEngine>,
    Path(hunt_id): Path<String>,
    request: Option<Json<PauseHuntRequest>>,
) -> ApiResult<Hunt> {
    let reason = request
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "Paused by operator".to_string());
    Ok(Json(engine.hunts().pause_hunt(&HuntId(hunt_id), &reason).await?))
}

/// POST /api/hunts/:hunt_id/resume
async fn resume_hunt(State(engine): State<FleetEngine>, Path(hunt_id): Path<String>) -> ApiResult<Hunt> {
    Ok(Json(engine.hunts().resume_hunt(&HuntId(hunt_id)).await?))
}

/// POST /api/hunts/:hunt_id/stop
async fn stop_hunt(State(engine): State<FleetEngine>, Path(hunt_id): Path<String>) -> ApiResult<Hunt> {
    Ok(Json(engine.hunts().stop_hunt(&HuntId(hunt_id)).await?))
}

/// POST /agent/:client_id/messages
///
/// The transport authenticated the agent, so the envelope's source is the
/// path client whatever the body claims. Envelopes addressed to another
/// client's sessions reject the whole batch.
async fn receive_messages(
    State(engine): State<FleetEngine>,
    Path(raw): Path<String>,
    Json(envelopes): Json<Vec<MessageEnvelope>>,
) -> ApiResult<AcceptedResponse> {
    let client_id = client_id(&raw)?;
    for envelope in &envelopes {
        if envelope.session_id.is_well_known() {
            continue;
        }
        if envelope.session_id.client_id().as_ref() != Some(&client_id) {
            return Err(FleetError::InvalidInput(format!(
                "session {} does not belong to {}",
                envelope.session_id, client_id
            ))
            .into());
        }
    }

    let accepted = envelopes.len();
    for mut envelope in envelopes {
        envelope.source = Some(client_id.clone());
        envelope.auth_state = AuthState::Authenticated;
        engine.store().enqueue_inbound(envelope).await?;
    }
    debug!(client_id = %client_id, accepted, "Accepted agent messages");
    Ok(Json(AcceptedResponse { accepted }))
}

/// GET /agent/:client_id/requests?max=N
async fn drain_requests(
    State(engine): State<FleetEngine>,
    Path(raw): Path<String>,
    Query(query): Query<DrainQuery>,
) -> ApiResult<Vec<AgentRequest>> {
    let client_id = client_id(&raw)?;
    let max = query
        .max
        .unwrap_or(DEFAULT_REQUESTS_PER_POLL)
        .min(MAX_REQUESTS_PER_POLL);
    engine.store().ensure_client(&client_id).await?;
    Ok(Json(engine.store().drain_outbound(&client_id, max).await?))
}

/// Every route of the orchestrator
pub fn routes(engine: FleetEngine) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/flows", post(start_flow).get(read_flow))
        .route("/api/flows/cancel", post(cancel_flow))
        .route("/api/clients/:client_id/flows", get(list_client_flows))
        .route("/api/clients/:client_id/crashes", get(list_client_crashes))
        .route("/api/hunts", post(start_hunt))
        .route("/api/hunts/:hunt_id", get(read_hunt))
        .route("/api/hunts/:hunt_id/clients", post(add_hunt_clients))
        .route("/api/hunts/:hunt_id/tick", post(tick_hunt))
        .route("/api/hunts/:hunt_id/pause", post(pause_hunt))
        .route("/api/hunts/:hunt_id/resume", post(resume_hunt))
        .route("/api/hunts/:hunt_id/stop", post(stop_hunt))
        .route("/agent/:client_id/messages", post(receive_messages))
        .route("/agent/:client_id/requests", get(drain_requests))
        .with_state(engine)
}

/// HTTP server
pub struct HttpServer {
    settings: ServerSettings,
    engine: FleetEngine,
}

impl HttpServer {
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    pub fn router(&self) -> Router {
        let app = routes(self.engine.clone());
        if self.settings.cors_enabled {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        let raw = format!("{}:{}", self.settings.host, self.settings.port);
        raw.parse()
            .map_err(|e| FleetError::InvalidInput(format!("invalid bind address {}: {}", raw, e)))
    }

    /// Serve until the process exits
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves; open requests are finished first
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.addr()?;
        let app = self.router();
        info!("HTTP server listening on http://{}", addr);

        Server::try_bind(&addr)
            .map_err(|e| FleetError::Internal(format!("failed to bind {}: {}", addr, e)))?
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| FleetError::Internal(format!("HTTP server failed: {}", e)))?;
        info!("HTTP server stopped");
        Ok(())
    }
}

/// Builder for [`HttpServer`]
#[derive(Default)]
pub struct HttpServerBuilder {
    settings: ServerSettings,
    engine: Option<FleetEngine>,
}

impl HttpServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.settings.port = port;
        self
    }

    pub fn cors(mut self, enabled: bool) -> Self {
        self.settings.cors_enabled = enabled;
        self
    }

    pub fn engine(mut self, engine: FleetEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Result<HttpServer> {
        let engine = self
            .engine
            .ok_or_else(|| FleetError::InvalidInput("HTTP server needs an engine".to_string()))?;
        Ok(HttpServer {
            settings: self.settings,
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::alerts::{AlertDispatcher, MemoryAlertSender};
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{ClientRecord, FlowState, FlowStatus, Payload};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde::de::DeserializeOwned;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_app() -> (Router, FleetEngine) {
        let store = Arc::new(InMemoryStorage::new());
        store
            .write_client(ClientRecord::new(ClientId::from_index(0)).with_hostname("Host-0.example.com"))
            .await
            .unwrap();
        let alerts = AlertDispatcher::new(
            Arc::new(MemoryAlertSender::new()),
            "sec@example.com",
            "http://localhost:8000",
        );
        let engine = FleetEngine::with_store(store, alerts, &Settings::default()).await;
        let server = HttpServer::builder().engine(engine.clone()).build().unwrap();
        (server.router(), engine)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn decode<T: DeserializeOwned>(value: Value) -> T {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app().await;
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_flow_round_trip_through_agent_endpoints() {
        let (app, engine) = test_app().await;
        let client = ClientId::from_index(0);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/flows",
            Some(json!({
                "client_id": client,
                "flow": {"flow_name": "ClientActionRunner", "args": {"action": "Echo"}}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let flow: FlowInstance = decode(body);
        assert_eq!(flow.state, FlowState::Running);

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/agent/{}/requests?max=10", client),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let requests: Vec<AgentRequest> = decode(body);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].action, "Echo");

        let replies = vec![
            MessageEnvelope::response(flow.session_id.clone(), 1, 0, Payload::text("pong")),
            MessageEnvelope::status(flow.session_id.clone(), 1, 1, FlowStatus::ok()),
        ];
        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/agent/{}/messages", client),
            Some(serde_json::to_value(&replies).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 2);

        engine.worker().run_until_idle().await.unwrap();

        let uri = format!("/api/flows?session_id={}", flow.session_id);
        let (status, body) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let finished: FlowInstance = decode(body);
        assert_eq!(finished.state, FlowState::Terminated);
        assert_eq!(finished.results[0].as_text(), "pong");

        let (_, body) = call(&app, Method::GET, &format!("/api/clients/{}/flows", client), None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_messages_for_foreign_sessions_are_rejected() {
        let (app, engine) = test_app().await;
        let other = ClientId::from_index(1);
        let session = SessionId::for_flow(&other, &crate::models::FlowId::random());
        let envelope = MessageEnvelope::status(session.clone(), 1, 0, FlowStatus::ok());

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/agent/{}/messages", ClientId::from_index(0)),
            Some(json!([envelope])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_type"], "InvalidInput");
        assert!(engine.store().lease_ready_sessions(10, std::time::Duration::from_secs(5)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_flow_ignores_session_and_hunt_from_body() {
        let (app, _) = test_app().await;
        let client = ClientId::from_index(0);
        let foreign = SessionId::for_flow(&ClientId::from_index(1), &crate::models::FlowId::random());

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/flows",
            Some(json!({
                "client_id": client,
                "flow": {"flow_name": "ClientActionRunner", "args": {"action": "Echo"}},
                "session_id": foreign,
                "hunt_id": "H.DEADBEEF"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let flow: FlowInstance = decode(body);
        assert_ne!(flow.session_id, foreign);
        assert_eq!(flow.session_id.client_id(), Some(client));
        assert!(flow.hunt_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_flow_and_missing_hunt() {
        let (app, _) = test_app().await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/flows",
            Some(json!({
                "client_id": ClientId::from_index(0),
                "flow": {"flow_name": "DoesNotExist", "args": {}}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::GET, "/api/hunts/H.DEADBEEF", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::GET, "/api/clients/not-a-client/flows", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_hunt_lifecycle() {
        let (app, _) = test_app().await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/hunts",
            Some(json!({
                "description": "echo",
                "flow": {"flow_name": "ClientActionRunner", "args": {"action": "Echo"}},
                "client_selection": {"type": "clients", "client_ids": []},
                "client_rate": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let hunt: Hunt = decode(body);
        let base = format!("/api/hunts/{}", hunt.hunt_id);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("{}/clients", base),
            Some(json!({"client_ids": [ClientId::from_index(0), ClientId::from_index(1)]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let dispatch: HuntDispatch = decode(body);
        assert_eq!(dispatch.started.len(), 1);
        assert_eq!(dispatch.queued, 1);

        let (status, body) = call(&app, Method::POST, &format!("{}/pause", base), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "PAUSED");

        let (_, body) = call(&app, Method::POST, &format!("{}/tick", base), None).await;
        let dispatch: HuntDispatch = decode(body);
        assert!(dispatch.started.is_empty());

        // the tick while paused refilled the bucket, so resuming starts the queued client
        let (status, body) = call(&app, Method::POST, &format!("{}/resume", base), None).await;
        assert_eq!(status, StatusCode::OK);
        let resumed: Hunt = decode(body);
        assert_eq!(resumed.started_sessions.len(), 2);

        let (_, body) = call(&app, Method::GET, &base, None).await;
        let view: HuntResponse = decode(body);
        assert_eq!(view.stats.started, 2);
        assert_eq!(view.stats.queued, 0);

        let (status, body) = call(&app, Method::POST, &format!("{}/stop", base), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "STOPPED");
    }
}
