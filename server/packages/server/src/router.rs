use std::convert::Infallible;
use std::sync::{Arc, Mutex as StdMutex};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{future, stream, Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

use workspace_agent_error::{ErrorType, ProblemDetails, WorkspaceError};
use workspace_agent_sandbox_runtime::ContainerRuntime;

use crate::config::ServerConfig;
use crate::conversation::{
    ConversationParams, ConversationRecord, ConversationService, ConversationState,
};
use crate::events::{ConversationEvent, EventKind};
use crate::reaper::IdleReaper;
use crate::registry::WorkspaceRegistry;

pub struct AppState {
    config: ServerConfig,
    conversations: ConversationService,
    reaper: StdMutex<Option<IdleReaper>>,
}

impl AppState {
    /// Wires the registry, conversation service, and idle reaper together.
    /// The reaper starts immediately and runs until [`shutdown_server`].
    pub fn new(
        config: ServerConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, WorkspaceError> {
        let registry = WorkspaceRegistry::new(runtime, config.clone());
        let conversations = ConversationService::new(config.clone(), registry.clone())?;
        let reaper = IdleReaper::spawn(registry, config.idle_ttl, config.sweep_interval);
        Ok(Self {
            config,
            conversations,
            reaper: StdMutex::new(Some(reaper)),
        })
    }

    pub fn registry(&self) -> &WorkspaceRegistry {
        self.conversations.registry()
    }

    pub(crate) fn conversations(&self) -> &ConversationService {
        &self.conversations
    }
}

/// Documented teardown: stop the reaper, then drain and evict every session.
pub async fn shutdown_server(state: &Arc<AppState>) {
    let reaper = state.reaper.lock().expect("reaper slot poisoned").take();
    if let Some(reaper) = reaper {
        reaper.stop().await;
    }
    state.registry().shutdown().await;
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/conversation", post(post_conversation))
        .route(
            "/workspace/:workspace_id/conversations/:conversation_id/events",
            get(get_conversation_events),
        )
        .route(
            "/workspace/:workspace_id/conversations/:conversation_id/state",
            get(get_conversation_state),
        )
        .route("/workspace/:workspace_id/project/file", get(get_project_file))
        .route(
            "/workspace/:workspace_id/vscode",
            get(get_workspace_vscode).delete(delete_workspace_vscode),
        )
        .with_state(shared.clone());

    let mut router = Router::new().nest("/v1", v1_router).fallback(not_found);

    let http_logging = match std::env::var("WORKSPACE_AGENT_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let include_headers = std::env::var("WORKSPACE_AGENT_LOG_HTTP_HEADERS").is_ok();
        let trace_layer = TraceLayer::new_for_http().make_span_with(move |req: &Request<_>| {
            if include_headers {
                let mut headers = Vec::new();
                for (name, value) in req.headers().iter() {
                    let name_str = name.as_str();
                    let display_value = if name_str.eq_ignore_ascii_case("authorization") {
                        "<redacted>".to_string()
                    } else {
                        value.to_str().unwrap_or("<binary>").to_string()
                    };
                    headers.push(format!("{name_str}={display_value}"));
                }
                tracing::info_span!(
                    "http",
                    method = %req.method(),
                    uri = %req.uri(),
                    headers = ?headers
                )
            } else {
                tracing::info_span!("http", method = %req.method(), uri = %req.uri())
            }
        });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "workspace-agent",
        description = "Run AI-agent conversations against Git-backed workspaces in per-workspace sandboxes."
    ),
    paths(
        get_health,
        post_conversation,
        get_conversation_events,
        get_conversation_state,
        get_project_file,
        get_workspace_vscode,
        delete_workspace_vscode
    ),
    components(schemas(
        ConversationRequest,
        ConversationEvent,
        EventKind,
        ConversationRecord,
        ConversationState,
        EventsResponse,
        StateResponse,
        VscodeResponse,
        EvictResponse,
        HealthResponse,
        ProblemDetails,
        ErrorType
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "conversations", description = "Conversation lifecycle"),
        (name = "workspaces", description = "Workspace sandboxes")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Workspace(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema, ToSchema)]
pub struct ConversationRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub git_repos: Option<Vec<String>>,
    #[serde(default)]
    pub git_token: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct EventsResponse {
    pub workspace_id: String,
    pub conversation_id: String,
    pub event_count: usize,
    pub events: Vec<ConversationEvent>,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct StateResponse {
    pub workspace_id: String,
    pub conversation_id: String,
    pub state: ConversationRecord,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct VscodeResponse {
    pub workspace_id: String,
    pub url: String,
    pub ttl_seconds: u64,
    pub last_active: i64,
    pub expires_at: i64,
    pub remaining_seconds: i64,
    pub source: String,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct EvictResponse {
    pub workspace_id: String,
    pub status: String,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
    pub runtime: String,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub file_path: String,
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let runtime = match state.registry().runtime().ping().await {
        Ok(()) => "ok".to_string(),
        Err(err) => err.to_string(),
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions: state.registry().session_count(),
        runtime,
    })
}

#[utoipa::path(
    post,
    path = "/v1/conversation",
    request_body = ConversationRequest,
    responses(
        (status = 200, description = "SSE event stream for the turn"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "conversations"
)]
async fn post_conversation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConversationRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let params = ConversationParams {
        message: request.message,
        workspace_id: request.workspace_id,
        conversation_id: request.conversation_id,
        git_repos: request.git_repos.unwrap_or_default(),
        git_token: request.git_token,
    };
    let started = state.conversations().create_or_resume(params).await?;

    let initial = stream::iter(
        started
            .subscription
            .initial_events
            .into_iter()
            .map(|event| Ok::<Event, Infallible>(to_sse_event(event))),
    );
    // The stream closes after the turn's cleanup marker; dropping it earlier
    // only detaches this client, the turn keeps running. A subscriber that
    // falls behind the broadcast capacity is disconnected rather than served
    // a sequence with holes in it.
    let live = BroadcastStream::new(started.subscription.receiver)
        .take_while(|result| future::ready(result.is_ok()))
        .filter_map(|result| future::ready(result.ok()))
        .scan(false, |done, event: ConversationEvent| {
            if *done {
                return future::ready(None);
            }
            if event.is_terminal() {
                *done = true;
            }
            future::ready(Some(event))
        })
        .map(|event| Ok::<Event, Infallible>(to_sse_event(event)));

    Ok(Sse::new(initial.chain(live)))
}

#[utoipa::path(
    get,
    path = "/v1/workspace/{workspace_id}/conversations/{conversation_id}/events",
    params(
        ("workspace_id" = String, Path, description = "Workspace id"),
        ("conversation_id" = String, Path, description = "Conversation id"),
        ("offset" = Option<u64>, Query, description = "Last seen event sequence (exclusive)"),
        ("limit" = Option<u64>, Query, description = "Max events to return")
    ),
    responses(
        (status = 200, body = EventsResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "conversations"
)]
async fn get_conversation_events(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, conversation_id)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let events = state.conversations().archived_events(
        &workspace_id,
        &conversation_id,
        query.offset.unwrap_or(0),
        query.limit,
    )?;
    Ok(Json(EventsResponse {
        workspace_id,
        conversation_id,
        event_count: events.len(),
        events,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/workspace/{workspace_id}/conversations/{conversation_id}/state",
    params(
        ("workspace_id" = String, Path, description = "Workspace id"),
        ("conversation_id" = String, Path, description = "Conversation id")
    ),
    responses(
        (status = 200, body = StateResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "conversations"
)]
async fn get_conversation_state(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, conversation_id)): Path<(String, String)>,
) -> Result<Json<StateResponse>, ApiError> {
    let record = state
        .conversations()
        .state_snapshot(&workspace_id, &conversation_id)?;
    Ok(Json(StateResponse {
        workspace_id,
        conversation_id,
        state: record,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/workspace/{workspace_id}/project/file",
    params(
        ("workspace_id" = String, Path, description = "Workspace id"),
        ("file_path" = String, Query, description = "Path relative to the project root")
    ),
    responses(
        (status = 200, description = "File contents"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "workspaces"
)]
async fn get_project_file(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let file = state
        .conversations()
        .project_file(&workspace_id, &query.file_path)?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.mime_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.file_name),
        )
        .body(Body::from(file.bytes))
        .map_err(|err| {
            ApiError::Workspace(WorkspaceError::Internal {
                message: format!("failed to build file response: {err}"),
            })
        })
}

#[utoipa::path(
    get,
    path = "/v1/workspace/{workspace_id}/vscode",
    params(("workspace_id" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, body = VscodeResponse),
        (status = 404, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "workspaces"
)]
async fn get_workspace_vscode(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> Result<Json<VscodeResponse>, ApiError> {
    let (info, view, source) = state.conversations().editor_info(&workspace_id).await?;

    let ttl_seconds = state.config.idle_ttl.as_secs();
    let last_active = view.last_used_ms / 1000;
    let expires_at = last_active + ttl_seconds as i64;
    let remaining_seconds = (expires_at - Utc::now().timestamp()).max(0);
    Ok(Json(VscodeResponse {
        workspace_id,
        url: info.url,
        ttl_seconds,
        last_active,
        expires_at,
        remaining_seconds,
        source: source.to_string(),
    }))
}

#[utoipa::path(
    delete,
    path = "/v1/workspace/{workspace_id}/vscode",
    params(("workspace_id" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, body = EvictResponse),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "workspaces"
)]
async fn delete_workspace_vscode(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> Result<Json<EvictResponse>, ApiError> {
    state.conversations().evict_workspace(&workspace_id).await?;
    Ok(Json(EvictResponse {
        workspace_id,
        status: "stopped".to_string(),
    }))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn to_sse_event(event: ConversationEvent) -> Event {
    let name = event.sse_name().to_string();
    Event::default()
        .event(name)
        .json_data(&event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}
