//! HTTP surface over [`StorageManager`].
//!
//! Every request carries an already-authenticated principal in `X-User-Id`
//! and may bound its own runtime with `X-Deadline-Ms`. Document paths are
//! taken from the URL tail, so `GET /docs/teams/eng/doc.md` reads
//! `/teams/eng/doc.md`.

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use knowledge_hub_core::access::{PermissionSet, Principal, TeamRole};
use knowledge_hub_core::backend::{Document, ListEntry, SearchHit, VersionSnapshot, WriteOutcome};
use knowledge_hub_core::error::ErrorKind;
use knowledge_hub_core::manager::ManagerStatus;
use knowledge_hub_core::{Caller, Metadata, StorageManager, StoreError, VersionToken};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

const DEFAULT_SEARCH_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StorageManager>,
}

/// Caller identity extracted from request headers.
#[derive(Clone, Debug)]
pub struct AuthContext(pub Caller);

impl<S: Send + Sync> FromRequestParts<S> for AuthContext {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let user = headers
            .get("X-User-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(StatusCode::UNAUTHORIZED)?;
        let mut caller = Caller::new(user);
        if let Some(raw) = headers.get("X-Deadline-Ms") {
            let millis: u64 = raw
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or(StatusCode::BAD_REQUEST)?;
            caller = caller.with_timeout(Duration::from_millis(millis));
        }
        Ok(Self(caller))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_token: Option<VersionToken>,
}

pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
            ErrorKind::VersionConflict | ErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ErrorKind::InvalidPath => StatusCode::BAD_REQUEST,
            ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::SyncFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let current_token = match &self.0 {
            StoreError::VersionConflict { current, .. } => *current,
            _ => None,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.kind(),
            current_token,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct DocResponse {
    #[serde(flatten)]
    document: Document,
    token: VersionToken,
}

#[derive(Deserialize)]
struct ReadParams {
    version: Option<u64>,
}

#[derive(Deserialize)]
struct PutRequest {
    content: String,
    #[serde(default)]
    metadata: Metadata,
    expected_token: Option<VersionToken>,
}

#[derive(Deserialize)]
struct DeleteParams {
    expected_token: Option<VersionToken>,
}

#[derive(Deserialize)]
struct MoveRequest {
    from: String,
    to: String,
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "root_prefix")]
    prefix: String,
}

fn root_prefix() -> String {
    "/".to_string()
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    prefix: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct ShareRequest {
    prefix: String,
    principal: Principal,
    permissions: PermissionSet,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RevokeRequest {
    prefix: String,
    principal: Principal,
}

#[derive(Deserialize)]
struct CreateTeamRequest {
    name: String,
}

#[derive(Deserialize)]
struct TeamMemberRequest {
    user: String,
    role: TeamRole,
}

#[derive(Deserialize)]
struct CreateWorkspaceRequest {
    name: String,
    ttl_secs: Option<u64>,
}

#[derive(Deserialize)]
struct WorkspaceMemberRequest {
    user: String,
}

pub fn router(manager: Arc<StorageManager>) -> Router {
    Router::new()
        .route(
            "/docs/{*path}",
            get(get_doc).put(put_doc).delete(delete_doc),
        )
        .route("/history/{*path}", get(history))
        .route("/move", post(move_doc))
        .route("/list", get(list))
        .route("/search", get(search))
        .route("/grants", post(share).delete(revoke))
        .route("/teams", post(create_team))
        .route("/teams/{name}/members", post(add_team_member))
        .route("/workspaces", post(create_workspace))
        .route("/workspaces/{name}/members", post(add_workspace_member))
        .route("/status", get(status))
        .route("/health", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { manager })
}

async fn get_doc(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Path(path): Path<String>,
    Query(params): Query<ReadParams>,
) -> ApiResult<Response> {
    if let Some(version) = params.version {
        let snapshot = state.manager.read_version(&caller, &path, version).await?;
        return Ok(Json(snapshot).into_response());
    }
    let (document, token) = state.manager.get(&caller, &path).await?;
    Ok(Json(DocResponse { document, token }).into_response())
}

async fn put_doc(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Path(path): Path<String>,
    Json(req): Json<PutRequest>,
) -> ApiResult<(StatusCode, Json<WriteOutcome>)> {
    let outcome = state
        .manager
        .put(&caller, &path, req.content, req.metadata, req.expected_token)
        .await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

async fn delete_doc(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Path(path): Path<String>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .delete(&caller, &path, params.expected_token)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn history(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Path(path): Path<String>,
) -> ApiResult<Json<Vec<VersionSnapshot>>> {
    Ok(Json(state.manager.history(&caller, &path).await?))
}

async fn move_doc(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Json(req): Json<MoveRequest>,
) -> ApiResult<Json<WriteOutcome>> {
    Ok(Json(
        state
            .manager
            .move_document(&caller, &req.from, &req.to)
            .await?,
    ))
}

async fn list(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<ListEntry>>> {
    Ok(Json(state.manager.list(&caller, &params.prefix).await?))
}

async fn search(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<SearchHit>>> {
    let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    Ok(Json(
        state
            .manager
            .search(&caller, &params.q, params.prefix.as_deref(), limit)
            .await?,
    ))
}

async fn share(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Json(req): Json<ShareRequest>,
) -> ApiResult<impl IntoResponse> {
    let grant = state.manager.share(
        &caller,
        &req.prefix,
        req.principal,
        req.permissions,
        req.expires_at,
    )?;
    Ok((StatusCode::CREATED, Json(grant)))
}

async fn revoke(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Json(req): Json<RevokeRequest>,
) -> ApiResult<StatusCode> {
    if state.manager.revoke(&caller, &req.prefix, &req.principal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StoreError::NotFound { path: req.prefix }.into())
    }
}

async fn create_team(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Json(req): Json<CreateTeamRequest>,
) -> ApiResult<impl IntoResponse> {
    let team = state.manager.create_team(&caller, &req.name)?;
    Ok((StatusCode::CREATED, Json(team)))
}

async fn add_team_member(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Path(name): Path<String>,
    Json(req): Json<TeamMemberRequest>,
) -> ApiResult<impl IntoResponse> {
    let team = state
        .manager
        .add_team_member(&caller, &name, &req.user, req.role)?;
    Ok(Json(team))
}

async fn create_workspace(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Json(req): Json<CreateWorkspaceRequest>,
) -> ApiResult<impl IntoResponse> {
    let ttl = req.ttl_secs.map(Duration::from_secs);
    let workspace = state.manager.create_workspace(&caller, &req.name, ttl)?;
    Ok((StatusCode::CREATED, Json(workspace)))
}

async fn add_workspace_member(
    State(state): State<AppState>,
    AuthContext(caller): AuthContext,
    Path(name): Path<String>,
    Json(req): Json<WorkspaceMemberRequest>,
) -> ApiResult<impl IntoResponse> {
    let workspace = state
        .manager
        .add_workspace_member(&caller, &name, &req.user)?;
    Ok(Json(workspace))
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<ManagerStatus>> {
    Ok(Json(state.manager.status().await?))
}
