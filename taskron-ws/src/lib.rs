mod models;
pub mod repository;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use log::info;
use serde_json::json;
use taskron_database::interfaces::DatabaseImpl;
use taskron_metrics::MetricsCollector;
use taskron_models::{
    errors::{SendableError, TaskronError},
    web::{PageQuery, TaskInput},
};
use taskron_scheduler::SchedulerContext;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

pub use models::{ApiError, ErrorBody};

use crate::models::json_response;

/// Bearer checks applied to every API route except `/health`. Tokens are
/// issued and validated by the external auth service; when `api_token` is
/// set the presented token must also equal it.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub require_bearer: bool,
    pub api_token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self {
            require_bearer: false,
            api_token: None,
        }
    }

    fn check(&self, authorization: Option<&str>) -> Result<(), ApiError> {
        if !self.require_bearer {
            return Ok(());
        }
        let header = authorization.ok_or(ApiError::Unauthorized("missing bearer token"))?;
        let token = header
            .split_once(' ')
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized("missing bearer token"))?;

        match &self.api_token {
            Some(expected) if expected != token => Err(ApiError::Unauthorized("invalid bearer token")),
            _ => Ok(()),
        }
    }
}

pub struct AppState<D: DatabaseImpl> {
    pub scheduler: SchedulerContext<D>,
    pub metrics: Arc<MetricsCollector>,
    pub auth: AuthConfig,
}

impl<D: DatabaseImpl> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            metrics: Arc::clone(&self.metrics),
            auth: self.auth.clone(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn require_bearer(State(auth): State<AuthConfig>, request: Request, next: Next) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match auth.check(authorization) {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

fn task_input(payload: Result<Json<TaskInput>, JsonRejection>) -> Result<TaskInput, ApiError> {
    payload
        .map(|Json(input)| input)
        .map_err(|rejection| TaskronError::InvalidTask(rejection.body_text()).into())
}

async fn get_tasks<D: DatabaseImpl>(State(state): State<AppState<D>>) -> ApiResult<Response> {
    let tasks = repository::fetch_tasks(&state.scheduler).await?;
    Ok(Json(tasks).into_response())
}

async fn get_tasks_paginated<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Response> {
    let page = repository::fetch_tasks_page(&state.scheduler, query.into()).await?;
    Ok(Json(page).into_response())
}

async fn get_task<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let task = repository::fetch_task(&state.scheduler, task_id).await?;
    Ok(Json(task).into_response())
}

async fn add_task<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    payload: Result<Json<TaskInput>, JsonRejection>,
) -> ApiResult<Response> {
    let input = task_input(payload)?;
    let task = repository::add_task(&state.scheduler, &input).await?;
    Ok(json_response(StatusCode::CREATED, task))
}

async fn update_task<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Path(task_id): Path<i64>,
    payload: Result<Json<TaskInput>, JsonRejection>,
) -> ApiResult<Response> {
    let input = task_input(payload)?;
    let task = repository::update_task(&state.scheduler, task_id, &input).await?;
    Ok(Json(task).into_response())
}

async fn delete_task<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    info!("Deleting task with ID: {}", task_id);
    let response = repository::delete_task(state.scheduler.pool().as_ref(), task_id).await?;
    Ok(Json(response).into_response())
}

async fn execute_task<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let response = repository::execute_task(&state.scheduler, task_id).await?;
    Ok(json_response(StatusCode::ACCEPTED, response))
}

async fn get_task_logs<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let logs = repository::fetch_task_logs(state.scheduler.pool().as_ref(), task_id).await?;
    Ok(Json(logs).into_response())
}

async fn get_task_logs_paginated<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Path(task_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Response> {
    let page =
        repository::fetch_task_logs_page(state.scheduler.pool().as_ref(), task_id, query.into())
            .await?;
    Ok(Json(page).into_response())
}

async fn get_task_statistics<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let stats = repository::fetch_task_statistics(state.scheduler.pool().as_ref(), task_id).await?;
    Ok(Json(stats).into_response())
}

async fn get_logs_paginated<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Response> {
    let page = repository::fetch_logs_page(state.scheduler.pool().as_ref(), query.into()).await?;
    Ok(Json(page).into_response())
}

async fn get_log<D: DatabaseImpl>(
    State(state): State<AppState<D>>,
    Path(log_id): Path<i64>,
) -> ApiResult<Response> {
    let log = repository::fetch_log(state.scheduler.pool().as_ref(), log_id).await?;
    Ok(Json(log).into_response())
}

async fn get_system_stats<D: DatabaseImpl>(State(state): State<AppState<D>>) -> Response {
    Json(state.metrics.sample().await).into_response()
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

/// All routes, served at the root and again under `/api/v1`.
pub fn build_router<D: DatabaseImpl>(state: AppState<D>) -> Router {
    let auth = state.auth.clone();
    let api = Router::new()
        .route("/tasks", get(get_tasks::<D>).post(add_task::<D>))
        .route("/tasks/paginated", get(get_tasks_paginated::<D>))
        .route(
            "/tasks/:id",
            get(get_task::<D>).put(update_task::<D>).delete(delete_task::<D>),
        )
        .route("/tasks/:id/execute", post(execute_task::<D>))
        .route("/tasks/:id/logs", get(get_task_logs::<D>))
        .route("/tasks/:id/logs/paginated", get(get_task_logs_paginated::<D>))
        .route("/tasks/:id/statistics", get(get_task_statistics::<D>))
        .route("/logs/paginated", get(get_logs_paginated::<D>))
        .route("/logs/:id", get(get_log::<D>))
        .route("/system/stats", get(get_system_stats::<D>))
        .route_layer(middleware::from_fn_with_state(auth, require_bearer))
        .with_state(state);

    let routes = api.merge(Router::new().route("/health", get(health)));

    Router::new()
        .merge(routes.clone())
        .nest("/api/v1", routes)
        .layer(CorsLayer::permissive())
}

pub async fn run_webserver<D: DatabaseImpl>(
    addr: SocketAddr,
    state: AppState<D>,
    shutdown: CancellationToken,
) -> Result<(), SendableError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Web service listening on {}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Shutting down web server...");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required(token: Option<&str>) -> AuthConfig {
        AuthConfig {
            require_bearer: true,
            api_token: token.map(str::to_string),
        }
    }

    #[test]
    fn bearer_header_forms() {
        let auth = required(None);
        assert!(auth.check(Some("Bearer abc")).is_ok());
        assert!(auth.check(Some("bearer abc")).is_ok());
        assert!(auth.check(None).is_err());
        assert!(auth.check(Some("Bearer ")).is_err());
        assert!(auth.check(Some("Basic abc")).is_err());
        assert!(AuthConfig::disabled().check(None).is_ok());
    }

    #[test]
    fn configured_token_must_match() {
        let auth = required(Some("s3cret"));
        assert!(auth.check(Some("Bearer s3cret")).is_ok());
        assert!(matches!(
            auth.check(Some("Bearer other")),
            Err(ApiError::Unauthorized("invalid bearer token"))
        ));
    }
}
