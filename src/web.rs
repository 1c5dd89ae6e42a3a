use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;

use crate::app::{App, NewItem, StatusReport};
use crate::galaxy::cache::GalaxyCacheEntry;
use crate::galaxy::index::{IndexError, Neighbor};
use crate::galaxy::progress::StageState;
use crate::galaxy::GalaxyError;

const DEFAULT_K: usize = 10;

#[derive(Clone)]
struct SharedState {
    app: Arc<App>,
}

pub fn router(app: Arc<App>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/galaxy", get(get_galaxy))
        .route("/api/galaxy/build", get(build_status).post(build_galaxy))
        .route("/api/neighbors", post(neighbors))
        .route("/api/catalog/append", post(append))
        .route("/api/status", get(status))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(app: Arc<App>, addr: SocketAddr) -> anyhow::Result<()> {
    async fn shutdown_signal() {
        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                log::error!("failed to install Ctrl+C handler: {err}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(err) => {
                    log::error!("failed to install signal handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        log::warn!("shutting down");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub fn start_daemon(app: Arc<App>, addr: SocketAddr) -> anyhow::Result<()> {
    warm_up(&app);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(app, addr))
}

/// Make the index queryable as soon as possible: reuse a fresh cache and
/// rebuild only the index, or start a full build.
fn warm_up(app: &Arc<App>) {
    let service = app.service().clone();

    if service.load_cached_galaxy_if_fresh().is_some() {
        std::thread::spawn(move || match service.refresh_index() {
            Ok(index) => log::info!("Index ready ({} items)", index.len()),
            Err(err) => log::warn!("Failed to build index: {err}"),
        });
        return;
    }

    if service.store().is_empty() {
        log::info!("Store is empty, waiting for catalog items");
        return;
    }

    if let Err(err) = service.request_build(None) {
        log::warn!("Failed to start galaxy build: {err}");
    }
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Galaxy(#[from] GalaxyError),

    #[error(transparent)]
    Build(#[from] Arc<GalaxyError>),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug)]
struct HttpError(ApiError);

fn galaxy_status(err: &GalaxyError) -> StatusCode {
    match err {
        GalaxyError::Index(IndexError::NotReady) => StatusCode::SERVICE_UNAVAILABLE,
        GalaxyError::Index(IndexError::DimensionMismatch { .. })
        | GalaxyError::Index(IndexError::InvalidQuery(_)) => StatusCode::BAD_REQUEST,
        GalaxyError::Index(IndexError::EmptyIndex) => StatusCode::CONFLICT,
        GalaxyError::UnknownItem(_) => StatusCode::NOT_FOUND,
        GalaxyError::Superseded => StatusCode::CONFLICT,
        GalaxyError::Store(_) => StatusCode::BAD_REQUEST,
        GalaxyError::WorkerPanicked(_) | GalaxyError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            ApiError::Galaxy(err) => galaxy_status(err),
            ApiError::Build(err) => galaxy_status(err),
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            log::error!("{self:?}");
        }

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<ApiError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn get_galaxy(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<GalaxyCacheEntry>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        app.service()
            .load_cached_galaxy_if_fresh()
            .map(Json)
            .ok_or(ApiError::NotFound("galaxy cache is missing or stale".to_string()).into())
    })
}

async fn build_galaxy(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<GalaxyCacheEntry>, HttpError> {
    let handle = state.app.service().request_build(None)?;
    log::debug!("waiting for galaxy build {}", handle.id());

    let outcome = tokio::task::spawn_blocking(move || handle.wait())
        .await
        .map_err(|err| anyhow::anyhow!("build waiter failed: {err}"))?;

    Ok(Json(outcome?.as_ref().clone()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildStatusResponse {
    in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    build_id: Option<String>,
    cancelled: bool,
    stages: Vec<StageState>,
}

async fn build_status(State(state): State<Arc<SharedState>>) -> Json<BuildStatusResponse> {
    let response = match state.app.service().background_build() {
        Some(handle) => BuildStatusResponse {
            in_flight: true,
            build_id: Some(handle.id().to_string()),
            cancelled: handle.is_cancelled(),
            stages: handle.stages(),
        },
        None => BuildStatusResponse {
            in_flight: false,
            build_id: None,
            cancelled: false,
            stages: Vec::new(),
        },
    };

    Json(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborsRequest {
    pub item_id: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub k: Option<usize>,
}

async fn neighbors(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<NeighborsRequest>,
) -> Result<Json<Vec<Neighbor>>, HttpError> {
    let app = state.app.clone();
    let k = payload.k.unwrap_or(DEFAULT_K);

    tokio::task::block_in_place(move || {
        let service = app.service();
        let neighbors = match (payload.item_id, payload.vector) {
            (Some(item_id), None) => service.neighbors_of(&item_id, k)?,
            (None, Some(vector)) => service.query_with_distances(&vector, k)?,
            _ => {
                return Err(
                    ApiError::BadRequest("expected exactly one of itemId or vector".to_string())
                        .into(),
                )
            }
        };
        Ok(Json(neighbors))
    })
}

#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub items: Vec<NewItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    appended: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    build_id: Option<String>,
}

async fn append(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<AppendRequest>,
) -> Result<Json<AppendResponse>, HttpError> {
    let app = state.app.clone();
    log::debug!("appending {} items", payload.items.len());

    tokio::task::block_in_place(move || {
        let appended = app
            .append(payload.items)
            .map_err(|err| ApiError::BadRequest(format!("{err:#}")))?;

        // refresh the galaxy in the background
        let build_id = match app.service().request_build(None) {
            Ok(handle) => Some(handle.id().to_string()),
            Err(err) => {
                log::warn!("Failed to start galaxy build: {err}");
                None
            }
        };

        Ok(Json(AppendResponse { appended, build_id }))
    })
}

async fn status(State(state): State<Arc<SharedState>>) -> Json<StatusReport> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || Json(app.status()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn call(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn open_app(dir: &std::path::Path) -> Arc<App> {
        Arc::new(App::open(dir, Some(3)).unwrap())
    }

    fn items() -> serde_json::Value {
        json!({
            "items": [
                {"id": "a", "title": "Alpha", "category": "drama", "embedding": [1.0, 0.0, 0.0]},
                {"id": "b", "embedding": [0.9, 0.1, 0.0]},
                {"id": "c", "embedding": [0.0, 1.0, 0.0]},
                {"id": "d", "embedding": [0.0, 0.0, 1.0]}
            ]
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_galaxy_missing_before_build() {
        let tmp = tempfile::tempdir().unwrap();
        let router = router(open_app(tmp.path()));

        let (status, body) = call(router, "GET", "/api/galaxy", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_append_build_and_query() {
        let tmp = tempfile::tempdir().unwrap();
        let app = open_app(tmp.path());

        let (status, body) =
            call(router(app.clone()), "POST", "/api/catalog/append", Some(items())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["appended"], 4);

        let (status, body) = call(router(app.clone()), "POST", "/api/galaxy/build", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nodes"].as_array().unwrap().len(), 4);
        assert_eq!(body["fingerprint"]["count"], 4);

        let (status, body) = call(router(app.clone()), "GET", "/api/galaxy", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 1);

        let (status, body) = call(
            router(app.clone()),
            "POST",
            "/api/neighbors",
            Some(json!({"itemId": "a", "k": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["itemId"], "b");
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = call(
            router(app.clone()),
            "POST",
            "/api/neighbors",
            Some(json!({"vector": [1.0, 0.0, 0.0], "k": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["itemId"], "a");
        assert_eq!(body[0]["distance"], 0.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_neighbors_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let app = open_app(tmp.path());

        let (status, _) = call(
            router(app.clone()),
            "POST",
            "/api/neighbors",
            Some(json!({"vector": [1.0, 0.0, 0.0]})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = call(router(app.clone()), "POST", "/api/neighbors", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            router(app.clone()),
            "POST",
            "/api/neighbors",
            Some(json!({"itemId": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_append_seeds_store_without_dimensions() {
        let tmp = tempfile::tempdir().unwrap();
        let app = Arc::new(App::open(tmp.path(), None).unwrap());

        let (status, body) =
            call(router(app.clone()), "POST", "/api/catalog/append", Some(items())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["appended"], 4);
        assert_eq!(app.store().dimensions(), 3);

        let (status, body) = call(router(app.clone()), "POST", "/api/galaxy/build", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nodes"].as_array().unwrap().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_append_rejects_wrong_dimensions() {
        let tmp = tempfile::tempdir().unwrap();
        let app = open_app(tmp.path());

        let (status, body) = call(
            router(app.clone()),
            "POST",
            "/api/catalog/append",
            Some(json!({"items": [{"id": "a", "embedding": [1.0]}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("dimensions"));
        assert!(app.store().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_and_build_status() {
        let tmp = tempfile::tempdir().unwrap();
        let app = open_app(tmp.path());

        let (status, body) = call(router(app.clone()), "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["galaxy"]["store"]["count"], 0);
        assert_eq!(body["cache"]["present"], false);

        let (status, body) = call(router(app.clone()), "GET", "/api/galaxy/build", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inFlight"], false);
    }
}
