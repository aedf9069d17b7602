use crate::{
    app_state::AppState,
    service::TileError,
    store::TileStore,
    tile::{validate_tile, InvalidTile, RenderMode, TileKey},
};

use std::{path::Path as FsPath, sync::Arc};

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

pub fn make_router<S: TileStore + 'static>() -> Router<Arc<AppState<S>>> {
    Router::new()
        .route("/", get(home::<S>))
        .route("/static/:file", get(static_file::<S>))
        .route("/health", get(health::<S>))
        .route("/tiles/:z/:x/:y", get(tile::<S>))
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    InvalidTile(#[from] InvalidTile),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Tile(#[from] TileError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) | Self::InvalidTile(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Tile(err) if err.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Tile(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": format!("{self}") }))).into_response()
    }
}

#[derive(Deserialize)]
pub struct TileParams {
    #[serde(default)]
    mode: RenderMode,
}

async fn tile<S: TileStore>(
    State(state): State<Arc<AppState<S>>>,
    Path((z, x, y)): Path<(String, String, String)>,
    params: Result<Query<TileParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    // the last segment is `{y}.pbf`
    let y = y.strip_suffix(".pbf").ok_or(ApiError::NotFound)?;
    let parse = |name: &str, value: &str| {
        value.parse::<u32>().map_err(|_| {
            ApiError::BadRequest(format!(
                "{name} must be a non-negative integer, got {value:?}"
            ))
        })
    };
    let (z, x, y) = (parse("z", &z)?, parse("x", &x)?, parse("y", y)?);

    validate_tile(z, x, y, state.max_zoom)?;

    let key = TileKey::new(z, x, y, params.mode);
    let (payload, status) = state.tiles.get_tile(key).await?;

    let mut response = payload.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-protobuf"),
    );
    headers.insert(
        HeaderName::from_static("x-cache"),
        HeaderValue::from_static(status.as_str()),
    );
    if let Ok(cache_control) = HeaderValue::from_str(&state.cache_control) {
        headers.insert(header::CACHE_CONTROL, cache_control);
    }

    Ok(response)
}

async fn health<S: TileStore>(State(state): State<Arc<AppState<S>>>) -> impl IntoResponse {
    match state.tiles.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "version": env!("GIT_HASH") })),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": format!("{err}") })),
            )
        }
    }
}

async fn home<S: TileStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Html<String>, ApiError> {
    tokio::fs::read_to_string(state.static_dir.join("index.html"))
        .await
        .map(Html)
        .map_err(|_| ApiError::NotFound)
}

async fn static_file<S: TileStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(file): Path<String>,
) -> Result<([(HeaderName, &'static str); 1], Vec<u8>), ApiError> {
    // only plain file names from the static dir itself
    if file.is_empty() || file.contains(['/', '\\']) || file.contains("..") {
        return Err(ApiError::NotFound);
    }

    let content = tokio::fs::read(state.static_dir.join(&file))
        .await
        .map_err(|_| ApiError::NotFound)?;

    Ok(([(header::CONTENT_TYPE, content_type(&file))], content))
}

fn content_type(file: &str) -> &'static str {
    match FsPath::new(file).extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::Config,
        store::{MockTileStore, StoreError},
    };

    fn app(store: MockTileStore, vars: &[(&str, &str)]) -> Router {
        let config = Config::from_lookup(|name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        })
        .unwrap();

        make_router().with_state(Arc::new(AppState::new(&config, store)))
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    #[tokio::test]
    async fn test_empty_tile_miss_then_hit() {
        let mut store = MockTileStore::new();
        store.expect_fetch_tile().times(1).returning(|_, _| Ok(None));
        let app = app(store, &[("TILE_CACHE_TTL_SECONDS", "120")]);

        let (status, headers, body) = get(&app, "/tiles/5/10/12.pbf?mode=cluster").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(headers["x-cache"], "MISS");
        assert_eq!(headers["content-type"], "application/x-protobuf");
        assert_eq!(headers["cache-control"], "public, max-age=120");

        let (status, headers, body) = get(&app, "/tiles/5/10/12.pbf?mode=cluster").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(headers["x-cache"], "HIT");
    }

    #[tokio::test]
    async fn test_mode_defaults_to_cluster() {
        let mut store = MockTileStore::new();
        store
            .expect_fetch_tile()
            .withf(|key, _| key.mode == RenderMode::Cluster)
            .times(1)
            .returning(|_, _| Ok(Some(vec![0x1a, 0x00])));
        let app = app(store, &[]);

        let (status, _, body) = get(&app, "/tiles/3/1/2.pbf").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, vec![0x1a, 0x00]);

        // same tile asked for explicitly is the same cache entry
        let (_, headers, _) = get(&app, "/tiles/3/1/2.pbf?mode=cluster").await;
        assert_eq!(headers["x-cache"], "HIT");
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests() {
        let app = app(MockTileStore::new(), &[("TILE_MAX_ZOOM", "14")]);

        for uri in [
            "/tiles/3/8/0.pbf",
            "/tiles/15/0/0.pbf",
            "/tiles/-1/0/0.pbf",
            "/tiles/a/0/0.pbf",
            "/tiles/3/0/0.pbf?mode=heatmap",
        ] {
            let (status, _, body) = get(&app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");

            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert!(body["error"].is_string(), "{uri}");
        }

        let (status, _, _) = get(&app, "/tiles/3/0/0.png").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_backend_errors() {
        let mut store = MockTileStore::new();
        store
            .expect_fetch_tile()
            .withf(|key, _| key.x == 0)
            .returning(|_, _| Err(deadpool_postgres::PoolError::Closed.into()));
        store
            .expect_fetch_tile()
            .withf(|key, _| key.x == 1)
            .returning(|key, _| Err(StoreError::CoordinateOutOfRange(key)));
        let app = app(store, &[]);

        let (status, _, _) = get(&app, "/tiles/1/0/0.pbf").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _, _) = get(&app, "/tiles/1/1/0.pbf").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_health() {
        let mut store = MockTileStore::new();
        store.expect_ping().times(1).returning(|| Ok(()));
        let (status, _, body) = get(&app(store, &[]), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");

        let mut store = MockTileStore::new();
        store
            .expect_ping()
            .times(1)
            .returning(|| Err(deadpool_postgres::PoolError::Closed.into()));
        let (status, _, body) = get(&app(store, &[]), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "unavailable");
    }

    #[tokio::test]
    async fn test_static_files() {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/frontend");
        let app = app(MockTileStore::new(), &[("STATIC_DIR", dir)]);

        let (status, _, body) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("/static/main.js"));

        let (status, headers, _) = get(&app, "/static/main.js").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "text/javascript");

        let (status, _, _) = get(&app, "/static/..%2FCargo.toml").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = get(&app, "/static/missing.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
