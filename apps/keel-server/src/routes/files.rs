//! `/api/files`: product images and order documents.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use keel_engine::storage::ObjectInfo;
use keel_engine::ObjectStore;
use serde::Deserialize;

use crate::error::ApiResult;
use crate::extract::{Json, Path, Query};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/{*key}", get(download).put(upload).delete(remove))
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ObjectInfo>>> {
    Ok(Json(state.engine.storage.list(&query.prefix).await?))
}

async fn upload(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ObjectInfo>)> {
    let info = state.engine.storage.put(&key, body.to_vec()).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn download(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<impl IntoResponse> {
    let data = state.engine.storage.get(&key).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}

async fn remove(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<StatusCode> {
    state.engine.storage.delete(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}
