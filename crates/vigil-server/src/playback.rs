// 录像回放
// 按通道与时间范围动态生成拼接 m3u8，片段经静态文件服务回源

use crate::recording::{build_playlist, FindRecordingsQuery};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PlaylistQuery {
    pub start_ms: i64,
    pub end_ms: i64,
    pub token: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/channels/:cid/index.m3u8", get(channel_playlist))
}

async fn channel_playlist(
    State(state): State<AppState>,
    Path(cid): Path<String>,
    Query(query): Query<PlaylistQuery>,
) -> Response {
    if query.start_ms <= 0 || query.end_ms <= 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"code": 1, "msg": "start_ms and end_ms are required"})),
        )
            .into_response();
    }

    let (recordings, _) = match state
        .recording
        .find_recordings(&FindRecordingsQuery {
            cid,
            start_ms: query.start_ms,
            end_ms: query.end_ms,
            page: 1,
            size: 10_000,
            ..Default::default()
        })
        .await
    {
        Ok(found) => found,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"code": 1, "msg": e.to_string()})),
            )
                .into_response();
        }
    };

    if recordings.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"code": 1, "msg": "no recordings found in time range"})),
        )
            .into_response();
    }

    let playlist = build_playlist(&recordings, &query.token);
    (
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        playlist,
    )
        .into_response()
}
