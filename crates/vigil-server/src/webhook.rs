// 流媒体 webhook 管道
// 十个回调路径解读流生命周期事件，路由到各协议适配器；
// 应答一律 200 + {code, msg} 信封，即便领域处理失败也回 code 0，
// 避免流媒体重试风暴（推流鉴权除外）

use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use vigil_sms::DEFAULT_MEDIA_SERVER_ID;

#[derive(Debug, Serialize)]
pub struct DefaultOutput {
    pub code: i32,
    pub msg: String,
}

fn ok() -> Json<DefaultOutput> {
    Json(DefaultOutput {
        code: 0,
        msg: "success".to_string(),
    })
}

fn reject(msg: impl Into<String>) -> Json<DefaultOutput> {
    Json(DefaultOutput {
        code: 1,
        msg: msg.into(),
    })
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct OnPublishInput {
    pub app: String,
    pub stream: String,
    pub schema: String,
    /// URL query 形式的推流参数
    pub params: String,
    #[serde(rename = "mediaServerId")]
    pub media_server_id: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct OnStreamChangedInput {
    pub app: String,
    pub stream: String,
    pub schema: String,
    pub regist: bool,
    #[serde(rename = "mediaServerId")]
    pub media_server_id: String,
    /// lalmax 兼容字段
    pub stream_name: String,
    pub app_name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct OnStreamNoneReaderInput {
    pub app: String,
    pub stream: String,
    #[serde(rename = "mediaServerId")]
    pub media_server_id: String,
}

#[derive(Debug, Serialize)]
pub struct OnStreamNoneReaderOutput {
    pub code: i32,
    pub close: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct OnRtpServerTimeoutInput {
    pub local_port: u16,
    pub ssrc: u32,
    pub stream_id: String,
    #[serde(rename = "mediaServerId")]
    pub media_server_id: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct OnStreamNotFoundInput {
    pub app: String,
    pub stream: String,
    pub schema: String,
    #[serde(rename = "mediaServerId")]
    pub media_server_id: String,
    /// lalmax 兼容字段
    pub stream_name: String,
    pub app_name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct OnRecordMp4Input {
    pub app: String,
    pub stream: String,
    pub file_path: String,
    pub file_size: i64,
    /// 切片时长（秒）
    pub time_len: f64,
    /// 切片开始时间（unix 秒）
    pub start_time: i64,
    pub url: String,
    #[serde(rename = "mediaServerId")]
    pub media_server_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/on_server_started", post(on_server_started))
        .route("/on_server_keepalive", post(on_server_keepalive))
        .route("/on_publish", post(on_publish))
        .route("/on_stream_changed", post(on_stream_changed))
        .route("/on_play", post(on_play))
        .route("/on_stream_none_reader", post(on_stream_none_reader))
        .route("/on_rtp_server_timeout", post(on_rtp_server_timeout))
        .route("/on_stream_not_found", post(on_stream_not_found))
        .route("/on_record_mp4", post(on_record_mp4))
}

/// 流媒体重启：所有 RTMP 通道离线，推流方必须重推
async fn on_server_started(State(state): State<AppState>) -> Json<DefaultOutput> {
    info!("webhook on_server_started");
    match state.store.batch_offline_rtmp().await {
        Ok(n) => info!(channels = n, "rtmp channels marked offline"),
        Err(e) => warn!("batch offline rtmp failed: {e}"),
    }
    ok()
}

async fn on_server_keepalive(State(state): State<AppState>) -> Json<DefaultOutput> {
    state.nodes.keepalive(DEFAULT_MEDIA_SERVER_ID);
    if let Err(e) = state.nodes.stamp_last_seen(DEFAULT_MEDIA_SERVER_ID).await {
        warn!("stamp media server last seen failed: {e}");
    }
    ok()
}

/// 推流鉴权：路由到实现了 Publisher 能力的适配器；
/// 没有该能力的协议视为无需鉴权
async fn on_publish(
    State(state): State<AppState>,
    Json(input): Json<OnPublishInput>,
) -> Json<DefaultOutput> {
    info!(
        app = input.app,
        stream = input.stream,
        schema = input.schema,
        media_server_id = input.media_server_id,
        "webhook on_publish"
    );

    let Some((_, protocol)) = state.orchestrator.protocol_of_stream(&input.stream) else {
        return ok();
    };
    let Some(publisher) = protocol.as_publisher() else {
        return ok();
    };

    let mut params = parse_params(&input.params);
    params.insert("media_server_id".to_string(), input.media_server_id.clone());

    match publisher.on_publish(&input.app, &input.stream, &params).await {
        Ok(true) => ok(),
        Ok(false) => reject("鉴权失败"),
        Err(e) => reject(e.to_string()),
    }
}

/// 流注册启动录制；流注销停止录制并交给适配器清理状态
async fn on_stream_changed(
    State(state): State<AppState>,
    Json(input): Json<OnStreamChangedInput>,
) -> Json<DefaultOutput> {
    let (app, stream) = lalmax_compat(&input.app, &input.stream, &input.app_name, &input.stream_name);
    info!(
        app,
        stream,
        schema = input.schema,
        regist = input.regist,
        media_server_id = input.media_server_id,
        "webhook on_stream_changed"
    );

    if input.regist {
        if let Err(e) = state.store.edit_channel_playing(&stream, true).await {
            warn!(app, stream, "update playing state failed: {e}");
        }
        if let Err(e) = state.recording.start_recording(&app, &stream).await {
            warn!(app, stream, "start recording failed: {e}");
        }
        return ok();
    }

    if let Err(e) = state.recording.stop_recording(&app, &stream).await {
        warn!(app, stream, "stop recording failed: {e}");
    }
    if let Some((_, protocol)) = state.orchestrator.protocol_of_stream(&stream) {
        if let Err(e) = protocol.on_stream_changed(&app, &stream).await {
            warn!(app, stream, "on_stream_changed failed: {e}");
        }
    }
    ok()
}

async fn on_play(
    State(state): State<AppState>,
    Json(input): Json<OnPublishInput>,
) -> Json<DefaultOutput> {
    info!(app = input.app, stream = input.stream, "webhook on_play");
    if let Err(e) = state.store.edit_channel_playing(&input.stream, true).await {
        warn!(stream = input.stream, "update playing state failed: {e}");
    }
    ok()
}

/// 无人观看：标记停播并让流媒体关闭空闲流
async fn on_stream_none_reader(
    State(state): State<AppState>,
    Json(input): Json<OnStreamNoneReaderInput>,
) -> Json<OnStreamNoneReaderOutput> {
    info!(
        app = input.app,
        stream = input.stream,
        media_server_id = input.media_server_id,
        "webhook on_stream_none_reader"
    );
    if let Err(e) = state.store.edit_channel_playing(&input.stream, false).await {
        warn!(stream = input.stream, "update playing state failed: {e}");
    }
    Json(OnStreamNoneReaderOutput {
        code: 0,
        close: true,
    })
}

async fn on_rtp_server_timeout(
    Json(input): Json<OnRtpServerTimeoutInput>,
) -> Json<DefaultOutput> {
    info!(
        local_port = input.local_port,
        ssrc = input.ssrc,
        stream_id = input.stream_id,
        media_server_id = input.media_server_id,
        "webhook on_rtp_server_timeout"
    );
    ok()
}

/// 流不存在：rtsp 按需拉流、gb28181 重新点播；
/// ZLM 来源只处理 rtmp/rtsp schema
async fn on_stream_not_found(
    State(state): State<AppState>,
    Json(input): Json<OnStreamNotFoundInput>,
) -> Json<DefaultOutput> {
    info!(
        app = input.app,
        stream = input.stream,
        schema = input.schema,
        "webhook on_stream_not_found"
    );

    let (app, stream) = if input.stream_name.is_empty() {
        if input.schema != "rtmp" && input.schema != "rtsp" {
            return ok();
        }
        (input.app.clone(), input.stream.clone())
    } else {
        (input.app_name.clone(), input.stream_name.clone())
    };

    if let Some((_, protocol)) = state.orchestrator.protocol_of_stream(&stream) {
        if let Err(e) = protocol.on_stream_not_found(&app, &stream).await {
            info!(app, stream, "on_stream_not_found: {e}");
        }
    }
    ok()
}

/// MP4 切片完成入库；找不到通道时以流名充当通道标识
async fn on_record_mp4(
    State(state): State<AppState>,
    Json(input): Json<OnRecordMp4Input>,
) -> Json<DefaultOutput> {
    info!(
        app = input.app,
        stream = input.stream,
        file_path = input.file_path,
        file_size = input.file_size,
        time_len = input.time_len,
        start_time = input.start_time,
        media_server_id = input.media_server_id,
        "webhook on_record_mp4"
    );

    let storage_dir = &state.conf.server.recording.storage_dir;
    let path = relative_record_path(&input.file_path, &input.url, storage_dir);

    let started_at = Utc
        .timestamp_opt(input.start_time, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let ended_at = started_at + chrono::Duration::milliseconds((input.time_len * 1000.0) as i64);

    let cid = match state.store.get_channel_by_stream(&input.stream).await {
        Ok(ch) => ch.id,
        Err(_) => {
            warn!(stream = input.stream, "channel not found, using stream as cid");
            input.stream.clone()
        }
    };

    if let Err(e) = state
        .recording
        .add_recording(crate::recording::AddRecordingInput {
            cid,
            app: input.app,
            stream: input.stream,
            started_at,
            ended_at,
            duration: input.time_len,
            path,
            size: input.file_size,
        })
        .await
    {
        // 仍返回成功，避免流媒体重试
        warn!("persist recording failed: {e}");
    }
    ok()
}

/// lalmax 在独立字段上报 app/stream
fn lalmax_compat(app: &str, stream: &str, app_name: &str, stream_name: &str) -> (String, String) {
    if stream_name.is_empty() {
        (app.to_string(), stream.to_string())
    } else {
        (app_name.to_string(), stream_name.to_string())
    }
}

/// 推流参数是 URL query 形式
fn parse_params(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// 切片路径转为相对存储目录的路径；不在存储目录下时退回 url 字段
fn relative_record_path(file_path: &str, url: &str, storage_dir: &str) -> String {
    if storage_dir.is_empty() {
        return file_path.to_string();
    }
    match file_path.find(storage_dir) {
        Some(idx) => {
            let tail = &file_path[idx + storage_dir.len()..];
            tail.trim_start_matches('/').to_string()
        }
        None => url.to_string(),
    }
}
