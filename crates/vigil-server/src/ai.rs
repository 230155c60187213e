// AI 事件管道
// 检测器是进程外服务：平台下发带 SMS RTSP 地址的检测任务，
// 事件经 webhook 回来，限流后入库；5 分钟一轮对账恢复收敛

use crate::config::Bootstrap;
use crate::events::{events_dir, AddEventInput, EventCore};
use crate::state::AppState;
use crate::store::IpcStore;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use vigil_core::entity::channels;
use vigil_core::{Result, VigilError};
use vigil_sms::NodeManager;

const SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// 单相机事件限流：平均 5 秒 1 条，突发 1，桶 3 分钟无访问即回收
const EVENT_RATE_PER_SEC: f64 = 0.2;
const EVENT_BURST: f64 = 1.0;
const BUCKET_IDLE: Duration = Duration::from_secs(3 * 60);

// ---------- 检测服务客户端 ----------

#[derive(Debug, Clone, Serialize, Default)]
pub struct StartCameraRequest {
    pub camera_id: String,
    pub camera_name: String,
    pub rtsp_url: String,
    pub detect_fps: u32,
    pub labels: Vec<String>,
    pub threshold: f64,
    pub roi_points: Vec<f32>,
    pub retry_limit: u32,
    pub callback_url: String,
    pub callback_secret: String,
}

/// 检测服务 HTTP 客户端，零值字段在发送前补默认值
pub struct AiClient {
    base: String,
    client: reqwest::Client,
}

impl AiClient {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VigilError::Timeout(format!("ai {path}: {e}")))?;
        resp.json()
            .await
            .map_err(|e| VigilError::Internal(format!("ai {path} decode: {e}")))
    }

    pub async fn start_camera(&self, mut req: StartCameraRequest) -> Result<Value> {
        if req.detect_fps == 0 {
            req.detect_fps = 5;
        }
        if req.threshold == 0.0 {
            req.threshold = 0.5;
        }
        if req.retry_limit == 0 {
            req.retry_limit = 10;
        }
        self.post("/api/camera/start", serde_json::to_value(&req)?).await
    }

    pub async fn stop_camera(&self, camera_id: &str) -> Result<Value> {
        self.post(
            "/api/camera/stop",
            serde_json::json!({ "camera_id": camera_id }),
        )
        .await
    }

    pub async fn get_status(&self) -> Result<Value> {
        self.post("/api/status", serde_json::json!({})).await
    }
}

// ---------- 单相机限流 ----------

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

/// 按标识的令牌桶限流，超限事件静默丢弃
pub struct IdRateLimiter {
    rate: f64,
    burst: f64,
    idle: Duration,
    buckets: DashMap<String, Bucket>,
}

impl IdRateLimiter {
    pub fn new(rate: f64, burst: f64, idle: Duration) -> Self {
        Self {
            rate,
            burst,
            idle,
            buckets: DashMap::new(),
        }
    }

    pub fn allow(&self, id: &str) -> bool {
        let now = Instant::now();
        // 顺带回收闲置的桶
        self.buckets
            .retain(|_, b| now.duration_since(b.last_access) <= self.idle);

        let mut bucket = self.buckets.entry(id.to_string()).or_insert_with(|| Bucket {
            tokens: self.burst,
            last_refill: now,
            last_access: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        bucket.last_access = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------- webhook 载荷 ----------

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AiKeepaliveInput {
    pub timestamp: i64,
    pub message: String,
    pub stats: Option<AiStats>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AiStats {
    pub active_streams: i32,
    pub uptime_seconds: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AiStartedInput {
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AiStoppedInput {
    pub camera_id: String,
    pub timestamp: i64,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BoundingBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub area: f64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AiDetectionInput {
    pub camera_id: String,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub detections: Vec<Detection>,
    /// Base64 JPEG
    pub snapshot: String,
    pub snapshot_width: i32,
    pub snapshot_height: i32,
}

#[derive(Debug, Serialize)]
pub struct AiOutput {
    pub code: i32,
    pub msg: String,
}

fn ok() -> Json<AiOutput> {
    Json(AiOutput {
        code: 0,
        msg: "success".to_string(),
    })
}

// ---------- 管道 ----------

pub struct AiPipeline {
    client: AiClient,
    conf: Arc<Bootstrap>,
    store: IpcStore,
    events: EventCore,
    nodes: Arc<NodeManager>,
    tasks: DashMap<String, ()>,
    limiter: IdRateLimiter,
}

impl AiPipeline {
    pub fn new(
        conf: Arc<Bootstrap>,
        store: IpcStore,
        events: EventCore,
        nodes: Arc<NodeManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client: AiClient::new(&conf.server.ai.endpoint),
            conf,
            store,
            events,
            nodes,
            tasks: DashMap::new(),
            limiter: IdRateLimiter::new(EVENT_RATE_PER_SEC, EVENT_BURST, BUCKET_IDLE),
        })
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// 下发检测任务：ROI 与标签来自通道扩展配置
    pub async fn start_detection(&self, channel: &channels::Model, rtsp_url: &str) -> Result<()> {
        let ext = channel.channel_ext();
        let (roi_points, mut labels) = match ext.zones.first() {
            Some(zone) => (zone.coordinates.clone(), zone.labels.clone()),
            None => (Vec::new(), Vec::new()),
        };
        if labels.is_empty() {
            labels = ["person", "car", "cat", "dog"]
                .map(str::to_string)
                .to_vec();
        }

        self.client
            .start_camera(StartCameraRequest {
                camera_id: channel.id.clone(),
                camera_name: channel.name.clone(),
                rtsp_url: rtsp_url.to_string(),
                detect_fps: 1,
                labels,
                threshold: 0.75,
                roi_points,
                retry_limit: 10,
                callback_url: format!("http://127.0.0.1:{}/ai", self.conf.server.http.port),
                callback_secret: "Basic 1234567890".to_string(),
            })
            .await?;
        self.tasks.insert(channel.id.clone(), ());
        Ok(())
    }

    /// 停止检测；无论成败都从任务表摘除，避免反复停不存在的任务
    pub async fn stop_detection(&self, camera_id: &str) -> Result<()> {
        let result = self.client.stop_camera(camera_id).await;
        self.tasks.remove(camera_id);
        result.map(|_| ())
    }

    /// 对账循环：desired = 开启 AI 的通道集合，actual = 内存任务集合，
    /// 差集分别补启动/补停止。检测器或平台重启后据此收敛
    pub fn spawn_sync_loop(self: &Arc<Self>) {
        if self.conf.server.ai.disabled {
            info!("ai pipeline disabled");
            return;
        }
        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SYNC_INTERVAL);
            loop {
                interval.tick().await;
                pipeline.sync_tasks().await;
            }
        });
    }

    async fn sync_tasks(&self) {
        let channels = match self.store.find_channels(1, 999).await {
            Ok((items, _)) => items,
            Err(e) => {
                error!("sync ai tasks: find channels failed: {e}");
                return;
            }
        };

        let desired: HashMap<String, channels::Model> = channels
            .into_iter()
            .filter(|c| c.channel_ext().enabled_ai)
            .map(|c| (c.id.clone(), c))
            .collect();
        let actual: HashSet<String> = self.tasks.iter().map(|e| e.key().clone()).collect();

        for (id, channel) in &desired {
            if !actual.contains(id) {
                info!(channel_id = id, "sync: starting ai task");
                match self.rtsp_url_of(channel).await {
                    Ok(url) => {
                        if let Err(e) = self.start_detection(channel, &url).await {
                            error!(channel_id = id, "sync: start ai task failed: {e}");
                        }
                    }
                    Err(e) => error!(channel_id = id, "sync: resolve rtsp url failed: {e}"),
                }
            }
        }

        for id in actual {
            if !desired.contains_key(&id) {
                info!(channel_id = id, "sync: stopping ai task");
                if let Err(e) = self.stop_detection(&id).await {
                    warn!(channel_id = id, "sync: stop ai task failed: {e}");
                }
            }
        }
    }

    /// 检测器从 SMS 拉流的 RTSP 地址
    async fn rtsp_url_of(&self, channel: &channels::Model) -> Result<String> {
        let ms = self.nodes.get_default_media_server().await?;
        let ports = ms.server_ports();
        Ok(format!(
            "rtsp://127.0.0.1:{}/{}/{}",
            ports.rtsp, channel.app, channel.stream
        ))
    }

    /// 事件入库：限流 → 存快照 → 每个检出标签一行
    pub async fn ingest_events(&self, input: AiDetectionInput) {
        if !self.limiter.allow(&input.camera_id) {
            return;
        }

        let cid = input.camera_id.clone();
        let did = match self.store.get_channel(&cid).await {
            Ok(ch) => ch.did,
            Err(_) => String::new(),
        };

        let image_path = if input.snapshot.is_empty() {
            String::new()
        } else {
            match save_event_snapshot(&cid, input.timestamp, &input.snapshot).await {
                Ok(path) => path,
                Err(e) => {
                    error!(camera_id = cid, "save snapshot failed: {e}");
                    String::new()
                }
            }
        };

        for det in &input.detections {
            let zones = serde_json::to_string(&serde_json::json!({
                "x_min": det.bbox.x_min,
                "y_min": det.bbox.y_min,
                "x_max": det.bbox.x_max,
                "y_max": det.bbox.y_max,
            }))
            .unwrap_or_default();

            if let Err(e) = self
                .events
                .add_event(AddEventInput {
                    did: did.clone(),
                    cid: cid.clone(),
                    started_at: input.timestamp,
                    ended_at: input.timestamp,
                    label: det.label.clone(),
                    score: det.confidence as f32,
                    zones,
                    image_path: image_path.clone(),
                    model: "default".to_string(),
                })
                .await
            {
                error!(camera_id = cid, label = det.label, "save event failed: {e}");
            }
        }
    }

    pub fn drop_task(&self, camera_id: &str) {
        self.tasks.remove(camera_id);
    }
}

/// 保存 Base64 快照到 configs/events/<cid>/，
/// 文件名 <yyyymmddhhmmss>_<随机6位>.jpg，返回相对路径
pub async fn save_event_snapshot(cid: &str, timestamp_ms: i64, b64: &str) -> Result<String> {
    let data = BASE64
        .decode(b64)
        .map_err(|e| VigilError::InvalidInput(format!("decode snapshot: {e}")))?;

    let stamp = chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .unwrap_or_else(Utc::now)
        .format("%Y%m%d%H%M%S");
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    let relative = format!("{cid}/{stamp}_{suffix:06}.jpg");

    let full = events_dir().join(&relative);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&full, &data).await?;
    info!(path = %full.display(), size = data.len(), "event snapshot saved");
    Ok(relative)
}

// ---------- /ai 路由 ----------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/keepalive", post(on_keepalive))
        .route("/started", post(on_started))
        .route("/events", post(on_events))
        .route("/stopped", post(on_stopped))
}

async fn on_keepalive(Json(input): Json<AiKeepaliveInput>) -> Json<AiOutput> {
    let (active, uptime) = input
        .stats
        .as_ref()
        .map(|s| (s.active_streams, s.uptime_seconds))
        .unwrap_or((0, 0));
    info!(
        timestamp = input.timestamp,
        active_streams = active,
        uptime_seconds = uptime,
        "ai keepalive"
    );
    ok()
}

async fn on_started(Json(input): Json<AiStartedInput>) -> Json<AiOutput> {
    info!(timestamp = input.timestamp, message = input.message, "ai started");
    ok()
}

async fn on_events(
    State(state): State<AppState>,
    Json(input): Json<AiDetectionInput>,
) -> Json<AiOutput> {
    info!(
        camera_id = input.camera_id,
        detections = input.detections.len(),
        snapshot = format!("{}x{}", input.snapshot_width, input.snapshot_height),
        "ai detection event"
    );
    state.ai.ingest_events(input).await;
    ok()
}

async fn on_stopped(
    State(state): State<AppState>,
    Json(input): Json<AiStoppedInput>,
) -> Json<AiOutput> {
    info!(
        camera_id = input.camera_id,
        reason = input.reason,
        "ai task stopped"
    );
    state.ai.drop_task(&input.camera_id);
    ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_burst_one() {
        let limiter = IdRateLimiter::new(0.2, 1.0, Duration::from_secs(180));
        assert!(limiter.allow("cam1"));
        // 突发 1：立即的第二条被丢弃
        assert!(!limiter.allow("cam1"));
        // 相机之间独立
        assert!(limiter.allow("cam2"));
    }

    #[test]
    fn test_detection_deserializes_box_field() {
        let input: AiDetectionInput = serde_json::from_str(
            r#"{
                "camera_id": "gbc_1",
                "timestamp": 1736899200000,
                "detections": [
                    {"label": "person", "confidence": 0.92,
                     "box": {"x_min": 10, "y_min": 20, "x_max": 110, "y_max": 220},
                     "area": 20000}
                ],
                "snapshot": "",
                "snapshot_width": 1920,
                "snapshot_height": 1080
            }"#,
        )
        .unwrap();
        assert_eq!(input.detections.len(), 1);
        assert_eq!(input.detections[0].bbox.x_max, 110);
    }

    #[tokio::test]
    async fn test_save_event_snapshot_layout() {
        let cwd = std::env::current_dir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let b64 = BASE64.encode(b"\xff\xd8\xff\xe0 fake jpeg");
        let rel = save_event_snapshot("gbc_1", 1736899200000, &b64).await.unwrap();
        assert!(rel.starts_with("gbc_1/"));
        assert!(rel.ends_with(".jpg"));
        // 文件名含 14 位时间戳与 6 位随机后缀
        let name = rel.rsplit('/').next().unwrap();
        assert_eq!(name.len(), "20250115000000_000000.jpg".len());
        assert!(events_dir().join(&rel).exists());

        std::env::set_current_dir(cwd).unwrap();
    }
}
