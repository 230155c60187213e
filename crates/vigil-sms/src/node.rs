// 流媒体节点管理
// 节点生命周期：入库 → 连接采集端口 → 下发配置；存活由 webhook 心跳 + 主动探测共同判定

use crate::driver::{
    AddStreamProxyRequest, OpenRtpServerRequest, SmsDriver, StreamLiveAddr, PROTOCOL_ZLM,
};
use crate::lalmax::LalmaxDriver;
use crate::zlm::ZlmDriver;
use chrono::Utc;
use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait, IntoActiveModel,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use vigil_core::entity::{media_servers, prelude::MediaServers};
use vigil_core::{Result, VigilError};

pub const DEFAULT_MEDIA_SERVER_ID: &str = "local";

/// webhook 心跳窗口：两个 15 秒上报周期
const KEEPALIVE_WINDOW: Duration = Duration::from_secs(30);
/// 存活巡检周期
const TICK_INTERVAL: Duration = Duration::from_secs(3);

/// 配置文件中的流媒体节点设置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    pub ip: String,
    pub http_port: i32,
    pub secret: String,
    pub r#type: String,
    pub sdp_ip: String,
    pub webhook_ip: String,
    pub rtp_port_range: String,
    /// 共同部署的流媒体配置目录，用于自动发现 secret
    pub config_dir: String,
}

struct CachedServer {
    last_seen: AtomicI64,
    online: AtomicBool,
    config: media_servers::Model,
}

pub struct NodeManager {
    db: DatabaseConnection,
    drivers: HashMap<&'static str, Arc<dyn SmsDriver>>,
    cache: DashMap<String, Arc<CachedServer>>,
}

impl NodeManager {
    pub fn new(db: DatabaseConnection) -> Arc<Self> {
        let mut drivers: HashMap<&'static str, Arc<dyn SmsDriver>> = HashMap::new();
        drivers.insert(PROTOCOL_ZLM, Arc::new(ZlmDriver::new()));
        drivers.insert(crate::driver::PROTOCOL_LALMAX, Arc::new(LalmaxDriver::new()));
        Arc::new(Self {
            db,
            drivers,
            cache: DashMap::new(),
        })
    }

    /// 未指定驱动时默认 zlm
    fn driver(&self, name: &str) -> Result<Arc<dyn SmsDriver>> {
        let name = if name.is_empty() { PROTOCOL_ZLM } else { name };
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| VigilError::NotFound(format!("sms driver {name}")))
    }

    /// 启动：用配置更新默认节点，逐节点异步连接，开启存活巡检
    pub async fn run(self: &Arc<Self>, settings: &MediaSettings, server_port: u16) -> Result<()> {
        let mut settings = settings.clone();
        if let Some(secret) = discover_secret(&settings.config_dir).await {
            info!("zlm secret discovered from co-deployed config");
            settings.secret = secret;
        }

        self.upsert_default(&settings).await?;

        let servers = MediaServers::find().all(&self.db).await?;
        for ms in servers {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.connect_node(ms.clone(), server_port).await {
                    error!(id = ms.id, "connect media server failed: {e}");
                }
            });
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                manager.tick_check().await;
            }
        });
        Ok(())
    }

    /// 用配置文件内容更新（或创建）默认节点行
    async fn upsert_default(&self, settings: &MediaSettings) -> Result<()> {
        let now = Utc::now();
        let kind = if settings.r#type.is_empty() {
            PROTOCOL_ZLM.to_string()
        } else {
            settings.r#type.clone()
        };

        match MediaServers::find_by_id(DEFAULT_MEDIA_SERVER_ID)
            .one(&self.db)
            .await?
        {
            Some(existing) => {
                let mut active = existing.into_active_model();
                active.ip = Set(settings.ip.clone());
                active.http_port = Set(settings.http_port);
                active.secret = Set(settings.secret.clone());
                active.r#type = Set(kind);
                active.rtp_port_range = Set(settings.rtp_port_range.clone());
                active.hook_ip = Set(settings.webhook_ip.clone());
                active.sdp_ip = Set(settings.sdp_ip.clone());
                active.status = Set(false);
                active.updated_at = Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = media_servers::ActiveModel {
                    id: Set(DEFAULT_MEDIA_SERVER_ID.to_string()),
                    r#type: Set(kind),
                    ip: Set(settings.ip.clone()),
                    http_port: Set(settings.http_port),
                    secret: Set(settings.secret.clone()),
                    ports: Set(serde_json::json!({})),
                    rtp_port_range: Set(settings.rtp_port_range.clone()),
                    hook_ip: Set(settings.webhook_ip.clone()),
                    sdp_ip: Set(settings.sdp_ip.clone()),
                    hook_alive_interval: Set(10),
                    status: Set(false),
                    last_seen_at: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                active.insert(&self.db).await?;
            }
        }
        Ok(())
    }

    /// 连接节点：Connect 采集端口 → 持久化 → Setup 下发 webhook 配置
    async fn connect_node(&self, mut ms: media_servers::Model, server_port: u16) -> Result<()> {
        self.cache.insert(
            ms.id.clone(),
            Arc::new(CachedServer {
                last_seen: AtomicI64::new(Utc::now().timestamp()),
                online: AtomicBool::new(false),
                config: ms.clone(),
            }),
        );

        let driver = self.driver(&ms.r#type)?;
        info!(id = ms.id, kind = ms.r#type, "connecting media server");
        driver.connect(&mut ms).await?;
        info!(id = ms.id, "media server connected");

        let mut active = ms.clone().into_active_model();
        active.ports = Set(ms.ports.clone());
        active.hook_alive_interval = Set(ms.hook_alive_interval);
        active.status = Set(ms.status);
        active.updated_at = Set(Utc::now());
        active.update(&self.db).await?;

        // 缓存刷新为带端口信息的配置
        self.cache.insert(
            ms.id.clone(),
            Arc::new(CachedServer {
                last_seen: AtomicI64::new(Utc::now().timestamp()),
                online: AtomicBool::new(true),
                config: ms.clone(),
            }),
        );

        let webhook_base = format!("http://{}:{}/webhook", ms.hook_ip, server_port);
        driver.setup(&ms, &webhook_base).await?;
        info!(id = ms.id, "media server setup done");
        Ok(())
    }

    /// webhook 心跳打点
    pub fn keepalive(&self, server_id: &str) {
        if let Some(cached) = self.cache.get(server_id) {
            cached.last_seen.store(Utc::now().timestamp(), Ordering::Relaxed);
            cached.online.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_online(&self, server_id: &str) -> bool {
        self.cache
            .get(server_id)
            .map(|c| c.online.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// 巡检：心跳超窗后主动 Ping，仍失败判离线。
    /// 先快照再探测，探测期间不持有缓存分片锁
    async fn tick_check(&self) {
        let snapshot: Vec<(String, Arc<CachedServer>)> = self
            .cache
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (id, cached) in snapshot {
            let age = Utc::now().timestamp() - cached.last_seen.load(Ordering::Relaxed);
            if age < KEEPALIVE_WINDOW.as_secs() as i64 {
                cached.online.store(true, Ordering::Relaxed);
                continue;
            }

            let alive = match self.driver(&cached.config.r#type) {
                Ok(driver) => driver.ping(&cached.config).await.is_ok(),
                Err(_) => false,
            };
            if alive {
                cached.last_seen.store(Utc::now().timestamp(), Ordering::Relaxed);
                cached.online.store(true, Ordering::Relaxed);
            } else if cached.online.swap(false, Ordering::Relaxed) {
                warn!(id, "media server offline");
            }
        }
    }

    pub async fn get_media_server(&self, id: &str) -> Result<media_servers::Model> {
        MediaServers::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("media server {id}")))
    }

    pub async fn get_default_media_server(&self) -> Result<media_servers::Model> {
        self.get_media_server(DEFAULT_MEDIA_SERVER_ID).await
    }

    /// 更新节点 last_seen 落库（心跳 webhook 低频调用）
    pub async fn stamp_last_seen(&self, id: &str) -> Result<()> {
        if let Some(ms) = MediaServers::find_by_id(id).one(&self.db).await? {
            let mut active = ms.into_active_model();
            active.last_seen_at = Set(Some(Utc::now()));
            active.update(&self.db).await?;
        }
        Ok(())
    }

    pub async fn open_rtp_server(
        &self,
        ms: &media_servers::Model,
        req: &OpenRtpServerRequest,
    ) -> Result<u16> {
        self.driver(&ms.r#type)?.open_rtp_server(ms, req).await
    }

    pub async fn close_rtp_server(
        &self,
        ms: &media_servers::Model,
        stream_id: &str,
    ) -> Result<()> {
        self.driver(&ms.r#type)?.close_rtp_server(ms, stream_id).await
    }

    pub async fn add_stream_proxy(
        &self,
        ms: &media_servers::Model,
        req: &AddStreamProxyRequest,
    ) -> Result<String> {
        self.driver(&ms.r#type)?.add_stream_proxy(ms, req).await
    }

    pub async fn get_snapshot(
        &self,
        ms: &media_servers::Model,
        app: &str,
        stream: &str,
    ) -> Result<Vec<u8>> {
        self.driver(&ms.r#type)?.get_snapshot(ms, app, stream).await
    }

    pub async fn start_record(
        &self,
        ms: &media_servers::Model,
        app: &str,
        stream: &str,
        custom_path: &str,
        max_second: u32,
    ) -> Result<()> {
        self.driver(&ms.r#type)?
            .start_record(ms, app, stream, custom_path, max_second)
            .await
    }

    pub async fn stop_record(
        &self,
        ms: &media_servers::Model,
        app: &str,
        stream: &str,
    ) -> Result<()> {
        self.driver(&ms.r#type)?.stop_record(ms, app, stream).await
    }

    pub fn stream_live_addr(
        &self,
        ms: &media_servers::Model,
        http_prefix: &str,
        host: &str,
        app: &str,
        stream: &str,
    ) -> StreamLiveAddr {
        match self.driver(&ms.r#type) {
            Ok(driver) => driver.stream_live_addr(ms, http_prefix, host, app, stream),
            Err(e) => StreamLiveAddr {
                label: e.to_string(),
                ..Default::default()
            },
        }
    }
}

/// 从共同部署的流媒体配置读取 secret（zlm.ini / config.ini），
/// 流媒体可能尚未写完配置，轮询 6 次、间隔 200ms
pub async fn discover_secret(config_dir: &str) -> Option<String> {
    if config_dir.is_empty() {
        return None;
    }
    for _ in 0..6 {
        for file in ["zlm.ini", "config.ini"] {
            let path = Path::new(config_dir).join(file);
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                if let Some(secret) = parse_secret(&content) {
                    return Some(secret);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    warn!("no zlm config found, configure the sms secret manually");
    None
}

/// 在 ini 内容中提取 `secret=<token>`
fn parse_secret(content: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("secret=") {
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            if !token.is_empty() {
                return Some(token);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secret() {
        let ini = "[api]\napiDebug=1\nsecret=035c73f7-bb6b-4889-a715-d9eb2d1925cc\n";
        assert_eq!(
            parse_secret(ini).as_deref(),
            Some("035c73f7-bb6b-4889-a715-d9eb2d1925cc")
        );
        assert_eq!(parse_secret("[api]\napiDebug=1\n"), None);
    }

    #[tokio::test]
    async fn test_discover_secret_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("config.ini"), "secret=abc123\n")
            .await
            .unwrap();
        let secret = discover_secret(dir.path().to_str().unwrap()).await;
        assert_eq!(secret.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_discover_secret_empty_dir_is_none() {
        assert!(discover_secret("").await.is_none());
    }
}
