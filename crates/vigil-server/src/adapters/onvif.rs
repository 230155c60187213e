// ONVIF 协议适配器
// 健康状态是异步双任务状态机：
// 任务 A 周期性发心跳（30s，逐设备独立任务避免队头阻塞），
// 任务 B 周期性检查（1s，超时 70s 判离线），仅在状态翻转时写库

use crate::store::{IpcStore, ReportedChannel};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vigil_core::entity::{channels, devices};
use vigil_core::{ChannelExt, ChannelType, PlayDescriptor, Protocol, Result, VigilError};
use vigil_onvif::OnvifClient;
use vigil_sms::{AddStreamProxyRequest, NodeManager};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CHECK_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_TIMEOUT_SECS: i64 = 70;

struct CachedDevice {
    client: OnvifClient,
    /// 最近一次心跳成功时间（unix 秒），0 表示尚未心跳过
    keepalive_at: AtomicI64,
    online: AtomicBool,
}

pub struct OnvifAdapter {
    devices: DashMap<String, Arc<CachedDevice>>,
    store: IpcStore,
    nodes: Arc<NodeManager>,
}

/// 状态机翻转判定：返回 Some(新状态) 仅当状态发生变化
fn status_transition(age_secs: i64, currently_online: bool) -> Option<bool> {
    let online = age_secs < HEARTBEAT_TIMEOUT_SECS;
    (online != currently_online).then_some(online)
}

impl OnvifAdapter {
    pub fn new(store: IpcStore, nodes: Arc<NodeManager>) -> Arc<Self> {
        Arc::new(Self {
            devices: DashMap::new(),
            store,
            nodes,
        })
    }

    fn client_for(device: &devices::Model) -> OnvifClient {
        OnvifClient::new(
            &format!("{}:{}", device.ip, device.port),
            device.username_or_default(),
            &device.password,
        )
    }

    fn cache_device(&self, device: &devices::Model, online: bool) -> Arc<CachedDevice> {
        let cached = Arc::new(CachedDevice {
            client: Self::client_for(device),
            keepalive_at: AtomicI64::new(if online { Utc::now().timestamp() } else { 0 }),
            online: AtomicBool::new(online),
        });
        self.devices.insert(device.id.clone(), cached.clone());
        cached
    }

    /// 启动时恢复缓存并拉起健康检查双任务
    pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let devices = self.store.find_devices(Some(ChannelType::Onvif)).await?;
        for device in devices {
            self.cache_device(&device, device.is_online);
        }

        let adapter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                adapter.heartbeat_round();
            }
        });

        let adapter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            loop {
                interval.tick().await;
                adapter.status_round().await;
            }
        });
        Ok(())
    }

    /// 任务 A：每台设备独立任务探测，成功则仅更新内存时间戳
    fn heartbeat_round(&self) {
        for entry in self.devices.iter() {
            let cached = entry.value().clone();
            tokio::spawn(async move {
                if cached.client.get_device_information().await.is_ok() {
                    cached.keepalive_at.store(Utc::now().timestamp(), Ordering::Relaxed);
                }
            });
        }
    }

    /// 任务 B：仅在布尔翻转时同步到持久层，限定数据库写入量。
    /// 先快照再写库，写库期间不持有缓存分片锁
    async fn status_round(&self) {
        let now = Utc::now().timestamp();
        let snapshot: Vec<(String, Arc<CachedDevice>)> = self
            .devices
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (device_id, cached) in snapshot {
            let keepalive_at = cached.keepalive_at.load(Ordering::Relaxed);
            if keepalive_at == 0 {
                continue;
            }
            let age = now - keepalive_at;
            let currently = cached.online.load(Ordering::Relaxed);
            if let Some(online) = status_transition(age, currently) {
                cached.online.store(online, Ordering::Relaxed);
                if online {
                    info!(device_id, "onvif device online");
                } else {
                    warn!(device_id, age, "onvif device offline");
                }
                if let Err(e) = self.store.set_device_online(&device_id, online).await {
                    warn!(device_id, "sync online state failed: {e}");
                }
            }
        }
    }

    async fn query_and_save_profiles(
        &self,
        device: &devices::Model,
        client: &OnvifClient,
    ) -> Result<()> {
        let profiles = client
            .get_profiles()
            .await
            .map_err(|e| VigilError::Auth(format!("get profiles: {e}")))?;
        if profiles.is_empty() {
            return Err(VigilError::NotFound("no onvif profile".into()));
        }

        let reported: Vec<ReportedChannel> = profiles
            .into_iter()
            .map(|p| ReportedChannel {
                channel_id: p.token,
                name: p.name,
                is_online: true,
                ext: ChannelExt::default(),
            })
            .collect();
        let count = reported.len();
        self.store
            .save_channels(device, ChannelType::Onvif, reported)
            .await?;
        info!(device_id = device.id, count, "onvif profiles synced");
        Ok(())
    }
}

#[async_trait]
impl Protocol for OnvifAdapter {
    /// 探活并回填设备信息
    async fn validate_device(&self, device: &mut devices::Model) -> Result<()> {
        let client = Self::client_for(device);
        let info = client
            .get_device_information()
            .await
            .map_err(|e| VigilError::Auth(format!("bad credentials or address: {e}")))?;

        device.transport = "tcp".to_string();
        device.address = format!("{}:{}", device.ip, device.port);
        device.is_online = true;
        let mut ext = device.device_ext();
        ext.manufacturer = info.manufacturer;
        ext.model = info.model;
        ext.firmware = info.firmware_version;
        device.ext = serde_json::to_value(ext)?;
        Ok(())
    }

    /// 初始化：缓存连接并把 Profiles 同步为通道
    async fn init_device(&self, device: &devices::Model) -> Result<()> {
        let cached = self.cache_device(device, true);
        self.query_and_save_profiles(device, &cached.client).await
    }

    async fn query_catalog(&self, device: &devices::Model) -> Result<()> {
        let cached = match self.devices.get(&device.id) {
            Some(c) => c.value().clone(),
            None => self.cache_device(device, true),
        };
        self.query_and_save_profiles(device, &cached.client).await
    }

    /// 取 RTSP 地址交由流媒体拉流
    async fn start_play(
        &self,
        device: &devices::Model,
        channel: &channels::Model,
    ) -> Result<PlayDescriptor> {
        let cached = self
            .devices
            .get(&device.id)
            .map(|c| c.value().clone())
            .ok_or_else(|| VigilError::NotFound(format!("onvif device {} not initialized", device.id)))?;
        let rtsp = cached
            .client
            .get_stream_uri(&channel.channel_id)
            .await
            .map_err(|e| VigilError::Internal(format!("get stream uri: {e}")))?;
        Ok(PlayDescriptor {
            ssrc: String::new(),
            stream: channel.stream.clone(),
            rtsp,
        })
    }

    async fn stop_play(&self, _device: &devices::Model, _channel: &channels::Model) -> Result<()> {
        // 拉流代理由无人观看回调关闭
        Ok(())
    }

    async fn delete_device(&self, device: &devices::Model) -> Result<()> {
        self.devices.remove(&device.id);
        Ok(())
    }

    /// 流不存在：查 RTSP 地址并让流媒体建立拉流代理
    async fn on_stream_not_found(&self, app: &str, stream: &str) -> Result<()> {
        let channel = self.store.get_channel_by_stream(stream).await?;
        let cached = self
            .devices
            .get(&channel.did)
            .map(|c| c.value().clone())
            .ok_or_else(|| VigilError::NotFound(format!("onvif device {} not initialized", channel.did)))?;

        let rtsp = cached
            .client
            .get_stream_uri(&channel.channel_id)
            .await
            .map_err(|e| VigilError::Internal(format!("get stream uri: {e}")))?;

        let ms = self.nodes.get_default_media_server().await?;
        self.nodes
            .add_stream_proxy(
                &ms,
                &AddStreamProxyRequest {
                    app: app.to_string(),
                    stream: stream.to_string(),
                    url: rtsp,
                    rtp_type: 0,
                },
            )
            .await?;
        self.store.edit_channel_playing(&channel.stream, true).await
    }

    async fn on_stream_changed(&self, _app: &str, stream: &str) -> Result<()> {
        let channel = self.store.get_channel_by_stream(stream).await?;
        self.store.edit_channel_playing(&channel.stream, false).await
    }
}
