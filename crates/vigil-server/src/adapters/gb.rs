// GB28181 协议适配器
// 点播链路：开 RTP 收流端口 → INVITE → webhook 确认流注册；
// GbBridge 把注册服务器的回调落到存储

use crate::store::{IpcStore, ReportedChannel};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use vigil_core::entity::{channels, devices};
use vigil_core::{
    ChannelExt, ChannelType, PlayDescriptor, PresetCommand, Protocol, PtzControl, PtzDirection,
    Result, StreamMode, VigilError,
};
use vigil_gb28181::manscdp::{CatalogItem, DeviceInfo};
use vigil_gb28181::server::{GbHandler, PlayInput, RegisterContext};
use vigil_gb28181::GbServer;
use vigil_sms::{NodeManager, OpenRtpServerRequest};

fn parse_stream_mode(s: &str) -> StreamMode {
    match s {
        "tcp_passive" => StreamMode::TcpPassive,
        "tcp_active" => StreamMode::TcpActive,
        _ => StreamMode::Udp,
    }
}

pub struct GbAdapter {
    gb: Arc<GbServer>,
    store: IpcStore,
    nodes: Arc<NodeManager>,
}

impl GbAdapter {
    pub fn new(gb: Arc<GbServer>, store: IpcStore, nodes: Arc<NodeManager>) -> Arc<Self> {
        Arc::new(Self { gb, store, nodes })
    }
}

#[async_trait]
impl Protocol for GbAdapter {
    async fn validate_device(&self, _device: &mut devices::Model) -> Result<()> {
        // 国标设备由注册流程验证身份
        Ok(())
    }

    async fn init_device(&self, _device: &devices::Model) -> Result<()> {
        Ok(())
    }

    async fn query_catalog(&self, device: &devices::Model) -> Result<()> {
        self.gb.query_catalog(&device.device_id).await
    }

    async fn start_play(
        &self,
        device: &devices::Model,
        channel: &channels::Model,
    ) -> Result<PlayDescriptor> {
        let ms = self.nodes.get_default_media_server().await?;
        let stream_mode = parse_stream_mode(&device.stream_mode);
        let tcp_mode = match stream_mode {
            StreamMode::Udp => 0,
            StreamMode::TcpPassive => 1,
            StreamMode::TcpActive => 2,
        };

        let rtp_port = self
            .nodes
            .open_rtp_server(
                &ms,
                &OpenRtpServerRequest {
                    port: 0,
                    tcp_mode,
                    stream_id: channel.stream.clone(),
                },
            )
            .await?;

        let rtp_ip = if ms.sdp_ip.is_empty() {
            ms.ip.clone()
        } else {
            ms.sdp_ip.clone()
        };

        let play = self
            .gb
            .play(PlayInput {
                device_id: device.device_id.clone(),
                channel_id: channel.channel_id.clone(),
                stream: channel.stream.clone(),
                rtp_ip,
                rtp_port,
                stream_mode,
            })
            .await;

        match play {
            Ok(session) => Ok(PlayDescriptor {
                ssrc: session.ssrc,
                stream: channel.stream.clone(),
                rtsp: String::new(),
            }),
            Err(e) => {
                // INVITE 失败时释放收流端口
                if let Err(close_err) = self.nodes.close_rtp_server(&ms, &channel.stream).await {
                    warn!(stream = channel.stream, "close rtp server failed: {close_err}");
                }
                Err(e)
            }
        }
    }

    async fn stop_play(&self, _device: &devices::Model, channel: &channels::Model) -> Result<()> {
        self.gb.stop_play(&channel.stream).await?;
        if let Ok(ms) = self.nodes.get_default_media_server().await {
            let _ = self.nodes.close_rtp_server(&ms, &channel.stream).await;
        }
        self.store.edit_channel_playing(&channel.stream, false).await
    }

    async fn delete_device(&self, device: &devices::Model) -> Result<()> {
        self.gb.sessions.remove(&device.device_id);
        Ok(())
    }

    /// 流不存在：重新 INVITE 点播
    async fn on_stream_not_found(&self, _app: &str, stream: &str) -> Result<()> {
        let channel = self.store.get_channel_by_stream(stream).await?;
        let device = self.store.get_device(&channel.did).await?;
        self.start_play(&device, &channel).await.map(|_| ())
    }

    /// 流注销：结束点播会话并释放资源
    async fn on_stream_changed(&self, _app: &str, stream: &str) -> Result<()> {
        let channel = self.store.get_channel_by_stream(stream).await?;
        self.store.edit_channel_playing(&channel.stream, false).await?;
        self.gb.stop_play(&channel.stream).await?;
        if let Ok(ms) = self.nodes.get_default_media_server().await {
            let _ = self.nodes.close_rtp_server(&ms, &channel.stream).await;
        }
        Ok(())
    }

    fn as_ptz(&self) -> Option<&dyn PtzControl> {
        Some(self)
    }
}

#[async_trait]
impl PtzControl for GbAdapter {
    async fn ptz_control(
        &self,
        channel: &channels::Model,
        direction: PtzDirection,
        speed: u8,
        horizontal: u8,
        vertical: u8,
        zoom: u8,
    ) -> Result<()> {
        let device = self.store.get_device(&channel.did).await?;
        if !device.is_online {
            return Err(VigilError::DeviceOffline(device.device_id));
        }
        self.gb
            .ptz_control(
                &device.device_id,
                &channel.channel_id,
                direction,
                speed,
                horizontal,
                vertical,
                zoom,
            )
            .await
    }

    async fn ptz_preset(
        &self,
        channel: &channels::Model,
        command: PresetCommand,
        preset_id: u8,
    ) -> Result<()> {
        let device = self.store.get_device(&channel.did).await?;
        if !device.is_online {
            return Err(VigilError::DeviceOffline(device.device_id));
        }
        self.gb
            .ptz_preset(&device.device_id, &channel.channel_id, command, preset_id)
            .await
    }
}

/// 注册服务器 → 存储的桥接
pub struct GbBridge {
    store: IpcStore,
}

impl GbBridge {
    pub fn new(store: IpcStore) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

#[async_trait]
impl GbHandler for GbBridge {
    async fn device_password(&self, device_id: &str) -> Result<Option<String>> {
        let dev = self.store.get_or_create_gb_device(device_id).await?;
        if dev.password.is_empty() {
            Ok(None)
        } else {
            Ok(Some(dev.password))
        }
    }

    async fn on_registered(&self, device_id: &str, ctx: RegisterContext) {
        if let Err(e) = self
            .store
            .mark_registered(device_id, &ctx.address, ctx.transport, ctx.expires, &ctx.gb_version)
            .await
        {
            warn!(device_id, "persist registration failed: {e}");
        }
    }

    async fn on_unregistered(&self, device_id: &str) {
        info!(device_id, "status change: device offline");
        if let Err(e) = self.store.mark_offline_by_device_id(device_id).await {
            warn!(device_id, "persist offline failed: {e}");
        }
    }

    async fn on_keepalive(&self, device_id: &str) {
        if let Err(e) = self.store.touch_keepalive(device_id).await {
            warn!(device_id, "persist keepalive failed: {e}");
        }
    }

    async fn on_catalog(&self, device_id: &str, items: Vec<CatalogItem>) {
        // 零值不做变更：没有通道的目录没有入库意义
        if items.is_empty() {
            return;
        }
        let device = match self.store.get_device_by_device_id(device_id).await {
            Ok(Some(dev)) => dev,
            Ok(None) => {
                warn!(device_id, "catalog for unknown device dropped");
                return;
            }
            Err(e) => {
                warn!(device_id, "load device failed: {e}");
                return;
            }
        };

        let reported: Vec<ReportedChannel> = items
            .into_iter()
            .map(|item| ReportedChannel {
                is_online: item.is_online(),
                name: item.name,
                ext: ChannelExt {
                    manufacturer: item.manufacturer,
                    model: item.model,
                    ..Default::default()
                },
                channel_id: item.device_id,
            })
            .collect();

        let count = reported.len();
        if let Err(e) = self
            .store
            .save_channels(&device, ChannelType::Gb28181, reported)
            .await
        {
            warn!(device_id, "save channels failed: {e}");
        } else {
            info!(device_id, count, "catalog merged");
        }
    }

    async fn on_device_info(&self, device_id: &str, info: DeviceInfo) {
        if let Err(e) = self
            .store
            .update_device_info(
                device_id,
                &info.device_name,
                &info.manufacturer,
                &info.model,
                &info.firmware,
            )
            .await
        {
            warn!(device_id, "persist device info failed: {e}");
        }
    }

    async fn on_bye(&self, stream: &str) {
        if let Err(e) = self.store.edit_channel_playing(stream, false).await {
            warn!(stream, "clear playing flag failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_mode() {
        assert_eq!(parse_stream_mode("udp"), StreamMode::Udp);
        assert_eq!(parse_stream_mode("tcp_passive"), StreamMode::TcpPassive);
        assert_eq!(parse_stream_mode("tcp_active"), StreamMode::TcpActive);
        assert_eq!(parse_stream_mode(""), StreamMode::Udp);
    }

    #[tokio::test]
    async fn test_bridge_password_semantics() {
        let store = IpcStore::new(crate::store::tests::memory_db().await);
        let bridge = GbBridge::new(store.clone());
        // 新设备无口令：免鉴权（由服务器回落全局口令）
        assert_eq!(
            bridge.device_password("34020000001320000001").await.unwrap(),
            None
        );
        let dev = store
            .get_device_by_device_id("34020000001320000001")
            .await
            .unwrap()
            .unwrap();
        store.update_device_password(&dev.id, "12345678").await.unwrap();
        assert_eq!(
            bridge.device_password("34020000001320000001").await.unwrap(),
            Some("12345678".to_string())
        );
    }

    #[tokio::test]
    async fn test_bridge_catalog_merges_channels() {
        let store = IpcStore::new(crate::store::tests::memory_db().await);
        let bridge = GbBridge::new(store.clone());
        store
            .mark_registered("34020000001320000001", "a:1", "udp", 3600, "")
            .await
            .unwrap();

        bridge
            .on_catalog(
                "34020000001320000001",
                vec![
                    CatalogItem {
                        device_id: "34020000001310000001".into(),
                        name: "cam 1".into(),
                        status: "ON".into(),
                        manufacturer: "Hikvision".into(),
                        ..Default::default()
                    },
                    CatalogItem {
                        device_id: "34020000001310000002".into(),
                        name: "cam 2".into(),
                        status: "OFF".into(),
                        ..Default::default()
                    },
                ],
            )
            .await;

        let dev = store
            .get_device_by_device_id("34020000001320000001")
            .await
            .unwrap()
            .unwrap();
        let chs = store.find_channels_of_device(&dev.id).await.unwrap();
        assert_eq!(chs.len(), 2);
        let online: Vec<bool> = {
            let mut sorted = chs.clone();
            sorted.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
            sorted.iter().map(|c| c.is_online).collect()
        };
        assert_eq!(online, vec![true, false]);
        // 空目录不触发任何写入
        bridge.on_catalog("34020000001320000001", vec![]).await;
    }
}
