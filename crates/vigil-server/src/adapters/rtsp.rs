// RTSP 协议适配器
// 完全由 webhook 驱动：流不存在时让流媒体建立拉流代理，不做推流鉴权

use crate::store::IpcStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;
use vigil_core::entity::{channels, devices};
use vigil_core::{PlayDescriptor, Protocol, Result};
use vigil_sms::{AddStreamProxyRequest, NodeManager};

pub struct RtspAdapter {
    store: IpcStore,
    nodes: Arc<NodeManager>,
}

impl RtspAdapter {
    pub fn new(store: IpcStore, nodes: Arc<NodeManager>) -> Arc<Self> {
        Arc::new(Self { store, nodes })
    }
}

#[async_trait]
impl Protocol for RtspAdapter {
    async fn validate_device(&self, _device: &mut devices::Model) -> Result<()> {
        Ok(())
    }

    async fn init_device(&self, _device: &devices::Model) -> Result<()> {
        Ok(())
    }

    async fn query_catalog(&self, _device: &devices::Model) -> Result<()> {
        Ok(())
    }

    /// 播放地址由流媒体在首个观看者到来时按需建立
    async fn start_play(
        &self,
        _device: &devices::Model,
        channel: &channels::Model,
    ) -> Result<PlayDescriptor> {
        Ok(PlayDescriptor {
            ssrc: String::new(),
            stream: channel.stream.clone(),
            rtsp: String::new(),
        })
    }

    async fn stop_play(&self, _device: &devices::Model, _channel: &channels::Model) -> Result<()> {
        Ok(())
    }

    async fn delete_device(&self, _device: &devices::Model) -> Result<()> {
        Ok(())
    }

    /// 流不存在：按通道配置的源地址建立拉流代理，记录返回的 stream key
    async fn on_stream_not_found(&self, app: &str, stream: &str) -> Result<()> {
        let channel = self.store.get_channel_by_app_stream(app, stream).await?;
        let cfg = channel.stream_config();

        let ms = self.nodes.get_default_media_server().await?;
        let key = self
            .nodes
            .add_stream_proxy(
                &ms,
                &AddStreamProxyRequest {
                    app: channel.app.clone(),
                    stream: channel.stream.clone(),
                    url: cfg.source_url.clone(),
                    rtp_type: cfg.transport,
                },
            )
            .await?;

        self.store
            .edit_channel_config_online(&channel.id, true, |cfg| {
                cfg.stream_key = key;
            })
            .await
            .map(|_| ())
    }

    /// 拉流断开：在线与播放状态一并清除
    async fn on_stream_changed(&self, app: &str, stream: &str) -> Result<()> {
        let channel = match self.store.get_channel_by_app_stream(app, stream).await {
            Ok(ch) => ch,
            Err(e) => {
                warn!(app, stream, "rtsp channel not found: {e}");
                return Ok(());
            }
        };
        if let Err(e) = self
            .store
            .edit_channel_online_playing(&channel.stream, false, false)
            .await
        {
            warn!(app, stream, "update rtsp channel state failed: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::memory_db;
    use chrono::Utc;
    use sea_orm::{ActiveModelTrait, ActiveValue::Set};
    use vigil_core::StreamConfig;

    async fn seed_rtsp_channel(store: &IpcStore) -> channels::Model {
        let now = Utc::now();
        let cfg = StreamConfig {
            source_url: "rtsp://10.0.0.8:554/ch1".into(),
            transport: 0,
            ..Default::default()
        };
        channels::ActiveModel {
            id: Set("rtspc_abc".into()),
            did: Set("rtsp_dev".into()),
            device_id: Set("rtspc_abc".into()),
            channel_id: Set("rtspc_abc".into()),
            name: Set("pull".into()),
            r#type: Set("rtsp".into()),
            app: Set("proxy".into()),
            stream: Set("cam1".into()),
            is_online: Set(true),
            is_playing: Set(true),
            config: Set(serde_json::to_value(cfg).unwrap()),
            ext: Set(serde_json::json!({})),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(store.db())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_stream_changed_clears_state() {
        let store = IpcStore::new(memory_db().await);
        let nodes = NodeManager::new(store.db().clone());
        let adapter = RtspAdapter::new(store.clone(), nodes);
        seed_rtsp_channel(&store).await;

        adapter.on_stream_changed("proxy", "cam1").await.unwrap();
        let ch = store.get_channel("rtspc_abc").await.unwrap();
        assert!(!ch.is_online);
        assert!(!ch.is_playing);
    }

    #[tokio::test]
    async fn test_stream_changed_missing_channel_is_benign() {
        let store = IpcStore::new(memory_db().await);
        let nodes = NodeManager::new(store.db().clone());
        let adapter = RtspAdapter::new(store, nodes);
        // 通道不存在：告警后正常返回，webhook 不会重试风暴
        assert!(adapter.on_stream_changed("a", "nope").await.is_ok());
    }
}
