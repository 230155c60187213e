// RTMP 协议适配器
// 推流时鉴权：sign 参数须等于 MD5(rtmp_secret)；通道可单独豁免

use crate::store::IpcStore;
use async_trait::async_trait;
use chrono::Utc;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use vigil_core::entity::{channels, devices};
use vigil_core::{PlayDescriptor, Protocol, Publisher, Result};

pub fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

pub struct RtmpAdapter {
    store: IpcStore,
    rtmp_secret: String,
}

impl RtmpAdapter {
    pub fn new(store: IpcStore, rtmp_secret: String) -> Arc<Self> {
        Arc::new(Self { store, rtmp_secret })
    }
}

#[async_trait]
impl Protocol for RtmpAdapter {
    async fn validate_device(&self, _device: &mut devices::Model) -> Result<()> {
        Ok(())
    }

    async fn init_device(&self, _device: &devices::Model) -> Result<()> {
        Ok(())
    }

    async fn query_catalog(&self, _device: &devices::Model) -> Result<()> {
        Ok(())
    }

    /// 推流源：播放地址即推上来的流本身
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

    /// 推流方必须主动重推，流不存在事件无事可做
    async fn on_stream_not_found(&self, _app: &str, _stream: &str) -> Result<()> {
        Ok(())
    }

    /// 推流断开：停流时间戳 + 在线/播放状态清除
    async fn on_stream_changed(&self, app: &str, stream: &str) -> Result<()> {
        let channel = match self.store.get_channel_by_app_stream(app, stream).await {
            Ok(ch) => ch,
            Err(e) => {
                warn!(app, stream, "rtmp channel not found: {e}");
                return Ok(());
            }
        };
        let now = Utc::now();
        if let Err(e) = self
            .store
            .edit_channel_config_online(&channel.id, false, |cfg| {
                cfg.stopped_at = Some(now);
            })
            .await
        {
            warn!(app, stream, "update rtmp stop state failed: {e}");
        }
        if let Err(e) = self.store.edit_channel_playing(&channel.stream, false).await {
            warn!(app, stream, "clear playing flag failed: {e}");
        }
        Ok(())
    }

    fn as_publisher(&self) -> Option<&dyn Publisher> {
        Some(self)
    }
}

#[async_trait]
impl Publisher for RtmpAdapter {
    /// 鉴权判定：IsAuthDisabled ∨ sign == MD5(rtmp_secret)
    async fn on_publish(
        &self,
        app: &str,
        stream: &str,
        params: &HashMap<String, String>,
    ) -> Result<bool> {
        let channel = self.store.get_channel_by_app_stream(app, stream).await?;
        let cfg = channel.stream_config();

        if !cfg.is_auth_disabled {
            let sign = params.get("sign").map(String::as_str).unwrap_or("");
            if sign != md5_hex(&self.rtmp_secret) {
                return Ok(false);
            }
        }

        let now = Utc::now();
        let session = params.get("session").cloned().unwrap_or_default();
        let media_server_id = params.get("media_server_id").cloned().unwrap_or_default();
        self.store
            .edit_channel_config_online(&channel.id, true, |cfg| {
                cfg.pushed_at = Some(now);
                cfg.session = session;
                cfg.media_server_id = media_server_id;
            })
            .await?;
        Ok(true)
    }
}
