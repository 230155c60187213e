// 流媒体服务驱动抽象
// 平台通过统一契约驱动异构流媒体（ZLM 系 / Lalmax 系）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vigil_core::entity::media_servers;
use vigil_core::Result;

pub const PROTOCOL_ZLM: &str = "zlm";
pub const PROTOCOL_LALMAX: &str = "lalmax";

/// 拉流超时（毫秒）与重试次数
pub const PULL_TIMEOUT_MS: u32 = 10_000;
pub const PULL_RETRY_NUM: u32 = 3;

/// 开启 RTP 收流服务请求
#[derive(Debug, Clone, Default)]
pub struct OpenRtpServerRequest {
    /// 0 表示由流媒体在代理端口范围内自选
    pub port: u16,
    /// 0-udp 1-tcp被动 2-tcp主动
    pub tcp_mode: u8,
    pub stream_id: String,
}

/// 添加拉流代理请求
#[derive(Debug, Clone, Default)]
pub struct AddStreamProxyRequest {
    pub app: String,
    pub stream: String,
    pub url: String,
    /// 0-tcp 1-udp
    pub rtp_type: i32,
}

/// 客户端直连播放地址集合
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamLiveAddr {
    pub label: String,
    pub ws_flv: String,
    pub http_flv: String,
    pub hls: String,
    pub webrtc: String,
    pub rtmp: String,
    pub rtsp: String,
}

/// 流媒体服务驱动契约
#[async_trait]
pub trait SmsDriver: Send + Sync {
    /// 驱动协议名，如 "zlm"
    fn protocol(&self) -> &'static str;

    /// 测试连接并采集节点信息（协商端口等回填到 ms）
    async fn connect(&self, ms: &mut media_servers::Model) -> Result<()>;

    /// 下发配置：webhook 地址、无人观看关流延迟、RTP 端口范围等
    async fn setup(&self, ms: &media_servers::Model, webhook_base: &str) -> Result<()>;

    /// 轻量存活探测
    async fn ping(&self, ms: &media_servers::Model) -> Result<()>;

    /// 开启 RTP 收流端口，返回实际端口
    async fn open_rtp_server(
        &self,
        ms: &media_servers::Model,
        req: &OpenRtpServerRequest,
    ) -> Result<u16>;

    async fn close_rtp_server(&self, ms: &media_servers::Model, stream_id: &str) -> Result<()>;

    /// 启动拉流代理，返回用于关闭代理的 key
    async fn add_stream_proxy(
        &self,
        ms: &media_servers::Model,
        req: &AddStreamProxyRequest,
    ) -> Result<String>;

    /// JPEG 快照
    async fn get_snapshot(
        &self,
        ms: &media_servers::Model,
        app: &str,
        stream: &str,
    ) -> Result<Vec<u8>>;

    /// 开始 MP4 切片录制，max_second 已由调用方钳制到 [60, 3600]
    async fn start_record(
        &self,
        ms: &media_servers::Model,
        app: &str,
        stream: &str,
        custom_path: &str,
        max_second: u32,
    ) -> Result<()>;

    async fn stop_record(&self, ms: &media_servers::Model, app: &str, stream: &str) -> Result<()>;

    /// 由协商端口与调用方 HTTP origin 拼出客户端播放地址
    fn stream_live_addr(
        &self,
        ms: &media_servers::Model,
        http_prefix: &str,
        host: &str,
        app: &str,
        stream: &str,
    ) -> StreamLiveAddr;
}
