use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 免鉴权密码哨兵值，设备密码配置为 "#" 时跳过 SIP 摘要认证
pub const IGNORE_PASSWORD: &str = "#";

/// 通道/设备协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Gb28181,
    Onvif,
    Rtsp,
    Rtmp,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Gb28181 => "gb28181",
            ChannelType::Onvif => "onvif",
            ChannelType::Rtsp => "rtsp",
            ChannelType::Rtmp => "rtmp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gb28181" => Some(ChannelType::Gb28181),
            "onvif" => Some(ChannelType::Onvif),
            "rtsp" => Some(ChannelType::Rtsp),
            "rtmp" => Some(ChannelType::Rtmp),
            _ => None,
        }
    }

    /// 生成内部 ID 的前缀
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ChannelType::Gb28181 => "gb",
            ChannelType::Onvif => "nvf",
            ChannelType::Rtsp => "rtsp",
            ChannelType::Rtmp => "rtmp",
        }
    }

    /// 生成通道内部 ID 的前缀
    pub fn channel_id_prefix(&self) -> &'static str {
        match self {
            ChannelType::Gb28181 => "gbc",
            ChannelType::Onvif => "nvfc",
            ChannelType::Rtsp => "rtspc",
            ChannelType::Rtmp => "rtmpc",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通道的流名由注册该通道的适配器铸造内部 ID 作为默认值，
/// 因此可以从流名前缀反推通道类型
pub fn channel_type_of_stream(stream: &str) -> Option<ChannelType> {
    let prefix = stream.split('_').next().unwrap_or(stream);
    match prefix {
        "gb" | "gbc" => Some(ChannelType::Gb28181),
        "nvf" | "nvfc" => Some(ChannelType::Onvif),
        "rtsp" | "rtspc" => Some(ChannelType::Rtsp),
        "rtmp" | "rtmpc" => Some(ChannelType::Rtmp),
        // GB28181 设备直接用 20 位国标编号作为流名
        _ if stream.len() >= 18 && stream.len() <= 20 && stream.chars().all(|c| c.is_ascii_digit()) => {
            Some(ChannelType::Gb28181)
        }
        _ => None,
    }
}

/// 铸造带类型前缀的内部 ID
pub fn mint_id(prefix: &str) -> String {
    let u = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &u[..12])
}

/// 流传输模式偏好（GB28181 INVITE 协商用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    #[default]
    Udp,
    TcpPassive,
    TcpActive,
}

/// 设备扩展信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceExt {
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub gb_version: String,
}

/// AI 检测区域（ROI + 标签）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Zone {
    pub name: String,
    /// 归一化多边形顶点坐标，x1,y1,x2,y2...
    pub coordinates: Vec<f32>,
    pub labels: Vec<String>,
}

/// 通道扩展信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelExt {
    pub manufacturer: String,
    pub model: String,
    pub zones: Vec<Zone>,
    pub enabled_ai: bool,
}

/// 通道流配置子记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// RTSP 拉流源地址
    pub source_url: String,
    /// 拉流传输方式，0-tcp 1-udp
    pub transport: i32,
    /// 推流会话标识
    pub session: String,
    /// 流媒体返回的代理 key，关闭拉流代理时使用
    pub stream_key: String,
    pub pushed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub media_server_id: String,
    /// 推流免鉴权
    pub is_auth_disabled: bool,
    pub timeout_s: i32,
    pub enabled_audio: bool,
    pub enabled: bool,
}

/// 流媒体服务节点端口信息，Connect 时从节点配置协商得到
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerPorts {
    pub http: i32,
    pub https: i32,
    pub flv: i32,
    pub ws_flv: i32,
    pub rtmp: i32,
    pub rtmp_ssl: i32,
    pub rtsp: i32,
    pub rtsp_ssl: i32,
    pub rtp_proxy: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_type_roundtrip() {
        for t in [
            ChannelType::Gb28181,
            ChannelType::Onvif,
            ChannelType::Rtsp,
            ChannelType::Rtmp,
        ] {
            assert_eq!(ChannelType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ChannelType::parse("srt"), None);
    }

    #[test]
    fn test_stream_type_inference() {
        assert_eq!(
            channel_type_of_stream("rtmpc_a1b2c3d4e5f6"),
            Some(ChannelType::Rtmp)
        );
        assert_eq!(
            channel_type_of_stream("rtspc_a1b2c3d4e5f6"),
            Some(ChannelType::Rtsp)
        );
        assert_eq!(
            channel_type_of_stream("nvfc_a1b2c3d4e5f6"),
            Some(ChannelType::Onvif)
        );
        assert_eq!(
            channel_type_of_stream("gbc_a1b2c3d4e5f6"),
            Some(ChannelType::Gb28181)
        );
        // 国标编号直接作为流名
        assert_eq!(
            channel_type_of_stream("34020000001310000001"),
            Some(ChannelType::Gb28181)
        );
        assert_eq!(channel_type_of_stream("whatever"), None);
    }

    #[test]
    fn test_mint_id_prefix() {
        let id = mint_id(ChannelType::Rtmp.id_prefix());
        assert!(id.starts_with("rtmp_"));
        assert_eq!(id.len(), "rtmp_".len() + 12);
    }
}
