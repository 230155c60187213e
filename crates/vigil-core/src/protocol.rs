use crate::entity::{channels, devices};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 播放描述符：StartPlay 的结果，交给流媒体驱动或前端使用
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayDescriptor {
    /// GB28181 SSRC（10 位十进制字符串）
    pub ssrc: String,
    /// 流 ID
    pub stream: String,
    /// RTSP 拉流地址（ONVIF）
    pub rtsp: String,
}

/// 协议适配器契约（所有协议的统一接口）
///
/// 每个变体实现其中的一个子集；可选能力（推流鉴权、PTZ）
/// 通过 `as_publisher` / `as_ptz` 探测
#[async_trait]
pub trait Protocol: Send + Sync {
    /// 验证设备连通性（添加设备前调用），可回填设备信息
    async fn validate_device(&self, device: &mut devices::Model) -> Result<()>;

    /// 初始化设备连接（添加设备后调用）
    async fn init_device(&self, device: &devices::Model) -> Result<()>;

    /// 查询设备目录/通道
    async fn query_catalog(&self, device: &devices::Model) -> Result<()>;

    /// 开始播放
    async fn start_play(
        &self,
        device: &devices::Model,
        channel: &channels::Model,
    ) -> Result<PlayDescriptor>;

    /// 停止播放
    async fn stop_play(&self, device: &devices::Model, channel: &channels::Model) -> Result<()>;

    /// 删除设备时的协议侧清理
    async fn delete_device(&self, device: &devices::Model) -> Result<()>;

    /// 流不存在事件：rtsp/onvif 按需拉流，gb28181 重新 INVITE
    async fn on_stream_not_found(&self, app: &str, stream: &str) -> Result<()>;

    /// 流注销事件：更新通道状态、释放会话资源
    async fn on_stream_changed(&self, app: &str, stream: &str) -> Result<()>;

    /// 推流鉴权能力探测（仅 RTMP 实现）
    fn as_publisher(&self) -> Option<&dyn Publisher> {
        None
    }

    /// PTZ 控制能力探测（仅 GB28181 实现）
    fn as_ptz(&self) -> Option<&dyn PtzControl> {
        None
    }
}

/// 推流鉴权接口（可选能力）
#[async_trait]
pub trait Publisher: Send + Sync {
    /// 返回 true 表示鉴权通过
    async fn on_publish(
        &self,
        app: &str,
        stream: &str,
        params: &HashMap<String, String>,
    ) -> Result<bool>;
}

/// PTZ 方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtzDirection {
    Up,
    Down,
    Left,
    Right,
    UpLeft,
    UpRight,
    DownLeft,
    DownRight,
    ZoomIn,
    ZoomOut,
    FocusNear,
    FocusFar,
    IrisOpen,
    IrisClose,
    Stop,
}

/// PTZ 预置位命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresetCommand {
    SetPreset,
    GotoPreset,
    RemovePreset,
}

/// PTZ 控制接口（可选能力）
#[async_trait]
pub trait PtzControl: Send + Sync {
    async fn ptz_control(
        &self,
        channel: &channels::Model,
        direction: PtzDirection,
        speed: u8,
        horizontal: u8,
        vertical: u8,
        zoom: u8,
    ) -> Result<()>;

    /// preset_id 取值 1~255
    async fn ptz_preset(
        &self,
        channel: &channels::Model,
        command: PresetCommand,
        preset_id: u8,
    ) -> Result<()>;
}
