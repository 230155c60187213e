use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 设备表：一个逻辑视频源（国标设备 / ONVIF 相机 / RTSP 拉流源 / RTMP 推流源）
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "devices")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// 外部设备 ID：GB28181 为 18~20 位国标编号，ONVIF 为不透明 ID
    #[sea_orm(unique)]
    pub device_id: String,
    pub name: String,
    /// gb28181 / onvif / rtsp / rtmp
    pub r#type: String,
    /// tcp / udp
    pub transport: String,
    /// udp / tcp_passive / tcp_active
    pub stream_mode: String,
    pub address: String,
    pub ip: String,
    pub port: i32,
    pub username: String,
    pub password: String,
    /// 注册有效期（秒）
    pub expires: i32,
    #[sea_orm(nullable)]
    pub registered_at: Option<DateTimeUtc>,
    #[sea_orm(nullable)]
    pub keepalive_at: Option<DateTimeUtc>,
    pub is_online: bool,
    /// 通道数量
    pub channels: i32,
    #[sea_orm(column_type = "Json")]
    pub ext: Json,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// 登录 ONVIF 设备未填写用户名时默认 admin
    pub fn username_or_default(&self) -> &str {
        if self.username.is_empty() {
            "admin"
        } else {
            &self.username
        }
    }

    pub fn channel_type(&self) -> Option<crate::types::ChannelType> {
        crate::types::ChannelType::parse(&self.r#type)
    }

    pub fn device_ext(&self) -> crate::types::DeviceExt {
        serde_json::from_value(self.ext.clone()).unwrap_or_default()
    }
}
