use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 通道表：设备下的一个产流端点
///
/// 唯一性约束：GB28181 下 (device_id, channel_id) 唯一；
/// RTSP/RTMP 下 (app, stream) 全局唯一
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// 所属设备内部 ID
    pub did: String,
    /// 外部设备 ID（冗余，便于按国标编号查询）
    pub device_id: String,
    /// 外部通道 ID：GB28181 子设备编号 / ONVIF Profile token / 自身 ID
    pub channel_id: String,
    pub name: String,
    pub r#type: String,
    /// 流媒体命名空间
    pub app: String,
    pub stream: String,
    pub is_online: bool,
    pub is_playing: bool,
    #[sea_orm(column_type = "Json")]
    pub config: Json,
    #[sea_orm(column_type = "Json")]
    pub ext: Json,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn channel_type(&self) -> Option<crate::types::ChannelType> {
        crate::types::ChannelType::parse(&self.r#type)
    }

    pub fn stream_config(&self) -> crate::types::StreamConfig {
        serde_json::from_value(self.config.clone()).unwrap_or_default()
    }

    pub fn channel_ext(&self) -> crate::types::ChannelExt {
        serde_json::from_value(self.ext.clone()).unwrap_or_default()
    }
}
