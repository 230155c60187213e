use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 流媒体服务节点表
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "media_servers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// 驱动类型：zlm / lalmax
    pub r#type: String,
    pub ip: String,
    /// HTTP API 端口
    pub http_port: i32,
    pub secret: String,
    /// 协商端口（Connect 时从节点配置读取）
    #[sea_orm(column_type = "Json")]
    pub ports: Json,
    /// RTP 代理端口范围，如 "30000-30100"
    pub rtp_port_range: String,
    /// webhook 回调 IP
    pub hook_ip: String,
    /// SDP 中对设备通告的收流 IP
    pub sdp_ip: String,
    /// webhook 心跳上报间隔（秒）
    pub hook_alive_interval: i32,
    pub status: bool,
    #[sea_orm(nullable)]
    pub last_seen_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn server_ports(&self) -> crate::types::ServerPorts {
        serde_json::from_value(self.ports.clone()).unwrap_or_default()
    }
}
