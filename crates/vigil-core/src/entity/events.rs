use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// AI 检测事件表
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub did: String,
    pub cid: String,
    /// 事件起止时间（毫秒时间戳）
    pub started_at: i64,
    pub ended_at: i64,
    pub label: String,
    #[sea_orm(column_type = "Float")]
    pub score: f32,
    /// 检测框/区域 JSON
    pub zones: String,
    /// 快照相对路径
    pub image_path: String,
    pub model: String,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
