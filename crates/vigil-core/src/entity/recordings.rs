use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 录像切片表，流媒体每生成一个 MP4 切片入库一行
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "recordings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// 通道内部 ID
    pub cid: String,
    pub app: String,
    pub stream: String,
    pub started_at: DateTimeUtc,
    pub ended_at: DateTimeUtc,
    /// 时长（秒）
    #[sea_orm(column_type = "Double")]
    pub duration: f64,
    /// 相对存储根目录的路径
    pub path: String,
    /// 文件大小（字节）
    pub size: i64,
    /// 与该切片时段重叠的 AI 检测对象数
    pub object_count: i32,
    /// 预删除标记，用于界面提示即将过期
    pub delete_flag: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
