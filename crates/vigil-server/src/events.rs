// AI 事件存储与清理
// 事件行携带快照相对路径；清理时先删图片文件再删行

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vigil_core::entity::{events, prelude::Events};
use vigil_core::Result;

const BATCH_SIZE: u64 = 100;

/// 事件快照根目录
pub fn events_dir() -> PathBuf {
    PathBuf::from("configs/events")
}

#[derive(Debug, Clone, Default)]
pub struct AddEventInput {
    pub did: String,
    pub cid: String,
    /// 毫秒时间戳
    pub started_at: i64,
    pub ended_at: i64,
    pub label: String,
    pub score: f32,
    pub zones: String,
    pub image_path: String,
    pub model: String,
}

#[derive(Clone)]
pub struct EventCore {
    db: DatabaseConnection,
}

impl EventCore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn add_event(&self, input: AddEventInput) -> Result<events::Model> {
        let model = events::ActiveModel {
            did: Set(input.did),
            cid: Set(input.cid),
            started_at: Set(input.started_at),
            ended_at: Set(input.ended_at),
            label: Set(input.label),
            score: Set(input.score),
            zones: Set(input.zones),
            image_path: Set(input.image_path),
            model: Set(input.model),
            created_at: Set(Utc::now()),
            ..Default::default()
        };
        Ok(model.insert(&self.db).await?)
    }

    pub async fn find_events(
        &self,
        cid: &str,
        page: u64,
        size: u64,
    ) -> Result<(Vec<events::Model>, u64)> {
        let mut select = Events::find().order_by_desc(events::Column::StartedAt);
        if !cid.is_empty() {
            select = select.filter(events::Column::Cid.eq(cid));
        }
        let paginator = select.paginate(&self.db, size.max(1));
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((items, total))
    }

    /// 某录像时段内的事件对象数（回写到录像行的 object_count）
    pub async fn count_overlapping(&self, cid: &str, start_ms: i64, end_ms: i64) -> Result<u64> {
        Ok(Events::find()
            .filter(events::Column::Cid.eq(cid))
            .filter(events::Column::StartedAt.lt(end_ms))
            .filter(events::Column::EndedAt.gte(start_ms))
            .count(&self.db)
            .await?)
    }

    /// 启动每日清理任务
    pub fn spawn_cleanup(self, retain_days: i64) {
        if retain_days <= 0 {
            info!("event cleanup disabled");
            return;
        }
        info!(retain_days, "event cleanup worker started");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
            loop {
                interval.tick().await;
                if let Err(e) = self.cleanup_expired(retain_days, Utc::now()).await {
                    warn!("event cleanup round failed: {e}");
                }
            }
        });
    }

    /// 清理过期事件：先删图片再删行，批量 100
    pub async fn cleanup_expired(&self, retain_days: i64, now: DateTime<Utc>) -> Result<()> {
        let cutoff_ms = (now - Duration::days(retain_days)).timestamp_millis();
        let root = events_dir();
        let mut total_deleted = 0usize;
        let mut files_deleted = 0usize;

        loop {
            let batch = Events::find()
                .filter(events::Column::StartedAt.lt(cutoff_ms))
                .limit(BATCH_SIZE)
                .all(&self.db)
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut ids = Vec::with_capacity(batch.len());
            for event in &batch {
                ids.push(event.id);
                if event.image_path.is_empty() {
                    continue;
                }
                let path = root.join(&event.image_path);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => files_deleted += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path.display(), "delete event image failed: {e}"),
                }
            }

            Events::delete_many()
                .filter(events::Column::Id.is_in(ids.clone()))
                .exec(&self.db)
                .await?;
            total_deleted += ids.len();
        }

        remove_empty_dirs(&root);
        if total_deleted > 0 {
            info!(
                events_deleted = total_deleted,
                files_deleted, "event cleanup completed"
            );
        }
        Ok(())
    }
}

fn remove_empty_dirs(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_empty_dirs(&path);
            if std::fs::read_dir(&path).map(|mut e| e.next().is_none()).unwrap_or(false) {
                let _ = std::fs::remove_dir(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::memory_db;

    #[tokio::test]
    async fn test_add_and_cleanup() {
        let core = EventCore::new(memory_db().await);
        let now: DateTime<Utc> = "2025-01-31T00:00:00Z".parse().unwrap();
        let old_ms = (now - Duration::days(40)).timestamp_millis();
        let new_ms = (now - Duration::days(1)).timestamp_millis();

        for (ms, label) in [(old_ms, "person"), (new_ms, "car")] {
            core.add_event(AddEventInput {
                did: "gb_1".into(),
                cid: "gbc_1".into(),
                started_at: ms,
                ended_at: ms,
                label: label.into(),
                score: 0.9,
                zones: "{}".into(),
                image_path: String::new(),
                model: "default".into(),
            })
            .await
            .unwrap();
        }

        core.cleanup_expired(30, now).await.unwrap();
        let (items, total) = core.find_events("gbc_1", 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].label, "car");
    }

    #[tokio::test]
    async fn test_count_overlapping() {
        let core = EventCore::new(memory_db().await);
        core.add_event(AddEventInput {
            cid: "gbc_1".into(),
            started_at: 1_000,
            ended_at: 1_000,
            ..Default::default()
        })
        .await
        .unwrap();
        core.add_event(AddEventInput {
            cid: "gbc_1".into(),
            started_at: 5_000,
            ended_at: 5_000,
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(core.count_overlapping("gbc_1", 0, 2_000).await.unwrap(), 1);
        assert_eq!(core.count_overlapping("gbc_1", 0, 10_000).await.unwrap(), 2);
        assert_eq!(core.count_overlapping("gbc_2", 0, 10_000).await.unwrap(), 0);
    }
}
