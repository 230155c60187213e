// 录像保留与淘汰
// 启动时执行一次，随后每小时一轮：
// 预标记（1 小时内将过期）→ 按时间清理 → 按磁盘水位清理 → 清空目录

use crate::recording::RecordingCore;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::path::Path;
use sysinfo::Disks;
use tracing::{info, warn};
use vigil_core::entity::{prelude::Recordings, recordings};
use vigil_core::Result;

const BATCH_SIZE: u64 = 100;
const MIN_DISK_SWEEP_BYTES: i64 = 100 * 1024 * 1024;

pub struct RetentionWorker {
    core: RecordingCore,
}

impl RetentionWorker {
    pub fn new(core: RecordingCore) -> Self {
        Self { core }
    }

    /// 启动后台任务：立即清理一次，此后每 60 分钟一轮
    pub fn spawn(self) {
        if self.core.settings().disabled {
            info!("recording cleanup disabled");
            return;
        }
        info!(
            retain_days = self.core.settings().retain_days,
            disk_threshold = self.core.settings().disk_usage_threshold,
            storage_dir = self.core.settings().storage_dir,
            "recording cleanup worker started"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                if let Err(e) = self.run_cleanup(Utc::now(), None).await {
                    warn!("recording cleanup round failed: {e}");
                }
            }
        });
    }

    /// 一轮清理。usage_override 供测试注入磁盘水位
    pub async fn run_cleanup(
        &self,
        now: DateTime<Utc>,
        usage_override: Option<f64>,
    ) -> Result<()> {
        self.mark_expiring(now).await?;
        self.cleanup_expired(now).await?;
        self.cleanup_by_disk_usage(now, usage_override).await?;
        remove_empty_dirs(Path::new(&self.core.settings().storage_dir));
        Ok(())
    }

    /// 预标记：started_at < now + 1h − retainDays 的行将在一小时内过期，
    /// 打上 delete_flag 供界面提示
    async fn mark_expiring(&self, now: DateTime<Utc>) -> Result<()> {
        let retain_days = self.core.settings().retain_days;
        if retain_days <= 0 {
            return Ok(());
        }
        let cutoff = now + Duration::hours(1) - Duration::days(retain_days);
        Recordings::update_many()
            .col_expr(
                recordings::Column::DeleteFlag,
                sea_orm::sea_query::Expr::value(true),
            )
            .filter(recordings::Column::DeleteFlag.eq(false))
            .filter(recordings::Column::StartedAt.lt(cutoff))
            .exec(self.core.db())
            .await?;
        Ok(())
    }

    /// 按保留天数清理：文件与行一起删，批量 100
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<()> {
        let retain_days = self.core.settings().retain_days;
        if retain_days <= 0 {
            return Ok(());
        }
        let cutoff = now - Duration::days(retain_days);
        let mut total_deleted = 0usize;
        let mut freed: i64 = 0;

        loop {
            let batch = Recordings::find()
                .filter(recordings::Column::StartedAt.lt(cutoff))
                .order_by_asc(recordings::Column::StartedAt)
                .limit(BATCH_SIZE)
                .all(self.core.db())
                .await?;
            if batch.is_empty() {
                break;
            }
            freed += self.delete_batch(&batch).await?;
            total_deleted += batch.len();
        }

        if total_deleted > 0 {
            info!(
                retain_days,
                cutoff = %cutoff,
                recordings_deleted = total_deleted,
                freed_bytes = freed,
                "expired recording cleanup completed"
            );
        }
        Ok(())
    }

    /// 磁盘水位清理：超过阈值时删除最旧录像，
    /// 目标释放量 = max(最近一小时入库体积, 100 MiB)，
    /// 随后预标记下一轮 2 × freed 的最旧录像
    async fn cleanup_by_disk_usage(
        &self,
        now: DateTime<Utc>,
        usage_override: Option<f64>,
    ) -> Result<()> {
        let threshold = self.core.settings().disk_usage_threshold;
        if threshold <= 0.0 || threshold >= 100.0 {
            return Ok(());
        }
        let storage_dir = self.core.settings().storage_dir.clone();
        let usage = match usage_override.or_else(|| disk_usage_percent(&storage_dir)) {
            Some(u) => u,
            None => return Ok(()),
        };
        if usage < threshold {
            return Ok(());
        }

        // 最近一小时入库体积作为清理目标
        let one_hour_ago = now - Duration::hours(1);
        let recent = Recordings::find()
            .filter(recordings::Column::CreatedAt.gte(one_hour_ago))
            .all(self.core.db())
            .await?;
        let target: i64 = recent
            .iter()
            .map(|r| r.size)
            .sum::<i64>()
            .max(MIN_DISK_SWEEP_BYTES);

        let mut freed: i64 = 0;
        let mut deleted = 0usize;
        while freed < target {
            let batch = Recordings::find()
                .order_by_asc(recordings::Column::StartedAt)
                .limit(BATCH_SIZE)
                .all(self.core.db())
                .await?;
            if batch.is_empty() {
                break;
            }
            freed += self.delete_batch(&batch).await?;
            deleted += batch.len();

            if let Some(u) = usage_override.or_else(|| disk_usage_percent(&storage_dir)) {
                if u < threshold {
                    break;
                }
            }
        }

        self.mark_next_candidates(freed * 2).await?;

        if deleted > 0 {
            info!(
                usage,
                threshold,
                recordings_deleted = deleted,
                freed_bytes = freed,
                "disk usage cleanup completed"
            );
        }
        Ok(())
    }

    /// 预标记最旧的、总大小约等于 target 的录像
    async fn mark_next_candidates(&self, target_bytes: i64) -> Result<()> {
        if target_bytes <= 0 {
            return Ok(());
        }
        let candidates = Recordings::find()
            .filter(recordings::Column::DeleteFlag.eq(false))
            .order_by_asc(recordings::Column::StartedAt)
            .limit(200)
            .all(self.core.db())
            .await?;

        let mut marked: i64 = 0;
        let mut ids = Vec::new();
        for rec in candidates {
            if marked >= target_bytes {
                break;
            }
            marked += rec.size;
            ids.push(rec.id);
        }
        if ids.is_empty() {
            return Ok(());
        }
        Recordings::update_many()
            .col_expr(
                recordings::Column::DeleteFlag,
                sea_orm::sea_query::Expr::value(true),
            )
            .filter(recordings::Column::Id.is_in(ids))
            .exec(self.core.db())
            .await?;
        Ok(())
    }

    /// 删除一批：先删文件（不存在视为成功），再删行，返回释放字节数
    async fn delete_batch(&self, batch: &[recordings::Model]) -> Result<i64> {
        let mut freed: i64 = 0;
        let mut ids = Vec::with_capacity(batch.len());
        for rec in batch {
            let path = self.core.full_path(&rec.path);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => freed += rec.size,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => freed += rec.size,
                Err(e) => warn!(path, "remove recording file failed: {e}"),
            }
            ids.push(rec.id);
        }
        Recordings::delete_many()
            .filter(recordings::Column::Id.is_in(ids))
            .exec(self.core.db())
            .await?;
        Ok(freed)
    }
}

/// 存储目录所在文件系统的使用率（百分比）
pub fn disk_usage_percent(path: &str) -> Option<f64> {
    let target = std::fs::canonicalize(path).unwrap_or_else(|_| Path::new(path).to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    // 最长前缀匹配挂载点
    let disk = disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;
    let total = disk.total_space();
    if total == 0 {
        return None;
    }
    let used = total - disk.available_space();
    Some(used as f64 / total as f64 * 100.0)
}

/// 递归删除空子目录（不动根目录本身）
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
    use crate::config::RecordingSettings;
    use crate::recording::AddRecordingInput;
    use crate::store::tests::memory_db;
    use vigil_sms::NodeManager;

    async fn core_with_dir(dir: &Path, retain_days: i64, threshold: f64) -> RecordingCore {
        let db = memory_db().await;
        let nodes = NodeManager::new(db.clone());
        let conf = RecordingSettings {
            disabled: false,
            storage_dir: dir.to_string_lossy().to_string(),
            segment_seconds: 600,
            retain_days,
            disk_usage_threshold: threshold,
        };
        RecordingCore::new(db, conf, nodes)
    }

    async fn seed(core: &RecordingCore, dir: &Path, name: &str, start: &str, size: i64) -> i64 {
        let file = dir.join(name);
        std::fs::write(&file, vec![0u8; size as usize]).unwrap();
        let started_at: DateTime<Utc> = start.parse().unwrap();
        core.add_recording(AddRecordingInput {
            cid: "gbc_1".into(),
            app: "rtp".into(),
            stream: "gbc_1".into(),
            started_at,
            ended_at: started_at + Duration::seconds(600),
            duration: 600.0,
            path: name.to_string(),
            size,
        })
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_time_sweep_and_predictive_mark() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with_dir(dir.path(), 7, 0.0).await;
        let now: DateTime<Utc> = "2025-01-15T00:00:00Z".parse().unwrap();

        // 过期（1 月 7 日）、一小时内将过期（1 月 7 日 23:30 + 7 天窗口）、保留（1 月 14 日）
        let expired = seed(&core, dir.path(), "expired.mp4", "2025-01-07T00:00:00Z", 100).await;
        let expiring = seed(&core, dir.path(), "expiring.mp4", "2025-01-07T23:30:00Z", 100).await;
        let kept = seed(&core, dir.path(), "kept.mp4", "2025-01-14T00:00:00Z", 100).await;

        let worker = RetentionWorker::new(core.clone());
        worker.run_cleanup(now, None).await.unwrap();

        // 过期行连同文件一起删除
        assert!(core.get_recording(expired).await.is_err());
        assert!(!dir.path().join("expired.mp4").exists());

        // 将过期行保留但带预删除标记
        let rec = core.get_recording(expiring).await.unwrap();
        assert!(rec.delete_flag);
        assert!(dir.path().join("expiring.mp4").exists());

        // 保留期内的行不动（保留性约束）
        let rec = core.get_recording(kept).await.unwrap();
        assert!(!rec.delete_flag);
    }

    #[tokio::test]
    async fn test_disk_sweep_deletes_oldest_until_target() {
        let dir = tempfile::tempdir().unwrap();
        // retain_days=0 关闭时间清理，只验证磁盘清理路径
        let core = core_with_dir(dir.path(), 0, 90.0).await;
        let now: DateTime<Utc> = "2025-01-15T12:00:00Z".parse().unwrap();

        // 四条录像，行的 created_at 是入库时刻，全部落在「最近一小时」，
        // 因此目标释放量为四条体积之和
        let oldest = seed(&core, dir.path(), "a.mp4", "2025-01-10T00:00:00Z", 80 * 1024 * 1024).await;
        let middle = seed(&core, dir.path(), "b.mp4", "2025-01-11T00:00:00Z", 80 * 1024 * 1024).await;
        let newest = seed(&core, dir.path(), "c.mp4", "2025-01-12T00:00:00Z", 80 * 1024 * 1024).await;
        let recent = seed(&core, dir.path(), "d.mp4", "2025-01-15T11:30:00Z", 150 * 1024 * 1024).await;

        let worker = RetentionWorker::new(core.clone());
        // 磁盘水位注入 92%，始终高于阈值：清理持续到达到目标释放量
        worker.run_cleanup(now, Some(92.0)).await.unwrap();

        // 按 started_at 升序整批删除，四条都被清掉且文件一并移除
        assert!(core.get_recording(oldest).await.is_err());
        assert!(core.get_recording(middle).await.is_err());
        assert!(core.get_recording(newest).await.is_err());
        assert!(core.get_recording(recent).await.is_err());
        assert!(!dir.path().join("a.mp4").exists());
    }

    #[tokio::test]
    async fn test_disk_sweep_skipped_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with_dir(dir.path(), 0, 90.0).await;
        let now: DateTime<Utc> = "2025-01-15T12:00:00Z".parse().unwrap();
        let id = seed(&core, dir.path(), "a.mp4", "2025-01-10T00:00:00Z", 1024).await;

        let worker = RetentionWorker::new(core.clone());
        worker.run_cleanup(now, Some(50.0)).await.unwrap();
        assert!(core.get_recording(id).await.is_ok());
    }

    #[test]
    fn test_remove_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("rtp/gbc_1/2025-01-01");
        std::fs::create_dir_all(&nested).unwrap();
        let keep = dir.path().join("rtp/gbc_2");
        std::fs::create_dir_all(&keep).unwrap();
        std::fs::write(keep.join("seg.mp4"), b"x").unwrap();

        remove_empty_dirs(dir.path());
        assert!(!nested.exists());
        assert!(!dir.path().join("rtp/gbc_1").exists());
        assert!(keep.join("seg.mp4").exists());
    }
}
