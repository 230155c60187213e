// 录像管理
// 流注册即开始 MP4 切片，切片完成由 webhook 入库；
// 查询侧提供分页列表、时间轴、月度位图与拼接 HLS 播放列表

use crate::config::RecordingSettings;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vigil_core::entity::{prelude::Recordings, recordings};
use vigil_core::Result;
use vigil_sms::NodeManager;

/// 切片时长钳制区间（秒）
pub fn clamp_segment_seconds(secs: u32) -> u32 {
    secs.clamp(60, 3600)
}

#[derive(Debug, Clone, Default)]
pub struct AddRecordingInput {
    pub cid: String,
    pub app: String,
    pub stream: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: f64,
    pub path: String,
    pub size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FindRecordingsQuery {
    pub cid: String,
    pub app: String,
    pub stream: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub page: u64,
    pub size: u64,
}

/// 时间轴数据项
#[derive(Debug, Clone, serde::Serialize)]
pub struct TimeRange {
    pub id: i64,
    pub start_ms: i64,
    pub end_ms: i64,
    pub duration: f64,
    pub object_count: i32,
    pub delete_flag: bool,
}

/// 月度录像统计：位图字符串，第 n 位为 '1' 表示第 n 天有录像
#[derive(Debug, Clone, serde::Serialize)]
pub struct MonthlyStats {
    pub year: i32,
    pub month: u32,
    pub days: u32,
    pub has_video: String,
}

#[derive(Clone)]
pub struct RecordingCore {
    db: DatabaseConnection,
    conf: RecordingSettings,
    nodes: Arc<NodeManager>,
}

impl RecordingCore {
    pub fn new(db: DatabaseConnection, conf: RecordingSettings, nodes: Arc<NodeManager>) -> Self {
        Self { db, conf, nodes }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn settings(&self) -> &RecordingSettings {
        &self.conf
    }

    pub fn is_enabled(&self) -> bool {
        !self.conf.disabled
    }

    /// 流注册时开始录制
    pub async fn start_recording(&self, app: &str, stream: &str) -> Result<()> {
        if !self.is_enabled() {
            debug!(app, stream, "recording disabled");
            return Ok(());
        }
        let ms = self.nodes.get_default_media_server().await?;
        let max_second = clamp_segment_seconds(self.conf.segment_seconds);
        self.nodes
            .start_record(&ms, app, stream, &self.conf.storage_dir, max_second)
            .await?;
        info!(app, stream, max_second, "recording started");
        Ok(())
    }

    /// 流注销时停止录制
    pub async fn stop_recording(&self, app: &str, stream: &str) -> Result<()> {
        let ms = self.nodes.get_default_media_server().await?;
        self.nodes.stop_record(&ms, app, stream).await?;
        info!(app, stream, "recording stopped");
        Ok(())
    }

    pub async fn add_recording(&self, input: AddRecordingInput) -> Result<recordings::Model> {
        let now = Utc::now();
        let model = recordings::ActiveModel {
            cid: Set(input.cid),
            app: Set(input.app),
            stream: Set(input.stream),
            started_at: Set(input.started_at),
            ended_at: Set(input.ended_at),
            duration: Set(input.duration),
            path: Set(input.path),
            size: Set(input.size),
            object_count: Set(0),
            delete_flag: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        Ok(model.insert(&self.db).await?)
    }

    /// 分页查询，按开始时间倒序
    pub async fn find_recordings(
        &self,
        query: &FindRecordingsQuery,
    ) -> Result<(Vec<recordings::Model>, u64)> {
        let mut select = Recordings::find().order_by_desc(recordings::Column::StartedAt);
        if !query.cid.is_empty() {
            select = select.filter(recordings::Column::Cid.eq(query.cid.clone()));
        }
        if !query.app.is_empty() {
            select = select.filter(recordings::Column::App.eq(query.app.clone()));
        }
        if !query.stream.is_empty() {
            select = select.filter(recordings::Column::Stream.eq(query.stream.clone()));
        }
        if query.start_ms > 0 && query.end_ms > 0 {
            let start = ms_to_utc(query.start_ms);
            let end = ms_to_utc(query.end_ms);
            select = select
                .filter(recordings::Column::StartedAt.gte(start))
                .filter(recordings::Column::EndedAt.lte(end));
        }

        let paginator = select.paginate(&self.db, query.size.max(1));
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(query.page.saturating_sub(1)).await?;
        Ok((items, total))
    }

    pub async fn get_recording(&self, id: i64) -> Result<recordings::Model> {
        Recordings::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| vigil_core::VigilError::NotFound(format!("recording {id}")))
    }

    pub async fn delete_recording(&self, id: i64) -> Result<()> {
        let rec = self.get_recording(id).await?;
        let path = self.full_path(&rec.path);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path, "remove recording file failed: {e}");
            }
        }
        Recordings::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    /// 时间轴：与 [start, end) 有交叠的片段，升序
    pub async fn timeline(&self, cid: &str, start_ms: i64, end_ms: i64) -> Result<Vec<TimeRange>> {
        let start = ms_to_utc(start_ms);
        let end = ms_to_utc(end_ms);
        let rows = Recordings::find()
            .filter(recordings::Column::Cid.eq(cid))
            .filter(recordings::Column::StartedAt.lt(end))
            .filter(recordings::Column::EndedAt.gt(start))
            .order_by_asc(recordings::Column::StartedAt)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| TimeRange {
                id: r.id,
                start_ms: r.started_at.timestamp_millis(),
                end_ms: r.ended_at.timestamp_millis(),
                duration: r.duration,
                object_count: r.object_count,
                delete_flag: r.delete_flag,
            })
            .collect())
    }

    /// 月度位图，长度等于该月天数
    pub async fn monthly_stats(&self, cid: &str, year: i32, month: u32) -> Result<MonthlyStats> {
        if !(1..=12).contains(&month) {
            return Err(vigil_core::VigilError::InvalidInput(format!(
                "invalid month {month}"
            )));
        }
        let days = days_in_month(year, month);
        let first = Utc
            .with_ymd_and_hms(year, month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| vigil_core::VigilError::InvalidInput("invalid year".into()))?;
        let next = if month == 12 {
            Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single()
        } else {
            Utc.with_ymd_and_hms(year, month + 1, 1, 0, 0, 0).single()
        }
        .unwrap_or(first);

        let mut select = Recordings::find()
            .filter(recordings::Column::StartedAt.gte(first))
            .filter(recordings::Column::StartedAt.lt(next));
        if !cid.is_empty() {
            select = select.filter(recordings::Column::Cid.eq(cid));
        }
        let rows = select.all(&self.db).await?;

        let mut bitmap = vec![b'0'; days as usize];
        for row in rows {
            let day = row.started_at.day();
            if (1..=days).contains(&day) {
                bitmap[(day - 1) as usize] = b'1';
            }
        }
        Ok(MonthlyStats {
            year,
            month,
            days,
            has_video: String::from_utf8(bitmap).unwrap_or_default(),
        })
    }

    pub fn full_path(&self, relative: &str) -> String {
        if relative.starts_with('/') || relative.starts_with(&self.conf.storage_dir) {
            relative.to_string()
        } else {
            format!("{}/{}", self.conf.storage_dir, relative)
        }
    }
}

/// 拼接 HLS 播放列表
/// 流媒体产出的每个 MP4 片段 DTS 都从零开始，片段之间必须插入
/// DISCONTINUITY 让播放器重置解码时间轴
pub fn build_playlist(recordings: &[recordings::Model], token: &str) -> String {
    let mut sorted: Vec<&recordings::Model> = recordings.iter().collect();
    sorted.sort_by_key(|r| r.started_at);

    let target = sorted
        .iter()
        .map(|r| r.duration.ceil() as u64)
        .max()
        .unwrap_or(1);

    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:7\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target}\n"));
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");

    for (i, rec) in sorted.iter().enumerate() {
        if i > 0 {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        out.push_str(&format!("#EXTINF:{:.3},\n", rec.duration));
        let rel = rec.path.trim_start_matches('/');
        if token.is_empty() {
            out.push_str(&format!("/static/recordings/{rel}\n"));
        } else {
            out.push_str(&format!("/static/recordings/{rel}?token={token}\n"));
        }
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

pub fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default();
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .unwrap_or_default();
    (next - first).num_days() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::memory_db;

    fn rec(id: i64, start: &str, dur: f64, path: &str) -> recordings::Model {
        let started_at: DateTime<Utc> = start.parse().unwrap();
        recordings::Model {
            id,
            cid: "gbc_1".into(),
            app: "rtp".into(),
            stream: "gbc_1".into(),
            started_at,
            ended_at: started_at + chrono::Duration::milliseconds((dur * 1000.0) as i64),
            duration: dur,
            path: path.into(),
            size: 1024,
            object_count: 0,
            delete_flag: false,
            created_at: started_at,
            updated_at: started_at,
        }
    }

    #[test]
    fn test_clamp_segment_seconds() {
        assert_eq!(clamp_segment_seconds(0), 60);
        assert_eq!(clamp_segment_seconds(59), 60);
        assert_eq!(clamp_segment_seconds(600), 600);
        assert_eq!(clamp_segment_seconds(7200), 3600);
    }

    #[test]
    fn test_playlist_invariants() {
        // 乱序输入，播放列表按开始时间升序
        let recs = vec![
            rec(2, "2025-01-15T00:10:00Z", 600.0, "rtp/gbc_1/2025-01-15/1.mp4"),
            rec(1, "2025-01-15T00:00:00Z", 600.0, "rtp/gbc_1/2025-01-15/0.mp4"),
            rec(3, "2025-01-15T00:20:00Z", 30.5, "rtp/gbc_1/2025-01-15/2.mp4"),
        ];
        let playlist = build_playlist(&recs, "tok");

        assert_eq!(playlist.matches("#EXTINF:").count(), 3);
        assert_eq!(playlist.matches("#EXT-X-DISCONTINUITY").count(), 2);
        assert!(playlist.trim_end().ends_with("#EXT-X-ENDLIST"));
        // 升序
        let p0 = playlist.find("0.mp4").unwrap();
        let p1 = playlist.find("1.mp4").unwrap();
        let p2 = playlist.find("2.mp4").unwrap();
        assert!(p0 < p1 && p1 < p2);
        assert!(playlist.contains("?token=tok"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:600"));
    }

    #[test]
    fn test_playlist_single_segment_has_no_discontinuity() {
        let recs = vec![rec(1, "2025-01-15T00:00:00Z", 12.0, "a.mp4")];
        let playlist = build_playlist(&recs, "");
        assert_eq!(playlist.matches("#EXTINF:").count(), 1);
        assert_eq!(playlist.matches("#EXT-X-DISCONTINUITY").count(), 0);
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2025, 1), 31);
        assert_eq!(days_in_month(2025, 2), 28);
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2025, 12), 31);
    }

    #[tokio::test]
    async fn test_add_find_timeline_monthly() {
        let db = memory_db().await;
        let nodes = NodeManager::new(db.clone());
        let core = RecordingCore::new(db, RecordingSettings::default(), nodes);

        for (start, dur) in [
            ("2025-01-14T23:50:00Z", 600.0),
            ("2025-01-15T00:00:00Z", 600.0),
            ("2025-01-15T00:10:00Z", 600.0),
        ] {
            let started_at: DateTime<Utc> = start.parse().unwrap();
            core.add_recording(AddRecordingInput {
                cid: "gbc_1".into(),
                app: "rtp".into(),
                stream: "gbc_1".into(),
                started_at,
                ended_at: started_at + chrono::Duration::seconds(dur as i64),
                duration: dur,
                path: format!("rtp/gbc_1/{start}.mp4"),
                size: 2048,
            })
            .await
            .unwrap();
        }

        let (items, total) = core
            .find_recordings(&FindRecordingsQuery {
                cid: "gbc_1".into(),
                page: 1,
                size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(items.len(), 3);

        // 时间轴只含交叠片段，升序
        let from: DateTime<Utc> = "2025-01-15T00:00:00Z".parse().unwrap();
        let to: DateTime<Utc> = "2025-01-15T01:00:00Z".parse().unwrap();
        let ranges = core
            .timeline("gbc_1", from.timestamp_millis(), to.timestamp_millis())
            .await
            .unwrap();
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].start_ms < ranges[1].start_ms);

        let stats = core.monthly_stats("gbc_1", 2025, 1).await.unwrap();
        assert_eq!(stats.days, 31);
        assert_eq!(stats.has_video.len(), 31);
        // 1 月 14、15 日有录像
        assert_eq!(&stats.has_video[13..15], "11");
        assert_eq!(&stats.has_video[15..16], "0");
    }
}
