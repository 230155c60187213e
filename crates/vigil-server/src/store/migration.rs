// 旧版本数据迁移
// 0.0.20 之前独立的 stream_pushs / stream_proxys 表折叠进 channels，
// 归到合成的 RTMP / RTSP 迁移设备之下。(app, stream) 冲突只上报不覆盖

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, FromQueryResult, JsonValue, QueryFilter, QueryOrder, Statement,
};
use tracing::{info, warn};
use vigil_core::entity::{channels, devices, prelude::*, schema_versions};
use vigil_core::{mint_id, ChannelType, DeviceExt, Result, StreamConfig};

/// 低于该版本的库需要执行一次性迁移
const MIGRATE_THRESHOLD: &str = "0.0.20";

/// 迁移结果，作为面向使用者的报告输出到日志
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub rtmp_migrated: usize,
    pub rtsp_migrated: usize,
    /// (app, stream) 已存在而被跳过的旧行
    pub skipped: Vec<(String, String)>,
}

/// 数字段逐段比较版本号
pub fn compare_version(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    };
    let (va, vb) = (parse(a), parse(b));
    for i in 0..va.len().max(vb.len()) {
        let (x, y) = (va.get(i).copied().unwrap_or(0), vb.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// 旧表是否存在：直接探测查询，失败视为无表
async fn has_table(db: &DatabaseConnection, table: &str) -> bool {
    let stmt = Statement::from_string(
        db.get_database_backend(),
        format!("SELECT 1 FROM {table} LIMIT 1"),
    );
    db.query_one(stmt).await.is_ok()
}

async fn recorded_version(db: &DatabaseConnection) -> Result<Option<String>> {
    Ok(SchemaVersions::find()
        .order_by_desc(schema_versions::Column::Id)
        .one(db)
        .await?
        .map(|v| v.version))
}

/// 是否需要迁移：存在旧表且库版本低于阈值（或没有版本记录）
pub async fn should_migrate(db: &DatabaseConnection) -> Result<bool> {
    if !has_table(db, "stream_pushs").await && !has_table(db, "stream_proxys").await {
        return Ok(false);
    }
    match recorded_version(db).await? {
        None => Ok(true),
        Some(v) => Ok(compare_version(&v, MIGRATE_THRESHOLD) == std::cmp::Ordering::Less),
    }
}

fn text(row: &JsonValue, key: &str) -> String {
    row.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn flag(row: &JsonValue, key: &str) -> bool {
    match row.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

async fn synthetic_device(
    db: &DatabaseConnection,
    kind: ChannelType,
    name: &str,
) -> Result<devices::Model> {
    if let Some(dev) = Devices::find()
        .filter(devices::Column::Name.eq(name))
        .filter(devices::Column::Type.eq(kind.as_str()))
        .one(db)
        .await?
    {
        return Ok(dev);
    }
    let now = Utc::now();
    let id = mint_id(kind.id_prefix());
    let model = devices::ActiveModel {
        id: Set(id.clone()),
        device_id: Set(id),
        name: Set(name.to_string()),
        r#type: Set(kind.as_str().to_string()),
        transport: Set("tcp".to_string()),
        stream_mode: Set("udp".to_string()),
        address: Set(String::new()),
        ip: Set(String::new()),
        port: Set(0),
        username: Set(String::new()),
        password: Set(String::new()),
        expires: Set(0),
        registered_at: Set(None),
        keepalive_at: Set(None),
        is_online: Set(true),
        channels: Set(0),
        ext: Set(serde_json::to_value(DeviceExt::default())?),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(model.insert(db).await?)
}

async fn channel_exists(db: &DatabaseConnection, app: &str, stream: &str) -> Result<bool> {
    Ok(Channels::find()
        .filter(channels::Column::App.eq(app))
        .filter(channels::Column::Stream.eq(stream))
        .one(db)
        .await?
        .is_some())
}

/// 执行迁移。旧表数据保留，由使用者确认后手工清理
pub async fn migrate_legacy_streams(db: &DatabaseConnection) -> Result<MigrationReport> {
    let backend = db.get_database_backend();
    let mut report = MigrationReport::default();
    let now = Utc::now();

    if has_table(db, "stream_pushs").await {
        let device = synthetic_device(db, ChannelType::Rtmp, "rtmp-migration").await?;
        let rows = JsonValue::find_by_statement(Statement::from_string(
            backend,
            "SELECT app, stream, name, is_auth_disabled, session, status, media_server_id FROM stream_pushs",
        ))
        .all(db)
        .await?;

        for row in rows {
            let (app, stream) = (text(&row, "app"), text(&row, "stream"));
            if channel_exists(db, &app, &stream).await? {
                report.skipped.push((app, stream));
                continue;
            }
            let id = mint_id(ChannelType::Rtmp.channel_id_prefix());
            let cfg = StreamConfig {
                is_auth_disabled: flag(&row, "is_auth_disabled"),
                session: text(&row, "session"),
                media_server_id: text(&row, "media_server_id"),
                ..Default::default()
            };
            channels::ActiveModel {
                id: Set(id.clone()),
                did: Set(device.id.clone()),
                device_id: Set(id.clone()),
                channel_id: Set(id),
                name: Set(text(&row, "name")),
                r#type: Set(ChannelType::Rtmp.as_str().to_string()),
                app: Set(app),
                stream: Set(stream),
                is_online: Set(text(&row, "status") == "PUSHING"),
                is_playing: Set(false),
                config: Set(serde_json::to_value(cfg)?),
                ext: Set(serde_json::json!({})),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(db)
            .await?;
            report.rtmp_migrated += 1;
        }
    }

    if has_table(db, "stream_proxys").await {
        let device = synthetic_device(db, ChannelType::Rtsp, "rtsp-migration").await?;
        let rows = JsonValue::find_by_statement(Statement::from_string(
            backend,
            "SELECT app, stream, name, source_url, transport, timeout_s, enabled_audio, stream_key, pulling, enabled FROM stream_proxys",
        ))
        .all(db)
        .await?;

        for row in rows {
            let (app, stream) = (text(&row, "app"), text(&row, "stream"));
            if channel_exists(db, &app, &stream).await? {
                report.skipped.push((app, stream));
                continue;
            }
            let id = mint_id(ChannelType::Rtsp.channel_id_prefix());
            let cfg = StreamConfig {
                source_url: text(&row, "source_url"),
                transport: row.get("transport").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
                timeout_s: row.get("timeout_s").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
                enabled_audio: flag(&row, "enabled_audio"),
                stream_key: text(&row, "stream_key"),
                enabled: flag(&row, "enabled"),
                ..Default::default()
            };
            channels::ActiveModel {
                id: Set(id.clone()),
                did: Set(device.id.clone()),
                device_id: Set(id.clone()),
                channel_id: Set(id),
                name: Set(text(&row, "name")),
                r#type: Set(ChannelType::Rtsp.as_str().to_string()),
                app: Set(app),
                stream: Set(stream),
                is_online: Set(flag(&row, "pulling")),
                is_playing: Set(false),
                config: Set(serde_json::to_value(cfg)?),
                ext: Set(serde_json::json!({})),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(db)
            .await?;
            report.rtsp_migrated += 1;
        }
    }

    // 面向使用者的迁移报告
    info!(
        rtmp = report.rtmp_migrated,
        rtsp = report.rtsp_migrated,
        skipped = report.skipped.len(),
        "legacy stream migration finished; old tables kept for manual review"
    );
    for (app, stream) in &report.skipped {
        warn!(app, stream, "legacy row skipped: (app, stream) already present in channels");
    }

    stamp_version(db, env!("CARGO_PKG_VERSION")).await?;
    Ok(report)
}

/// 记录当前库版本
pub async fn stamp_version(db: &DatabaseConnection, version: &str) -> Result<()> {
    schema_versions::ActiveModel {
        version: Set(version.to_string()),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::memory_db;

    #[test]
    fn test_compare_version() {
        use std::cmp::Ordering::*;
        assert_eq!(compare_version("0.0.19", "0.0.20"), Less);
        assert_eq!(compare_version("0.0.20", "0.0.20"), Equal);
        assert_eq!(compare_version("0.1.0", "0.0.20"), Greater);
        assert_eq!(compare_version("1.0", "0.9.9"), Greater);
    }

    async fn seed_legacy(db: &DatabaseConnection) {
        let backend = db.get_database_backend();
        for sql in [
            "CREATE TABLE stream_pushs (id TEXT, app TEXT, stream TEXT, name TEXT, is_auth_disabled INTEGER, session TEXT, status TEXT, media_server_id TEXT)",
            "INSERT INTO stream_pushs VALUES ('1','live','demo','front gate',0,'','PUSHING','local')",
            "INSERT INTO stream_pushs VALUES ('2','live','lobby','lobby cam',1,'','STOPPED','local')",
            "CREATE TABLE stream_proxys (id TEXT, app TEXT, stream TEXT, name TEXT, source_url TEXT, transport INTEGER, timeout_s INTEGER, enabled_audio INTEGER, stream_key TEXT, pulling INTEGER, enabled INTEGER)",
            "INSERT INTO stream_proxys VALUES ('3','proxy','cam1','pull 1','rtsp://10.0.0.8/ch1',0,10,1,'',1,1)",
        ] {
            db.execute(Statement::from_string(backend, sql)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_should_migrate_only_with_legacy_tables() {
        let db = memory_db().await;
        assert!(!should_migrate(&db).await.unwrap());
        seed_legacy(&db).await;
        assert!(should_migrate(&db).await.unwrap());
        // 版本达到阈值后不再迁移
        stamp_version(&db, "0.0.20").await.unwrap();
        assert!(!should_migrate(&db).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_folds_rows_into_channels() {
        let db = memory_db().await;
        seed_legacy(&db).await;

        let report = migrate_legacy_streams(&db).await.unwrap();
        assert_eq!(report.rtmp_migrated, 2);
        assert_eq!(report.rtsp_migrated, 1);
        assert!(report.skipped.is_empty());

        let chs = Channels::find().all(&db).await.unwrap();
        assert_eq!(chs.len(), 3);
        let push = chs.iter().find(|c| c.stream == "demo").unwrap();
        assert_eq!(push.r#type, "rtmp");
        assert!(push.is_online); // 原状态 PUSHING
        let proxy = chs.iter().find(|c| c.stream == "cam1").unwrap();
        assert_eq!(proxy.r#type, "rtsp");
        assert_eq!(proxy.stream_config().source_url, "rtsp://10.0.0.8/ch1");

        // 合成设备存在
        let devs = Devices::find().all(&db).await.unwrap();
        assert!(devs.iter().any(|d| d.name == "rtmp-migration"));
        assert!(devs.iter().any(|d| d.name == "rtsp-migration"));
    }

    #[tokio::test]
    async fn test_migrate_reports_conflicts_without_overwrite() {
        let db = memory_db().await;
        seed_legacy(&db).await;

        // 先迁移一遍，再次迁移时所有行都成冲突
        migrate_legacy_streams(&db).await.unwrap();
        let report = migrate_legacy_streams(&db).await.unwrap();
        assert_eq!(report.rtmp_migrated, 0);
        assert_eq!(report.rtsp_migrated, 0);
        assert_eq!(report.skipped.len(), 3);
        assert_eq!(Channels::find().all(&db).await.unwrap().len(), 3);
    }
}
