// 设备/通道存储
// 持久层为权威数据；目录合并、状态翻转、级联删除都在这里收口

pub mod migration;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use tracing::info;
use vigil_core::entity::{channels, devices, prelude::*};
use vigil_core::{mint_id, ChannelExt, ChannelType, DeviceExt, Result, StreamConfig, VigilError};

/// 目录上报的一条通道
#[derive(Debug, Clone)]
pub struct ReportedChannel {
    pub channel_id: String,
    pub name: String,
    pub is_online: bool,
    pub ext: ChannelExt,
}

/// 存储门面：sea-orm 仓储之上提供领域操作
#[derive(Clone)]
pub struct IpcStore {
    db: DatabaseConnection,
    /// 目录缺失通道的处理策略：false 置离线（默认），true 硬删除
    hard_delete_missing: bool,
}

impl IpcStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            hard_delete_missing: false,
        }
    }

    pub fn with_hard_delete(mut self, enabled: bool) -> Self {
        self.hard_delete_missing = enabled;
        self
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    // ---------- 设备 ----------

    pub async fn get_device(&self, id: &str) -> Result<devices::Model> {
        Devices::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("device {id}")))
    }

    pub async fn get_device_by_device_id(&self, device_id: &str) -> Result<Option<devices::Model>> {
        Ok(Devices::find()
            .filter(devices::Column::DeviceId.eq(device_id))
            .one(&self.db)
            .await?)
    }

    /// 国标设备首次注册时落库
    pub async fn get_or_create_gb_device(&self, device_id: &str) -> Result<devices::Model> {
        if let Some(dev) = self.get_device_by_device_id(device_id).await? {
            return Ok(dev);
        }
        let now = Utc::now();
        let model = devices::ActiveModel {
            id: Set(mint_id(ChannelType::Gb28181.id_prefix())),
            device_id: Set(device_id.to_string()),
            name: Set(device_id.to_string()),
            r#type: Set(ChannelType::Gb28181.as_str().to_string()),
            transport: Set("udp".to_string()),
            stream_mode: Set("udp".to_string()),
            address: Set(String::new()),
            ip: Set(String::new()),
            port: Set(0),
            username: Set(String::new()),
            password: Set(String::new()),
            expires: Set(0),
            registered_at: Set(None),
            keepalive_at: Set(None),
            is_online: Set(false),
            channels: Set(0),
            ext: Set(serde_json::to_value(DeviceExt::default())?),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(&self.db).await?)
    }

    pub async fn mark_registered(
        &self,
        device_id: &str,
        address: &str,
        transport: &str,
        expires: i64,
        gb_version: &str,
    ) -> Result<()> {
        let dev = self.get_or_create_gb_device(device_id).await?;
        let mut ext = dev.device_ext();
        if !gb_version.is_empty() {
            ext.gb_version = gb_version.to_string();
        }
        let mut active = dev.into_active_model();
        active.is_online = Set(true);
        active.address = Set(address.to_string());
        active.transport = Set(transport.to_string());
        active.expires = Set(expires as i32);
        active.registered_at = Set(Some(Utc::now()));
        active.keepalive_at = Set(Some(Utc::now()));
        active.ext = Set(serde_json::to_value(ext)?);
        active.updated_at = Set(Utc::now());
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn mark_offline_by_device_id(&self, device_id: &str) -> Result<()> {
        if let Some(dev) = self.get_device_by_device_id(device_id).await? {
            let mut active = dev.into_active_model();
            active.is_online = Set(false);
            active.expires = Set(0);
            active.updated_at = Set(Utc::now());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    pub async fn touch_keepalive(&self, device_id: &str) -> Result<()> {
        if let Some(dev) = self.get_device_by_device_id(device_id).await? {
            let mut active = dev.into_active_model();
            active.keepalive_at = Set(Some(Utc::now()));
            active.is_online = Set(true);
            active.updated_at = Set(Utc::now());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    pub async fn update_device_info(
        &self,
        device_id: &str,
        name: &str,
        manufacturer: &str,
        model: &str,
        firmware: &str,
    ) -> Result<()> {
        if let Some(dev) = self.get_device_by_device_id(device_id).await? {
            let mut ext = dev.device_ext();
            ext.manufacturer = manufacturer.to_string();
            ext.model = model.to_string();
            ext.firmware = firmware.to_string();
            let mut active = dev.into_active_model();
            if !name.is_empty() {
                active.name = Set(name.to_string());
            }
            active.ext = Set(serde_json::to_value(ext)?);
            active.updated_at = Set(Utc::now());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    /// 按内部 ID 翻转设备在线状态（ONVIF 状态机仅在边沿调用）
    pub async fn set_device_online(&self, id: &str, online: bool) -> Result<()> {
        let dev = self.get_device(id).await?;
        let mut active = dev.into_active_model();
        active.is_online = Set(online);
        if online {
            active.keepalive_at = Set(Some(Utc::now()));
        }
        active.updated_at = Set(Utc::now());
        active.update(&self.db).await?;
        Ok(())
    }

    /// 修改口令；国标设备改口令后置离线，迫使设备重新鉴权
    pub async fn update_device_password(&self, id: &str, password: &str) -> Result<bool> {
        let dev = self.get_device(id).await?;
        if dev.password == password {
            return Ok(false);
        }
        let is_gb = dev.channel_type() == Some(ChannelType::Gb28181);
        let mut active = dev.into_active_model();
        active.password = Set(password.to_string());
        if is_gb {
            info!(id, "password changed, forcing re-registration");
            active.is_online = Set(false);
        }
        active.updated_at = Set(Utc::now());
        active.update(&self.db).await?;
        Ok(true)
    }

    pub async fn find_devices(&self, kind: Option<ChannelType>) -> Result<Vec<devices::Model>> {
        let mut query = Devices::find();
        if let Some(kind) = kind {
            query = query.filter(devices::Column::Type.eq(kind.as_str()));
        }
        Ok(query.all(&self.db).await?)
    }

    /// 删除设备并级联删除其通道（单事务）
    pub async fn delete_device(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .transaction::<_, (), DbErr>(|txn| {
                Box::pin(async move {
                    Channels::delete_many()
                        .filter(channels::Column::Did.eq(id.clone()))
                        .exec(txn)
                        .await?;
                    Devices::delete_by_id(id).exec(txn).await?;
                    Ok(())
                })
            })
            .await
            .map_err(|e| VigilError::Internal(e.to_string()))?;
        Ok(())
    }

    // ---------- 通道 ----------

    pub async fn get_channel(&self, id: &str) -> Result<channels::Model> {
        Channels::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("channel {id}")))
    }

    /// 按流名查通道；流名也可能直接是通道内部 ID
    pub async fn get_channel_by_stream(&self, stream: &str) -> Result<channels::Model> {
        if let Some(ch) = Channels::find()
            .filter(channels::Column::Stream.eq(stream))
            .one(&self.db)
            .await?
        {
            return Ok(ch);
        }
        self.get_channel(stream).await
    }

    /// 自定义 app/stream 的 RTMP/RTSP 通道按 (app, stream) 查，回落到内部 ID
    pub async fn get_channel_by_app_stream(&self, app: &str, stream: &str) -> Result<channels::Model> {
        if let Some(ch) = Channels::find()
            .filter(channels::Column::App.eq(app))
            .filter(channels::Column::Stream.eq(stream))
            .one(&self.db)
            .await?
        {
            return Ok(ch);
        }
        self.get_channel(stream).await
    }

    pub async fn edit_channel_playing(&self, stream: &str, playing: bool) -> Result<()> {
        let ch = self.get_channel_by_stream(stream).await?;
        let mut active = ch.into_active_model();
        active.is_playing = Set(playing);
        active.updated_at = Set(Utc::now());
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn edit_channel_online_playing(
        &self,
        stream: &str,
        online: bool,
        playing: bool,
    ) -> Result<()> {
        let ch = self.get_channel_by_stream(stream).await?;
        let mut active = ch.into_active_model();
        active.is_online = Set(online);
        active.is_playing = Set(playing);
        active.updated_at = Set(Utc::now());
        active.update(&self.db).await?;
        Ok(())
    }

    /// 更新通道流配置与在线状态（推/拉流会话信息）
    pub async fn edit_channel_config_online<F>(
        &self,
        id: &str,
        online: bool,
        mutate: F,
    ) -> Result<channels::Model>
    where
        F: FnOnce(&mut StreamConfig),
    {
        let ch = self.get_channel(id).await?;
        let mut cfg = ch.stream_config();
        mutate(&mut cfg);
        let mut active = ch.into_active_model();
        active.config = Set(serde_json::to_value(cfg)?);
        active.is_online = Set(online);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&self.db).await?)
    }

    /// 流媒体重启后所有 RTMP 通道置离线（推流方必须重推）
    pub async fn batch_offline_rtmp(&self) -> Result<u64> {
        let result = Channels::update_many()
            .col_expr(channels::Column::IsOnline, sea_orm::sea_query::Expr::value(false))
            .col_expr(channels::Column::IsPlaying, sea_orm::sea_query::Expr::value(false))
            .filter(channels::Column::Type.eq(ChannelType::Rtmp.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn find_channels(&self, page: u64, size: u64) -> Result<(Vec<channels::Model>, u64)> {
        let paginator = Channels::find()
            .order_by_asc(channels::Column::CreatedAt)
            .paginate(&self.db, size.max(1));
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((items, total))
    }

    pub async fn find_channels_of_device(&self, did: &str) -> Result<Vec<channels::Model>> {
        Ok(Channels::find()
            .filter(channels::Column::Did.eq(did))
            .all(&self.db)
            .await?)
    }

    /// 目录合并：新增铸 ID、存量更新、缺失置离线（或硬删除）、
    /// 最后回写设备通道数。五步同一事务
    pub async fn save_channels(
        &self,
        device: &devices::Model,
        kind: ChannelType,
        reported: Vec<ReportedChannel>,
    ) -> Result<()> {
        if reported.is_empty() {
            return Ok(());
        }
        let did = device.id.clone();
        let device_id = device.device_id.clone();
        let hard_delete = self.hard_delete_missing;
        let count = reported.len() as i32;

        self.db
            .transaction::<_, (), DbErr>(move |txn| {
                Box::pin(async move {
                    let existing = Channels::find()
                        .filter(channels::Column::Did.eq(did.clone()))
                        .all(txn)
                        .await?;
                    let by_external: std::collections::HashMap<String, channels::Model> = existing
                        .into_iter()
                        .map(|c| (c.channel_id.clone(), c))
                        .collect();

                    let now = Utc::now();
                    let mut reported_ids: Vec<String> = Vec::with_capacity(reported.len());

                    for ch in &reported {
                        reported_ids.push(ch.channel_id.clone());
                        match by_external.get(&ch.channel_id) {
                            Some(existing) => {
                                let mut active = existing.clone().into_active_model();
                                active.name = Set(ch.name.clone());
                                active.is_online = Set(ch.is_online);
                                active.ext = Set(serde_json::to_value(&ch.ext)
                                    .map_err(|e| DbErr::Custom(e.to_string()))?);
                                active.updated_at = Set(now);
                                active.update(txn).await?;
                            }
                            None => {
                                let id = mint_id(kind.channel_id_prefix());
                                let active = channels::ActiveModel {
                                    id: Set(id.clone()),
                                    did: Set(did.clone()),
                                    device_id: Set(device_id.clone()),
                                    channel_id: Set(ch.channel_id.clone()),
                                    name: Set(ch.name.clone()),
                                    r#type: Set(kind.as_str().to_string()),
                                    app: Set("rtp".to_string()),
                                    stream: Set(id),
                                    is_online: Set(ch.is_online),
                                    is_playing: Set(false),
                                    config: Set(serde_json::to_value(StreamConfig::default())
                                        .map_err(|e| DbErr::Custom(e.to_string()))?),
                                    ext: Set(serde_json::to_value(&ch.ext)
                                        .map_err(|e| DbErr::Custom(e.to_string()))?),
                                    created_at: Set(now),
                                    updated_at: Set(now),
                                };
                                active.insert(txn).await?;
                            }
                        }
                    }

                    // 本次未上报的通道：默认置离线，保留历史；可配置为硬删除
                    if hard_delete {
                        Channels::delete_many()
                            .filter(channels::Column::Did.eq(did.clone()))
                            .filter(channels::Column::ChannelId.is_not_in(reported_ids))
                            .exec(txn)
                            .await?;
                    } else {
                        Channels::update_many()
                            .col_expr(
                                channels::Column::IsOnline,
                                sea_orm::sea_query::Expr::value(false),
                            )
                            .filter(channels::Column::Did.eq(did.clone()))
                            .filter(channels::Column::ChannelId.is_not_in(reported_ids))
                            .exec(txn)
                            .await?;
                    }

                    if let Some(dev) = Devices::find_by_id(did).one(txn).await? {
                        let mut active = dev.into_active_model();
                        active.channels = Set(count);
                        active.updated_at = Set(now);
                        active.update(txn).await?;
                    }
                    Ok(())
                })
            })
            .await
            .map_err(|e| VigilError::Internal(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sea_orm::{ConnectionTrait, Database, Schema};

    pub(crate) async fn memory_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        for stmt in [
            schema.create_table_from_entity(Devices).if_not_exists().to_owned(),
            schema.create_table_from_entity(Channels).if_not_exists().to_owned(),
            schema.create_table_from_entity(MediaServers).if_not_exists().to_owned(),
            schema.create_table_from_entity(Recordings).if_not_exists().to_owned(),
            schema.create_table_from_entity(Events).if_not_exists().to_owned(),
            schema
                .create_table_from_entity(SchemaVersions)
                .if_not_exists()
                .to_owned(),
        ] {
            db.execute(backend.build(&stmt)).await.unwrap();
        }
        db
    }

    fn reported(id: &str, online: bool) -> ReportedChannel {
        ReportedChannel {
            channel_id: id.to_string(),
            name: format!("ch {id}"),
            is_online: online,
            ext: ChannelExt::default(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_gb_device_idempotent() {
        let store = IpcStore::new(memory_db().await);
        let a = store.get_or_create_gb_device("34020000001320000001").await.unwrap();
        let b = store.get_or_create_gb_device("34020000001320000001").await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("gb_"));
        assert!(!a.is_online);
    }

    #[tokio::test]
    async fn test_save_channels_merge_monotonic() {
        let store = IpcStore::new(memory_db().await);
        let dev = store.get_or_create_gb_device("34020000001320000001").await.unwrap();

        // 首次上报三条
        store
            .save_channels(
                &dev,
                ChannelType::Gb28181,
                vec![reported("c1", true), reported("c2", true), reported("c3", false)],
            )
            .await
            .unwrap();
        let chs = store.find_channels_of_device(&dev.id).await.unwrap();
        assert_eq!(chs.len(), 3);

        // 第二次上报缺了 c3：c3 软下线而非删除，c1 改名生效
        store
            .save_channels(
                &dev,
                ChannelType::Gb28181,
                vec![
                    ReportedChannel {
                        name: "front door".to_string(),
                        ..reported("c1", true)
                    },
                    reported("c2", false),
                ],
            )
            .await
            .unwrap();

        let chs = store.find_channels_of_device(&dev.id).await.unwrap();
        assert_eq!(chs.len(), 3);
        let by_id: std::collections::HashMap<_, _> =
            chs.iter().map(|c| (c.channel_id.as_str(), c)).collect();
        assert_eq!(by_id["c1"].name, "front door");
        assert!(by_id["c1"].is_online);
        assert!(!by_id["c2"].is_online);
        assert!(!by_id["c3"].is_online);

        // 设备通道数为最近一次上报条数
        let dev = store.get_device(&dev.id).await.unwrap();
        assert_eq!(dev.channels, 2);
    }

    #[tokio::test]
    async fn test_save_channels_hard_delete_mode() {
        let store = IpcStore::new(memory_db().await).with_hard_delete(true);
        let dev = store.get_or_create_gb_device("34020000001320000001").await.unwrap();
        store
            .save_channels(
                &dev,
                ChannelType::Gb28181,
                vec![reported("c1", true), reported("c2", true)],
            )
            .await
            .unwrap();
        store
            .save_channels(&dev, ChannelType::Gb28181, vec![reported("c1", true)])
            .await
            .unwrap();
        let chs = store.find_channels_of_device(&dev.id).await.unwrap();
        assert_eq!(chs.len(), 1);
        assert_eq!(chs[0].channel_id, "c1");
    }

    #[tokio::test]
    async fn test_register_and_offline_flow() {
        let store = IpcStore::new(memory_db().await);
        store
            .mark_registered("34020000001320000001", "192.168.1.64:5060", "udp", 3600, "2022")
            .await
            .unwrap();
        let dev = store
            .get_device_by_device_id("34020000001320000001")
            .await
            .unwrap()
            .unwrap();
        assert!(dev.is_online);
        assert_eq!(dev.expires, 3600);
        assert_eq!(dev.device_ext().gb_version, "2022");

        store
            .mark_offline_by_device_id("34020000001320000001")
            .await
            .unwrap();
        let dev = store.get_device(&dev.id).await.unwrap();
        assert!(!dev.is_online);
        assert_eq!(dev.expires, 0);
    }

    #[tokio::test]
    async fn test_batch_offline_rtmp() {
        let store = IpcStore::new(memory_db().await);
        let dev = store.get_or_create_gb_device("34020000001320000001").await.unwrap();
        // 手工插入一条 rtmp 通道
        let now = Utc::now();
        channels::ActiveModel {
            id: Set("rtmpc_1".to_string()),
            did: Set(dev.id.clone()),
            device_id: Set("rtmpc_1".to_string()),
            channel_id: Set("rtmpc_1".to_string()),
            name: Set("push".to_string()),
            r#type: Set("rtmp".to_string()),
            app: Set("live".to_string()),
            stream: Set("demo".to_string()),
            is_online: Set(true),
            is_playing: Set(true),
            config: Set(serde_json::json!({})),
            ext: Set(serde_json::json!({})),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(store.db())
        .await
        .unwrap();

        let affected = store.batch_offline_rtmp().await.unwrap();
        assert_eq!(affected, 1);
        let ch = store.get_channel("rtmpc_1").await.unwrap();
        assert!(!ch.is_online);
        assert!(!ch.is_playing);
    }

    #[tokio::test]
    async fn test_password_change_marks_gb_offline() {
        let store = IpcStore::new(memory_db().await);
        store
            .mark_registered("34020000001320000001", "a:1", "udp", 3600, "")
            .await
            .unwrap();
        let dev = store
            .get_device_by_device_id("34020000001320000001")
            .await
            .unwrap()
            .unwrap();
        assert!(store.update_device_password(&dev.id, "newpass").await.unwrap());
        let dev = store.get_device(&dev.id).await.unwrap();
        assert!(!dev.is_online);
        // 同口令不翻转
        assert!(!store.update_device_password(&dev.id, "newpass").await.unwrap());
    }

    #[tokio::test]
    async fn test_channel_lookup_by_app_stream_falls_back_to_id() {
        let store = IpcStore::new(memory_db().await);
        let dev = store.get_or_create_gb_device("34020000001320000001").await.unwrap();
        store
            .save_channels(&dev, ChannelType::Gb28181, vec![reported("c1", true)])
            .await
            .unwrap();
        let ch = store.find_channels_of_device(&dev.id).await.unwrap().remove(0);
        // (app, stream) 命中
        let found = store.get_channel_by_app_stream("rtp", &ch.stream).await.unwrap();
        assert_eq!(found.id, ch.id);
        // 回落到内部 ID
        let found = store.get_channel_by_app_stream("other", &ch.id).await.unwrap();
        assert_eq!(found.id, ch.id);
    }
}
