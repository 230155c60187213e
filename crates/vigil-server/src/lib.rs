// 平台装配库
// 二进制入口只做配置加载与装配，子系统全部在这里

pub mod adapters;
pub mod ai;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod playback;
pub mod recording;
pub mod retention;
pub mod state;
pub mod store;
pub mod webhook;

use adapters::{GbAdapter, GbBridge, OnvifAdapter, RtmpAdapter, RtspAdapter};
use ai::AiPipeline;
use config::Bootstrap;
use events::EventCore;
use orchestrator::Orchestrator;
use recording::RecordingCore;
use retention::RetentionWorker;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Schema};
use state::AppState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use store::IpcStore;
use tower_http::services::ServeDir;
use tracing::{error, info};
use vigil_core::entity::prelude::*;
use vigil_core::{ChannelType, Protocol};
use vigil_gb28181::server::GbConfig;
use vigil_gb28181::GbServer;
use vigil_sms::NodeManager;

/// 装配并启动全部子系统，随后在 HTTP 服务上阻塞
pub async fn run(conf: Bootstrap) -> anyhow::Result<()> {
    let conf = Arc::new(conf);

    // 持久层连接失败属于致命错误，直接退出
    let db = Database::connect(conf.database_url()).await?;
    create_schema(&db).await?;

    if store::migration::should_migrate(&db).await? {
        info!("legacy stream tables detected, running one-time migration");
        store::migration::migrate_legacy_streams(&db).await?;
    }

    let store = IpcStore::new(db.clone());
    let nodes = NodeManager::new(db.clone());

    // GB28181 注册服务器
    let gb = GbServer::new(GbConfig {
        listen_addr: conf.sip.listen_address.clone(),
        domain: conf.sip.domain.clone(),
        server_id: conf.sip.id.clone(),
        password: conf.sip.password.clone(),
        transaction_timeout: Duration::from_secs(30),
    });
    gb.set_handler(GbBridge::new(store.clone()));

    // 编排器与适配器互有依赖：先建空注册表，适配器建好后注入
    let orchestrator = Orchestrator::new();
    let gb_adapter = GbAdapter::new(gb.clone(), store.clone(), nodes.clone());
    let onvif_adapter = OnvifAdapter::new(store.clone(), nodes.clone());
    onvif_adapter.bootstrap().await?;
    let rtsp_adapter = RtspAdapter::new(store.clone(), nodes.clone());
    let rtmp_adapter = RtmpAdapter::new(store.clone(), conf.server.rtmp_secret.clone());

    let mut protocols: HashMap<ChannelType, Arc<dyn Protocol>> = HashMap::new();
    protocols.insert(ChannelType::Gb28181, gb_adapter);
    protocols.insert(ChannelType::Onvif, onvif_adapter);
    protocols.insert(ChannelType::Rtsp, rtsp_adapter);
    protocols.insert(ChannelType::Rtmp, rtmp_adapter);
    orchestrator.install(protocols);

    let recording = RecordingCore::new(db.clone(), conf.server.recording.clone(), nodes.clone());
    let events = EventCore::new(db.clone());
    let ai = AiPipeline::new(conf.clone(), store.clone(), events.clone(), nodes.clone());

    // 周期任务：录像保留、事件清理、AI 对账
    RetentionWorker::new(recording.clone()).spawn();
    events.clone().spawn_cleanup(conf.server.ai.event_retain_days);
    ai.spawn_sync_loop();

    // SIP 主循环
    {
        let gb = gb.clone();
        tokio::spawn(async move {
            if let Err(e) = gb.run().await {
                error!("gb28181 server exited: {e}");
            }
        });
    }

    // 流媒体节点：连接、配置下发、存活巡检
    nodes.run(&conf.media, conf.server.http.port).await?;

    let app_state = AppState {
        conf: conf.clone(),
        store,
        orchestrator,
        nodes,
        recording,
        events,
        ai,
    };

    let app = axum::Router::new()
        .nest("/webhook", webhook::router())
        .nest("/ai", ai::router())
        .nest("/recordings", playback::router())
        .nest_service(
            "/static/recordings",
            ServeDir::new(&conf.server.recording.storage_dir),
        )
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", conf.server.http.port)).await?;
    info!(port = conf.server.http.port, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// 从实体建表（不存在才建）
pub async fn create_schema(db: &DatabaseConnection) -> anyhow::Result<()> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    for stmt in [
        schema.create_table_from_entity(Devices).if_not_exists().to_owned(),
        schema.create_table_from_entity(Channels).if_not_exists().to_owned(),
        schema
            .create_table_from_entity(MediaServers)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(Recordings)
            .if_not_exists()
            .to_owned(),
        schema.create_table_from_entity(Events).if_not_exists().to_owned(),
        schema
            .create_table_from_entity(SchemaVersions)
            .if_not_exists()
            .to_owned(),
    ] {
        db.execute(backend.build(&stmt)).await?;
    }
    info!("database schema ready");
    Ok(())
}
