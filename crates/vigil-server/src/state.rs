// 共享应用状态：HTTP 处理器透过它触达各子系统

use crate::ai::AiPipeline;
use crate::config::Bootstrap;
use crate::events::EventCore;
use crate::orchestrator::Orchestrator;
use crate::recording::RecordingCore;
use crate::store::IpcStore;
use std::sync::Arc;
use vigil_sms::NodeManager;

#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Bootstrap>,
    pub store: IpcStore,
    pub orchestrator: Arc<Orchestrator>,
    pub nodes: Arc<NodeManager>,
    pub recording: RecordingCore,
    pub events: EventCore,
    pub ai: Arc<AiPipeline>,
}
