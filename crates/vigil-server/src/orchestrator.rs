// 协议编排器
// 按通道类型把领域操作分发到对应适配器。
// 编排器与适配器互相依赖，采用两段式装配：
// 先建空注册表的编排器，适配器建好后再注入

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use vigil_core::{channel_type_of_stream, ChannelType, Protocol};

#[derive(Default)]
pub struct Orchestrator {
    protocols: OnceLock<HashMap<ChannelType, Arc<dyn Protocol>>>,
}

impl Orchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注入适配器注册表，仅生效一次
    pub fn install(&self, protocols: HashMap<ChannelType, Arc<dyn Protocol>>) {
        let _ = self.protocols.set(protocols);
    }

    pub fn protocol(&self, kind: ChannelType) -> Option<Arc<dyn Protocol>> {
        self.protocols.get()?.get(&kind).cloned()
    }

    /// 流名前缀反推类型后取适配器
    pub fn protocol_of_stream(&self, stream: &str) -> Option<(ChannelType, Arc<dyn Protocol>)> {
        let kind = channel_type_of_stream(stream)?;
        Some((kind, self.protocol(kind)?))
    }
}
