// 设备会话内存态
// 持久化存储拥有权威的设备行，这里只保管活跃连接与构造出站请求所需的 SIP 上下文

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use vigil_sip::SipConnection;

/// 单个设备的 SIP 会话状态
pub struct DeviceSession {
    pub device_id: String,
    conn: RwLock<Option<SipConnection>>,
    source: RwLock<Option<SocketAddr>>,
    /// 最近一次请求的 To 头（带 tag），构造出站请求时使用
    to: RwLock<Option<String>>,
    cseq: AtomicU32,
    expires: AtomicI64,
    keepalive_at: AtomicI64,
    online: AtomicBool,
}

impl DeviceSession {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            conn: RwLock::new(None),
            source: RwLock::new(None),
            to: RwLock::new(None),
            cseq: AtomicU32::new(1),
            expires: AtomicI64::new(0),
            keepalive_at: AtomicI64::new(Utc::now().timestamp()),
            online: AtomicBool::new(false),
        }
    }

    /// 注册/心跳时更新连接上下文
    pub fn attach(&self, conn: SipConnection, source: SocketAddr, to: Option<String>) {
        *self.conn.write().unwrap() = Some(conn);
        *self.source.write().unwrap() = Some(source);
        if let Some(to) = to {
            *self.to.write().unwrap() = Some(to);
        }
    }

    pub fn connection(&self) -> Option<SipConnection> {
        self.conn.read().unwrap().clone()
    }

    pub fn source(&self) -> Option<SocketAddr> {
        *self.source.read().unwrap()
    }

    pub fn to_header(&self) -> Option<String> {
        self.to.read().unwrap().clone()
    }

    pub fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_expires(&self, secs: i64) {
        self.expires.store(secs, Ordering::Relaxed);
    }

    pub fn expires(&self) -> i64 {
        self.expires.load(Ordering::Relaxed)
    }

    pub fn touch_keepalive(&self) {
        self.keepalive_at.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn keepalive_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.keepalive_at.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// 心跳是否已超时（有效期 + 宽限）
    pub fn keepalive_expired(&self, grace_secs: i64) -> bool {
        let deadline = self.expires() + grace_secs;
        if deadline <= 0 {
            return false;
        }
        (Utc::now() - self.keepalive_at()).num_seconds() > deadline
    }
}

/// 设备会话表。注销不删除条目，保留套接字上下文以便重连
#[derive(Default)]
pub struct SessionStore {
    devices: DashMap<String, Arc<DeviceSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_or_create(&self, device_id: &str) -> Arc<DeviceSession> {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(DeviceSession::new(device_id)))
            .clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.devices.get(device_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, device_id: &str) {
        self.devices.remove(device_id);
    }

    pub fn iter_sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }
}
