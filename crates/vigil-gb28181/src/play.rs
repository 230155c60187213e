// 实时点播会话与 SSRC 分配

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// SSRC 分配器
/// 规则：10 位十进制，"0" + 域编号末 5 位 + 4 位序号
pub struct SsrcAllocator {
    prefix: String,
    seq: AtomicU32,
}

impl SsrcAllocator {
    pub fn new(realm: &str) -> Self {
        let digits: String = realm.chars().filter(|c| c.is_ascii_digit()).collect();
        let prefix = if digits.len() >= 5 {
            digits[digits.len() - 5..].to_string()
        } else {
            format!("{digits:0>5}")
        };
        Self {
            prefix,
            seq: AtomicU32::new(1),
        }
    }

    pub fn next(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 10000;
        format!("0{}{:04}", self.prefix, seq)
    }
}

/// 一次点播的对话状态，BYE 时需要
#[derive(Debug, Clone)]
pub struct PlaySession {
    pub call_id: String,
    pub device_id: String,
    pub channel_id: String,
    /// 流媒体侧流 ID（通道内部 ID）
    pub stream: String,
    pub ssrc: String,
    pub cseq: u32,
    /// 200 OK 携带 tag 的 To 头
    pub to: Option<String>,
    /// 流媒体收流端口（关闭 RTP server 时使用）
    pub rtp_port: u16,
}

/// 以流 ID 为键的点播会话表
#[derive(Default)]
pub struct PlaySessions {
    by_stream: DashMap<String, PlaySession>,
}

impl PlaySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: PlaySession) {
        self.by_stream.insert(session.stream.clone(), session);
    }

    pub fn get(&self, stream: &str) -> Option<PlaySession> {
        self.by_stream.get(stream).map(|e| e.value().clone())
    }

    pub fn remove(&self, stream: &str) -> Option<PlaySession> {
        self.by_stream.remove(stream).map(|(_, s)| s)
    }

    /// 设备主动 BYE 时按 Call-ID 回收
    pub fn remove_by_call_id(&self, call_id: &str) -> Option<PlaySession> {
        let stream = self
            .by_stream
            .iter()
            .find(|e| e.value().call_id == call_id)
            .map(|e| e.key().clone())?;
        self.remove(&stream)
    }

    /// 记录 200 OK 里的 To 头（带 tag），后续 ACK/BYE 复用
    pub fn set_dialog_to(&self, stream: &str, to: String) {
        if let Some(mut e) = self.by_stream.get_mut(stream) {
            e.to = Some(to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ssrc_shape() {
        let alloc = SsrcAllocator::new("3402000000");
        let ssrc = alloc.next();
        assert_eq!(ssrc.len(), 10);
        assert!(ssrc.starts_with('0'));
        assert!(ssrc.chars().all(|c| c.is_ascii_digit()));
        // 末 5 位域编号
        assert_eq!(&ssrc[1..6], "00000");
    }

    #[test]
    fn test_ssrc_short_realm_padded() {
        let alloc = SsrcAllocator::new("3402");
        assert_eq!(&alloc.next()[1..6], "03402");
    }

    #[test]
    fn test_ssrc_first_10k_distinct() {
        let alloc = SsrcAllocator::new("3402000000");
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(alloc.next()));
        }
    }

    #[test]
    fn test_session_call_id_lookup() {
        let sessions = PlaySessions::new();
        sessions.insert(PlaySession {
            call_id: "abc".into(),
            device_id: "34020000001320000001".into(),
            channel_id: "34020000001310000001".into(),
            stream: "gbc_1".into(),
            ssrc: "0000000001".into(),
            cseq: 1,
            to: None,
            rtp_port: 30000,
        });
        assert!(sessions.get("gbc_1").is_some());
        let removed = sessions.remove_by_call_id("abc").unwrap();
        assert_eq!(removed.stream, "gbc_1");
        assert!(sessions.get("gbc_1").is_none());
    }
}
