// SIP 摘要认证
// 响应计算: MD5(MD5(user:realm:pass) : nonce : MD5(method:uri))

use dashmap::DashMap;
use md5::{Digest, Md5};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 挑战有效期，超时后复用 nonce 必须重新挑战
const CHALLENGE_TTL: Duration = Duration::from_secs(30);

/// 生成 32 位十六进制随机 nonce
pub fn random_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// 计算摘要响应
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

/// 已解析的 Authorization 头
#[derive(Debug, Clone, Default)]
pub struct DigestAuthorization {
    params: HashMap<String, String>,
}

impl DigestAuthorization {
    /// 解析 `Digest username="...", realm="...", nonce="...", ...`
    pub fn parse(value: &str) -> Self {
        let rest = value.strip_prefix("Digest").unwrap_or(value).trim();
        let mut params = HashMap::new();
        for part in rest.split(',') {
            if let Some((k, v)) = part.trim().split_once('=') {
                params.insert(
                    k.trim().to_ascii_lowercase(),
                    v.trim().trim_matches('"').to_string(),
                );
            }
        }
        Self { params }
    }

    pub fn get(&self, key: &str) -> &str {
        self.params.get(key).map(String::as_str).unwrap_or("")
    }

    /// 用给定口令校验响应；username 以服务端视角传入（设备国标编号）
    pub fn verify(&self, username: &str, password: &str, method: &str) -> bool {
        let expected = digest_response(
            username,
            self.get("realm"),
            password,
            method,
            self.get("uri"),
            self.get("nonce"),
        );
        expected == self.get("response")
    }
}

struct Challenge {
    nonce: String,
    issued_at: Instant,
}

/// 未持久化的挑战记录，按 Call-ID 键控、单次使用
#[derive(Default)]
pub struct ChallengeStore {
    inner: DashMap<String, Challenge>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为一次注册签发挑战，返回 nonce
    pub fn issue(&self, call_id: &str) -> String {
        let nonce = random_nonce();
        self.inner.insert(
            call_id.to_string(),
            Challenge {
                nonce: nonce.clone(),
                issued_at: Instant::now(),
            },
        );
        nonce
    }

    /// 取走挑战（单次使用）。过期或不存在返回 None
    pub fn take(&self, call_id: &str) -> Option<String> {
        let (_, ch) = self.inner.remove(call_id)?;
        if ch.issued_at.elapsed() > CHALLENGE_TTL {
            return None;
        }
        Some(ch.nonce)
    }

    /// 清理过期挑战
    pub fn sweep(&self) {
        self.inner
            .retain(|_, ch| ch.issued_at.elapsed() <= CHALLENGE_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_shape() {
        let n = random_nonce();
        assert_eq!(n.len(), 32);
        assert!(n.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(n, random_nonce());
    }

    #[test]
    fn test_digest_deterministic_and_sensitive() {
        let base = digest_response(
            "34020000001320000001",
            "3402000000",
            "12345678",
            "REGISTER",
            "sip:34020000002000000001@3402000000",
            "9bd055",
        );
        let again = digest_response(
            "34020000001320000001",
            "3402000000",
            "12345678",
            "REGISTER",
            "sip:34020000002000000001@3402000000",
            "9bd055",
        );
        assert_eq!(base, again);

        // 任一输入变化都改变响应
        for changed in [
            digest_response("x", "3402000000", "12345678", "REGISTER", "sip:a", "9bd055"),
            digest_response(
                "34020000001320000001",
                "3402000001",
                "12345678",
                "REGISTER",
                "sip:34020000002000000001@3402000000",
                "9bd055",
            ),
            digest_response(
                "34020000001320000001",
                "3402000000",
                "wrong",
                "REGISTER",
                "sip:34020000002000000001@3402000000",
                "9bd055",
            ),
            digest_response(
                "34020000001320000001",
                "3402000000",
                "12345678",
                "REGISTER",
                "sip:34020000002000000001@3402000000",
                "other",
            ),
        ] {
            assert_ne!(base, changed);
        }
    }

    #[test]
    fn test_authorization_verify() {
        let nonce = "44010000001110000001abcdefabcdef";
        let response = digest_response(
            "34020000001320000001",
            "3402000000",
            "12345678",
            "REGISTER",
            "sip:34020000002000000001@3402000000",
            nonce,
        );
        let header = format!(
            "Digest username=\"34020000001320000001\", realm=\"3402000000\", \
             nonce=\"{nonce}\", uri=\"sip:34020000002000000001@3402000000\", \
             response=\"{response}\", algorithm=MD5"
        );
        let auth = DigestAuthorization::parse(&header);
        assert!(auth.verify("34020000001320000001", "12345678", "REGISTER"));
        assert!(!auth.verify("34020000001320000001", "wrong", "REGISTER"));
    }

    #[test]
    fn test_challenge_single_use() {
        let store = ChallengeStore::new();
        let nonce = store.issue("call-1");
        assert_eq!(store.take("call-1"), Some(nonce));
        // 第二次取已不存在
        assert_eq!(store.take("call-1"), None);
    }
}
