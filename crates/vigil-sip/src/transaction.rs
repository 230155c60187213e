// 客户端事务层：以 Call-ID + CSeq + branch 为键挂起等待响应

use crate::message::SipResponse;
use crate::{Result, SipError};
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// 默认事务超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// 事务键
pub fn transaction_key(call_id: &str, cseq: u32, branch: &str) -> String {
    format!("{call_id}:{cseq}:{branch}")
}

/// 挂起事务池
pub struct TransactionPool {
    pending: DashMap<String, oneshot::Sender<SipResponse>>,
    timeout: Duration,
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TransactionPool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    /// 登记一个等待响应的事务，随后用返回的 receiver 调 `wait`
    pub fn register(&self, key: String) -> oneshot::Receiver<SipResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key, tx);
        rx
    }

    /// 入站响应路由到挂起事务；无人等待返回 false
    pub fn complete(&self, resp: SipResponse) -> bool {
        let Some(call_id) = resp.call_id().map(str::to_string) else {
            return false;
        };
        let Some((cseq, _)) = resp.cseq() else {
            return false;
        };
        let branch = resp.branch().unwrap_or("").to_string();
        let key = transaction_key(&call_id, cseq, &branch);
        match self.pending.remove(&key) {
            Some((_, tx)) => tx.send(resp).is_ok(),
            None => false,
        }
    }

    /// 等待响应直到超时；超时后事务被清除
    pub async fn wait(
        &self,
        key: &str,
        rx: oneshot::Receiver<SipResponse>,
    ) -> Result<SipResponse> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => {
                self.pending.remove(key);
                Err(SipError::ConnectionClosed(key.to_string()))
            }
            Err(_) => {
                self.pending.remove(key);
                Err(SipError::Timeout(key.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipResponse;

    fn response(call_id: &str, cseq: &str, branch: &str) -> SipResponse {
        let mut resp = SipResponse::new(200, "OK");
        resp.headers.push("Call-ID", call_id);
        resp.headers.push("CSeq", cseq);
        resp.headers
            .push("Via", format!("SIP/2.0/UDP 1.2.3.4:5060;branch={branch}"));
        resp
    }

    #[tokio::test]
    async fn test_complete_routes_to_waiter() {
        let pool = TransactionPool::new(Duration::from_secs(1));
        let key = transaction_key("c1", 2, "z9hG4bKabc");
        let rx = pool.register(key.clone());

        assert!(pool.complete(response("c1", "2 MESSAGE", "z9hG4bKabc")));
        let resp = pool.wait(&key, rx).await.unwrap();
        assert_eq!(resp.status_code, 200);
    }

    #[tokio::test]
    async fn test_unmatched_response_dropped() {
        let pool = TransactionPool::new(Duration::from_secs(1));
        assert!(!pool.complete(response("nobody", "1 INVITE", "z9hG4bKx")));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let pool = TransactionPool::new(Duration::from_millis(20));
        let key = transaction_key("c2", 1, "z9hG4bKy");
        let rx = pool.register(key.clone());
        let err = pool.wait(&key, rx).await.unwrap_err();
        assert!(matches!(err, SipError::Timeout(_)));
    }
}
