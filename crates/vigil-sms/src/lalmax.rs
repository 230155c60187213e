// Lalmax 驱动
// 仅覆盖 Lalmax 实际提供的能力子集：拉流代理（relay pull）与 RTP 收流，
// 其余操作返回 Unsupported 而非中断进程

use crate::driver::{
    AddStreamProxyRequest, OpenRtpServerRequest, SmsDriver, StreamLiveAddr, PROTOCOL_LALMAX,
    PULL_RETRY_NUM, PULL_TIMEOUT_MS,
};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use vigil_core::entity::media_servers;
use vigil_core::{Result, VigilError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct LalmaxDriver {
    client: Option<reqwest::Client>,
}

impl LalmaxDriver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder().timeout(HTTP_TIMEOUT).build().ok(),
        }
    }

    fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| VigilError::Internal("lalmax http client unavailable".into()))
    }

    async fn post(
        &self,
        ms: &media_servers::Model,
        path: &str,
        body: Value,
    ) -> Result<Value> {
        let url = format!("http://{}:{}{}", ms.ip, ms.http_port, path);
        let resp = self
            .client()?
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VigilError::Timeout(format!("lalmax {path}: {e}")))?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| VigilError::Internal(format!("lalmax {path} decode: {e}")))?;
        let code = value.get("error_code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let msg = value
                .get("desp")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(VigilError::MediaServer { code, msg });
        }
        Ok(value)
    }

    fn unsupported<T>(&self, op: &str) -> Result<T> {
        Err(VigilError::Unsupported(format!("lalmax does not support {op}")))
    }
}

#[async_trait]
impl SmsDriver for LalmaxDriver {
    fn protocol(&self) -> &'static str {
        PROTOCOL_LALMAX
    }

    async fn connect(&self, ms: &mut media_servers::Model) -> Result<()> {
        // Lalmax 无配置协商接口，仅确认 HTTP 端口可达
        self.ping(ms).await?;
        ms.status = true;
        ms.hook_alive_interval = 10;
        Ok(())
    }

    async fn setup(&self, _ms: &media_servers::Model, _webhook_base: &str) -> Result<()> {
        // webhook 由 Lalmax 配置文件静态指定
        Ok(())
    }

    async fn ping(&self, ms: &media_servers::Model) -> Result<()> {
        let url = format!("http://{}:{}/api/stat/lal_info", ms.ip, ms.http_port);
        self.client()?
            .get(&url)
            .send()
            .await
            .map_err(|e| VigilError::Timeout(format!("lalmax ping: {e}")))?;
        Ok(())
    }

    async fn open_rtp_server(
        &self,
        ms: &media_servers::Model,
        req: &OpenRtpServerRequest,
    ) -> Result<u16> {
        let value = self
            .post(
                ms,
                "/api/ctrl/start_rtp_pub",
                serde_json::json!({
                    "stream_name": req.stream_id,
                    "port": req.port,
                    "timeout_ms": PULL_TIMEOUT_MS,
                    "is_tcp_flag": if req.tcp_mode > 0 { 1 } else { 0 },
                }),
            )
            .await?;
        value
            .pointer("/data/port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .ok_or_else(|| VigilError::MediaServer {
                code: -1,
                msg: "start_rtp_pub returned no port".into(),
            })
    }

    async fn close_rtp_server(&self, _ms: &media_servers::Model, _stream_id: &str) -> Result<()> {
        self.unsupported("closeRtpServer")
    }

    async fn add_stream_proxy(
        &self,
        ms: &media_servers::Model,
        req: &AddStreamProxyRequest,
    ) -> Result<String> {
        let value = self
            .post(
                ms,
                "/api/ctrl/start_relay_pull",
                serde_json::json!({
                    "stream_name": req.stream,
                    "url": req.url,
                    "pull_timeout_ms": PULL_TIMEOUT_MS,
                    "pull_retry_num": PULL_RETRY_NUM,
                    "rtsp_mode": req.rtp_type,
                }),
            )
            .await?;
        value
            .pointer("/data/session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VigilError::MediaServer {
                code: -1,
                msg: "start_relay_pull returned no session id".into(),
            })
    }

    async fn get_snapshot(
        &self,
        _ms: &media_servers::Model,
        _app: &str,
        _stream: &str,
    ) -> Result<Vec<u8>> {
        self.unsupported("getSnap")
    }

    async fn start_record(
        &self,
        _ms: &media_servers::Model,
        _app: &str,
        _stream: &str,
        _custom_path: &str,
        _max_second: u32,
    ) -> Result<()> {
        self.unsupported("startRecord")
    }

    async fn stop_record(
        &self,
        _ms: &media_servers::Model,
        _app: &str,
        _stream: &str,
    ) -> Result<()> {
        self.unsupported("stopRecord")
    }

    fn stream_live_addr(
        &self,
        ms: &media_servers::Model,
        http_prefix: &str,
        host: &str,
        app: &str,
        stream: &str,
    ) -> StreamLiveAddr {
        let ports = ms.server_ports();
        let ws_prefix = http_prefix
            .replacen("https", "wss", 1)
            .replacen("http", "ws", 1);
        StreamLiveAddr {
            label: "Lalmax".to_string(),
            ws_flv: format!("{ws_prefix}/proxy/sms/{app}/{stream}.live.flv"),
            http_flv: format!("{http_prefix}/proxy/sms/{app}/{stream}.live.flv"),
            hls: format!("{http_prefix}/proxy/sms/{app}/{stream}/hls.fmp4.m3u8"),
            webrtc: String::new(),
            rtmp: format!("rtmp://{host}:{}/{stream}", ports.rtmp),
            rtsp: format!("rtsp://{host}:{}/{stream}", ports.rtsp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_ops_are_typed_errors() {
        let driver = LalmaxDriver::new();
        let ms = media_servers::Model {
            id: "local".into(),
            r#type: "lalmax".into(),
            ip: "127.0.0.1".into(),
            http_port: 8083,
            secret: String::new(),
            ports: serde_json::json!({}),
            rtp_port_range: String::new(),
            hook_ip: String::new(),
            sdp_ip: String::new(),
            hook_alive_interval: 10,
            status: false,
            last_seen_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let err = driver.get_snapshot(&ms, "live", "demo").await.unwrap_err();
        assert!(matches!(err, VigilError::Unsupported(_)));
        let err = driver.stop_record(&ms, "live", "demo").await.unwrap_err();
        assert!(matches!(err, VigilError::Unsupported(_)));
    }
}
