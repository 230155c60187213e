// ZLMediaKit 驱动
// HTTP API 前缀 /index/api/*，应答统一携带 code/msg，非零 code 转为类型化错误

use crate::driver::{
    AddStreamProxyRequest, OpenRtpServerRequest, SmsDriver, StreamLiveAddr, PROTOCOL_ZLM,
    PULL_RETRY_NUM, PULL_TIMEOUT_MS,
};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::info;
use vigil_core::entity::media_servers;
use vigil_core::{Result, ServerPorts, VigilError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_VHOST: &str = "__defaultVhost__";

/// ZLM HTTP API 引擎
#[derive(Clone)]
pub struct ZlmEngine {
    client: reqwest::Client,
}

impl Default for ZlmEngine {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl ZlmEngine {
    fn base_url(ms: &media_servers::Model) -> String {
        format!("http://{}:{}", ms.ip, ms.http_port)
    }

    /// 调用 API，非零 code 映射为 MediaServer 错误
    async fn call(
        &self,
        ms: &media_servers::Model,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value> {
        let url = format!("{}{}", Self::base_url(ms), path);
        let mut form: Vec<(&str, String)> = vec![("secret", ms.secret.clone())];
        form.extend_from_slice(params);

        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| VigilError::Timeout(format!("zlm {path}: {e}")))?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| VigilError::Internal(format!("zlm {path} decode: {e}")))?;

        let code = value.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let msg = value
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(VigilError::MediaServer { code, msg });
        }
        Ok(value)
    }

    /// 快照接口返回的是 JPEG 二进制而非 JSON
    async fn call_binary(
        &self,
        ms: &media_servers::Model,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<u8>> {
        let url = format!("{}{}", Self::base_url(ms), path);
        let mut form: Vec<(&str, String)> = vec![("secret", ms.secret.clone())];
        form.extend_from_slice(params);
        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| VigilError::Timeout(format!("zlm {path}: {e}")))?;
        Ok(resp
            .bytes()
            .await
            .map_err(|e| VigilError::Internal(format!("zlm {path} read: {e}")))?
            .to_vec())
    }
}

/// ZLM 驱动
#[derive(Default)]
pub struct ZlmDriver {
    engine: ZlmEngine,
}

impl ZlmDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn config_port(cfg: &Value, key: &str) -> i32 {
    cfg.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl SmsDriver for ZlmDriver {
    fn protocol(&self) -> &'static str {
        PROTOCOL_ZLM
    }

    async fn connect(&self, ms: &mut media_servers::Model) -> Result<()> {
        let value = self
            .engine
            .call(ms, "/index/api/getServerConfig", &[])
            .await?;
        let cfg = value
            .get("data")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .ok_or_else(|| VigilError::MediaServer {
                code: -1,
                msg: "empty server config".into(),
            })?;

        // 首次连接时采集协商端口
        let ports = ServerPorts {
            http: ms.http_port,
            flv: ms.http_port,
            ws_flv: ms.http_port,
            https: config_port(cfg, "http.sslport"),
            rtmp: config_port(cfg, "rtmp.port"),
            rtmp_ssl: config_port(cfg, "rtmp.sslport"),
            rtsp: config_port(cfg, "rtsp.port"),
            rtsp_ssl: config_port(cfg, "rtsp.sslport"),
            rtp_proxy: config_port(cfg, "rtp_proxy.port"),
        };
        ms.ports = serde_json::to_value(ports)?;
        ms.hook_alive_interval = 10;
        ms.status = true;
        Ok(())
    }

    async fn setup(&self, ms: &media_servers::Model, webhook_base: &str) -> Result<()> {
        let mut extern_ips: Vec<&str> = Vec::with_capacity(2);
        for ip in [ms.sdp_ip.as_str(), ms.ip.as_str()] {
            if !ip.is_empty() {
                extern_ips.push(ip);
            }
        }

        let params: Vec<(&str, String)> = vec![
            ("general.mediaServerId", ms.id.clone()),
            ("hook.enable", "1".into()),
            ("hook.on_play", format!("{webhook_base}/on_play")),
            ("hook.on_publish", format!("{webhook_base}/on_publish")),
            (
                "hook.on_stream_changed",
                format!("{webhook_base}/on_stream_changed"),
            ),
            (
                "hook.on_stream_none_reader",
                format!("{webhook_base}/on_stream_none_reader"),
            ),
            (
                "hook.on_stream_not_found",
                format!("{webhook_base}/on_stream_not_found"),
            ),
            (
                "hook.on_server_started",
                format!("{webhook_base}/on_server_started"),
            ),
            (
                "hook.on_server_keepalive",
                format!("{webhook_base}/on_server_keepalive"),
            ),
            (
                "hook.on_rtp_server_timeout",
                format!("{webhook_base}/on_rtp_server_timeout"),
            ),
            (
                "hook.on_record_mp4",
                format!("{webhook_base}/on_record_mp4"),
            ),
            ("hook.on_flow_report", String::new()),
            ("hook.on_record_ts", String::new()),
            ("hook.on_rtsp_auth", String::new()),
            ("hook.on_rtsp_realm", String::new()),
            ("hook.on_shell_login", String::new()),
            ("hook.timeout_sec", "10".into()),
            ("hook.alive_interval", ms.hook_alive_interval.to_string()),
            ("general.streamNoneReaderDelayMS", "30000".into()),
            ("protocol.enable_ts", "0".into()),
            ("protocol.enable_fmp4", "0".into()),
            ("protocol.enable_hls", "0".into()),
            ("protocol.enable_hls_fmp4", "1".into()),
            ("protocol.continue_push_ms", "3000".into()),
            ("rtp_proxy.port_range", ms.rtp_port_range.clone()),
            ("rtc.externIP", extern_ips.join(",")),
        ];

        let value = self
            .engine
            .call(ms, "/index/api/setServerConfig", &params)
            .await?;
        info!(
            changed = value.get("changed").and_then(serde_json::Value::as_i64).unwrap_or(0),
            "zlm server config applied"
        );
        Ok(())
    }

    async fn ping(&self, ms: &media_servers::Model) -> Result<()> {
        self.engine
            .call(ms, "/index/api/getServerConfig", &[])
            .await
            .map(|_| ())
    }

    async fn open_rtp_server(
        &self,
        ms: &media_servers::Model,
        req: &OpenRtpServerRequest,
    ) -> Result<u16> {
        let value = self
            .engine
            .call(
                ms,
                "/index/api/openRtpServer",
                &[
                    ("port", req.port.to_string()),
                    ("tcp_mode", req.tcp_mode.to_string()),
                    ("stream_id", req.stream_id.clone()),
                ],
            )
            .await?;
        value
            .get("port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .ok_or_else(|| VigilError::MediaServer {
                code: -1,
                msg: "openRtpServer returned no port".into(),
            })
    }

    async fn close_rtp_server(&self, ms: &media_servers::Model, stream_id: &str) -> Result<()> {
        self.engine
            .call(
                ms,
                "/index/api/closeRtpServer",
                &[("stream_id", stream_id.to_string())],
            )
            .await
            .map(|_| ())
    }

    async fn add_stream_proxy(
        &self,
        ms: &media_servers::Model,
        req: &AddStreamProxyRequest,
    ) -> Result<String> {
        let value = self
            .engine
            .call(
                ms,
                "/index/api/addStreamProxy",
                &[
                    ("vhost", DEFAULT_VHOST.into()),
                    ("app", req.app.clone()),
                    ("stream", req.stream.clone()),
                    ("url", req.url.clone()),
                    ("rtp_type", req.rtp_type.to_string()),
                    ("timeout_sec", (PULL_TIMEOUT_MS / 1000).to_string()),
                    ("retry_count", PULL_RETRY_NUM.to_string()),
                    ("enable_hls_fmp4", "1".into()),
                    ("enable_audio", "1".into()),
                    ("enable_rtsp", "1".into()),
                    ("enable_rtmp", "1".into()),
                    ("add_mute_audio", "1".into()),
                    ("auto_close", "1".into()),
                ],
            )
            .await?;
        value
            .pointer("/data/key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VigilError::MediaServer {
                code: -1,
                msg: "addStreamProxy returned no key".into(),
            })
    }

    async fn get_snapshot(
        &self,
        ms: &media_servers::Model,
        app: &str,
        stream: &str,
    ) -> Result<Vec<u8>> {
        let ports = ms.server_ports();
        let url = format!(
            "rtsp://127.0.0.1:{}/{}/{}",
            ports.rtsp, app, stream
        );
        self.engine
            .call_binary(
                ms,
                "/index/api/getSnap",
                &[
                    ("url", url),
                    ("timeout_sec", "10".into()),
                    ("expire_sec", "1".into()),
                ],
            )
            .await
    }

    async fn start_record(
        &self,
        ms: &media_servers::Model,
        app: &str,
        stream: &str,
        custom_path: &str,
        max_second: u32,
    ) -> Result<()> {
        let mut params: Vec<(&str, String)> = vec![
            ("type", "1".into()),
            ("vhost", DEFAULT_VHOST.into()),
            ("app", app.to_string()),
            ("stream", stream.to_string()),
            ("max_second", max_second.to_string()),
        ];
        if !custom_path.is_empty() {
            params.push(("customized_path", custom_path.to_string()));
        }
        self.engine
            .call(ms, "/index/api/startRecord", &params)
            .await
            .map(|_| ())
    }

    async fn stop_record(&self, ms: &media_servers::Model, app: &str, stream: &str) -> Result<()> {
        self.engine
            .call(
                ms,
                "/index/api/stopRecord",
                &[
                    ("type", "1".into()),
                    ("vhost", DEFAULT_VHOST.into()),
                    ("app", app.to_string()),
                    ("stream", stream.to_string()),
                ],
            )
            .await
            .map(|_| ())
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
        let rtc_prefix = http_prefix
            .replacen("https", "webrtc", 1)
            .replacen("http", "webrtc", 1);
        StreamLiveAddr {
            label: "ZLM".to_string(),
            ws_flv: format!("{ws_prefix}/proxy/sms/{app}/{stream}.live.flv"),
            http_flv: format!("{http_prefix}/proxy/sms/{app}/{stream}.live.flv"),
            hls: format!("{http_prefix}/proxy/sms/{app}/{stream}/hls.fmp4.m3u8"),
            webrtc: format!(
                "{rtc_prefix}/proxy/sms/index/api/webrtc?app={app}&stream={stream}&type=play"
            ),
            rtmp: format!("rtmp://{host}:{}/{stream}", ports.rtmp),
            rtsp: format!("rtsp://{host}:{}/{stream}", ports.rtsp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn media_server() -> media_servers::Model {
        let ports = ServerPorts {
            http: 8080,
            rtmp: 1935,
            rtsp: 554,
            ..Default::default()
        };
        media_servers::Model {
            id: "local".into(),
            r#type: "zlm".into(),
            ip: "127.0.0.1".into(),
            http_port: 8080,
            secret: "s".into(),
            ports: serde_json::to_value(ports).unwrap(),
            rtp_port_range: "30000-30100".into(),
            hook_ip: "127.0.0.1".into(),
            sdp_ip: String::new(),
            hook_alive_interval: 10,
            status: true,
            last_seen_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_stream_live_addr_shapes() {
        let driver = ZlmDriver::new();
        let addr = driver.stream_live_addr(
            &media_server(),
            "https://vms.example.com",
            "vms.example.com",
            "rtp",
            "gbc_1",
        );
        assert_eq!(
            addr.ws_flv,
            "wss://vms.example.com/proxy/sms/rtp/gbc_1.live.flv"
        );
        assert_eq!(
            addr.http_flv,
            "https://vms.example.com/proxy/sms/rtp/gbc_1.live.flv"
        );
        assert_eq!(
            addr.hls,
            "https://vms.example.com/proxy/sms/rtp/gbc_1/hls.fmp4.m3u8"
        );
        assert_eq!(
            addr.webrtc,
            "webrtc://vms.example.com/proxy/sms/index/api/webrtc?app=rtp&stream=gbc_1&type=play"
        );
        assert_eq!(addr.rtmp, "rtmp://vms.example.com:1935/gbc_1");
        assert_eq!(addr.rtsp, "rtsp://vms.example.com:554/gbc_1");
    }

    #[test]
    fn test_config_port_parsing() {
        let cfg: Value = serde_json::json!({
            "rtmp.port": "1935",
            "rtsp.port": "554",
            "bogus": "x"
        });
        assert_eq!(config_port(&cfg, "rtmp.port"), 1935);
        assert_eq!(config_port(&cfg, "rtsp.port"), 554);
        assert_eq!(config_port(&cfg, "bogus"), 0);
        assert_eq!(config_port(&cfg, "missing"), 0);
    }
}
