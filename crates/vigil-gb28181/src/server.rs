// GB28181 SIP 注册服务器 / UAS
// 设备注册（摘要鉴权）、心跳、目录收集、实时点播 INVITE、PTZ 下发

use crate::collector::CatalogCollector;
use crate::device::{DeviceSession, SessionStore};
use crate::manscdp::{self, CatalogItem, CmdType, DeviceInfo};
use crate::play::{PlaySession, PlaySessions, SsrcAllocator};
use crate::ptz;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use vigil_core::{PresetCommand, PtzDirection, Result, StreamMode, VigilError, IGNORE_PASSWORD};
use vigil_sip::sdp::{SdpOffer, SdpTransport};
use vigil_sip::transaction::transaction_key;
use vigil_sip::{
    ChallengeStore, DigestAuthorization, SipConnection, SipMessage, SipMethod, SipRequest,
    SipResponse, SipTransport, TransactionPool,
};

/// 心跳宽限（秒），超过「有效期 + 宽限」未见心跳判离线
const KEEPALIVE_GRACE_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct GbConfig {
    /// SIP 监听地址，如 "0.0.0.0:5060"
    pub listen_addr: String,
    /// SIP 域（realm），如 "3402000000"
    pub domain: String,
    /// 平台国标编号
    pub server_id: String,
    /// 全局默认注册口令，设备未单独配置时使用
    pub password: String,
    /// 事务超时
    pub transaction_timeout: Duration,
}

impl Default for GbConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5060".to_string(),
            domain: "3402000000".to_string(),
            server_id: "34020000002000000001".to_string(),
            password: String::new(),
            transaction_timeout: Duration::from_secs(30),
        }
    }
}

/// 注册上下文，交给上层落库
#[derive(Debug, Clone)]
pub struct RegisterContext {
    pub address: String,
    pub transport: &'static str,
    pub expires: i64,
    pub gb_version: String,
}

/// 注册服务器的领域回调，由上层（存储/编排）实现
#[async_trait]
pub trait GbHandler: Send + Sync {
    /// 设备生效口令；返回 None 表示该设备免鉴权
    async fn device_password(&self, device_id: &str) -> Result<Option<String>>;

    async fn on_registered(&self, device_id: &str, ctx: RegisterContext);

    async fn on_unregistered(&self, device_id: &str);

    async fn on_keepalive(&self, device_id: &str);

    /// 目录静默合并后的整表上报
    async fn on_catalog(&self, device_id: &str, items: Vec<CatalogItem>);

    async fn on_device_info(&self, device_id: &str, info: DeviceInfo);

    /// 设备侧 BYE，参数为流 ID
    async fn on_bye(&self, stream: &str);
}

/// 点播输入
#[derive(Debug, Clone)]
pub struct PlayInput {
    /// 设备国标编号
    pub device_id: String,
    /// 通道国标编号
    pub channel_id: String,
    /// 流媒体侧流 ID
    pub stream: String,
    /// 流媒体收流地址
    pub rtp_ip: String,
    pub rtp_port: u16,
    pub stream_mode: StreamMode,
}

pub struct GbServer {
    config: GbConfig,
    pub sessions: SessionStore,
    challenges: ChallengeStore,
    transactions: TransactionPool,
    pub collector: Arc<CatalogCollector>,
    pub plays: PlaySessions,
    ssrc: SsrcAllocator,
    sn: AtomicU32,
    handler: OnceLock<Arc<dyn GbHandler>>,
}

impl GbServer {
    pub fn new(config: GbConfig) -> Arc<Self> {
        let ssrc = SsrcAllocator::new(&config.domain);
        Arc::new(Self {
            transactions: TransactionPool::new(config.transaction_timeout),
            config,
            sessions: SessionStore::new(),
            challenges: ChallengeStore::new(),
            collector: Arc::new(CatalogCollector::default()),
            plays: PlaySessions::new(),
            ssrc,
            sn: AtomicU32::new(1),
            handler: OnceLock::new(),
        })
    }

    /// 注入领域回调（两段式装配：先建服务器，再建依赖它的适配器，最后注入）
    pub fn set_handler(&self, handler: Arc<dyn GbHandler>) {
        let _ = self.handler.set(handler);
    }

    fn handler(&self) -> Option<Arc<dyn GbHandler>> {
        self.handler.get().cloned()
    }

    pub fn config(&self) -> &GbConfig {
        &self.config
    }

    fn next_sn(&self) -> u32 {
        self.sn.fetch_add(1, Ordering::Relaxed)
    }

    /// 启动：绑定传输、目录收集器、心跳清扫器与主分发循环
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let transport = SipTransport::bind(&self.config.listen_addr)
            .await
            .map_err(sip_err)?;
        let mut inbound = transport.run();

        let server = self.clone();
        self.collector.clone().spawn(move |device_id, items| {
            let server = server.clone();
            async move {
                if let Some(handler) = server.handler() {
                    handler.on_catalog(&device_id, items).await;
                }
            }
        });

        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                sweeper.sweep_keepalive().await;
                sweeper.challenges.sweep();
            }
        });

        info!("GB28181 UAS started on {}", self.config.listen_addr);
        while let Some(msg) = inbound.recv().await {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server
                    .handle_message(msg.message, msg.conn, msg.source)
                    .await
                {
                    warn!("handle SIP message failed: {e}");
                }
            });
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        message: SipMessage,
        conn: SipConnection,
        source: std::net::SocketAddr,
    ) -> Result<()> {
        match message {
            SipMessage::Request(req) => match req.method {
                SipMethod::Register => self.handle_register(req, conn, source).await,
                SipMethod::Message => self.handle_message_method(req, conn, source).await,
                SipMethod::Bye => self.handle_bye(req, conn).await,
                SipMethod::Ack => Ok(()),
                SipMethod::Options => {
                    let resp = SipResponse::from_request(&req, 200, "OK");
                    conn.send(&resp.encode()).await.map_err(sip_err)
                }
                other => {
                    debug!("unsupported SIP method {other}");
                    let resp = SipResponse::from_request(&req, 501, "Not Implemented");
                    conn.send(&resp.encode()).await.map_err(sip_err)
                }
            },
            SipMessage::Response(resp) => {
                if !self.transactions.complete(resp) {
                    debug!("response without pending transaction dropped");
                }
                Ok(())
            }
        }
    }

    /// 国标编号校验：18~20 位纯数字。不符合的来源直接 400，不分配任何状态
    fn validate_device_id(device_id: &str) -> Result<()> {
        if device_id.len() < 18 {
            return Err(VigilError::InvalidInput("device id too short".into()));
        }
        if device_id.len() > 20 {
            return Err(VigilError::InvalidInput("device id too long".into()));
        }
        if !device_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(VigilError::InvalidInput(
                "device id must be all numbers".into(),
            ));
        }
        Ok(())
    }

    async fn handle_register(
        &self,
        req: SipRequest,
        conn: SipConnection,
        source: std::net::SocketAddr,
    ) -> Result<()> {
        let device_id = req
            .from_user()
            .map(str::to_string)
            .ok_or_else(|| VigilError::InvalidInput("missing From user".into()))?;

        if let Err(e) = Self::validate_device_id(&device_id) {
            warn!(device_id, "reject register: {e}");
            let resp = SipResponse::from_request(&req, 400, "Bad Request");
            conn.send(&resp.encode()).await.map_err(sip_err)?;
            return Ok(());
        }

        let handler = self
            .handler()
            .ok_or_else(|| VigilError::Internal("gb handler not installed".into()))?;

        // 生效口令：设备行优先，其次全局配置；"#" 哨兵免鉴权
        let password = match handler.device_password(&device_id).await? {
            Some(p) if p == IGNORE_PASSWORD => None,
            Some(p) if !p.is_empty() => Some(p),
            _ if !self.config.password.is_empty() => Some(self.config.password.clone()),
            _ => None,
        };

        let call_id = req.call_id().unwrap_or_default().to_string();
        if let Some(password) = password {
            let authorization = req.headers.get("Authorization").map(str::to_string);
            let Some(authorization) = authorization else {
                return self.challenge(&req, &conn, &call_id).await;
            };

            let auth = DigestAuthorization::parse(&authorization);
            // nonce 单次使用且 30 秒内有效，过期必须重新挑战
            let Some(nonce) = self.challenges.take(&call_id) else {
                return self.challenge(&req, &conn, &call_id).await;
            };
            if auth.get("nonce") != nonce
                || !auth.verify(&device_id, &password, "REGISTER")
            {
                info!(device_id, "register digest mismatch");
                let resp = SipResponse::from_request(&req, 401, "Unauthorized");
                conn.send(&resp.encode()).await.map_err(sip_err)?;
                return Ok(());
            }
        }

        let session = self.sessions.load_or_create(&device_id);
        session.attach(
            conn.clone(),
            source,
            req.headers.get("To").map(str::to_string),
        );

        let expires: i64 = req
            .headers
            .get("Expires")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let respond_ok = |req: &SipRequest| {
            let mut resp = SipResponse::from_request(req, 200, "OK");
            resp.headers.push(
                "Date",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            );
            resp
        };

        if expires == 0 {
            info!(device_id, "device unregistered");
            session.set_online(false);
            session.set_expires(0);
            handler.on_unregistered(&device_id).await;
            conn.send(&respond_ok(&req).encode()).await.map_err(sip_err)?;
            return Ok(());
        }

        session.set_online(true);
        session.set_expires(expires);
        session.touch_keepalive();

        let gb_version = req
            .headers
            .get("X-GB-Ver")
            .unwrap_or_default()
            .to_string();
        handler
            .on_registered(
                &device_id,
                RegisterContext {
                    address: source.to_string(),
                    transport: conn.network(),
                    expires,
                    gb_version,
                },
            )
            .await;
        info!(device_id, addr = %source, "device registered");

        conn.send(&respond_ok(&req).encode()).await.map_err(sip_err)?;

        // 注册成功后下发三类查询
        let _ = self.query_device_info(&device_id).await;
        let _ = self.query_catalog(&device_id).await;
        let _ = self.query_config_download(&device_id).await;
        Ok(())
    }

    async fn challenge(&self, req: &SipRequest, conn: &SipConnection, call_id: &str) -> Result<()> {
        let nonce = self.challenges.issue(call_id);
        let mut resp = SipResponse::from_request(req, 401, "Unauthorized");
        resp.headers.push(
            "WWW-Authenticate",
            format!(
                "Digest realm=\"{}\",qop=\"auth\",nonce=\"{}\"",
                self.config.domain, nonce
            ),
        );
        conn.send(&resp.encode()).await.map_err(sip_err)
    }

    async fn handle_message_method(
        &self,
        req: SipRequest,
        conn: SipConnection,
        source: std::net::SocketAddr,
    ) -> Result<()> {
        let device_id = req
            .from_user()
            .map(str::to_string)
            .ok_or_else(|| VigilError::InvalidInput("missing From user".into()))?;
        let body = String::from_utf8_lossy(&req.body).into_owned();

        let handler = self
            .handler()
            .ok_or_else(|| VigilError::Internal("gb handler not installed".into()))?;

        match manscdp::classify(&body) {
            CmdType::Keepalive => {
                if let Some(session) = self.sessions.get(&device_id) {
                    session.touch_keepalive();
                    session.attach(conn.clone(), source, None);
                }
                handler.on_keepalive(&device_id).await;
            }
            CmdType::Catalog => match manscdp::parse_catalog(&body) {
                Ok(resp) => {
                    let sum_num = resp.sum_num.unwrap_or(0);
                    let items = resp.device_list.map(|l| l.items).unwrap_or_default();
                    self.collector.push(&device_id, sum_num, items);
                }
                Err(e) => warn!(device_id, "bad catalog body: {e}"),
            },
            CmdType::DeviceInfo => match manscdp::parse_device_info(&body) {
                Ok(info) => handler.on_device_info(&device_id, info).await,
                Err(e) => warn!(device_id, "bad device info body: {e}"),
            },
            CmdType::DeviceStatus => match manscdp::parse_device_status(&body) {
                Ok(status) => debug!(device_id, online = status.is_online(), "device status"),
                Err(e) => warn!(device_id, "bad device status body: {e}"),
            },
            CmdType::ConfigDownload => debug!(device_id, "config download reply accepted"),
            CmdType::Unknown => debug!(device_id, "unhandled MANSCDP command"),
        }

        let resp = SipResponse::from_request(&req, 200, "OK");
        conn.send(&resp.encode()).await.map_err(sip_err)
    }

    async fn handle_bye(&self, req: SipRequest, conn: SipConnection) -> Result<()> {
        if let Some(call_id) = req.call_id() {
            if let Some(session) = self.plays.remove_by_call_id(call_id) {
                info!(stream = session.stream, "device sent BYE, session closed");
                if let Some(handler) = self.handler() {
                    handler.on_bye(&session.stream).await;
                }
            }
        }
        let resp = SipResponse::from_request(&req, 200, "OK");
        conn.send(&resp.encode()).await.map_err(sip_err)
    }

    fn local_host(&self) -> &str {
        self.config
            .listen_addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or("0.0.0.0")
    }

    fn local_port(&self) -> &str {
        self.config
            .listen_addr
            .rsplit_once(':')
            .map(|(_, p)| p)
            .unwrap_or("5060")
    }

    fn new_branch() -> String {
        format!("z9hG4bK{}", rand::thread_rng().gen_range(100000000u64..=999999999))
    }

    fn new_tag() -> String {
        format!("{}", rand::thread_rng().gen_range(100000000u64..=999999999))
    }

    /// 构造发往设备的出站请求
    fn build_request(
        &self,
        session: &DeviceSession,
        method: SipMethod,
        target: &str,
        cseq: u32,
        branch: &str,
    ) -> SipRequest {
        let peer = session
            .source()
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.config.domain.clone());
        let mut req = SipRequest::new(method, format!("sip:{target}@{peer}"));
        req.headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};rport;branch={}",
                self.local_host(),
                self.local_port(),
                branch
            ),
        );
        req.headers.push(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.config.server_id,
                self.config.domain,
                Self::new_tag()
            ),
        );
        req.headers
            .push("To", format!("<sip:{}@{}>", target, self.config.domain));
        req.headers.push(
            "Call-ID",
            format!("{}@{}", Self::new_tag(), self.config.domain),
        );
        req.headers.push("CSeq", format!("{cseq} {method}"));
        req.headers.push("Max-Forwards", "70");
        req.headers.push(
            "Contact",
            format!(
                "<sip:{}@{}:{}>",
                self.config.server_id,
                self.local_host(),
                self.local_port()
            ),
        );
        req
    }

    fn session_of(&self, device_id: &str) -> Result<Arc<DeviceSession>> {
        let session = self
            .sessions
            .get(device_id)
            .ok_or_else(|| VigilError::NotFound(format!("device session {device_id}")))?;
        if !session.is_online() {
            return Err(VigilError::DeviceOffline(device_id.to_string()));
        }
        Ok(session)
    }

    async fn send_to_device(&self, session: &DeviceSession, req: &SipRequest) -> Result<()> {
        let conn = session
            .connection()
            .ok_or_else(|| VigilError::DeviceOffline(session.device_id.clone()))?;
        conn.send(&req.encode()).await.map_err(sip_err)
    }

    /// 下发 MANSCDP 查询/控制 MESSAGE
    async fn send_manscdp(&self, device_id: &str, target: &str, body: String) -> Result<()> {
        let session = self.session_of(device_id)?;
        let cseq = session.next_cseq();
        let mut req =
            self.build_request(&session, SipMethod::Message, target, cseq, &Self::new_branch());
        req.set_body(manscdp::CONTENT_TYPE_XML, body);
        self.send_to_device(&session, &req).await
    }

    pub async fn query_catalog(&self, device_id: &str) -> Result<()> {
        let sn = self.next_sn();
        debug!(device_id, sn, "query catalog");
        self.send_manscdp(device_id, device_id, manscdp::catalog_query_xml(sn, device_id))
            .await
    }

    pub async fn query_device_info(&self, device_id: &str) -> Result<()> {
        let sn = self.next_sn();
        self.send_manscdp(
            device_id,
            device_id,
            manscdp::device_info_query_xml(sn, device_id),
        )
        .await
    }

    pub async fn query_config_download(&self, device_id: &str) -> Result<()> {
        let sn = self.next_sn();
        self.send_manscdp(
            device_id,
            device_id,
            manscdp::config_download_query_xml(sn, device_id),
        )
        .await
    }

    /// 云台方向/变倍控制
    pub async fn ptz_control(
        &self,
        device_id: &str,
        channel_id: &str,
        direction: PtzDirection,
        speed: u8,
        horizontal: u8,
        vertical: u8,
        zoom: u8,
    ) -> Result<()> {
        let cmd = ptz::encode_control(direction, speed, horizontal, vertical, zoom);
        let body = manscdp::device_control_xml(self.next_sn(), channel_id, &ptz::to_hex(&cmd));
        self.send_manscdp(device_id, channel_id, body).await
    }

    /// 云台预置位控制
    pub async fn ptz_preset(
        &self,
        device_id: &str,
        channel_id: &str,
        command: PresetCommand,
        preset_id: u8,
    ) -> Result<()> {
        let cmd = ptz::encode_preset(command, preset_id)?;
        let body = manscdp::device_control_xml(self.next_sn(), channel_id, &ptz::to_hex(&cmd));
        self.send_manscdp(device_id, channel_id, body).await
    }

    /// 实时点播：INVITE → 200(SDP) → ACK，成功后登记点播会话
    pub async fn play(&self, input: PlayInput) -> Result<PlaySession> {
        if let Some(existing) = self.plays.get(&input.stream) {
            return Ok(existing);
        }

        let session = self.session_of(&input.device_id)?;
        let ssrc = self.ssrc.next();
        let transport = match input.stream_mode {
            StreamMode::Udp => SdpTransport::Udp,
            StreamMode::TcpPassive => SdpTransport::TcpPassive,
            StreamMode::TcpActive => SdpTransport::TcpActive,
        };
        let offer = SdpOffer {
            owner: input.channel_id.clone(),
            ip: input.rtp_ip.clone(),
            port: input.rtp_port,
            ssrc: ssrc.clone(),
            transport,
        };

        let cseq = session.next_cseq();
        let branch = Self::new_branch();
        let mut req =
            self.build_request(&session, SipMethod::Invite, &input.channel_id, cseq, &branch);
        req.headers.push(
            "Subject",
            format!("{}:{},{}:0", input.channel_id, ssrc, self.config.server_id),
        );
        req.set_body("application/sdp", offer.to_string());

        let call_id = req.call_id().unwrap_or_default().to_string();
        let key = transaction_key(&call_id, cseq, &branch);
        let rx = self.transactions.register(key.clone());

        self.send_to_device(&session, &req).await?;
        info!(
            device_id = input.device_id,
            channel_id = input.channel_id,
            ssrc,
            "INVITE sent"
        );

        let resp = self.transactions.wait(&key, rx).await.map_err(sip_err)?;
        if resp.status_code != 200 {
            return Err(VigilError::Internal(format!(
                "INVITE rejected: {} {}",
                resp.status_code, resp.reason
            )));
        }

        // 应答可能改写 SSRC（y= 行），以设备为准
        let answer = String::from_utf8_lossy(&resp.body).into_owned();
        let final_ssrc = vigil_sip::sdp::parse_ssrc(&answer)
            .map(str::to_string)
            .unwrap_or(ssrc);
        let to = resp.headers.get("To").map(str::to_string);

        // ACK 复用 INVITE 的 CSeq 序号
        let mut ack =
            self.build_request(&session, SipMethod::Ack, &input.channel_id, cseq, &Self::new_branch());
        ack.headers.set("Call-ID", call_id.clone());
        ack.headers.set("CSeq", format!("{cseq} ACK"));
        if let Some(to) = &to {
            ack.headers.set("To", to.clone());
        }
        self.send_to_device(&session, &ack).await?;

        let play = PlaySession {
            call_id,
            device_id: input.device_id,
            channel_id: input.channel_id,
            stream: input.stream,
            ssrc: final_ssrc,
            cseq,
            to,
            rtp_port: input.rtp_port,
        };
        self.plays.insert(play.clone());
        Ok(play)
    }

    /// 停止点播：BYE 并回收会话
    pub async fn stop_play(&self, stream: &str) -> Result<Option<PlaySession>> {
        let Some(play) = self.plays.remove(stream) else {
            return Ok(None);
        };
        let Some(session) = self.sessions.get(&play.device_id) else {
            return Ok(Some(play));
        };

        let cseq = session.next_cseq();
        let mut bye = self.build_request(
            &session,
            SipMethod::Bye,
            &play.channel_id,
            cseq,
            &Self::new_branch(),
        );
        bye.headers.set("Call-ID", play.call_id.clone());
        if let Some(to) = &play.to {
            bye.headers.set("To", to.clone());
        }
        if let Err(e) = self.send_to_device(&session, &bye).await {
            warn!(stream, "send BYE failed: {e}");
        } else {
            info!(stream, "BYE sent");
        }
        Ok(Some(play))
    }

    /// 心跳清扫：超时（有效期 + 宽限）的在线设备判离线，
    /// 保留套接字上下文等待重连
    async fn sweep_keepalive(&self) {
        for session in self.sessions.iter_sessions() {
            if session.is_online() && session.keepalive_expired(KEEPALIVE_GRACE_SECS) {
                warn!(device_id = session.device_id, "keepalive timeout, marking offline");
                session.set_online(false);
                if let Some(handler) = self.handler() {
                    handler.on_unregistered(&session.device_id).await;
                }
            }
        }
    }
}

fn sip_err(e: vigil_sip::SipError) -> VigilError {
    match e {
        vigil_sip::SipError::Timeout(s) => VigilError::Timeout(s),
        other => VigilError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_gate() {
        assert!(GbServer::validate_device_id("34020000001320000001").is_ok());
        assert!(GbServer::validate_device_id("340200000013200001").is_ok());
        // 过短 / 过长 / 非数字
        assert!(GbServer::validate_device_id("3402000000132").is_err());
        assert!(GbServer::validate_device_id("340200000013200000011").is_err());
        assert!(GbServer::validate_device_id("3402000000132000000a").is_err());
    }

    #[test]
    fn test_build_request_headers() {
        let server = GbServer::new(GbConfig::default());
        let session = DeviceSession::new("34020000001320000001");
        let req = server.build_request(
            &session,
            SipMethod::Message,
            "34020000001320000001",
            5,
            "z9hG4bK123456789",
        );
        assert_eq!(req.cseq(), Some((5, "MESSAGE")));
        assert_eq!(req.branch(), Some("z9hG4bK123456789"));
        assert!(req
            .headers
            .get("From")
            .unwrap()
            .contains("34020000002000000001"));
        assert!(req.headers.get("To").unwrap().contains("@3402000000"));
        assert!(req.call_id().unwrap().ends_with("@3402000000"));
    }

    #[test]
    fn test_branch_and_tag_shape() {
        let b = GbServer::new_branch();
        assert!(b.starts_with("z9hG4bK"));
        let t = GbServer::new_tag();
        assert_eq!(t.len(), 9);
        assert!(t.chars().all(|c| c.is_ascii_digit()));
    }
}
