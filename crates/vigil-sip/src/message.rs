// SIP 消息解析与生成
// 头部保留重复项与出现顺序，消息体按 Content-Length 截取

use crate::{Result, SipError};
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
    Options,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
            SipMethod::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "INFO" => Some(SipMethod::Info),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

/// 保序、允许重复的头部集合
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// 追加一个头部（不去重）
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 替换首个同名头部，不存在则追加
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        for (k, v) in self.0.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value.into();
                return;
            }
        }
        self.push(name.to_string(), value);
    }

    /// 首个同名头部的值（大小写不敏感）
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 所有同名头部的值
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        let mut headers = Headers::new();
        for line in lines {
            if let Some(pos) = line.find(':') {
                let key = line[..pos].trim();
                let value = line[pos + 1..].trim();
                headers.push(key, value);
            }
        }
        headers
    }

    fn render(&self, out: &mut String) {
        for (k, v) in self.iter() {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Vec<u8>>) {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// CSeq 头拆为 (序号, 方法)
    pub fn cseq(&self) -> Option<(u32, &str)> {
        let v = self.headers.get("CSeq")?;
        let mut parts = v.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        Some((seq, parts.next().unwrap_or("")))
    }

    /// 第一条 Via 的 branch 参数
    pub fn branch(&self) -> Option<&str> {
        let via = self.headers.get("Via")?;
        via.split(';')
            .find_map(|p| p.trim().strip_prefix("branch="))
    }

    /// 从 From 头提取 sip:user@domain 中的 user
    pub fn from_user(&self) -> Option<&str> {
        let from = self.headers.get("From")?;
        extract_sip_user(from)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        self.headers.render(&mut out);
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// 按事务规则从请求构造响应：复制 Via/From/To/Call-ID/CSeq
    pub fn from_request(req: &SipRequest, status_code: u16, reason: impl Into<String>) -> Self {
        let mut resp = Self::new(status_code, reason);
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for v in req.headers.get_all(name) {
                resp.headers.push(name, v);
            }
        }
        resp
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Vec<u8>>) {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, &str)> {
        let v = self.headers.get("CSeq")?;
        let mut parts = v.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        Some((seq, parts.next().unwrap_or("")))
    }

    pub fn branch(&self) -> Option<&str> {
        let via = self.headers.get("Via")?;
        via.split(';')
            .find_map(|p| p.trim().strip_prefix("branch="))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason
        );
        self.headers.render(&mut out);
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从完整数据报/帧解析
    pub fn parse(data: &[u8]) -> Result<Self> {
        let head_end = find_header_end(data)
            .ok_or_else(|| SipError::Parse("missing header terminator".into()))?;
        let head = std::str::from_utf8(&data[..head_end])
            .map_err(|_| SipError::Parse("header is not utf-8".into()))?;

        let mut lines = head.split("\r\n");
        let start_line = lines
            .next()
            .ok_or_else(|| SipError::Parse("empty message".into()))?;
        let headers = Headers::parse_lines(lines);

        let content_length: usize = headers
            .get("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(data.len() - head_end - 4);
        let body_start = head_end + 4;
        let body_end = (body_start + content_length).min(data.len());
        let body = data[body_start..body_end].to_vec();

        if let Some(rest) = start_line.strip_prefix("SIP/") {
            // 状态行: SIP/2.0 200 OK
            let mut parts = rest.splitn(3, ' ');
            let version = format!("SIP/{}", parts.next().unwrap_or("2.0"));
            let status_code = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| SipError::Parse("invalid status code".into()))?;
            let reason = parts.next().unwrap_or("").to_string();
            Ok(SipMessage::Response(SipResponse {
                version,
                status_code,
                reason,
                headers,
                body,
            }))
        } else {
            // 请求行: REGISTER sip:... SIP/2.0
            let parts: Vec<&str> = start_line.split_whitespace().collect();
            if parts.len() != 3 {
                return Err(SipError::Parse(format!("invalid request line: {start_line}")));
            }
            let method = SipMethod::parse(parts[0])
                .ok_or_else(|| SipError::Parse(format!("unknown method: {}", parts[0])))?;
            Ok(SipMessage::Request(SipRequest {
                method,
                uri: parts[1].to_string(),
                version: parts[2].to_string(),
                headers,
                body,
            }))
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            SipMessage::Request(r) => r.encode(),
            SipMessage::Response(r) => r.encode(),
        }
    }
}

/// 头块终止符 \r\n\r\n 的起始偏移
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// 从形如 `<sip:34020000001320000001@3402000000>;tag=xxx` 的头值提取 user
pub fn extract_sip_user(value: &str) -> Option<&str> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let end = rest.find(['@', '>', ';', ':']).unwrap_or(rest.len());
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK1371463273\r\n\
        From: <sip:34020000001320000001@3402000000>;tag=2043466181\r\n\
        To: <sip:34020000001320000001@3402000000>\r\n\
        Call-ID: 1011047669\r\n\
        CSeq: 1 REGISTER\r\n\
        Contact: <sip:34020000001320000001@192.168.1.64:5060>\r\n\
        Max-Forwards: 70\r\n\
        Expires: 3600\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_register() {
        let msg = SipMessage::parse(REGISTER.as_bytes()).unwrap();
        let req = match msg {
            SipMessage::Request(r) => r,
            _ => panic!("expected request"),
        };
        assert_eq!(req.method, SipMethod::Register);
        assert_eq!(req.from_user(), Some("34020000001320000001"));
        assert_eq!(req.cseq(), Some((1, "REGISTER")));
        assert_eq!(req.branch(), Some("z9hG4bK1371463273"));
        assert_eq!(req.headers.get("expires"), Some("3600"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_parse_with_body() {
        let body = "<?xml version=\"1.0\"?><Notify><CmdType>Keepalive</CmdType></Notify>";
        let raw = format!(
            "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\n\
             Call-ID: 77\r\n\
             CSeq: 20 MESSAGE\r\n\
             Content-Type: Application/MANSCDP+xml\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        match msg {
            SipMessage::Request(r) => assert_eq!(r.body, body.as_bytes()),
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn test_duplicate_headers_preserved() {
        let raw = "INVITE sip:x@y SIP/2.0\r\n\
            Via: SIP/2.0/UDP a:5060;branch=z9hG4bKa\r\n\
            Via: SIP/2.0/UDP b:5060;branch=z9hG4bKb\r\n\
            Call-ID: 1\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        let req = match msg {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        };
        let vias: Vec<&str> = req.headers.get_all("Via").collect();
        assert_eq!(vias.len(), 2);
        assert!(vias[0].contains("a:5060"));
        assert!(vias[1].contains("b:5060"));
    }

    #[test]
    fn test_response_from_request_copies_transaction_headers() {
        let msg = SipMessage::parse(REGISTER.as_bytes()).unwrap();
        let req = match msg {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        };
        let resp = SipResponse::from_request(&req, 401, "Unauthorized");
        assert_eq!(resp.call_id(), Some("1011047669"));
        assert_eq!(resp.cseq(), Some((1, "REGISTER")));
        let encoded = String::from_utf8(resp.encode()).unwrap();
        assert!(encoded.starts_with("SIP/2.0 401 Unauthorized\r\n"));
        assert!(encoded.contains("Via: SIP/2.0/UDP 192.168.1.64:5060"));
        assert!(encoded.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_parse_response_roundtrip() {
        let mut resp = SipResponse::new(200, "OK");
        resp.headers.push("Call-ID", "42");
        resp.headers.push("CSeq", "3 MESSAGE");
        let parsed = SipMessage::parse(&resp.encode()).unwrap();
        match parsed {
            SipMessage::Response(r) => {
                assert_eq!(r.status_code, 200);
                assert_eq!(r.reason, "OK");
                assert_eq!(r.call_id(), Some("42"));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_extract_sip_user() {
        assert_eq!(
            extract_sip_user("<sip:34020000001320000001@3402000000>;tag=1"),
            Some("34020000001320000001")
        );
        assert_eq!(extract_sip_user("sip:1678@80.79.5.134"), Some("1678"));
        assert_eq!(extract_sip_user("no uri here"), None);
    }
}
