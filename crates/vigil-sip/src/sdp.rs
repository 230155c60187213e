// GB28181 点播 SDP 构造
// 媒体行固定 96/PS 载荷，附 y=(SSRC) 与 f= 扩展字段

use std::fmt;

/// 媒体传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpTransport {
    Udp,
    /// 平台收流，被动等待设备连接
    TcpPassive,
    /// 平台主动向设备发起 TCP 连接
    TcpActive,
}

/// GB28181 实时点播 SDP offer
#[derive(Debug, Clone)]
pub struct SdpOffer {
    /// o= 行的会话 owner（平台/通道国标编号）
    pub owner: String,
    /// 收流 IP
    pub ip: String,
    /// 收流端口
    pub port: u16,
    /// 10 位十进制 SSRC
    pub ssrc: String,
    pub transport: SdpTransport,
}

impl fmt::Display for SdpOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v=0\r")?;
        writeln!(f, "o={} 0 0 IN IP4 {}\r", self.owner, self.ip)?;
        writeln!(f, "s=Play\r")?;
        writeln!(f, "c=IN IP4 {}\r", self.ip)?;
        writeln!(f, "t=0 0\r")?;
        match self.transport {
            SdpTransport::Udp => {
                writeln!(f, "m=video {} RTP/AVP 96\r", self.port)?;
            }
            SdpTransport::TcpPassive | SdpTransport::TcpActive => {
                writeln!(f, "m=video {} TCP/RTP/AVP 96\r", self.port)?;
            }
        }
        writeln!(f, "a=recvonly\r")?;
        writeln!(f, "a=rtpmap:96 PS/90000\r")?;
        match self.transport {
            SdpTransport::TcpPassive => {
                writeln!(f, "a=setup:passive\r")?;
                writeln!(f, "a=connection:new\r")?;
            }
            SdpTransport::TcpActive => {
                writeln!(f, "a=setup:active\r")?;
                writeln!(f, "a=connection:new\r")?;
            }
            SdpTransport::Udp => {}
        }
        writeln!(f, "y={}\r", self.ssrc)?;
        writeln!(f, "f=\r")?;
        Ok(())
    }
}

/// 从应答 SDP 提取 y= 行的 SSRC
pub fn parse_ssrc(sdp: &str) -> Option<&str> {
    sdp.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("y="))
        .map(str::trim)
}

/// 从应答 SDP 提取媒体端口（m=video 行第二个字段）
pub fn parse_media_port(sdp: &str) -> Option<u16> {
    sdp.lines()
        .map(str::trim)
        .find(|l| l.starts_with("m=video"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|p| p.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_offer_shape() {
        let offer = SdpOffer {
            owner: "34020000001310000001".into(),
            ip: "192.168.1.10".into(),
            port: 30000,
            ssrc: "0000000001".into(),
            transport: SdpTransport::Udp,
        };
        let s = offer.to_string();
        assert!(s.contains("m=video 30000 RTP/AVP 96\r\n"));
        assert!(s.contains("a=rtpmap:96 PS/90000\r\n"));
        assert!(s.contains("y=0000000001\r\n"));
        assert!(s.contains("f=\r\n"));
        assert!(!s.contains("a=setup"));
    }

    #[test]
    fn test_tcp_passive_offer() {
        let offer = SdpOffer {
            owner: "34020000001310000001".into(),
            ip: "192.168.1.10".into(),
            port: 30001,
            ssrc: "0000000002".into(),
            transport: SdpTransport::TcpPassive,
        };
        let s = offer.to_string();
        assert!(s.contains("m=video 30001 TCP/RTP/AVP 96\r\n"));
        assert!(s.contains("a=setup:passive\r\n"));
        assert!(s.contains("a=connection:new\r\n"));
    }

    #[test]
    fn test_parse_answer_fields() {
        let answer = "v=0\r\no=34020000001320000001 0 0 IN IP4 192.168.1.64\r\n\
            s=Play\r\nc=IN IP4 192.168.1.64\r\nt=0 0\r\n\
            m=video 62000 RTP/AVP 96\r\na=sendonly\r\na=rtpmap:96 PS/90000\r\ny=0000000001\r\n";
        assert_eq!(parse_ssrc(answer), Some("0000000001"));
        assert_eq!(parse_media_port(answer), Some(62000));
    }
}
