// SIP 传输层：UDP 数据报（一报一消息）与 TCP 流（按 Content-Length 成帧）
// 入站消息统一投递到 mpsc 通道，响应沿入口连接原路返回

use crate::message::{find_header_end, SipMessage};
use crate::{Result, SipError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

/// 一条入站 SIP 消息及其来源
pub struct Inbound {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub conn: SipConnection,
}

/// 可应答的连接句柄
#[derive(Clone)]
pub enum SipConnection {
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    Tcp {
        writer: Arc<Mutex<OwnedWriteHalf>>,
        peer: SocketAddr,
    },
}

impl SipConnection {
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        match self {
            SipConnection::Udp { socket, peer } => {
                socket.send_to(data, peer).await?;
            }
            SipConnection::Tcp { writer, .. } => {
                writer.lock().await.write_all(data).await?;
            }
        }
        Ok(())
    }

    pub fn peer(&self) -> SocketAddr {
        match self {
            SipConnection::Udp { peer, .. } => *peer,
            SipConnection::Tcp { peer, .. } => *peer,
        }
    }

    pub fn network(&self) -> &'static str {
        match self {
            SipConnection::Udp { .. } => "udp",
            SipConnection::Tcp { .. } => "tcp",
        }
    }
}

/// SIP 监听器，同一端口同时服务 UDP 与 TCP
pub struct SipTransport {
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
}

impl SipTransport {
    pub async fn bind(addr: &str) -> Result<Self> {
        let udp = UdpSocket::bind(addr).await?;
        let tcp = TcpListener::bind(addr).await?;
        tracing::info!("SIP transport listening on {} (udp+tcp)", addr);
        Ok(Self {
            udp: Arc::new(udp),
            tcp,
        })
    }

    /// 启动接收循环，返回入站消息通道
    pub fn run(self) -> mpsc::Receiver<Inbound> {
        let (tx, rx) = mpsc::channel(256);

        let udp = self.udp.clone();
        let udp_tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match udp.recv_from(&mut buf).await {
                    Ok((len, peer)) => {
                        match SipMessage::parse(&buf[..len]) {
                            Ok(message) => {
                                let inbound = Inbound {
                                    message,
                                    source: peer,
                                    conn: SipConnection::Udp {
                                        socket: udp.clone(),
                                        peer,
                                    },
                                };
                                if udp_tx.send(inbound).await.is_err() {
                                    return;
                                }
                            }
                            // 畸形报文：丢弃并记录
                            Err(e) => warn!("drop malformed SIP datagram from {peer}: {e}"),
                        }
                    }
                    Err(e) => error!("udp recv error: {e}"),
                }
            }
        });

        let tcp = self.tcp;
        tokio::spawn(async move {
            loop {
                match tcp.accept().await {
                    Ok((stream, peer)) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_tcp(stream, peer, tx).await {
                                debug!("tcp connection {peer} closed: {e}");
                            }
                        });
                    }
                    Err(e) => error!("tcp accept error: {e}"),
                }
            }
        });

        rx
    }
}

/// 单条 TCP 连接的读循环：积累字节，按头块 + Content-Length 切帧
async fn serve_tcp(stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<Inbound>) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        while let Some(frame) = take_frame(&mut buf)? {
            match SipMessage::parse(&frame) {
                Ok(message) => {
                    let inbound = Inbound {
                        message,
                        source: peer,
                        conn: SipConnection::Tcp {
                            writer: writer.clone(),
                            peer,
                        },
                    };
                    if tx.send(inbound).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    // TCP 上的畸形帧无法重新同步，只能断开
                    return Err(SipError::Parse(format!("malformed frame from {peer}: {e}")));
                }
            }
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(SipError::ConnectionClosed(peer.to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// 从缓冲中切出一个完整 SIP 帧，长度不足返回 None
fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    let Some(head_end) = find_header_end(buf) else {
        return Ok(None);
    };
    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| SipError::Parse("header is not utf-8".into()))?;
    let content_length: usize = head
        .split("\r\n")
        .find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case("Content-Length").then(|| v.trim().parse().ok())?
        })
        .unwrap_or(0);

    let total = head_end + 4 + content_length;
    if buf.len() < total {
        return Ok(None);
    }
    let frame = buf[..total].to_vec();
    buf.drain(..total);
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_frame_incomplete() {
        let mut buf = b"MESSAGE sip:x SIP/2.0\r\nContent-Length: 10\r\n\r\n12345".to_vec();
        assert!(take_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"67890");
        let frame = take_frame(&mut buf).unwrap().unwrap();
        assert!(frame.ends_with(b"1234567890"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_frame_two_messages() {
        let one = b"OPTIONS sip:x SIP/2.0\r\nCall-ID: 1\r\nContent-Length: 0\r\n\r\n";
        let mut buf = Vec::new();
        buf.extend_from_slice(one);
        buf.extend_from_slice(one);
        assert!(take_frame(&mut buf).unwrap().is_some());
        assert!(take_frame(&mut buf).unwrap().is_some());
        assert!(take_frame(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_udp_inbound_roundtrip() {
        let transport = SipTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.udp.local_addr().unwrap();
        let mut rx = transport.run();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let raw = b"OPTIONS sip:ping SIP/2.0\r\nCall-ID: 9\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
        client.send_to(raw, addr).await.unwrap();

        let inbound = rx.recv().await.unwrap();
        match inbound.message {
            SipMessage::Request(req) => assert_eq!(req.method, crate::SipMethod::Options),
            _ => panic!("expected request"),
        }
        assert_eq!(inbound.conn.network(), "udp");
    }
}
