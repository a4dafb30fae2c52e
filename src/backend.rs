//! 后端游戏服务器查询客户端
//!
//! 所有后端流量走同一个已 connect 的 UDP socket。每次请求/响应交换都持有交换锁，
//! 不同类型的并发刷新不会收到彼此的响应。
use crate::a2s::packet::{build_info_request, build_request, parse_backend_packet, parse_multi_header};
use crate::a2s::{A2sError, BackendPacket, MultiPacketHeader, RequestKind, CHALLENGE_SENTINEL, MAX_PACKET_SIZE};
use crate::cache::CacheKind;
use crate::challenge::ChallengeManager;
use crate::config::BackendConfig;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 单次交换前最多丢弃的残留数据报数量
const MAX_STALE_DATAGRAMS: usize = 64;

/// 后端查询错误
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to send query to backend: {0}")]
    Send(#[source] io::Error),

    #[error("Timed out sending query to backend after {0:?}")]
    SendTimeout(Duration),

    #[error("Failed to receive from backend: {0}")]
    Receive(#[source] io::Error),

    #[error("Timed out waiting for backend after {0:?}")]
    ReceiveTimeout(Duration),

    #[error("Unhandled backend response: {0}")]
    Malformed(#[from] A2sError),

    /// 后端不断下发新的 challenge
    #[error("Backend issued a new challenge {0} times in a row")]
    ChallengeLoop(u32),

    /// 多包响应中途失败
    #[error("Multi-packet response incomplete ({received}/{total} packets): {source}")]
    Incomplete {
        received: usize,
        total: usize,
        #[source]
        source: Box<BackendError>,
    },
}

/// 后端返回的完整响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    /// 响应自身标记的类型
    pub kind: CacheKind,
    /// 原始数据报，按接收顺序
    pub packets: Vec<Bytes>,
}

/// 后端查询客户端
pub struct BackendClient {
    socket: UdpSocket,
    addr: SocketAddr,
    /// 请求/响应交换锁
    exchange: Mutex<()>,
    /// 同一时刻最多一个 challenge 获取
    challenge_fetch: Mutex<()>,
    challenge: ChallengeManager,
    challenge_wait: Duration,
    send_timeout: Duration,
    recv_timeout: Duration,
    max_challenge_retries: u32,
}

impl BackendClient {
    /// 绑定与后端同一地址族的本地端口并 connect 到后端
    pub async fn connect(addr: SocketAddr, config: &BackendConfig) -> io::Result<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        info!(
            "Backend client ready: server={}, local={}, send_timeout={:?}, recv_timeout={:?}",
            addr,
            socket.local_addr()?,
            config.send_timeout(),
            config.recv_timeout()
        );

        Ok(Self {
            socket,
            addr,
            exchange: Mutex::new(()),
            challenge_fetch: Mutex::new(()),
            challenge: ChallengeManager::new(),
            challenge_wait: config.challenge_wait(),
            send_timeout: config.send_timeout(),
            recv_timeout: config.recv_timeout(),
            max_challenge_retries: config.max_challenge_retries,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn challenge(&self) -> &ChallengeManager {
        &self.challenge
    }

    /// 获取当前 challenge，仍是占位值时向后端请求
    ///
    /// 失败时返回原值 (占位值)，下次调用会重试。
    ///
    /// 已有获取在进行中时不等待，直接返回当前值；交换锁最多等待 `challenge_wait`。
    /// 因此最长阻塞 `challenge_wait` 加一个发送超时和一个接收超时。
    pub async fn get_challenge(&self) -> [u8; 4] {
        if !self.challenge.is_unknown() {
            return self.challenge.current();
        }

        let Ok(_fetch) = self.challenge_fetch.try_lock() else {
            debug!("Challenge fetch already in flight, using current code");
            return self.challenge.current();
        };

        let _exchange = match timeout(self.challenge_wait, self.exchange.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                debug!(
                    "Backend busy for {:?}, skipping challenge fetch",
                    self.challenge_wait
                );
                return self.challenge.current();
            }
        };
        self.fetch_challenge().await
    }

    /// 检查客户端请求中的 challenge
    pub async fn challenge_is_valid(&self, request: &[u8]) -> bool {
        self.get_challenge().await;
        self.challenge.is_valid(request)
    }

    /// 构造发给客户端的 challenge 响应
    pub async fn challenge_reply(&self) -> [u8; 9] {
        self.get_challenge().await;
        self.challenge.challenge_reply()
    }

    /// 调用方需持有交换锁
    async fn fetch_challenge(&self) -> [u8; 4] {
        // 等锁期间可能已被其它请求获取
        if !self.challenge.is_unknown() {
            return self.challenge.current();
        }

        self.drain_stale();
        let request = build_request(RequestKind::Players.as_byte(), CHALLENGE_SENTINEL);
        if let Err(e) = self.send(&request).await {
            debug!("Cannot request challenge from {}: {}", self.addr, e);
            return self.challenge.current();
        }

        let packet = match self.recv_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                debug!("No challenge from {}: {}", self.addr, e);
                return self.challenge.current();
            }
        };

        match parse_backend_packet(&packet) {
            Ok(BackendPacket::Challenge(code)) => {
                self.challenge.renew(code);
                code
            }
            other => {
                debug!("Unexpected reply to challenge request: {:?}", other);
                self.challenge.current()
            }
        }
    }

    /// 向后端查询并收齐完整响应
    ///
    /// 后端下发新 challenge 时更新并用新值重发，最多 `max_challenge_retries` 次。
    pub async fn query(&self, kind: CacheKind) -> Result<BackendResponse, BackendError> {
        let _exchange = self.exchange.lock().await;
        let mut renewals = 0;
        let mut info_challenge = None;

        loop {
            let request = match kind {
                // A2S_INFO 第一次不带 challenge
                CacheKind::Info => build_info_request(info_challenge),
                _ => {
                    self.fetch_challenge().await;
                    self.challenge.build_request(kind.request_kind().as_byte()).to_vec()
                }
            };

            self.drain_stale();
            self.send(&request).await?;
            let first = self.recv_packet().await?;

            match parse_backend_packet(&first)? {
                BackendPacket::Challenge(code) => {
                    self.challenge.renew(code);
                    if renewals >= self.max_challenge_retries {
                        return Err(BackendError::ChallengeLoop(renewals + 1));
                    }
                    renewals += 1;
                    info_challenge = Some(code);
                    debug!("Backend renewed challenge during {} query, retrying", kind);
                }
                BackendPacket::Single(tag) => {
                    let kind = CacheKind::from_response(tag)
                        .ok_or(A2sError::UnhandledResponse(tag.as_byte()))?;
                    return Ok(BackendResponse {
                        kind,
                        packets: vec![first],
                    });
                }
                BackendPacket::Multi { header, kind: tag } => {
                    let kind = CacheKind::from_response(tag)
                        .ok_or(A2sError::UnhandledResponse(tag.as_byte()))?;
                    let packets = self.collect_fragments(header, first).await?;
                    return Ok(BackendResponse { kind, packets });
                }
            }
        }
    }

    /// 按接收顺序收齐多包响应的剩余分片
    async fn collect_fragments(
        &self,
        header: MultiPacketHeader,
        first: Bytes,
    ) -> Result<Vec<Bytes>, BackendError> {
        let total = header.total as usize;
        let mut packets = Vec::with_capacity(total);
        packets.push(first);

        while packets.len() < total {
            let next = self
                .recv_packet()
                .await
                .and_then(|packet| {
                    let fragment = parse_multi_header(&packet)?;
                    if fragment.id != header.id {
                        return Err(A2sError::PacketIdMismatch {
                            expected: header.id,
                            actual: fragment.id,
                        }
                        .into());
                    }
                    Ok(packet)
                })
                .map_err(|e| BackendError::Incomplete {
                    received: packets.len(),
                    total,
                    source: Box::new(e),
                })?;
            packets.push(next);
        }

        debug!("Reassembled {} packet response (id={:#010x})", total, header.id);
        Ok(packets)
    }

    async fn send(&self, packet: &[u8]) -> Result<(), BackendError> {
        timeout(self.send_timeout, self.socket.send(packet))
            .await
            .map_err(|_| BackendError::SendTimeout(self.send_timeout))?
            .map_err(BackendError::Send)?;
        Ok(())
    }

    async fn recv_packet(&self) -> Result<Bytes, BackendError> {
        let mut buf = BytesMut::zeroed(MAX_PACKET_SIZE);
        let len = timeout(self.recv_timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| BackendError::ReceiveTimeout(self.recv_timeout))?
            .map_err(BackendError::Receive)?;
        buf.truncate(len);
        Ok(buf.freeze())
    }

    /// 丢弃之前超时交换遗留的迟到数据报
    fn drain_stale(&self) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut drained = 0;
        while drained < MAX_STALE_DATAGRAMS && self.socket.try_recv(&mut buf).is_ok() {
            drained += 1;
        }
        if drained > 0 {
            warn!("Discarded {} late datagram(s) from backend {}", drained, self.addr);
        }
    }
}
