//! 请求分发
//!
//! 监听循环是公共 socket 的唯一读者。每个数据报复制成独立的请求放入有界队列，
//! 由固定数量的 worker 并发处理；队列满时直接丢弃。
use crate::a2s::{classify_request, RequestKind, MAX_PACKET_SIZE};
use crate::cache::{CacheKind, LockTimeout, RefreshOutcome};
use crate::config::DispatcherConfig;
use crate::proxy::ProxyState;
use anyhow::{bail, Result};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info};

/// 一个客户端请求
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub source: SocketAddr,
    pub payload: Bytes,
}

/// 请求处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 已发送全部缓存数据报
    Answered { packets: usize },
    /// 已回复 challenge
    ChallengeIssued,
    /// 缓存为空 (后端从未成功响应)，没有回复
    NoCachedData(CacheKind),
    /// 无法识别的请求，没有回复
    Ignored,
}

/// 回复客户端失败
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to send reply to {addr} ({sent}/{total} packets sent): {source}")]
    Send {
        addr: SocketAddr,
        sent: usize,
        total: usize,
        #[source]
        source: io::Error,
    },

    #[error("Timed out sending reply to {addr} ({sent}/{total} packets sent)")]
    SendTimeout {
        addr: SocketAddr,
        sent: usize,
        total: usize,
    },

    #[error(transparent)]
    CacheLock(#[from] LockTimeout),
}

/// 请求分发器
pub struct Dispatcher {
    state: Arc<ProxyState>,
    socket: Arc<UdpSocket>,
    workers: usize,
    queue_depth: usize,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(state: Arc<ProxyState>, socket: Arc<UdpSocket>, config: &DispatcherConfig) -> Self {
        Self {
            state,
            socket,
            workers: config.workers.max(1),
            queue_depth: config.queue_depth.max(1),
            send_timeout: config.send_timeout(),
        }
    }

    /// 启动 worker 并运行监听循环
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<IncomingRequest>(self.queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        for id in 0..self.workers {
            let dispatcher = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                dispatcher.worker(id, rx).await;
            });
        }

        info!(
            "Dispatcher started: workers={}, queue_depth={}",
            self.workers, self.queue_depth
        );

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (len, source) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("Error receiving client datagram: {}", e);
                    continue;
                }
            };

            let request = IncomingRequest {
                source,
                payload: Bytes::copy_from_slice(&buf[..len]),
            };

            match tx.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(request)) => {
                    self.state.stats.dropped();
                    debug!("Request queue full, dropping datagram from {}", request.source);
                }
                Err(TrySendError::Closed(_)) => {
                    error!("All dispatcher workers have stopped");
                    bail!("request queue closed");
                }
            }
        }
    }

    async fn worker(&self, id: usize, queue: Arc<Mutex<mpsc::Receiver<IncomingRequest>>>) {
        loop {
            let request = queue.lock().await.recv().await;
            let Some(request) = request else {
                debug!("Worker {} exiting", id);
                break;
            };

            match self.handle(&request).await {
                Ok(outcome) => debug!("Worker {}: {} -> {:?}", id, request.source, outcome),
                Err(e) => debug!("Worker {}: request from {} failed: {}", id, request.source, e),
            }
        }
    }

    /// 处理单个请求
    pub async fn handle(&self, request: &IncomingRequest) -> Result<Outcome, DispatchError> {
        let Some(kind) = classify_request(&request.payload) else {
            return Ok(Outcome::Ignored);
        };
        let stats = &self.state.stats;
        let backend = &self.state.backend;

        match kind {
            RequestKind::Info => {
                stats.info_issued();
                let outcome = self.serve_cached(CacheKind::Info, request.source).await?;
                if matches!(outcome, Outcome::Answered { .. }) {
                    stats.info_answered();
                }
                Ok(outcome)
            }
            RequestKind::Players | RequestKind::Rules => {
                stats.other_issued();
                if !backend.challenge_is_valid(&request.payload).await {
                    // 告诉客户端应该使用的 challenge
                    let reply = backend.challenge_reply().await;
                    self.send_all(request.source, &[reply]).await?;
                    return Ok(Outcome::ChallengeIssued);
                }

                let cache_kind = if kind == RequestKind::Players {
                    CacheKind::Players
                } else {
                    CacheKind::Rules
                };
                let outcome = self.serve_cached(cache_kind, request.source).await?;
                if matches!(outcome, Outcome::Answered { .. }) {
                    stats.other_answered();
                }
                Ok(outcome)
            }
            RequestKind::Challenge => {
                stats.other_issued();
                let reply = backend.challenge_reply().await;
                self.send_all(request.source, &[reply]).await?;
                stats.other_answered();
                Ok(Outcome::ChallengeIssued)
            }
        }
    }

    /// 需要时刷新缓存，然后按顺序发送缓存的全部数据报
    async fn serve_cached(&self, kind: CacheKind, dest: SocketAddr) -> Result<Outcome, DispatchError> {
        let backend = &self.state.backend;
        let refresh = self
            .state
            .cache
            .refresh_if_stale(kind, |kind| backend.query(kind))
            .await;
        match &refresh {
            RefreshOutcome::Fresh => {}
            RefreshOutcome::Refreshed => debug!("Refreshed {} cache from {}", kind, backend.addr()),
            RefreshOutcome::Busy => debug!("Serving {} cache while another refresh is in flight", kind),
            RefreshOutcome::Failed(e) => debug!("Serving previous {} cache after failed refresh: {}", kind, e),
        }

        let packets = self.state.cache.snapshot(kind).await?;
        if packets.is_empty() {
            return Ok(Outcome::NoCachedData(kind));
        }

        self.send_all(dest, &packets).await?;
        Ok(Outcome::Answered {
            packets: packets.len(),
        })
    }

    /// 依次发送；任一失败即放弃剩余数据报
    async fn send_all<P: AsRef<[u8]>>(&self, dest: SocketAddr, packets: &[P]) -> Result<(), DispatchError> {
        let total = packets.len();
        for (sent, packet) in packets.iter().enumerate() {
            match timeout(self.send_timeout, self.socket.send_to(packet.as_ref(), dest)).await {
                Ok(Ok(_)) => {}
                Ok(Err(source)) => {
                    return Err(DispatchError::Send {
                        addr: dest,
                        sent,
                        total,
                        source,
                    })
                }
                Err(_) => {
                    return Err(DispatchError::SendTimeout {
                        addr: dest,
                        sent,
                        total,
                    })
                }
            }
        }
        Ok(())
    }
}
