//! 代理启动与共享状态
use crate::backend::BackendClient;
use crate::cache::CacheStore;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::stats::{spawn_reporter, Stats};
use anyhow::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// 启动失败
#[derive(Error, Debug)]
pub enum BindError {
    #[error("Cannot bind proxy port {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Cannot open backend socket for {addr}: {source}")]
    Backend {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// worker 之间共享的状态：三个缓存槽、后端客户端 (含 challenge) 和计数器
pub struct ProxyState {
    pub cache: CacheStore,
    pub backend: BackendClient,
    pub stats: Arc<Stats>,
}

impl ProxyState {
    pub async fn connect(config: &Config) -> io::Result<Self> {
        let backend = BackendClient::connect(config.server.backend_addr, &config.backend).await?;
        Ok(Self {
            cache: CacheStore::new(&config.cache),
            backend,
            stats: Arc::new(Stats::new()),
        })
    }
}

/// 已绑定端口、尚未开始服务的代理
pub struct Proxy {
    config: Config,
    state: Arc<ProxyState>,
    socket: Arc<UdpSocket>,
}

impl Proxy {
    /// 绑定对外端口并连接后端
    pub async fn bind(config: Config) -> std::result::Result<Self, BindError> {
        let listen_addr = config.server.listen_addr;
        let socket = bind_public_socket(listen_addr, config.server.recv_buffer_size).map_err(
            |source| BindError::Listen {
                addr: listen_addr,
                source,
            },
        )?;

        let backend_addr = config.server.backend_addr;
        let state = ProxyState::connect(&config)
            .await
            .map_err(|source| BindError::Backend {
                addr: backend_addr,
                source,
            })?;

        info!(
            "Proxy listening on {}, caching {} (ttl info={:?}, players={:?}, rules={:?})",
            socket.local_addr().unwrap_or(listen_addr),
            backend_addr,
            config.cache.info_ttl(),
            config.cache.players_ttl(),
            config.cache.rules_ttl()
        );

        Ok(Self {
            config,
            state: Arc::new(state),
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn state(&self) -> Arc<ProxyState> {
        self.state.clone()
    }

    /// 启动统计任务和分发器，直到分发器退出
    pub async fn run(self) -> Result<()> {
        let reporter = spawn_reporter(self.state.stats.clone(), self.config.stats.interval());

        let dispatcher = Arc::new(Dispatcher::new(
            self.state.clone(),
            self.socket.clone(),
            &self.config.dispatcher,
        ));
        let result = dispatcher.run().await;

        reporter.abort();
        result
    }
}

/// 创建对外监听的 UDP socket
///
/// 通过 socket2 设置接收缓冲区，突发查询时内核不会过早丢包。
fn bind_public_socket(addr: SocketAddr, recv_buffer_size: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_size) {
        warn!("Cannot set receive buffer to {} bytes: {}", recv_buffer_size, e);
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}
