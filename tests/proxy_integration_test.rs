//! 代理端到端测试
//!
//! 在回环地址上启动代理和一个按脚本回复的模拟游戏服务器

use a2s_cache::a2s::build_request;
use a2s_cache::cache::CacheKind;
use a2s_cache::{Config, Proxy, ProxyState};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const CODE: [u8; 4] = [0x0A, 0x0B, 0x0C, 0x0D];
const SENTINEL: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const INFO_QUERY: &[u8] = b"\xFF\xFF\xFF\xFFTSource Engine Query\0";
const INFO_REPLY: &[u8] = b"\xFF\xFF\xFF\xFFI\x11Integration\0cp_badlands\0tf\0";

/// 模拟游戏服务器
struct GameServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl GameServer {
    async fn spawn<F>(delay: Duration, respond: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                let request = buf[..len].to_vec();
                recorded.lock().unwrap().push(request.clone());
                tokio::time::sleep(delay).await;
                for reply in respond(&request) {
                    let _ = socket.send_to(&reply, src).await;
                }
            }
        });

        Self { addr, requests }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// 启动代理，返回监听地址和共享状态
async fn start_proxy(backend: SocketAddr, tweak: impl FnOnce(&mut Config)) -> (SocketAddr, Arc<ProxyState>) {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.server.backend_addr = backend;
    tweak(&mut config);

    let proxy = Proxy::bind(config).await.unwrap();
    let addr = proxy.local_addr().unwrap();
    let state = proxy.state();
    tokio::spawn(proxy.run());

    (addr, state)
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv(socket: &UdpSocket, wait: Duration) -> Option<Vec<u8>> {
    let mut buf = [0u8; 2048];
    match timeout(wait, socket.recv(&mut buf)).await {
        Ok(Ok(len)) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

fn fragment(id: u32, total: u8, number: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![0xFE, 0xFF, 0xFF, 0xFF];
    packet.extend_from_slice(&id.to_le_bytes());
    packet.push(total);
    packet.push(number);
    packet.extend_from_slice(&1248u16.to_le_bytes());
    if number == 0 {
        packet.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x44]);
    }
    packet.extend_from_slice(body);
    packet
}

#[tokio::test]
async fn test_info_cached_for_second_client() {
    let server = GameServer::spawn(Duration::ZERO, |_| vec![INFO_REPLY.to_vec()]).await;
    let (proxy, _state) = start_proxy(server.addr, |_| {}).await;

    let first = client().await;
    first.send_to(INFO_QUERY, proxy).await.unwrap();
    let reply = recv(&first, Duration::from_secs(2)).await.expect("no info reply");
    assert_eq!(reply, INFO_REPLY);

    let second = client().await;
    second.send_to(INFO_QUERY, proxy).await.unwrap();
    let reply = recv(&second, Duration::from_secs(2)).await.expect("no cached info reply");
    assert_eq!(reply, INFO_REPLY);

    // 有效期内第二个客户端没有触发后端请求
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn test_player_list_challenge_round_trip() {
    let fragments = vec![
        fragment(77, 3, 0, b"alice"),
        fragment(77, 3, 1, b"bob"),
        fragment(77, 3, 2, b"carol"),
    ];
    let replies = fragments.clone();
    let server = GameServer::spawn(Duration::ZERO, move |request| {
        if request[5..9] == SENTINEL {
            vec![build_request(0x41, CODE).to_vec()]
        } else if request == &build_request(0x55, CODE)[..] {
            replies.clone()
        } else {
            Vec::new()
        }
    })
    .await;
    let (proxy, state) = start_proxy(server.addr, |_| {}).await;

    let player = client().await;

    // 客户端先用默认 challenge 请求，拿到代理持有的 challenge
    player.send_to(&build_request(0x55, SENTINEL), proxy).await.unwrap();
    let reply = recv(&player, Duration::from_secs(2)).await.expect("no challenge reply");
    assert_eq!(reply, build_request(0x41, CODE).to_vec());

    player.send_to(&build_request(0x55, CODE), proxy).await.unwrap();
    for expected in &fragments {
        let packet = recv(&player, Duration::from_secs(2)).await.expect("missing fragment");
        assert_eq!(&packet, expected);
    }
    assert!(recv(&player, Duration::from_millis(200)).await.is_none());

    let stats = state.stats.peek();
    assert_eq!(stats.other_issued, 2);
    assert_eq!(stats.other_answered, 1);
}

#[tokio::test]
async fn test_concurrent_info_requests_single_refresh() {
    let server = GameServer::spawn(Duration::from_millis(300), |_| vec![INFO_REPLY.to_vec()]).await;
    let (proxy, _state) = start_proxy(server.addr, |_| {}).await;

    let mut clients = Vec::new();
    for _ in 0..8 {
        let socket = client().await;
        socket.send_to(INFO_QUERY, proxy).await.unwrap();
        clients.push(socket);
    }

    // 等第一次刷新完成
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(server.request_count(), 1);

    let late = client().await;
    late.send_to(INFO_QUERY, proxy).await.unwrap();
    assert_eq!(
        recv(&late, Duration::from_secs(2)).await.as_deref(),
        Some(INFO_REPLY)
    );
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn test_full_queue_drops_requests() {
    let server = GameServer::spawn(Duration::from_millis(500), |_| vec![INFO_REPLY.to_vec()]).await;
    let (proxy, state) = start_proxy(server.addr, |config| {
        config.dispatcher.workers = 1;
        config.dispatcher.queue_depth = 1;
    })
    .await;

    let flood = client().await;
    for _ in 0..20 {
        flood.send_to(INFO_QUERY, proxy).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(state.stats.peek().dropped > 0);
}

#[tokio::test]
async fn test_unknown_queries_get_no_reply() {
    let server = GameServer::spawn(Duration::ZERO, |_| vec![INFO_REPLY.to_vec()]).await;
    let (proxy, state) = start_proxy(server.addr, |_| {}).await;

    let socket = client().await;
    socket.send_to(b"\xFF\xFF\xFF\xFFq", proxy).await.unwrap();
    socket.send_to(b"garbage", proxy).await.unwrap();

    assert!(recv(&socket, Duration::from_millis(300)).await.is_none());
    assert_eq!(server.request_count(), 0);
    assert_eq!(state.stats.peek().info_issued, 0);
}

#[tokio::test]
async fn test_dead_backend_does_not_stall_cached_info() {
    // 后端从不回复
    let server = GameServer::spawn(Duration::ZERO, |_| Vec::new()).await;
    let (proxy, state) = start_proxy(server.addr, |config| {
        config.dispatcher.workers = 8;
        config.backend.recv_timeout_ms = 200;
    })
    .await;
    state
        .cache
        .slot(CacheKind::Info)
        .replace(vec![Bytes::from_static(INFO_REPLY)], tokio::time::Instant::now())
        .await;

    let flood = client().await;
    for _ in 0..16 {
        flood.send_to(&build_request(0x55, SENTINEL), proxy).await.unwrap();
    }

    let started = std::time::Instant::now();
    let info = client().await;
    info.send_to(INFO_QUERY, proxy).await.unwrap();
    let reply = recv(&info, Duration::from_secs(2)).await.expect("no cached info reply");
    assert_eq!(reply, INFO_REPLY);
    assert!(started.elapsed() < Duration::from_secs(1));

    // 每个 player 请求都收到占位值 challenge
    let mut challenges = 0;
    while let Some(reply) = recv(&flood, Duration::from_millis(500)).await {
        assert_eq!(reply, build_request(0x41, SENTINEL).to_vec());
        challenges += 1;
    }
    assert_eq!(challenges, 16);
}
