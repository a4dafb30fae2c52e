//! 查询结果缓存
//!
//! info / players / rules 三个缓存槽相互独立，每个槽有自己的有效期、读写锁和刷新锁。
//! 刷新锁保证同一类型同时最多只有一个后端请求；拿不到刷新锁的请求直接使用旧缓存。
use crate::a2s::{RequestKind, ResponseKind};
use crate::backend::{BackendError, BackendResponse};
use crate::config::CacheConfig;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// 缓存类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Info,
    Players,
    Rules,
}

impl CacheKind {
    /// 刷新该缓存时发给后端的请求类型
    pub fn request_kind(self) -> RequestKind {
        match self {
            CacheKind::Info => RequestKind::Info,
            CacheKind::Players => RequestKind::Players,
            CacheKind::Rules => RequestKind::Rules,
        }
    }

    pub fn from_request(kind: RequestKind) -> Option<Self> {
        match kind {
            RequestKind::Info => Some(CacheKind::Info),
            RequestKind::Players => Some(CacheKind::Players),
            RequestKind::Rules => Some(CacheKind::Rules),
            RequestKind::Challenge => None,
        }
    }

    pub fn from_response(kind: ResponseKind) -> Option<Self> {
        match kind {
            ResponseKind::Info => Some(CacheKind::Info),
            ResponseKind::Players => Some(CacheKind::Players),
            ResponseKind::Rules => Some(CacheKind::Rules),
            ResponseKind::Challenge => None,
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKind::Info => write!(f, "info"),
            CacheKind::Players => write!(f, "players"),
            CacheKind::Rules => write!(f, "rules"),
        }
    }
}

/// 完整的缓存响应，按接收顺序保存的原始数据报
pub type CachedResponse = Vec<Bytes>;

/// 刷新失败原因
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// 后端返回了其它类型的响应 (已写入对应的缓存槽)
    #[error("Backend answered a {expected} refresh with a {actual} response")]
    Mismatch { expected: CacheKind, actual: CacheKind },
}

/// `refresh_if_stale` 的结果
#[derive(Debug)]
pub enum RefreshOutcome {
    /// 缓存仍在有效期内
    Fresh,
    /// 已从后端刷新
    Refreshed,
    /// 其它 worker 正在刷新，使用旧缓存
    Busy,
    /// 刷新失败，旧缓存保持不变
    Failed(RefreshError),
}

/// 等待读锁超时
#[derive(Error, Debug)]
#[error("Timed out after {waited:?} waiting for the {kind} cache lock")]
pub struct LockTimeout {
    pub kind: CacheKind,
    pub waited: Duration,
}

struct SlotState {
    packets: CachedResponse,
    refreshed_at: Option<Instant>,
}

/// 单个缓存槽
pub struct CacheSlot {
    kind: CacheKind,
    ttl: Duration,
    /// 响应和刷新时间一起替换，读者不会看到不完整的多包响应
    state: RwLock<SlotState>,
    /// 单飞刷新锁
    refresh_guard: Mutex<()>,
}

impl CacheSlot {
    pub fn new(kind: CacheKind, ttl: Duration) -> Self {
        Self {
            kind,
            ttl,
            state: RwLock::new(SlotState {
                packets: Vec::new(),
                refreshed_at: None,
            }),
            refresh_guard: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `now >= refreshed_at + ttl` 时需要刷新，从未刷新过也需要
    ///
    /// 有效期大到无法表示的时刻视为永不过期。
    pub async fn is_stale_at(&self, now: Instant) -> bool {
        match self.state.read().await.refreshed_at {
            Some(refreshed_at) => refreshed_at
                .checked_add(self.ttl)
                .map_or(false, |expires_at| now >= expires_at),
            None => true,
        }
    }

    pub async fn refreshed_at(&self) -> Option<Instant> {
        self.state.read().await.refreshed_at
    }

    /// 取出当前缓存的副本 (`Bytes` 为引用计数，不复制数据)
    pub async fn snapshot(&self, wait: Duration) -> Result<CachedResponse, LockTimeout> {
        let state = timeout(wait, self.state.read())
            .await
            .map_err(|_| LockTimeout {
                kind: self.kind,
                waited: wait,
            })?;
        Ok(state.packets.clone())
    }

    /// 整体替换缓存内容并记录刷新时间
    pub async fn replace(&self, packets: CachedResponse, refreshed_at: Instant) {
        let mut state = self.state.write().await;
        state.packets = packets;
        state.refreshed_at = Some(refreshed_at);
    }
}

/// 三个缓存槽
pub struct CacheStore {
    info: CacheSlot,
    players: CacheSlot,
    rules: CacheSlot,
    refresh_wait: Duration,
    read_wait: Duration,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            info: CacheSlot::new(CacheKind::Info, config.info_ttl()),
            players: CacheSlot::new(CacheKind::Players, config.players_ttl()),
            rules: CacheSlot::new(CacheKind::Rules, config.rules_ttl()),
            refresh_wait: config.refresh_wait(),
            read_wait: config.read_wait(),
        }
    }

    pub fn slot(&self, kind: CacheKind) -> &CacheSlot {
        match kind {
            CacheKind::Info => &self.info,
            CacheKind::Players => &self.players,
            CacheKind::Rules => &self.rules,
        }
    }

    /// 读取缓存，等待读锁超过 `read_wait` 时返回错误
    pub async fn snapshot(&self, kind: CacheKind) -> Result<CachedResponse, LockTimeout> {
        self.slot(kind).snapshot(self.read_wait).await
    }

    /// 按响应自身的类型写入对应缓存槽
    pub async fn store(&self, response: BackendResponse) {
        debug!(
            "Caching {} response ({} packet(s))",
            response.kind,
            response.packets.len()
        );
        self.slot(response.kind)
            .replace(response.packets, Instant::now())
            .await;
    }

    /// 缓存过期时刷新
    pub async fn refresh_if_stale<F, Fut>(&self, kind: CacheKind, fetch: F) -> RefreshOutcome
    where
        F: FnOnce(CacheKind) -> Fut,
        Fut: Future<Output = Result<BackendResponse, BackendError>>,
    {
        self.refresh_if_stale_at(kind, Instant::now(), fetch).await
    }

    /// 以给定时刻判断是否过期并刷新
    ///
    /// 最多等待 `refresh_wait` 获取刷新锁；拿到锁后再检查一次，
    /// 避免在别的 worker 刚刷新完之后重复请求后端。
    pub async fn refresh_if_stale_at<F, Fut>(
        &self,
        kind: CacheKind,
        now: Instant,
        fetch: F,
    ) -> RefreshOutcome
    where
        F: FnOnce(CacheKind) -> Fut,
        Fut: Future<Output = Result<BackendResponse, BackendError>>,
    {
        let slot = self.slot(kind);
        if !slot.is_stale_at(now).await {
            return RefreshOutcome::Fresh;
        }

        let _guard = match timeout(self.refresh_wait, slot.refresh_guard.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                debug!("{} refresh already in flight, serving cached response", kind);
                return RefreshOutcome::Busy;
            }
        };

        if !slot.is_stale_at(now).await {
            return RefreshOutcome::Fresh;
        }

        match fetch(kind).await {
            Ok(response) => {
                let actual = response.kind;
                self.store(response).await;
                if actual == kind {
                    RefreshOutcome::Refreshed
                } else {
                    warn!("Backend answered {} refresh with a {} response", kind, actual);
                    RefreshOutcome::Failed(RefreshError::Mismatch {
                        expected: kind,
                        actual,
                    })
                }
            }
            Err(e) => {
                warn!("Failed to refresh {} cache: {}", kind, e);
                RefreshOutcome::Failed(e.into())
            }
        }
    }
}
