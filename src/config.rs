use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Result, Context};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 对外监听地址 (例如: "0.0.0.0:27015")，命令行参数会覆盖
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// 游戏服务器地址，命令行参数会覆盖
    #[serde(default = "default_backend_addr")]
    pub backend_addr: SocketAddr,
    /// 监听 socket 接收缓冲区大小 (字节)
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// 日志级别: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 日志格式: json, pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// 可选: 日志文件路径，未配置时输出到 stdout
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// 发送超时(毫秒)
    #[serde(default = "default_backend_send_timeout")]
    pub send_timeout_ms: u64,
    /// 接收超时(毫秒)，多包响应的每个分片单独计时
    #[serde(default = "default_backend_recv_timeout")]
    pub recv_timeout_ms: u64,
    /// 一次刷新中最多接受几次 challenge 更新
    #[serde(default = "default_max_challenge_retries")]
    pub max_challenge_retries: u32,
    /// 等待后端交换锁获取 challenge 的最长时间(毫秒)，超时则使用当前值
    #[serde(default = "default_lock_wait")]
    pub challenge_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// A2S_INFO 缓存有效期(毫秒)
    #[serde(default = "default_info_ttl")]
    pub info_ttl_ms: u64,
    /// A2S_PLAYER 缓存有效期(毫秒)
    #[serde(default = "default_players_ttl")]
    pub players_ttl_ms: u64,
    /// A2S_RULES 缓存有效期(毫秒)
    #[serde(default = "default_rules_ttl")]
    pub rules_ttl_ms: u64,
    /// 等待刷新锁的最长时间(毫秒)，超时则直接返回旧缓存
    #[serde(default = "default_lock_wait")]
    pub refresh_wait_ms: u64,
    /// 等待读锁的最长时间(毫秒)
    #[serde(default = "default_lock_wait")]
    pub read_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// worker 数量
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 请求队列长度，队列满时丢弃新请求
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// 回复客户端的发送超时(毫秒)
    #[serde(default = "default_client_send_timeout")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// 统计输出间隔(秒)
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
}

// 默认值函数
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 27015))
}

fn default_backend_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 27015))
}

fn default_recv_buffer_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_backend_send_timeout() -> u64 {
    100
}

fn default_backend_recv_timeout() -> u64 {
    1000
}

fn default_max_challenge_retries() -> u32 {
    3
}

fn default_info_ttl() -> u64 {
    5000
}

fn default_players_ttl() -> u64 {
    3000
}

fn default_rules_ttl() -> u64 {
    10000
}

fn default_lock_wait() -> u64 {
    100
}

fn default_workers() -> usize {
    64
}

fn default_queue_depth() -> usize {
    1024
}

fn default_client_send_timeout() -> u64 {
    100
}

fn default_stats_interval() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backend_addr: default_backend_addr(),
            recv_buffer_size: default_recv_buffer_size(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_file: None,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_backend_send_timeout(),
            recv_timeout_ms: default_backend_recv_timeout(),
            max_challenge_retries: default_max_challenge_retries(),
            challenge_wait_ms: default_lock_wait(),
        }
    }
}

impl BackendConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn challenge_wait(&self) -> Duration {
        Duration::from_millis(self.challenge_wait_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            info_ttl_ms: default_info_ttl(),
            players_ttl_ms: default_players_ttl(),
            rules_ttl_ms: default_rules_ttl(),
            refresh_wait_ms: default_lock_wait(),
            read_wait_ms: default_lock_wait(),
        }
    }
}

impl CacheConfig {
    pub fn info_ttl(&self) -> Duration {
        Duration::from_millis(self.info_ttl_ms)
    }

    pub fn players_ttl(&self) -> Duration {
        Duration::from_millis(self.players_ttl_ms)
    }

    pub fn rules_ttl(&self) -> Duration {
        Duration::from_millis(self.rules_ttl_ms)
    }

    pub fn refresh_wait(&self) -> Duration {
        Duration::from_millis(self.refresh_wait_ms)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            send_timeout_ms: default_client_send_timeout(),
        }
    }
}

impl DispatcherConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval(),
        }
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// 从文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// 检查无法正常运行的取值
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.workers == 0 {
            anyhow::bail!("dispatcher.workers must be at least 1");
        }
        if self.dispatcher.queue_depth == 0 {
            anyhow::bail!("dispatcher.queue_depth must be at least 1");
        }
        if self.stats.interval_secs == 0 {
            anyhow::bail!("stats.interval_secs must be at least 1");
        }
        Ok(())
    }
}
