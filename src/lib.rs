//! a2s-cache 库
//!
//! Source 引擎 A2S 查询协议的缓存反向代理：客户端的 info / player / rules 查询
//! 由本地缓存应答，只在缓存过期时向游戏服务器请求。

pub mod a2s;
pub mod backend;
pub mod cache;
pub mod challenge;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod proxy;
pub mod stats;

#[cfg(test)]
mod testing;

// 重新导出常用类型
pub use config::Config;
pub use proxy::{BindError, Proxy, ProxyState};
