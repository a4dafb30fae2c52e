//! 命令行参数
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

/// 退出码
pub mod exit_code {
    pub const USAGE: u8 = 1;
    pub const INVALID_PROXY_PORT: u8 = 2;
    pub const INVALID_SERVER_IP: u8 = 3;
    pub const INVALID_SERVER_PORT: u8 = 4;
    pub const BIND_FAILED: u8 = 5;
    pub const CONFIG_ERROR: u8 = 6;
}

/// A2S 查询缓存代理
#[derive(Parser, Debug)]
#[command(author, version, about = "Caching proxy for Source engine A2S server queries")]
pub struct Cli {
    /// 对外监听的 UDP 端口 (1-65535)
    pub proxy_port: String,

    /// 游戏服务器 IP 地址
    pub server_ip: String,

    /// 游戏服务器 UDP 端口 (1-65535)
    pub server_port: String,

    /// 可选的 TOML 配置文件
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// 参数校验失败
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CliError {
    #[error("Invalid proxy port: {0}")]
    InvalidProxyPort(String),

    #[error("Invalid gameserver IP address: {0}")]
    InvalidServerIp(String),

    #[error("Invalid gameserver port: {0}")]
    InvalidServerPort(String),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::InvalidProxyPort(_) => exit_code::INVALID_PROXY_PORT,
            CliError::InvalidServerIp(_) => exit_code::INVALID_SERVER_IP,
            CliError::InvalidServerPort(_) => exit_code::INVALID_SERVER_PORT,
        }
    }
}

/// 校验后的地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub listen_addr: SocketAddr,
    pub backend_addr: SocketAddr,
}

impl Cli {
    /// 按顺序校验三个位置参数
    pub fn endpoints(&self) -> Result<Endpoints, CliError> {
        let proxy_port = parse_port(&self.proxy_port)
            .ok_or_else(|| CliError::InvalidProxyPort(self.proxy_port.clone()))?;
        let server_ip: IpAddr = self
            .server_ip
            .trim()
            .parse()
            .map_err(|_| CliError::InvalidServerIp(self.server_ip.clone()))?;
        let server_port = parse_port(&self.server_port)
            .ok_or_else(|| CliError::InvalidServerPort(self.server_port.clone()))?;

        // 监听地址与后端地址族一致
        let unspecified = match server_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };

        Ok(Endpoints {
            listen_addr: SocketAddr::new(unspecified, proxy_port),
            backend_addr: SocketAddr::new(server_ip, server_port),
        })
    }
}

fn parse_port(value: &str) -> Option<u16> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}
