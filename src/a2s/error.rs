//! A2S 报文解析错误类型
use thiserror::Error;

/// 解析后端 A2S 报文时可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum A2sError {
    /// 数据包太短，无法解析
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    /// 缺少 `FF FF FF FF` 前缀
    #[error("Missing A2S packet prefix (first byte: {0:#04x})")]
    MissingPrefix(u8),

    /// 无法处理的响应类型
    #[error("Unhandled response type: {0:#04x}")]
    UnhandledResponse(u8),

    /// 多包响应声明的包数量无效
    #[error("Invalid multi-packet total: {0}")]
    InvalidPacketTotal(u8),

    /// 多包响应中出现不属于同一响应的分片
    #[error("Multi-packet id mismatch: expected {expected:#010x}, got {actual:#010x}")]
    PacketIdMismatch { expected: u32, actual: u32 },
}

pub type Result<T> = std::result::Result<T, A2sError>;
