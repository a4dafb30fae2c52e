//! A2S 报文格式
//!
//! 单包格式:
//! ```text
//! [FF FF FF FF][type(1)][payload...]
//! ```
//!
//! 多包格式 (Source):
//! ```text
//! [FE FF FF FF][id(4, LE)][total(1)][number(1)][size(2, LE)][payload...]
//! ```
//! 第一个分片的 payload 以完整的单包头开始，因此响应类型位于偏移 16。

use crate::a2s::error::{A2sError, Result};

/// 单包前缀
pub const PACKET_PREFIX: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// 多包响应首字节
pub const MULTI_PACKET_MARKER: u8 = 0xFE;

/// 单个 UDP 数据报的最大长度
pub const MAX_PACKET_SIZE: usize = 1400;

/// 未知 challenge 的占位值，表示必须向后端获取
pub const CHALLENGE_SENTINEL: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// 请求/响应类型字节的偏移
pub const TYPE_OFFSET: usize = 4;

/// challenge 在请求中的偏移
pub const CHALLENGE_OFFSET: usize = 5;

/// 多包响应中分片总数的偏移
pub const MULTI_TOTAL_OFFSET: usize = 8;

/// 多包响应中分片序号的偏移
pub const MULTI_NUMBER_OFFSET: usize = 9;

/// 多包响应第一个分片中响应类型的偏移
pub const MULTI_TYPE_OFFSET: usize = 16;

/// 携带 challenge 的请求长度
pub const CHALLENGE_REQUEST_LEN: usize = CHALLENGE_OFFSET + 4;

const INFO_QUERY_PAYLOAD: &[u8] = b"Source Engine Query\0";

/// 客户端请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    /// A2S_INFO
    Info = 0x54,
    /// A2S_PLAYER
    Players = 0x55,
    /// A2S_RULES
    Rules = 0x56,
    /// A2S_SERVERQUERY_GETCHALLENGE
    Challenge = 0x57,
}

impl RequestKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x54 => Some(Self::Info),
            0x55 => Some(Self::Players),
            0x56 => Some(Self::Rules),
            0x57 => Some(Self::Challenge),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// 后端响应类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseKind {
    /// S2C_CHALLENGE
    Challenge = 0x41,
    /// A2S_INFO 响应
    Info = 0x49,
    /// A2S_PLAYER 响应
    Players = 0x44,
    /// A2S_RULES 响应
    Rules = 0x45,
}

impl ResponseKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x41 => Some(Self::Challenge),
            0x49 => Some(Self::Info),
            0x44 => Some(Self::Players),
            0x45 => Some(Self::Rules),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// 多包响应分片头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiPacketHeader {
    /// 响应 ID，同一响应的所有分片相同
    pub id: u32,
    /// 分片总数
    pub total: u8,
    /// 当前分片序号
    pub number: u8,
}

/// 后端数据报的分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPacket {
    /// 后端下发新的 challenge
    Challenge([u8; 4]),
    /// 单包响应
    Single(ResponseKind),
    /// 多包响应的第一个分片
    Multi {
        header: MultiPacketHeader,
        kind: ResponseKind,
    },
}

/// 判断客户端请求类型
///
/// 长度不足或缺少前缀的数据报返回 `None`。
pub fn classify_request(packet: &[u8]) -> Option<RequestKind> {
    if packet.len() <= TYPE_OFFSET || packet[..TYPE_OFFSET] != PACKET_PREFIX {
        return None;
    }
    RequestKind::from_byte(packet[TYPE_OFFSET])
}

/// 取出客户端请求中携带的 challenge
pub fn request_challenge(packet: &[u8]) -> Option<[u8; 4]> {
    packet
        .get(CHALLENGE_OFFSET..CHALLENGE_REQUEST_LEN)
        .and_then(|bytes| bytes.try_into().ok())
}

/// 构造 `FF FF FF FF <type> <challenge>`
///
/// 同时用于 player/rules 请求和发给客户端的 challenge 响应 (`0x41`)。
pub fn build_request(type_byte: u8, challenge: [u8; 4]) -> [u8; CHALLENGE_REQUEST_LEN] {
    let mut packet = [0u8; CHALLENGE_REQUEST_LEN];
    packet[..TYPE_OFFSET].copy_from_slice(&PACKET_PREFIX);
    packet[TYPE_OFFSET] = type_byte;
    packet[CHALLENGE_OFFSET..].copy_from_slice(&challenge);
    packet
}

/// 构造 A2S_INFO 请求
///
/// 后端要求 challenge 时，重发的请求在末尾追加 challenge。
pub fn build_info_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(TYPE_OFFSET + 1 + INFO_QUERY_PAYLOAD.len() + 4);
    packet.extend_from_slice(&PACKET_PREFIX);
    packet.push(RequestKind::Info.as_byte());
    packet.extend_from_slice(INFO_QUERY_PAYLOAD);
    if let Some(challenge) = challenge {
        packet.extend_from_slice(&challenge);
    }
    packet
}

/// 解析后端返回的第一个数据报
pub fn parse_backend_packet(packet: &[u8]) -> Result<BackendPacket> {
    let first = *packet.first().ok_or(A2sError::PacketTooShort {
        expected: TYPE_OFFSET + 1,
        actual: 0,
    })?;

    if first == MULTI_PACKET_MARKER {
        let header = parse_multi_header(packet)?;
        if packet.len() <= MULTI_TYPE_OFFSET {
            return Err(A2sError::PacketTooShort {
                expected: MULTI_TYPE_OFFSET + 1,
                actual: packet.len(),
            });
        }
        let tag = packet[MULTI_TYPE_OFFSET];
        return match ResponseKind::from_byte(tag) {
            // 只有 player/rules 列表会拆成多包
            Some(kind @ (ResponseKind::Players | ResponseKind::Rules)) => {
                Ok(BackendPacket::Multi { header, kind })
            }
            _ => Err(A2sError::UnhandledResponse(tag)),
        };
    }

    if packet.len() <= TYPE_OFFSET {
        return Err(A2sError::PacketTooShort {
            expected: TYPE_OFFSET + 1,
            actual: packet.len(),
        });
    }
    if packet[..TYPE_OFFSET] != PACKET_PREFIX {
        return Err(A2sError::MissingPrefix(first));
    }

    let tag = packet[TYPE_OFFSET];
    match ResponseKind::from_byte(tag) {
        Some(ResponseKind::Challenge) => request_challenge(packet)
            .map(BackendPacket::Challenge)
            .ok_or(A2sError::PacketTooShort {
                expected: CHALLENGE_REQUEST_LEN,
                actual: packet.len(),
            }),
        Some(kind) => Ok(BackendPacket::Single(kind)),
        None => Err(A2sError::UnhandledResponse(tag)),
    }
}

/// 解析多包分片头
pub fn parse_multi_header(packet: &[u8]) -> Result<MultiPacketHeader> {
    if packet.len() <= MULTI_NUMBER_OFFSET {
        return Err(A2sError::PacketTooShort {
            expected: MULTI_NUMBER_OFFSET + 1,
            actual: packet.len(),
        });
    }
    if packet[0] != MULTI_PACKET_MARKER || packet[1..4] != PACKET_PREFIX[1..] {
        return Err(A2sError::MissingPrefix(packet[0]));
    }

    let total = packet[MULTI_TOTAL_OFFSET];
    if total == 0 {
        return Err(A2sError::InvalidPacketTotal(total));
    }

    Ok(MultiPacketHeader {
        id: u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]),
        total,
        number: packet[MULTI_NUMBER_OFFSET],
    })
}
