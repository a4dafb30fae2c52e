//! A2S (Source Engine Server Query) 报文编解码
//!
//! 只覆盖缓存代理需要的部分：请求分类、challenge 报文构造、后端响应头解析。
//! 响应内容本身按原样缓存和转发，不做解析。

pub mod error;
pub mod packet;

pub use error::{A2sError, Result};
pub use packet::{
    build_info_request, build_request, classify_request, parse_backend_packet,
    parse_multi_header, request_challenge, BackendPacket, MultiPacketHeader, RequestKind,
    ResponseKind, CHALLENGE_SENTINEL, MAX_PACKET_SIZE,
};
