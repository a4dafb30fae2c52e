//! Challenge 管理
//!
//! 所有查询类型共用同一个 4 字节 challenge。这里只保存状态；
//! 向后端获取 challenge 需要后端 socket，见 [`crate::backend::BackendClient::get_challenge`]。
use crate::a2s::packet::{build_request, request_challenge, CHALLENGE_SENTINEL};
use crate::a2s::ResponseKind;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// 进程内共享的 challenge
///
/// 4 字节值以原子整数保存，读写无需加锁，后写覆盖先写。
#[derive(Debug)]
pub struct ChallengeManager {
    code: AtomicU32,
}

impl Default for ChallengeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeManager {
    /// 创建新的 challenge 管理器，初始值为占位值
    pub fn new() -> Self {
        Self {
            code: AtomicU32::new(u32::from_ne_bytes(CHALLENGE_SENTINEL)),
        }
    }

    /// 当前 challenge
    pub fn current(&self) -> [u8; 4] {
        self.code.load(Ordering::Acquire).to_ne_bytes()
    }

    /// 是否仍是占位值 (需要向后端获取)
    pub fn is_unknown(&self) -> bool {
        self.current() == CHALLENGE_SENTINEL
    }

    /// 保存后端下发的新 challenge
    pub fn renew(&self, code: [u8; 4]) {
        let previous = self.code.swap(u32::from_ne_bytes(code), Ordering::AcqRel);
        if previous.to_ne_bytes() != code {
            debug!("Challenge renewed: {:02x?}", code);
        }
    }

    /// 构造携带当前 challenge 的 9 字节请求
    pub fn build_request(&self, type_byte: u8) -> [u8; 9] {
        build_request(type_byte, self.current())
    }

    /// 构造发给客户端的 challenge 响应
    pub fn challenge_reply(&self) -> [u8; 9] {
        self.build_request(ResponseKind::Challenge.as_byte())
    }

    /// 检查客户端请求中 5..9 字节是否与当前 challenge 完全一致
    ///
    /// 占位值永远无效，客户端回显 `FF FF FF FF` 时总会收到 challenge 响应。
    pub fn is_valid(&self, request: &[u8]) -> bool {
        let current = self.current();
        if current == CHALLENGE_SENTINEL {
            return false;
        }
        request_challenge(request) == Some(current)
    }
}
