//! 查询计数与定期统计输出
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

/// 查询计数器
///
/// info 查询单独计数，player/rules/challenge 计入 other。
#[derive(Debug, Default)]
pub struct Stats {
    info_issued: AtomicU64,
    info_answered: AtomicU64,
    other_issued: AtomicU64,
    other_answered: AtomicU64,
    dropped: AtomicU64,
}

/// 某一统计周期内的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub info_issued: u64,
    pub info_answered: u64,
    pub other_issued: u64,
    pub other_answered: u64,
    pub dropped: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_issued(&self) {
        self.info_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn info_answered(&self) {
        self.info_answered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn other_issued(&self) {
        self.other_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn other_answered(&self) {
        self.other_answered.fetch_add(1, Ordering::Relaxed);
    }

    /// 队列已满被丢弃的请求
    pub fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// 读取当前计数，不清零
    pub fn peek(&self) -> StatsSnapshot {
        StatsSnapshot {
            info_issued: self.info_issued.load(Ordering::Relaxed),
            info_answered: self.info_answered.load(Ordering::Relaxed),
            other_issued: self.other_issued.load(Ordering::Relaxed),
            other_answered: self.other_answered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// 取出计数并清零
    pub fn take(&self) -> StatsSnapshot {
        StatsSnapshot {
            info_issued: self.info_issued.swap(0, Ordering::Relaxed),
            info_answered: self.info_answered.swap(0, Ordering::Relaxed),
            other_issued: self.other_issued.swap(0, Ordering::Relaxed),
            other_answered: self.other_answered.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
        }
    }
}

/// 启动统计输出任务
///
/// 每个周期输出一次收到/应答的查询数量，然后清零。
pub fn spawn_reporter(stats: Arc<Stats>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();

        loop {
            interval.tick().await;
            let snapshot = stats.take();
            let elapsed = last.elapsed();
            last = Instant::now();

            info!(
                "{}/{} info queries and {}/{} other queries in last {}s, {} dropped",
                snapshot.info_answered,
                snapshot.info_issued,
                snapshot.other_answered,
                snapshot.other_issued,
                elapsed.as_secs(),
                snapshot.dropped
            );
        }
    })
}
