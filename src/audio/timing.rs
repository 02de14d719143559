//! 时间相关函数
//!
//! 提供单调时钟源和帧数 ↔ 时间换算。
//! pump 时间戳、位置插值、Stop 时的 rewind 估计都通过 [`Clock`] 读取时间，
//! 便于宿主（或测试）注入确定性的时钟。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// 进程级单调时间基准（只初始化一次）
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 获取当前单调时间（纳秒，相对于进程内首次调用）
#[inline]
pub fn now_ns() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// 单调时钟源
pub trait Clock: Send + Sync {
    /// 当前时间（纳秒），必须单调不减
    fn now_ns(&self) -> u64;
}

/// 系统单调时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        now_ns()
    }
}

/// 手动推进的时钟
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    /// 向前推进
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, ns: u64) {
        self.now.fetch_max(ns, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

/// 时长 → 帧数（向上取整）
#[inline]
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> usize {
    let ns = duration.as_nanos();
    ((ns * sample_rate as u128 + 999_999_999) / 1_000_000_000) as usize
}

/// 纳秒 → 帧数（向下取整）
#[inline]
pub fn ns_to_frames(ns: u64, sample_rate: u32) -> u64 {
    (ns as u128 * sample_rate as u128 / 1_000_000_000) as u64
}

/// 帧数 → 时长
#[inline]
pub fn frames_to_duration(frames: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((frames as u128 * 1_000_000_000 / sample_rate as u128) as u64)
}
