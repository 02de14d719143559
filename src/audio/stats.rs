//! Pump 统计
//!
//! 在 pump tick 中收集统计信息，采用降频采样策略减少开销

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 统计采样间隔：每 N 次 tick 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 时间间隔缓冲区大小
const INTERVAL_BUFFER_SIZE: usize = 256;

/// Pump 统计收集器
///
/// 所有操作都是 lock-free 的；pump 线程写，任意线程读报告
pub struct PumpStats {
    tick_count: AtomicU64,
    last_sampled_ns: AtomicU64,

    interval_buffer: Box<[AtomicU64; INTERVAL_BUFFER_SIZE]>,
    interval_write_idx: AtomicUsize,

    xrun_count: AtomicU64,
    would_block_count: AtomicU64,
    frames_moved: AtomicU64,
    lead_in_frames: AtomicU64,
    dropped_frames: AtomicU64,
}

impl PumpStats {
    pub fn new() -> Self {
        Self {
            tick_count: AtomicU64::new(0),
            last_sampled_ns: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            xrun_count: AtomicU64::new(0),
            would_block_count: AtomicU64::new(0),
            frames_moved: AtomicU64::new(0),
            lead_in_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// 每个 tick 开头调用
    ///
    /// 只在采样点才记录间隔
    #[inline]
    pub fn on_tick(&self, now_ns: u64) {
        let count = self.tick_count.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let last = self.last_sampled_ns.swap(now_ns, Ordering::Relaxed);
            if last > 0 {
                let interval = now_ns.saturating_sub(last);
                let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed)
                    % INTERVAL_BUFFER_SIZE;
                self.interval_buffer[idx].store(interval, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn record_xrun(&self) {
        self.xrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_would_block(&self) {
        self.would_block_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_frames_moved(&self, frames: u64) {
        self.frames_moved.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_lead_in(&self, frames: u64) {
        self.lead_in_frames.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_dropped(&self, frames: u64) {
        self.dropped_frames.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn xrun_count(&self) -> u64 {
        self.xrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_moved(&self) -> u64 {
        self.frames_moved.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, period_frames: usize, sample_rate: u32) -> StatsReport {
        let expected_interval_ns = if sample_rate > 0 {
            (period_frames as u64 * 1_000_000_000) / sample_rate as u64
        } else {
            0
        };
        let expected_sampled_interval_ns = expected_interval_ns * SAMPLE_INTERVAL;

        let intervals_ns: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&ns| ns > 0)
            .collect();

        let interval_stats = match (intervals_ns.iter().min(), intervals_ns.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => IntervalStats {
                min_ns,
                max_ns,
                avg_ns: intervals_ns.iter().sum::<u64>() / intervals_ns.len() as u64,
            },
            _ => IntervalStats::default(),
        };

        StatsReport {
            tick_count: self.tick_count.load(Ordering::Relaxed),
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns,
            interval_stats,
            xrun_count: self.xrun_count.load(Ordering::Relaxed),
            would_block_count: self.would_block_count.load(Ordering::Relaxed),
            frames_moved: self.frames_moved.load(Ordering::Relaxed),
            lead_in_frames: self.lead_in_frames.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.tick_count.store(0, Ordering::Relaxed);
        self.last_sampled_ns.store(0, Ordering::Relaxed);
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.xrun_count.store(0, Ordering::Relaxed);
        self.would_block_count.store(0, Ordering::Relaxed);
        self.frames_moved.store(0, Ordering::Relaxed);
        self.lead_in_frames.store(0, Ordering::Relaxed);
        self.dropped_frames.store(0, Ordering::Relaxed);

        for slot in self.interval_buffer.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for PumpStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub tick_count: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub xrun_count: u64,
    pub would_block_count: u64,
    pub frames_moved: u64,
    pub lead_in_frames: u64,
    pub dropped_frames: u64,
}

#[derive(Debug, Default)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pump Statistics")?;
        writeln!(f, "===============")?;
        writeln!(f, "Total ticks: {}", self.tick_count)?;
        writeln!(f, "Stats sample interval: every {} ticks", self.sample_interval)?;
        writeln!(f)?;

        writeln!(f, "Tick Timing (per {} ticks):", self.sample_interval)?;
        writeln!(
            f,
            "  Expected: {:.2} ms",
            self.expected_sampled_interval_ns as f64 / 1_000_000.0
        )?;
        writeln!(f, "  Measured:")?;
        writeln!(
            f,
            "    Min: {:.2} ms",
            self.interval_stats.min_ns as f64 / 1_000_000.0
        )?;
        writeln!(
            f,
            "    Max: {:.2} ms",
            self.interval_stats.max_ns as f64 / 1_000_000.0
        )?;
        writeln!(
            f,
            "    Avg: {:.2} ms",
            self.interval_stats.avg_ns as f64 / 1_000_000.0
        )?;

        let jitter_ns = self
            .interval_stats
            .max_ns
            .saturating_sub(self.interval_stats.min_ns);
        let jitter_pct = if self.expected_sampled_interval_ns > 0 {
            jitter_ns as f64 / self.expected_sampled_interval_ns as f64 * 100.0
        } else {
            0.0
        };
        writeln!(
            f,
            "  Jitter: {:.2} ms ({:.1}%)",
            jitter_ns as f64 / 1_000_000.0,
            jitter_pct
        )?;
        writeln!(f)?;

        writeln!(f, "XRUN recoveries: {}", self.xrun_count)?;
        writeln!(f, "Would-block results: {}", self.would_block_count)?;
        writeln!(f, "Frames moved: {}", self.frames_moved)?;
        writeln!(f, "Lead-in silence frames: {}", self.lead_in_frames)?;
        writeln!(f, "Dropped capture frames: {}", self.dropped_frames)?;

        Ok(())
    }
}
