//! 播放位置
//!
//! 硬件相关的计数器每个 pump 周期才更新一次，
//! 两次 tick 之间用墙上时间插值，并且保证上报值单调不减。

use super::format::Direction;
use super::timing::ns_to_frames;

/// 一次位置查询所需的计数器快照
#[derive(Clone, Copy, Debug)]
pub struct ClockInput {
    pub direction: Direction,
    pub written_frames: u64,
    pub held_frames: usize,
    pub sample_rate: u32,
    /// 硬件周期（帧），插值的上限
    pub period_frames: usize,
    pub started: bool,
    pub device_running: bool,
    /// 上次 pump tick 的时间戳
    pub last_pump_ns: u64,
    pub now_ns: u64,
}

/// 每个 Stream 一份，记住上次返回的位置
#[derive(Debug, Default, Clone, Copy)]
pub struct PositionClock {
    last_reported: u64,
}

impl PositionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 计算当前位置（帧）
    pub fn position(&mut self, input: &ClockInput) -> u64 {
        let position = match input.direction {
            Direction::Render => Self::render_position(input),
            // 只在 pump 确认之后前进
            Direction::Capture => input.written_frames,
        };
        let position = position.max(self.last_reported);
        self.last_reported = position;
        position
    }

    fn render_position(input: &ClockInput) -> u64 {
        let base = input.written_frames - input.held_frames as u64;
        if !(input.started && input.device_running && input.held_frames > 0) {
            return base;
        }
        let elapsed_ns = input.now_ns.saturating_sub(input.last_pump_ns);
        let interpolated = ns_to_frames(elapsed_ns, input.sample_rate);
        let limit = (base + input.period_frames as u64).min(input.written_frames);
        (base + interpolated).min(limit)
    }

    /// 上次返回的位置
    #[inline]
    pub fn last_reported(&self) -> u64 {
        self.last_reported
    }

    /// Stream reset 之后位置从 0 重新开始
    pub fn reset(&mut self) {
        self.last_reported = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(written: u64, held: usize, last_pump_ns: u64, now_ns: u64) -> ClockInput {
        ClockInput {
            direction: Direction::Render,
            written_frames: written,
            held_frames: held,
            sample_rate: 48000,
            period_frames: 480,
            started: true,
            device_running: true,
            last_pump_ns,
            now_ns,
        }
    }

    #[test]
    fn test_not_running_reports_base() {
        let mut clock = PositionClock::new();
        let mut input = render(1000, 400, 0, 5_000_000);
        input.started = false;
        assert_eq!(clock.position(&input), 600);

        let mut input = render(1000, 400, 0, 5_000_000);
        input.device_running = false;
        assert_eq!(clock.position(&input), 600);
    }

    #[test]
    fn test_interpolates_between_ticks() {
        let mut clock = PositionClock::new();
        // 2ms 之后 → +96 帧
        assert_eq!(clock.position(&render(1000, 400, 0, 2_000_000)), 696);
    }

    #[test]
    fn test_interpolation_clamped_to_period() {
        let mut clock = PositionClock::new();
        // 50ms 远超一个周期
        assert_eq!(clock.position(&render(2000, 900, 0, 50_000_000)), 1100 + 480);
    }

    #[test]
    fn test_interpolation_clamped_to_written() {
        let mut clock = PositionClock::new();
        assert_eq!(clock.position(&render(1000, 100, 0, 50_000_000)), 1000);
    }

    #[test]
    fn test_monotonic_across_tick() {
        let mut clock = PositionClock::new();
        // tick 之前插值到了 600 + 480
        let before = clock.position(&render(1000, 400, 0, 20_000_000));
        assert_eq!(before, 1000);
        // tick 之后硬件只确认消费了 200 帧：base = 800
        let after = clock.position(&render(1000, 200, 20_000_000, 20_000_000));
        assert!(after >= before);
        assert_eq!(clock.last_reported(), 1000);
    }

    #[test]
    fn test_capture_uses_written() {
        let mut clock = PositionClock::new();
        let mut input = render(960, 480, 0, 0);
        input.direction = Direction::Capture;
        assert_eq!(clock.position(&input), 960);
    }

    #[test]
    fn test_reset() {
        let mut clock = PositionClock::new();
        clock.position(&render(1000, 0, 0, 0));
        clock.reset();
        assert_eq!(clock.position(&render(0, 0, 0, 0)), 0);
    }
}
