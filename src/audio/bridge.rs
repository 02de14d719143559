//! HardwareBridge：StreamBuffer ↔ 硬件 ring 的搬运
//!
//! 每个 tick（一个硬件周期）：
//!
//! Render:
//! 1. 查询硬件 headroom；XRUN 则 recover，headroom 视为整个硬件 buffer
//! 2. 根据硬件队列长度回收已播放的帧（先扣 lead-in 静音，再扣数据）
//! 3. 设备里没有数据且 held 不足一个周期时，先推一个周期的静音
//! 4. 推送 pending 帧：施加增益（每帧只一次）→ 声道重映射 → 写硬件
//!
//! Capture: 读出硬件中可用的帧 → 反向重映射 → 零增益声道静音 → 存入 ring
//!
//! would-block 和单次 XRUN 都在这里消化，不会传给调用方。

use std::sync::Arc;
use std::time::Duration;

use super::backend::{DeviceState, HwConfig, PcmDevice};
use super::format::{Direction, StreamFormat};
use super::remap::{ChannelMap, ChannelRemapper};
use super::ring_buffer::StreamBuffer;
use super::stats::PumpStats;
use super::timing::ns_to_frames;
use super::volume::{GainStage, GainWindow};
use crate::error::{BackendError, Result, StreamError};

pub struct HardwareBridge {
    device: Box<dyn PcmDevice>,
    hw: HwConfig,
    direction: Direction,
    remapper: ChannelRemapper,
    gain: GainStage,
    window: GainWindow,
    /// 设备中排在数据前面的静音帧
    lead_in_frames: usize,
    /// 一个周期的硬件静音
    silence: Vec<u8>,
    client_frame_bytes: usize,
    last_pump_ns: u64,
    stats: Arc<PumpStats>,
}

impl HardwareBridge {
    pub fn new(
        device: Box<dyn PcmDevice>,
        direction: Direction,
        format: &StreamFormat,
        map: ChannelMap,
    ) -> Result<Self> {
        let hw = device.config();
        if hw.encoding != format.encoding || hw.sample_rate != format.sample_rate {
            return Err(StreamError::UnsupportedFormat(format!(
                "device opened as {:?} {}Hz",
                hw.encoding, hw.sample_rate
            )));
        }
        if map.client_channels() != format.channels as usize
            || map.hw_channels() != hw.channels as usize
        {
            return Err(StreamError::UnsupportedFormat(format!(
                "channel map {}→{} for {}ch client on {}ch device",
                map.client_channels(),
                map.hw_channels(),
                format.channels,
                hw.channels
            )));
        }

        let mut remapper = ChannelRemapper::new(map, format.bytes_per_sample(), format.silence_byte());
        if remapper.is_active() {
            remapper.reserve(hw.buffer_frames)?;
        }

        let silence_len = hw.period_frames * hw.bytes_per_frame();
        let mut silence = Vec::new();
        silence.try_reserve_exact(silence_len)?;
        silence.resize(silence_len, format.silence_byte());

        Ok(Self {
            device,
            hw,
            direction,
            remapper,
            gain: GainStage::for_encoding(format.encoding),
            window: GainWindow::default(),
            lead_in_frames: 0,
            silence,
            client_frame_bytes: format.bytes_per_frame(),
            last_pump_ns: 0,
            stats: Arc::new(PumpStats::new()),
        })
    }

    #[inline]
    pub fn config(&self) -> HwConfig {
        self.hw
    }

    #[inline]
    pub fn period_frames(&self) -> usize {
        self.hw.period_frames
    }

    #[inline]
    pub fn channel_map(&self) -> &ChannelMap {
        self.remapper.map()
    }

    #[inline]
    pub fn last_pump_ns(&self) -> u64 {
        self.last_pump_ns
    }

    #[inline]
    pub fn lead_in_frames(&self) -> usize {
        self.lead_in_frames
    }

    #[inline]
    pub fn stats(&self) -> &Arc<PumpStats> {
        &self.stats
    }

    pub fn device_running(&mut self) -> bool {
        self.device.state() == DeviceState::Running
    }

    /// 执行一个 tick
    ///
    /// 只有设备失效时返回错误
    pub fn tick(
        &mut self,
        buf: &mut StreamBuffer,
        gains: &[f32],
        now_ns: u64,
    ) -> std::result::Result<(), BackendError> {
        self.stats.on_tick(now_ns);
        let result = match self.direction {
            Direction::Render => self.render_tick(buf, gains),
            Direction::Capture => self.capture_tick(buf, gains),
        };
        self.last_pump_ns = now_ns;
        result
    }

    fn recover_xrun(&mut self) {
        self.stats.record_xrun();
        log::warn!("{:?} device xrun, recovering", self.direction);
        if let Err(err) = self.device.recover(&BackendError::Xrun) {
            log::warn!("Recover failed ({}), resetting device", err);
            if let Err(err) = self.device.reset().and_then(|_| self.device.prepare()) {
                log::warn!("Device reset failed: {}", err);
            }
        }
        if self.direction == Direction::Capture {
            if let Err(err) = self.device.start() {
                log::warn!("Capture restart failed: {}", err);
            }
        }
    }

    /// 根据硬件队列长度回收已播放的帧
    fn reclaim_played(&mut self, buf: &mut StreamBuffer, queued: usize) {
        let tracked = self.lead_in_frames + buf.in_device_frames();
        let consumed = tracked.saturating_sub(queued);
        let from_lead = consumed.min(self.lead_in_frames);
        self.lead_in_frames -= from_lead;
        buf.consume_played(consumed - from_lead);
    }

    fn render_tick(
        &mut self,
        buf: &mut StreamBuffer,
        gains: &[f32],
    ) -> std::result::Result<(), BackendError> {
        let buffer = self.hw.buffer_frames;
        let avail = match self.device.avail() {
            Ok(avail) if avail <= buffer && self.device.state() != DeviceState::Xrun => avail,
            Ok(_) | Err(BackendError::Xrun) => {
                self.recover_xrun();
                buffer
            }
            Err(BackendError::Disconnected) => return Err(BackendError::Disconnected),
            Err(BackendError::WouldBlock) => {
                self.stats.record_would_block();
                return Ok(());
            }
            Err(err) => {
                log::warn!("Unable to query device headroom: {}", err);
                return Ok(());
            }
        };
        self.reclaim_played(buf, buffer - avail);
        let mut headroom = avail;

        let period = self.hw.period_frames;
        if buf.in_device_frames() == 0
            && self.lead_in_frames == 0
            && buf.held_frames() < period
            && headroom >= period
        {
            match self.device.write(&self.silence) {
                Ok(written) => {
                    self.lead_in_frames += written;
                    headroom -= written.min(headroom);
                    self.stats.add_lead_in(written as u64);
                }
                Err(BackendError::Disconnected) => return Err(BackendError::Disconnected),
                Err(BackendError::WouldBlock) => self.stats.record_would_block(),
                Err(err) => log::warn!("Lead-in write failed: {}", err),
            }
        }

        while headroom > 0 && buf.pending_frames() > 0 {
            let pushed = buf.pushed_end();
            let run = buf.pending_run(headroom);
            let frames = run.len() / self.client_frame_bytes;

            let unscaled = self.window.unscaled(pushed..pushed + frames as u64);
            if !unscaled.is_empty() {
                let from = (unscaled.start - pushed) as usize * self.client_frame_bytes;
                self.gain.apply(&mut run[from..], gains);
                self.window.mark_scaled(unscaled.end);
            }

            let data = match self.remapper.map_render(run) {
                Ok(data) => data,
                Err(err) => {
                    log::warn!("Remap scratch growth failed: {}", err);
                    break;
                }
            };
            match self.device.write(data) {
                Ok(written) => {
                    buf.mark_pushed(written);
                    headroom -= written.min(headroom);
                    self.stats.add_frames_moved(written as u64);
                    if written < frames {
                        break;
                    }
                }
                Err(BackendError::WouldBlock) => {
                    self.stats.record_would_block();
                    break;
                }
                Err(BackendError::Xrun) => {
                    self.recover_xrun();
                    break;
                }
                Err(BackendError::Disconnected) => return Err(BackendError::Disconnected),
                Err(err) => {
                    log::warn!("Device write failed: {}", err);
                    break;
                }
            }
        }

        if self.lead_in_frames + buf.in_device_frames() > 0
            && self.device.state() == DeviceState::Prepared
        {
            if let Err(err) = self.device.start() {
                log::warn!("Device start failed: {}", err);
            }
        }
        Ok(())
    }

    fn capture_tick(
        &mut self,
        buf: &mut StreamBuffer,
        gains: &[f32],
    ) -> std::result::Result<(), BackendError> {
        let mut remaining = match self.device.avail() {
            Ok(avail) => avail,
            Err(BackendError::Xrun) => {
                self.recover_xrun();
                return Ok(());
            }
            Err(BackendError::Disconnected) => return Err(BackendError::Disconnected),
            Err(BackendError::WouldBlock) => {
                self.stats.record_would_block();
                return Ok(());
            }
            Err(err) => {
                log::warn!("Unable to query captured frames: {}", err);
                return Ok(());
            }
        };

        let cfb = self.client_frame_bytes;
        while remaining > 0 {
            let (dropped, run) = buf.capture_run(remaining);
            if dropped > 0 {
                log::warn!("Capture overflow, dropped {} unread frames", dropped);
                self.stats.add_dropped(dropped as u64);
            }
            let frames = run.len() / cfb;
            if frames == 0 {
                break;
            }

            let read = if self.remapper.is_active() {
                match self.remapper.capture_scratch(frames) {
                    Ok(scratch) => self.device.read(scratch),
                    Err(err) => {
                        log::warn!("Remap scratch growth failed: {}", err);
                        break;
                    }
                }
            } else {
                self.device.read(run)
            };

            match read {
                Ok(n) => {
                    let region = &mut run[..n * cfb];
                    if self.remapper.is_active() {
                        self.remapper.unmap_capture(n, region);
                    }
                    self.gain.mute_zero_channels(region, gains);
                    buf.store_captured(n);
                    self.stats.add_frames_moved(n as u64);
                    remaining -= n.min(remaining);
                    if n < frames {
                        break;
                    }
                }
                Err(BackendError::WouldBlock) => {
                    self.stats.record_would_block();
                    break;
                }
                Err(BackendError::Xrun) => {
                    self.recover_xrun();
                    break;
                }
                Err(BackendError::Disconnected) => return Err(BackendError::Disconnected),
                Err(err) => {
                    log::warn!("Device read failed: {}", err);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stream 进入 Started
    ///
    /// Capture 先丢掉设备里残留的数据再启动；Render 在第一次推送后启动
    pub fn start(&mut self, now_ns: u64) -> std::result::Result<(), BackendError> {
        self.last_pump_ns = now_ns;
        if self.direction == Direction::Capture {
            match self.device.reset().and_then(|_| self.device.prepare()) {
                Ok(()) => {}
                Err(BackendError::Disconnected) => return Err(BackendError::Disconnected),
                Err(err) => log::debug!("Discarding stale capture data failed: {}", err),
            }
            match self.device.start() {
                Ok(()) => {}
                Err(BackendError::Disconnected) => return Err(BackendError::Disconnected),
                Err(err) => log::warn!("Capture start failed: {}", err),
            }
        }
        Ok(())
    }

    /// Stream 进入 Stopped
    ///
    /// Render 尽力回退硬件中尚未播放的数据，让它们重新成为 pending；
    /// 之后设备被清空并重新 prepare
    pub fn stop(&mut self, buf: &mut StreamBuffer, now_ns: u64, safety: Duration) {
        if self.direction == Direction::Render {
            self.rewind_on_stop(buf, now_ns, safety);
        }
        self.lead_in_frames = 0;
        if let Err(err) = self.device.reset().and_then(|_| self.device.prepare()) {
            log::debug!("Device reset on stop failed: {}", err);
        }
    }

    /// 估算：自上次 tick 以来的墙上时间 + 安全余量 = 硬件已播放的帧
    fn rewind_on_stop(&mut self, buf: &mut StreamBuffer, now_ns: u64, safety: Duration) {
        let elapsed = now_ns.saturating_sub(self.last_pump_ns) + safety.as_nanos() as u64;
        let played = ns_to_frames(elapsed, self.hw.sample_rate) as usize;

        let from_lead = played.min(self.lead_in_frames);
        let data_played = (played - from_lead).min(buf.in_device_frames());
        let unplayed = buf.in_device_frames() - data_played;

        let rewound = if unplayed > 0 {
            match self.device.rewind(unplayed) {
                Ok(n) => n.min(unplayed),
                Err(err) => {
                    log::debug!("Rewind failed: {}", err);
                    0
                }
            }
        } else {
            0
        };
        buf.unpush(rewound);
        let released = buf.consume_played(buf.in_device_frames());
        log::debug!(
            "Stop: rewound {} frames, {} treated as played",
            rewound,
            released
        );
    }

    /// Stream reset 之后计数器和统计归零
    pub fn reset(&mut self) {
        self.window.reset();
        self.lead_in_frames = 0;
        self.last_pump_ns = 0;
        self.stats.reset();
    }
}
