//! Stream：一个 buffer + 一个硬件 bridge + 一份 session 成员资格 + 生命周期状态机
//!
//! ```text
//! Created ──initialize──▶ Initialized ──start──▶ Started ⇄ Stopped
//!                              ▲                              │
//!                              └────────────reset─────────────┘
//! ```
//!
//! 所有公开方法都可以从任意线程并发调用。每个 Stream 一把锁，
//! 覆盖 ring 计数器、增益、outstanding region 和设备句柄；pump tick 全程持有它。

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crossbeam_utils::sync::Unparker;

use super::pump::PumpHandle;
use super::session::{check_level, SessionControl, SessionId, SessionKey, SessionRegistry};
use super::{ContextConfig, PumpMode};
use crate::audio::backend::{HwConfig, HwRequest, PcmBackend};
use crate::audio::bridge::HardwareBridge;
use crate::audio::clock::{ClockInput, PositionClock};
use crate::audio::format::{default_layout, Direction, StreamFormat};
use crate::audio::remap::ChannelMap;
use crate::audio::ring_buffer::{RegionSpan, StreamBuffer};
use crate::audio::stats::StatsReport;
use crate::audio::timing::{duration_to_frames, frames_to_duration};
use crate::audio::volume::{recompute_gain, SessionVolume};
use crate::error::{Result, StreamError};

/// Stream 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Initialized,
    Started,
    Stopped,
}

/// Initialize 参数
#[derive(Clone, Debug)]
pub struct StreamParams {
    pub format: StreamFormat,
    /// 客户端 buffer 时长
    pub duration: Duration,
    /// 设备周期；零表示使用默认周期
    pub period: Duration,
    /// 事件驱动模式：Start 之前必须注册事件句柄
    pub event_callback: bool,
    /// 加入的 session；`None` 时创建一个私有 session
    pub session: Option<SessionId>,
    /// 显式的 client→hardware 声道映射
    pub channel_map: Option<Vec<usize>>,
}

impl StreamParams {
    pub fn new(format: StreamFormat, duration: Duration) -> Self {
        Self {
            format,
            duration,
            period: Duration::ZERO,
            event_callback: false,
            session: None,
            channel_map: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn event_driven(mut self) -> Self {
        self.event_callback = true;
        self
    }

    pub fn with_session(mut self, id: SessionId) -> Self {
        self.session = Some(id);
        self
    }

    pub fn with_channel_map(mut self, map: Vec<usize>) -> Self {
        self.channel_map = Some(map);
        self
    }
}

/// 位置查询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPosition {
    /// 帧
    pub frames: u64,
    /// 采样该位置时的时钟读数（纳秒）
    pub timestamp_ns: u64,
}

/// Initialize 之后才存在的部分
struct StreamIo {
    format: StreamFormat,
    buffer: StreamBuffer,
    bridge: HardwareBridge,
    clock: PositionClock,
    vols: Vec<f32>,
    muted: bool,
    session_volume: SessionVolume,
    /// 合成增益，pump 每个 tick 读取
    gains: Vec<f32>,
    event_callback: bool,
    event: Option<Unparker>,
    session: SessionKey,
    pump_period: Duration,
}

impl StreamIo {
    fn recompute(&mut self) {
        recompute_gain(&self.vols, self.muted, &self.session_volume, &mut self.gains);
    }
}

pub(crate) struct StreamInner {
    state: StreamState,
    /// pump 观察到设备失效
    lost: bool,
    io: Option<StreamIo>,
}

impl StreamInner {
    #[inline]
    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    /// Session 音量变化时由 registry 在表锁内调用
    pub(crate) fn apply_session_volume(&mut self, volume: &SessionVolume) {
        if let Some(io) = self.io.as_mut() {
            io.session_volume.clone_from(volume);
            io.recompute();
        }
    }

    fn io(&mut self) -> Result<&mut StreamIo> {
        self.io.as_mut().ok_or(StreamError::NotInitialized)
    }

    /// 需要设备仍然有效的操作
    fn live_io(&mut self) -> Result<&mut StreamIo> {
        if self.lost {
            return Err(StreamError::DeviceInvalidated);
        }
        self.io()
    }
}

/// pump 线程与 session registry 共享的部分
pub(crate) struct StreamShared {
    direction: Direction,
    inner: Mutex<StreamInner>,
}

impl StreamShared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 一个 pump tick；Started 之外的状态什么也不做
    fn tick(&self, now_ns: u64) -> Result<()> {
        let mut inner = self.lock();
        let StreamInner { state, lost, io } = &mut *inner;
        let io = io.as_mut().ok_or(StreamError::NotInitialized)?;
        if *lost {
            return Err(StreamError::DeviceInvalidated);
        }
        if *state != StreamState::Started {
            return Ok(());
        }

        let result = io.bridge.tick(&mut io.buffer, &io.gains, now_ns);
        if let Some(event) = io.event.as_ref() {
            event.unpark();
        }
        result.map_err(|err| {
            log::warn!("{:?} stream lost its device: {}", self.direction, err);
            *lost = true;
            StreamError::DeviceInvalidated
        })
    }
}

/// 音频流
pub struct Stream {
    shared: Arc<StreamShared>,
    endpoint: String,
    backend: Arc<dyn PcmBackend>,
    registry: Arc<SessionRegistry>,
    config: ContextConfig,
    /// Start / Stop 串行化；锁顺序在 Stream 锁之前
    pump: Mutex<Option<PumpHandle>>,
}

impl Stream {
    pub(crate) fn new(
        endpoint: String,
        direction: Direction,
        backend: Arc<dyn PcmBackend>,
        registry: Arc<SessionRegistry>,
        config: ContextConfig,
    ) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                direction,
                inner: Mutex::new(StreamInner {
                    state: StreamState::Created,
                    lost: false,
                    io: None,
                }),
            }),
            endpoint,
            backend,
            registry,
            config,
            pump: Mutex::new(None),
        }
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<PumpHandle>> {
        self.pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_io<R>(&self, f: impl FnOnce(&mut StreamIo) -> Result<R>) -> Result<R> {
        f(self.shared.lock().io()?)
    }

    fn with_live_io<R>(&self, f: impl FnOnce(&mut StreamIo) -> Result<R>) -> Result<R> {
        f(self.shared.lock().live_io()?)
    }

    // ---- 生命周期 ----

    /// 协商格式，分配 ring buffer，打开设备，加入 session
    pub fn initialize(&self, params: StreamParams) -> Result<()> {
        if self.state() != StreamState::Created {
            return Err(StreamError::AlreadyInitialized);
        }
        let format = params.format;
        format.validate()?;

        let period = if params.period.is_zero() {
            self.config.default_period
        } else if params.period < self.config.minimum_period {
            return Err(StreamError::InvalidArgument("period"));
        } else {
            params.period
        };

        let capacity = duration_to_frames(params.duration, format.sample_rate);
        let period_frames = duration_to_frames(period, format.sample_rate).max(1);
        let request = HwRequest {
            format,
            period_frames,
            buffer_frames: capacity.max(2 * period_frames),
        };
        let device = self
            .backend
            .open(&self.endpoint, self.direction(), &request)?;
        let hw_channels = device.config().channels as usize;

        let map = match params.channel_map {
            Some(map) => {
                if map.len() != format.channels as usize {
                    return Err(StreamError::InvalidArgument("channel map length"));
                }
                ChannelMap::new(map, hw_channels)?
            }
            None => ChannelMap::between(
                &default_layout(format.channels as usize),
                &default_layout(hw_channels),
            )?,
        };

        let bridge = HardwareBridge::new(device, self.direction(), &format, map)?;
        let mut buffer = StreamBuffer::new(capacity, format.bytes_per_frame(), format.silence_byte())?;
        if self.config.lock_memory {
            buffer.lock_memory();
        }

        let session = SessionKey::new(
            params.session.unwrap_or_else(SessionId::random),
            self.endpoint.clone(),
        );
        let pump_period = frames_to_duration(bridge.period_frames(), format.sample_rate);
        let channels = format.channels as usize;
        let hw = bridge.config();

        self.registry
            .attach(&session.clone(), channels, &self.shared, |volume| {
                let mut inner = self.shared.lock();
                if inner.state != StreamState::Created {
                    return Err(StreamError::AlreadyInitialized);
                }
                let mut io = StreamIo {
                    format,
                    buffer,
                    bridge,
                    clock: PositionClock::new(),
                    vols: vec![1.0; channels],
                    muted: false,
                    session_volume: volume.clone(),
                    gains: Vec::with_capacity(channels),
                    event_callback: params.event_callback,
                    event: None,
                    session,
                    pump_period,
                };
                io.recompute();
                inner.io = Some(io);
                inner.state = StreamState::Initialized;
                Ok(())
            })?;

        log::info!(
            "{:?} stream initialized on '{}': {}, buffer {} frames, hw {}ch period {} / buffer {}",
            self.direction(),
            self.endpoint,
            format,
            capacity,
            hw.channels,
            hw.period_frames,
            hw.buffer_frames
        );
        Ok(())
    }

    /// 开始搬运；Timer 模式下启动 pump 线程
    pub fn start(&self) -> Result<()> {
        let mut pump = self.lock_pump();
        let (previous, period) = {
            let mut inner = self.shared.lock();
            let StreamInner { state, lost, io } = &mut *inner;
            let io = io.as_mut().ok_or(StreamError::NotInitialized)?;
            if *state == StreamState::Started {
                return Err(StreamError::NotStopped);
            }
            if io.event_callback && io.event.is_none() {
                return Err(StreamError::EventHandleNotSet);
            }
            if *lost {
                return Err(StreamError::DeviceInvalidated);
            }
            if io.bridge.start(self.config.clock.now_ns()).is_err() {
                *lost = true;
                return Err(StreamError::DeviceInvalidated);
            }
            let previous = *state;
            *state = StreamState::Started;
            (previous, io.pump_period)
        };

        if self.config.pump_mode == PumpMode::Timer {
            let weak: Weak<StreamShared> = Arc::downgrade(&self.shared);
            let clock = Arc::clone(&self.config.clock);
            let spawned = PumpHandle::spawn(
                format!("pcm-pump-{:?}", self.direction()).to_lowercase(),
                period,
                self.config.realtime_priority,
                move || match weak.upgrade() {
                    Some(shared) => {
                        let _ = shared.tick(clock.now_ns());
                        true
                    }
                    None => false,
                },
            );
            match spawned {
                Ok(handle) => *pump = Some(handle),
                Err(err) => {
                    self.shared.lock().state = previous;
                    return Err(err);
                }
            }
        }

        log::info!("{:?} stream on '{}' started", self.direction(), self.endpoint);
        Ok(())
    }

    /// 停止；已经停止时是 no-op
    ///
    /// Render 方向尽力回退硬件中尚未播放的帧。返回前等待 in-flight tick 结束
    pub fn stop(&self) -> Result<()> {
        let mut pump = self.lock_pump();
        {
            let mut inner = self.shared.lock();
            let StreamInner { state, lost, io } = &mut *inner;
            let io = io.as_mut().ok_or(StreamError::NotInitialized)?;
            if *state != StreamState::Started {
                return Ok(());
            }
            if !*lost {
                let now = self.config.clock.now_ns();
                io.bridge.stop(&mut io.buffer, now, self.config.rewind_safety);
            }
            *state = StreamState::Stopped;
        }

        // tick 需要 Stream 锁才能结束，join 必须在锁外
        if let Some(handle) = pump.take() {
            handle.shutdown();
        }
        log::info!("{:?} stream on '{}' stopped", self.direction(), self.endpoint);
        Ok(())
    }

    /// 清零计数器和偏移，回到 Initialized
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        let StreamInner { state, io, .. } = &mut *inner;
        let io = io.as_mut().ok_or(StreamError::NotInitialized)?;
        if *state == StreamState::Started {
            return Err(StreamError::NotStopped);
        }
        io.buffer.reset()?;
        io.bridge.reset();
        io.clock.reset();
        *state = StreamState::Initialized;
        log::debug!("{:?} stream on '{}' reset", self.shared.direction, self.endpoint);
        Ok(())
    }

    /// 注册事件句柄；每个 pump tick 之后 unpark
    pub fn set_event_handle(&self, handle: Unparker) -> Result<()> {
        self.with_io(|io| {
            if !io.event_callback {
                return Err(StreamError::EventHandleNotExpected);
            }
            io.event = Some(handle);
            Ok(())
        })
    }

    /// 手动执行一个 pump tick（`PumpMode::Manual`）
    pub fn pump(&self) -> Result<()> {
        self.shared.tick(self.config.clock.now_ns())
    }

    // ---- buffer region ----

    /// 申请 `frames` 帧的写区域（render）
    ///
    /// 区域 drop 时如果还没提交，按 0 帧提交
    pub fn acquire_write(&self, frames: usize) -> Result<RenderRegion<'_>> {
        if self.direction() != Direction::Render {
            return Err(StreamError::InvalidArgument("not a render stream"));
        }
        let span = self.with_live_io(|io| io.buffer.acquire_write(frames))?;
        Ok(RenderRegion {
            stream: self,
            span,
            released: false,
        })
    }

    /// 提交写区域的前 `frames` 帧；`silent` 时写入静音
    pub fn commit_write(&self, region: RenderRegion<'_>, frames: usize, silent: bool) -> Result<()> {
        region.commit(frames, silent)
    }

    /// 申请读区域（capture）：一次交出所有已采集的帧
    pub fn acquire_read(&self) -> Result<CaptureRegion<'_>> {
        if self.direction() != Direction::Capture {
            return Err(StreamError::InvalidArgument("not a capture stream"));
        }
        let (span, position) = self.with_live_io(|io| {
            let position = io.buffer.written_frames() - io.buffer.held_frames() as u64;
            Ok((io.buffer.acquire_read()?, position))
        })?;
        Ok(CaptureRegion {
            stream: self,
            span,
            position,
            released: false,
        })
    }

    /// 释放读区域的前 `frames` 帧
    pub fn commit_read(&self, region: CaptureRegion<'_>, frames: usize) -> Result<()> {
        region.commit(frames)
    }

    fn release_write(&self, frames: usize, silent: bool) -> Result<()> {
        self.with_io(|io| io.buffer.commit_write(frames, silent))
    }

    fn release_read(&self, frames: usize) -> Result<()> {
        self.with_io(|io| io.buffer.commit_read(frames))
    }

    // ---- 查询 ----

    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }

    pub fn buffer_size(&self) -> Result<usize> {
        self.with_io(|io| Ok(io.buffer.capacity()))
    }

    /// 已排队（render）或已采集（capture）的帧数
    pub fn current_padding(&self) -> Result<usize> {
        self.with_live_io(|io| Ok(io.buffer.held_frames()))
    }

    /// 下一个 capture 包的帧数
    pub fn next_packet_size(&self) -> Result<usize> {
        if self.direction() != Direction::Capture {
            return Err(StreamError::InvalidArgument("not a capture stream"));
        }
        self.current_padding()
    }

    /// 一个硬件周期 + 一个 pump 周期
    pub fn stream_latency(&self) -> Result<Duration> {
        self.with_io(|io| {
            let hw = frames_to_duration(io.bridge.period_frames(), io.format.sample_rate);
            Ok(hw + io.pump_period)
        })
    }

    /// 位置单位：每秒的帧数
    pub fn frequency(&self) -> Result<u64> {
        self.with_io(|io| Ok(io.format.sample_rate as u64))
    }

    pub fn position(&self) -> Result<StreamPosition> {
        let mut inner = self.shared.lock();
        let started = inner.state == StreamState::Started;
        let io = inner.live_io()?;
        let now_ns = self.config.clock.now_ns();
        let input = ClockInput {
            direction: self.shared.direction,
            written_frames: io.buffer.written_frames(),
            held_frames: io.buffer.held_frames(),
            sample_rate: io.format.sample_rate,
            period_frames: io.bridge.period_frames(),
            started,
            device_running: started && io.bridge.device_running(),
            last_pump_ns: io.bridge.last_pump_ns(),
            now_ns,
        };
        Ok(StreamPosition {
            frames: io.clock.position(&input),
            timestamp_ns: now_ns,
        })
    }

    pub fn channel_count(&self) -> Result<u16> {
        self.with_io(|io| Ok(io.format.channels))
    }

    pub fn format(&self) -> Result<StreamFormat> {
        self.with_io(|io| Ok(io.format))
    }

    pub fn hardware_config(&self) -> Result<HwConfig> {
        self.with_io(|io| Ok(io.bridge.config()))
    }

    pub fn channel_map(&self) -> Result<ChannelMap> {
        self.with_io(|io| Ok(io.bridge.channel_map().clone()))
    }

    pub fn stats(&self) -> Result<StatsReport> {
        self.with_io(|io| {
            Ok(io
                .bridge
                .stats()
                .report(io.bridge.period_frames(), io.format.sample_rate))
        })
    }

    pub fn session_id(&self) -> Result<SessionId> {
        self.with_io(|io| Ok(io.session.id))
    }

    /// 所属 session 的控制句柄
    pub fn session(&self) -> Result<SessionControl> {
        let key = self.with_io(|io| Ok(io.session.clone()))?;
        Ok(self.registry.control(key))
    }

    // ---- 音量 ----

    pub fn set_channel_volume(&self, index: usize, level: f32) -> Result<()> {
        check_level(level)?;
        self.with_io(|io| {
            let slot = io
                .vols
                .get_mut(index)
                .ok_or(StreamError::InvalidArgument("channel index"))?;
            *slot = level;
            io.recompute();
            Ok(())
        })
    }

    pub fn channel_volume(&self, index: usize) -> Result<f32> {
        self.with_io(|io| {
            io.vols
                .get(index)
                .copied()
                .ok_or(StreamError::InvalidArgument("channel index"))
        })
    }

    pub fn set_all_volumes(&self, levels: &[f32]) -> Result<()> {
        for &level in levels {
            check_level(level)?;
        }
        self.with_io(|io| {
            if levels.len() != io.vols.len() {
                return Err(StreamError::InvalidArgument("channel count"));
            }
            io.vols.copy_from_slice(levels);
            io.recompute();
            Ok(())
        })
    }

    pub fn all_volumes(&self) -> Result<Vec<f32>> {
        self.with_io(|io| Ok(io.vols.clone()))
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        self.with_io(|io| {
            io.muted = mute;
            io.recompute();
            Ok(())
        })
    }

    pub fn mute(&self) -> Result<bool> {
        self.with_io(|io| Ok(io.muted))
    }

    /// pump 实际使用的合成增益
    pub fn combined_gains(&self) -> Result<Vec<f32>> {
        self.with_io(|io| Ok(io.gains.clone()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            if !matches!(err, StreamError::NotInitialized) {
                log::debug!("Stop on drop failed: {}", err);
            }
        }
        let key = self.shared.lock().io.as_ref().map(|io| io.session.clone());
        if let Some(key) = key {
            self.registry.detach(&key, &self.shared);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("direction", &self.shared.direction)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// Render 写区域
///
/// 区域内存在 commit 之前只属于调用方，pump 看不到
pub struct RenderRegion<'a> {
    stream: &'a Stream,
    span: RegionSpan,
    released: bool,
}

impl RenderRegion<'_> {
    #[inline]
    pub fn frames(&self) -> usize {
        self.span.frames()
    }

    /// 提交前 `frames` 帧；出错时区域按 0 帧释放
    pub fn commit(mut self, frames: usize, silent: bool) -> Result<()> {
        self.released = true;
        let result = self.stream.release_write(frames, silent);
        if result.is_err() {
            let _ = self.stream.release_write(0, false);
        }
        result
    }
}

impl Deref for RenderRegion<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { self.span.as_slice() }
    }
}

impl DerefMut for RenderRegion<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { self.span.as_mut_slice() }
    }
}

impl Drop for RenderRegion<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.stream.release_write(0, false);
        }
    }
}

/// Capture 读区域
pub struct CaptureRegion<'a> {
    stream: &'a Stream,
    span: RegionSpan,
    position: u64,
    released: bool,
}

impl CaptureRegion<'_> {
    #[inline]
    pub fn frames(&self) -> usize {
        self.span.frames()
    }

    /// 区域第一帧的 stream 位置
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// 释放前 `frames` 帧
    pub fn commit(mut self, frames: usize) -> Result<()> {
        self.released = true;
        let result = self.stream.release_read(frames);
        if result.is_err() {
            let _ = self.stream.release_read(0);
        }
        result
    }
}

impl Deref for CaptureRegion<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { self.span.as_slice() }
    }
}

impl Drop for CaptureRegion<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.stream.release_read(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::{DeviceState, VirtualBackend, VirtualConfig};
    use crate::audio::format::SampleEncoding;
    use crate::audio::timing::{Clock, ManualClock, SystemClock};
    use crate::engine::session::SessionState;
    use crate::engine::AudioContext;
    use crate::error::BackendError;

    const RATE: u32 = 48000;

    struct Rig {
        ctx: AudioContext,
        backend: Arc<VirtualBackend>,
        clock: Arc<ManualClock>,
    }

    fn rig(config: VirtualConfig) -> Rig {
        let backend = Arc::new(VirtualBackend::new(config));
        let clock = Arc::new(ManualClock::new(1_000_000));
        let ctx = AudioContext::new(
            backend.clone(),
            ContextConfig {
                pump_mode: PumpMode::Manual,
                clock: clock.clone(),
                ..Default::default()
            },
        );
        Rig { ctx, backend, clock }
    }

    fn stereo_s16() -> StreamFormat {
        StreamFormat::new(RATE, 2, SampleEncoding::S16)
    }

    fn s16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn to_s16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn render_stream(r: &Rig, params: StreamParams) -> Stream {
        let stream = r.ctx.new_stream("default", Direction::Render);
        stream.initialize(params).unwrap();
        stream
    }

    fn write_frames(stream: &Stream, samples: &[i16]) {
        let bytes = s16(samples);
        let frames = bytes.len() / stream.format().unwrap().bytes_per_frame();
        let mut region = stream.acquire_write(frames).unwrap();
        region.copy_from_slice(&bytes);
        region.commit(frames, false).unwrap();
    }

    #[test]
    fn test_end_to_end_render() {
        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        assert_eq!(stream.buffer_size().unwrap(), 480);

        let mut region = stream.acquire_write(480).unwrap();
        assert_eq!(region.len(), 480 * 4);
        region.fill(0x11);
        stream.commit_write(region, 480, false).unwrap();
        assert_eq!(stream.current_padding().unwrap(), 480);

        stream.start().unwrap();
        r.clock.advance(Duration::from_millis(10));
        stream.pump().unwrap();
        // 设备刚启动，还没有消费
        assert_eq!(stream.current_padding().unwrap(), 480);

        let probe = r.backend.last_probe().unwrap();
        assert_eq!(probe.state(), DeviceState::Running);
        assert_eq!(probe.consume(160), 160);
        r.clock.advance(Duration::from_millis(10));
        stream.pump().unwrap();
        assert_eq!(stream.current_padding().unwrap(), 480 - 160);
        let stats = stream.stats().unwrap();
        assert_eq!(stats.tick_count, 2);
        assert!(stats.frames_moved > 0);

        stream.stop().unwrap();
        stream.reset().unwrap();
        assert_eq!(stream.current_padding().unwrap(), 0);
        let stats = stream.stats().unwrap();
        assert_eq!(stats.tick_count, 0);
        assert_eq!(stats.frames_moved, 0);
        assert_eq!(stream.state(), StreamState::Initialized);
        assert_eq!(stream.position().unwrap().frames, 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(20)));
        write_frames(&stream, &[5; 960]);
        stream.start().unwrap();
        stream.pump().unwrap();
        r.backend.last_probe().unwrap().consume(100);
        stream.pump().unwrap();

        stream.stop().unwrap();
        let padding = stream.current_padding().unwrap();
        let position = stream.position().unwrap().frames;
        stream.stop().unwrap();
        assert_eq!(stream.current_padding().unwrap(), padding);
        assert_eq!(stream.position().unwrap().frames, position);
        assert_eq!(stream.state(), StreamState::Stopped);

        // 停止状态可以再次启动
        stream.start().unwrap();
        assert_eq!(stream.state(), StreamState::Started);
    }

    #[test]
    fn test_session_mute_zeroes_every_member() {
        let r = rig(VirtualConfig::default());
        let id = SessionId(42);
        let params = StreamParams::new(stereo_s16(), Duration::from_millis(10)).with_session(id);
        let a = render_stream(&r, params.clone());
        let b = render_stream(&r, params);
        a.set_channel_volume(0, 0.3).unwrap();
        b.set_all_volumes(&[0.7, 0.9]).unwrap();

        let session = a.session().unwrap();
        assert_eq!(session.channel_count(), 2);
        session.set_master_volume(0.5).unwrap();
        assert_eq!(a.combined_gains().unwrap(), vec![0.15, 0.5]);

        session.set_mute(true).unwrap();
        assert_eq!(a.combined_gains().unwrap(), vec![0.0, 0.0]);
        assert_eq!(b.combined_gains().unwrap(), vec![0.0, 0.0]);

        write_frames(&a, &[12000; 960]);
        a.start().unwrap();
        a.pump().unwrap();
        let probe = r.backend.probes()[0].clone();
        assert_eq!(probe.written().len(), 480 * 4);
        assert!(probe.written().iter().all(|&b| b == 0));

        session.set_mute(false).unwrap();
        assert_eq!(b.combined_gains().unwrap(), vec![0.35, 0.45]);
    }

    #[test]
    fn test_stream_mute_folds_into_gain() {
        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        stream.set_mute(true).unwrap();
        assert!(stream.mute().unwrap());
        assert_eq!(stream.combined_gains().unwrap(), vec![0.0, 0.0]);
        // session 不受影响
        assert!(!stream.session().unwrap().mute());
    }

    #[test]
    fn test_channel_volume_scales_one_channel() {
        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        stream.set_channel_volume(0, 0.5).unwrap();

        let frames: Vec<i16> = std::iter::repeat([32767i16, 32767]).take(480).flatten().collect();
        write_frames(&stream, &frames);
        stream.start().unwrap();
        stream.pump().unwrap();

        let written = to_s16(&r.backend.last_probe().unwrap().written());
        assert_eq!(written.len(), 960);
        for frame in written.chunks_exact(2) {
            assert_eq!(frame, &[16383, 32767]);
        }
    }

    #[test]
    fn test_stereo_remapped_onto_quad_hardware() {
        let r = rig(VirtualConfig {
            hw_channels: Some(4),
            ..Default::default()
        });
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        assert_eq!(stream.hardware_config().unwrap().channels, 4);

        let frames: Vec<i16> = (0..480).flat_map(|i| [i as i16 + 1, -(i as i16) - 1]).collect();
        write_frames(&stream, &frames);
        stream.start().unwrap();
        stream.pump().unwrap();

        let written = to_s16(&r.backend.last_probe().unwrap().written());
        assert_eq!(written.len(), 480 * 4);
        for (i, frame) in written.chunks_exact(4).enumerate() {
            assert_eq!(frame[0], i as i16 + 1);
            assert_eq!(frame[1], -(i as i16) - 1);
            assert_eq!(&frame[2..], &[0, 0]);
        }
    }

    #[test]
    fn test_explicit_channel_map() {
        let r = rig(VirtualConfig {
            hw_channels: Some(4),
            ..Default::default()
        });
        let stream = render_stream(
            &r,
            StreamParams::new(stereo_s16(), Duration::from_millis(10)).with_channel_map(vec![2, 3]),
        );
        assert_eq!(stream.channel_map().unwrap().target(0), Some(2));

        let frames: Vec<i16> = std::iter::repeat([7i16, 9]).take(480).flatten().collect();
        write_frames(&stream, &frames);
        stream.start().unwrap();
        stream.pump().unwrap();
        let written = to_s16(&r.backend.last_probe().unwrap().written());
        assert_eq!(&written[..4], &[0, 0, 7, 9]);

        let bad = r.ctx.new_stream("default", Direction::Render);
        assert!(matches!(
            bad.initialize(StreamParams::new(stereo_s16(), Duration::from_millis(10)).with_channel_map(vec![0])),
            Err(StreamError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_position_is_monotonic() {
        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(40)));
        write_frames(&stream, &[100; 1920 * 2]);
        stream.start().unwrap();
        stream.pump().unwrap();
        let probe = r.backend.last_probe().unwrap();

        let mut last = 0;
        for step in 0..40 {
            r.clock.advance(Duration::from_millis(1));
            if step % 10 == 9 {
                probe.consume(480);
                stream.pump().unwrap();
            }
            let position = stream.position().unwrap();
            assert!(position.frames >= last, "position went backwards at step {}", step);
            assert_eq!(position.timestamp_ns, r.clock.now_ns());
            last = position.frames;
        }
        assert!(last > 0);
        assert!(last <= 1920);
    }

    #[test]
    fn test_buffer_invariants_under_random_traffic() {
        use rand::Rng;

        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(30)));
        let capacity = stream.buffer_size().unwrap();
        let probe = r.backend.last_probe().unwrap();
        stream.start().unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            match rng.gen_range(0..3) {
                0 => {
                    let free = capacity - stream.current_padding().unwrap();
                    let frames = rng.gen_range(0..=free);
                    let region = stream.acquire_write(frames).unwrap();
                    let commit = rng.gen_range(0..=frames);
                    region.commit(commit, rng.gen_bool(0.2)).unwrap();
                }
                1 => {
                    probe.consume(rng.gen_range(0..200));
                }
                _ => {
                    r.clock.advance(Duration::from_millis(rng.gen_range(1..12)));
                    stream.pump().unwrap();
                }
            }
            let padding = stream.current_padding().unwrap();
            assert!(padding <= capacity);
            let inner = stream.shared.lock();
            let buffer = &inner.io.as_ref().unwrap().buffer;
            assert!(buffer.in_device_frames() <= buffer.held_frames());
        }
    }

    #[test]
    fn test_lifecycle_errors() {
        let r = rig(VirtualConfig::default());
        let stream = r.ctx.new_stream("default", Direction::Render);
        assert!(matches!(stream.start(), Err(StreamError::NotInitialized)));
        assert!(matches!(stream.stop(), Err(StreamError::NotInitialized)));
        assert!(matches!(stream.reset(), Err(StreamError::NotInitialized)));
        assert!(matches!(stream.current_padding(), Err(StreamError::NotInitialized)));
        assert!(matches!(stream.acquire_write(1), Err(StreamError::NotInitialized)));

        let params = StreamParams::new(stereo_s16(), Duration::from_millis(10));
        stream.initialize(params.clone()).unwrap();
        assert!(matches!(
            stream.initialize(params),
            Err(StreamError::AlreadyInitialized)
        ));

        stream.start().unwrap();
        assert!(matches!(stream.start(), Err(StreamError::NotStopped)));
        assert!(matches!(stream.reset(), Err(StreamError::NotStopped)));
        stream.stop().unwrap();

        // 初始化后、启动前 Stop 也是 no-op
        stream.reset().unwrap();
        stream.stop().unwrap();
        assert_eq!(stream.state(), StreamState::Initialized);
    }

    #[test]
    fn test_region_errors() {
        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));

        assert!(matches!(stream.acquire_write(481), Err(StreamError::BufferTooLarge)));

        let region = stream.acquire_write(100).unwrap();
        assert!(matches!(stream.acquire_write(1), Err(StreamError::OutOfOrder)));
        assert!(matches!(stream.reset(), Err(StreamError::BufferOperationPending)));
        assert!(matches!(region.commit(101, false), Err(StreamError::InvalidSize)));
        // 出错的区域已释放
        assert_eq!(stream.current_padding().unwrap(), 0);

        // drop 等同于提交 0 帧
        let region = stream.acquire_write(50).unwrap();
        drop(region);
        assert_eq!(stream.current_padding().unwrap(), 0);
        stream.reset().unwrap();

        // 0 帧也占住区域
        let empty = stream.acquire_write(0).unwrap();
        assert!(empty.is_empty());
        assert!(matches!(stream.acquire_write(1), Err(StreamError::OutOfOrder)));
        empty.commit(0, false).unwrap();

        assert!(matches!(stream.acquire_read(), Err(StreamError::InvalidArgument(_))));
        assert!(matches!(stream.next_packet_size(), Err(StreamError::InvalidArgument(_))));
    }

    #[test]
    fn test_acquire_beyond_free_space_with_frames_held() {
        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        stream.acquire_write(1).unwrap().commit(1, false).unwrap();

        assert!(matches!(
            stream.acquire_write(usize::MAX),
            Err(StreamError::BufferTooLarge)
        ));
        assert!(matches!(stream.acquire_write(480), Err(StreamError::BufferTooLarge)));
        let region = stream.acquire_write(479).unwrap();
        assert_eq!(region.frames(), 479);
        assert_eq!(region.len(), 479 * 4);
        region.commit(479, false).unwrap();
        assert_eq!(stream.current_padding().unwrap(), 480);
    }

    #[test]
    fn test_silent_commit_writes_silence() {
        let r = rig(VirtualConfig::default());
        let format = StreamFormat::new(RATE, 1, SampleEncoding::U8);
        let stream = render_stream(&r, StreamParams::new(format, Duration::from_millis(10)));
        let mut region = stream.acquire_write(480).unwrap();
        region.fill(0x33);
        region.commit(480, true).unwrap();
        stream.start().unwrap();
        stream.pump().unwrap();
        assert!(r.backend.last_probe().unwrap().written().iter().all(|&b| b == 0x80));
    }

    #[test]
    fn test_event_handle() {
        let r = rig(VirtualConfig::default());
        let parker = crossbeam_utils::sync::Parker::new();

        let plain = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        assert!(matches!(
            plain.set_event_handle(parker.unparker().clone()),
            Err(StreamError::EventHandleNotExpected)
        ));

        let evented = render_stream(
            &r,
            StreamParams::new(stereo_s16(), Duration::from_millis(10)).event_driven(),
        );
        assert!(matches!(evented.start(), Err(StreamError::EventHandleNotSet)));
        evented.set_event_handle(parker.unparker().clone()).unwrap();
        evented.start().unwrap();
        evented.pump().unwrap();
        // tick 之后 token 已就绪，park 立即返回
        parker.park();
    }

    #[test]
    fn test_period_validation() {
        let r = rig(VirtualConfig::default());
        let stream = r.ctx.new_stream("default", Direction::Render);
        assert!(matches!(
            stream.initialize(
                StreamParams::new(stereo_s16(), Duration::from_millis(10))
                    .with_period(Duration::from_millis(1))
            ),
            Err(StreamError::InvalidArgument("period"))
        ));
        stream
            .initialize(
                StreamParams::new(stereo_s16(), Duration::from_millis(10))
                    .with_period(Duration::from_millis(5)),
            )
            .unwrap();
        assert_eq!(stream.hardware_config().unwrap().period_frames, 240);
        assert_eq!(stream.stream_latency().unwrap(), Duration::from_millis(10));
        assert_eq!(stream.frequency().unwrap(), 48000);
    }

    #[test]
    fn test_open_failures_surface() {
        let r = rig(VirtualConfig::default());
        let stream = r.ctx.new_stream("nowhere", Direction::Render);
        assert!(matches!(
            stream.initialize(StreamParams::new(stereo_s16(), Duration::from_millis(10))),
            Err(StreamError::Device(BackendError::DeviceNotFound(_)))
        ));

        r.backend.fail_next_open(BackendError::Native { code: -16, op: "open" });
        let stream = r.ctx.new_stream("default", Direction::Render);
        assert!(matches!(
            stream.initialize(StreamParams::new(stereo_s16(), Duration::from_millis(10))),
            Err(StreamError::Device(BackendError::Native { code: -16, .. }))
        ));
        // 失败后仍是 Created，可以重试
        stream
            .initialize(StreamParams::new(stereo_s16(), Duration::from_millis(10)))
            .unwrap();

        let bad = r.ctx.new_stream("default", Direction::Render);
        let format = StreamFormat::new(RATE, 0, SampleEncoding::S16);
        assert!(bad
            .initialize(StreamParams::new(format, Duration::from_millis(10)))
            .is_err());
    }

    #[test]
    fn test_disconnect_invalidates_stream() {
        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        write_frames(&stream, &[1; 960]);
        stream.start().unwrap();
        r.backend.last_probe().unwrap().disconnect();

        assert!(matches!(stream.pump(), Err(StreamError::DeviceInvalidated)));
        assert!(matches!(stream.current_padding(), Err(StreamError::DeviceInvalidated)));
        assert!(matches!(stream.acquire_write(1), Err(StreamError::DeviceInvalidated)));
        stream.stop().unwrap();
        assert!(matches!(stream.start(), Err(StreamError::DeviceInvalidated)));
    }

    #[test]
    fn test_capture_flow() {
        let r = rig(VirtualConfig::default());
        let stream = r.ctx.new_stream("default", Direction::Capture);
        stream
            .initialize(StreamParams::new(stereo_s16(), Duration::from_millis(10)))
            .unwrap();
        stream.start().unwrap();
        let probe = r.backend.last_probe().unwrap();

        probe.inject(&s16(&[1, 2, 3, 4, 5, 6]));
        stream.pump().unwrap();
        assert_eq!(stream.next_packet_size().unwrap(), 3);
        assert_eq!(stream.position().unwrap().frames, 3);

        let region = stream.acquire_read().unwrap();
        assert_eq!(region.frames(), 3);
        assert_eq!(region.position(), 0);
        assert_eq!(to_s16(&region), vec![1, 2, 3, 4, 5, 6]);
        stream.commit_read(region, 2).unwrap();
        assert_eq!(stream.current_padding().unwrap(), 1);

        probe.inject(&s16(&[7, 8, 9, 10]));
        stream.pump().unwrap();
        let region = stream.acquire_read().unwrap();
        assert_eq!(region.position(), 2);
        assert_eq!(to_s16(&region), vec![5, 6, 7, 8, 9, 10]);
        region.commit(2).unwrap();
        assert_eq!(stream.current_padding().unwrap(), 1);
        assert_eq!(stream.position().unwrap().frames, 5);

        assert!(matches!(stream.acquire_write(1), Err(StreamError::InvalidArgument(_))));
    }

    #[test]
    fn test_capture_zero_gain_channel_is_silenced() {
        let r = rig(VirtualConfig::default());
        let stream = r.ctx.new_stream("default", Direction::Capture);
        stream
            .initialize(StreamParams::new(stereo_s16(), Duration::from_millis(10)))
            .unwrap();
        stream.set_channel_volume(1, 0.0).unwrap();
        stream.start().unwrap();
        r.backend.last_probe().unwrap().inject(&s16(&[10, 20, 30, 40]));
        stream.pump().unwrap();
        let region = stream.acquire_read().unwrap();
        assert_eq!(to_s16(&region), vec![10, 0, 30, 0]);
    }

    #[test]
    fn test_session_state_follows_members() {
        let r = rig(VirtualConfig::default());
        let id = SessionId(7);
        let stream = render_stream(
            &r,
            StreamParams::new(stereo_s16(), Duration::from_millis(10)).with_session(id),
        );
        let session = stream.session().unwrap();
        assert_eq!(session.state(), SessionState::Inactive);
        stream.start().unwrap();
        assert_eq!(session.state(), SessionState::Active);
        stream.stop().unwrap();
        assert_eq!(session.state(), SessionState::Inactive);

        drop(stream);
        assert_eq!(session.state(), SessionState::Expired);
        // session 保留到显式回收
        assert_eq!(r.ctx.sessions().len(), 1);
        assert_eq!(r.ctx.registry().prune_expired(), 1);
    }

    #[test]
    fn test_session_volume_preserved_across_streams() {
        let r = rig(VirtualConfig::default());
        let id = SessionId(9);
        let control = r.ctx.session(id, "default");
        assert_eq!(control.channel_count(), 0);

        let mono = render_stream(
            &r,
            StreamParams::new(StreamFormat::new(RATE, 1, SampleEncoding::S16), Duration::from_millis(10))
                .with_session(id),
        );
        assert_eq!(control.channel_count(), 1);
        control.set_channel_volume(0, 0.25).unwrap();
        drop(mono);

        let stereo = render_stream(
            &r,
            StreamParams::new(stereo_s16(), Duration::from_millis(10)).with_session(id),
        );
        assert_eq!(control.all_volumes(), vec![0.25, 1.0]);
        assert_eq!(stereo.combined_gains().unwrap(), vec![0.25, 1.0]);
    }

    #[test]
    fn test_private_sessions_are_distinct() {
        let r = rig(VirtualConfig::default());
        let a = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        let b = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        assert_ne!(a.session_id().unwrap(), b.session_id().unwrap());
        a.session().unwrap().set_mute(true).unwrap();
        assert_eq!(b.combined_gains().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_volume_validation() {
        let r = rig(VirtualConfig::default());
        let stream = render_stream(&r, StreamParams::new(stereo_s16(), Duration::from_millis(10)));
        assert!(matches!(
            stream.set_channel_volume(2, 0.5),
            Err(StreamError::InvalidArgument("channel index"))
        ));
        assert!(stream.set_channel_volume(0, -0.1).is_err());
        assert!(stream.set_all_volumes(&[0.5]).is_err());
        assert!(stream.channel_volume(5).is_err());
        stream.set_all_volumes(&[0.5, 0.25]).unwrap();
        assert_eq!(stream.all_volumes().unwrap(), vec![0.5, 0.25]);
        assert_eq!(stream.channel_volume(1).unwrap(), 0.25);
    }

    #[test]
    fn test_timer_pump_drives_realtime_device() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backend = Arc::new(VirtualBackend::new(VirtualConfig {
            realtime: Some(clock.clone()),
            ..Default::default()
        }));
        let ctx = AudioContext::new(
            backend.clone(),
            ContextConfig {
                pump_mode: PumpMode::Timer,
                clock,
                ..Default::default()
            },
        );
        let stream = ctx.new_stream("default", Direction::Render);
        stream
            .initialize(StreamParams::new(stereo_s16(), Duration::from_millis(100)))
            .unwrap();
        write_frames(&stream, &[1000; 4800 * 2]);
        stream.start().unwrap();
        std::thread::sleep(Duration::from_millis(80));
        stream.stop().unwrap();

        let stats = stream.stats().unwrap();
        assert!(stats.tick_count > 0);
        assert!(!backend.last_probe().unwrap().written().is_empty());
        assert!(stream.current_padding().unwrap() <= 4800);
    }
}
