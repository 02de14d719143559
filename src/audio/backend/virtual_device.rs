//! 软件模拟的硬件设备
//!
//! 用一个字节队列模拟硬件 ring：
//! - Render：`write` 入队，[`VirtualProbe::consume`] 或实时时钟出队（"播放"）
//! - Capture：[`VirtualProbe::inject`] 或实时时钟入队，`read` 出队
//!
//! [`VirtualProbe`] 是宿主（或测试）驱动设备的句柄：强制 XRUN、would-block、
//! 拔出设备，以及检查写入过的每个字节。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{DeviceCaps, DeviceState, HwConfig, HwRequest, PcmBackend, PcmDevice};
use crate::audio::format::{Direction, SampleEncoding};
use crate::audio::timing::{ns_to_frames, Clock};
use crate::error::BackendError;

/// EBADFD：设备状态不允许该操作
const EBADFD: i32 = -77;

/// written / played 记录默认保留的字节数
pub const DEFAULT_HISTORY_BYTES: usize = 4 << 20;

/// 虚拟设备配置
#[derive(Clone)]
pub struct VirtualConfig {
    /// 可打开的 endpoint 名称
    pub endpoints: Vec<String>,
    pub encodings: Vec<SampleEncoding>,
    pub max_channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
    /// 固定的硬件声道数；`None` 时跟随客户端
    pub hw_channels: Option<u16>,
    /// 固定的硬件周期（帧）；`None` 时跟随请求
    pub period_frames: Option<usize>,
    /// 固定的硬件 buffer（帧）；`None` 时跟随请求
    pub buffer_frames: Option<usize>,
    /// 设置后按时钟实时消费 / 产生帧
    pub realtime: Option<Arc<dyn Clock>>,
    /// written / played 各自最多保留的字节数，超出时丢弃最旧的整帧
    pub history_bytes: usize,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["default".to_string()],
            encodings: vec![
                SampleEncoding::F32,
                SampleEncoding::S16,
                SampleEncoding::U8,
                SampleEncoding::S32,
                SampleEncoding::S24Packed,
                SampleEncoding::S20Packed,
                SampleEncoding::F64,
            ],
            max_channels: 8,
            min_rate: 8000,
            max_rate: 192_000,
            hw_channels: None,
            period_frames: None,
            buffer_frames: None,
            realtime: None,
            history_bytes: DEFAULT_HISTORY_BYTES,
        }
    }
}

impl std::fmt::Debug for VirtualConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualConfig")
            .field("endpoints", &self.endpoints)
            .field("encodings", &self.encodings)
            .field("max_channels", &self.max_channels)
            .field("hw_channels", &self.hw_channels)
            .field("realtime", &self.realtime.is_some())
            .field("history_bytes", &self.history_bytes)
            .finish()
    }
}

/// 虚拟后端
pub struct VirtualBackend {
    config: VirtualConfig,
    opened: Mutex<Vec<VirtualProbe>>,
    fail_next_open: Mutex<Option<BackendError>>,
}

impl VirtualBackend {
    pub fn new(config: VirtualConfig) -> Self {
        Self {
            config,
            opened: Mutex::new(Vec::new()),
            fail_next_open: Mutex::new(None),
        }
    }

    /// 下一次 `open` 返回指定错误
    pub fn fail_next_open(&self, err: BackendError) {
        *lock(&self.fail_next_open) = Some(err);
    }

    /// 最近打开的设备
    pub fn last_probe(&self) -> Option<VirtualProbe> {
        lock(&self.opened).last().cloned()
    }

    /// 按打开顺序返回所有设备
    pub fn probes(&self) -> Vec<VirtualProbe> {
        lock(&self.opened).clone()
    }

    fn check_endpoint(&self, endpoint: &str) -> Result<(), BackendError> {
        if self.config.endpoints.iter().any(|e| e == endpoint) {
            Ok(())
        } else {
            Err(BackendError::DeviceNotFound(endpoint.to_string()))
        }
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new(VirtualConfig::default())
    }
}

impl PcmBackend for VirtualBackend {
    fn name(&self) -> &str {
        "virtual"
    }

    fn capabilities(&self, endpoint: &str, _direction: Direction) -> Result<DeviceCaps, BackendError> {
        self.check_endpoint(endpoint)?;
        let (min_channels, max_channels) = match self.config.hw_channels {
            Some(ch) => (1, ch),
            None => (1, self.config.max_channels),
        };
        Ok(DeviceCaps {
            encodings: self.config.encodings.clone(),
            min_channels,
            max_channels,
            min_rate: self.config.min_rate,
            max_rate: self.config.max_rate,
        })
    }

    fn open(
        &self,
        endpoint: &str,
        direction: Direction,
        request: &HwRequest,
    ) -> Result<Box<dyn PcmDevice>, BackendError> {
        if let Some(err) = lock(&self.fail_next_open).take() {
            return Err(err);
        }
        self.check_endpoint(endpoint)?;

        let format = &request.format;
        if !self.config.encodings.contains(&format.encoding) {
            return Err(BackendError::Unsupported(format!("{:?}", format.encoding)));
        }
        if !(self.config.min_rate..=self.config.max_rate).contains(&format.sample_rate) {
            return Err(BackendError::Unsupported(format!("{} Hz", format.sample_rate)));
        }
        let channels = self.config.hw_channels.unwrap_or(format.channels);
        if channels < format.channels || channels > self.config.max_channels {
            return Err(BackendError::Unsupported(format!("{} channels", format.channels)));
        }

        let period_frames = self.config.period_frames.unwrap_or(request.period_frames).max(1);
        let buffer_frames = self
            .config
            .buffer_frames
            .unwrap_or(request.buffer_frames)
            .max(period_frames);
        let config = HwConfig {
            channels,
            encoding: format.encoding,
            sample_rate: format.sample_rate,
            period_frames,
            buffer_frames,
        };

        let inner = Arc::new(Mutex::new(VirtualInner {
            direction,
            config,
            state: DeviceState::Prepared,
            disconnected: false,
            queue: VecDeque::new(),
            written: VecDeque::new(),
            played: VecDeque::new(),
            history_bytes: self.config.history_bytes,
            block_next: 0,
            rewound: 0,
            starts: 0,
            realtime: self.config.realtime.clone().map(|clock| Realtime {
                clock,
                started_ns: 0,
                frames_done: 0,
            }),
            pattern: Vec::new(),
            pattern_pos: 0,
        }));

        log::debug!(
            "Virtual {:?} device '{}' opened: {}ch {:?} {}Hz, period {} / buffer {} frames",
            direction,
            endpoint,
            channels,
            config.encoding,
            config.sample_rate,
            period_frames,
            buffer_frames
        );

        lock(&self.opened).push(VirtualProbe {
            inner: Arc::clone(&inner),
        });
        Ok(Box::new(VirtualDevice { inner }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Realtime {
    clock: Arc<dyn Clock>,
    started_ns: u64,
    frames_done: u64,
}

struct VirtualInner {
    direction: Direction,
    config: HwConfig,
    state: DeviceState,
    disconnected: bool,
    /// 设备 ring 中的字节
    queue: VecDeque<u8>,
    /// render：最近写入的字节
    written: VecDeque<u8>,
    /// render：最近"播放"的字节
    played: VecDeque<u8>,
    history_bytes: usize,
    block_next: usize,
    rewound: u64,
    starts: u64,
    realtime: Option<Realtime>,
    /// capture 实时模式下循环产生的字节
    pattern: Vec<u8>,
    pattern_pos: usize,
}

impl VirtualInner {
    #[inline]
    fn frame_bytes(&self) -> usize {
        self.config.bytes_per_frame()
    }

    #[inline]
    fn queued_frames(&self) -> usize {
        self.queue.len() / self.frame_bytes()
    }

    /// 把 `history` 截到上限以内，按整帧丢弃最旧的数据
    fn trim_history(history: &mut VecDeque<u8>, limit: usize, frame_bytes: usize) {
        if history.len() > limit {
            let excess = (history.len() - limit).div_ceil(frame_bytes) * frame_bytes;
            history.drain(..excess.min(history.len()));
        }
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.disconnected {
            Err(BackendError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// 出队 `frames` 帧（render 播放）；不够时进入 XRUN
    fn play(&mut self, frames: usize) -> usize {
        let available = self.queued_frames();
        let n = frames.min(available);
        let bytes = n * self.frame_bytes();
        self.played.extend(self.queue.drain(..bytes));
        let frame_bytes = self.frame_bytes();
        Self::trim_history(&mut self.played, self.history_bytes, frame_bytes);
        if frames > available && self.state == DeviceState::Running {
            self.state = DeviceState::Xrun;
        }
        n
    }

    /// 入队 `bytes`（capture 采集）；溢出时进入 XRUN
    fn capture(&mut self, bytes: &[u8]) {
        let capacity = self.config.buffer_frames * self.frame_bytes();
        let room = capacity.saturating_sub(self.queue.len());
        let take = bytes.len().min(room) / self.frame_bytes() * self.frame_bytes();
        self.queue.extend(&bytes[..take]);
        if take < bytes.len() && self.state == DeviceState::Running {
            self.state = DeviceState::Xrun;
        }
    }

    /// 实时模式：按时钟推进
    fn sync_realtime(&mut self) {
        if self.state != DeviceState::Running {
            return;
        }
        let due = match self.realtime.as_mut() {
            Some(rt) => {
                let elapsed = rt.clock.now_ns().saturating_sub(rt.started_ns);
                let target = ns_to_frames(elapsed, self.config.sample_rate);
                let due = target.saturating_sub(rt.frames_done);
                rt.frames_done = target;
                due as usize
            }
            None => return,
        };
        if due == 0 {
            return;
        }
        match self.direction {
            Direction::Render => {
                self.play(due);
            }
            Direction::Capture => {
                let bytes = due * self.frame_bytes();
                let silence = self.config.encoding.silence_byte();
                let chunk: Vec<u8> = if self.pattern.is_empty() {
                    vec![silence; bytes]
                } else {
                    (0..bytes)
                        .map(|i| self.pattern[(self.pattern_pos + i) % self.pattern.len()])
                        .collect()
                };
                if !self.pattern.is_empty() {
                    self.pattern_pos = (self.pattern_pos + bytes) % self.pattern.len();
                }
                self.capture(&chunk);
            }
        }
    }

    fn restart_clock(&mut self) {
        if let Some(rt) = self.realtime.as_mut() {
            rt.started_ns = rt.clock.now_ns();
            rt.frames_done = 0;
        }
    }
}

/// 虚拟 PCM 设备
pub struct VirtualDevice {
    inner: Arc<Mutex<VirtualInner>>,
}

impl PcmDevice for VirtualDevice {
    fn config(&self) -> HwConfig {
        lock(&self.inner).config
    }

    fn avail(&mut self) -> Result<usize, BackendError> {
        let mut inner = lock(&self.inner);
        inner.check_alive()?;
        inner.sync_realtime();
        if inner.state == DeviceState::Xrun {
            return Err(BackendError::Xrun);
        }
        let queued = inner.queued_frames();
        Ok(match inner.direction {
            Direction::Render => inner.config.buffer_frames.saturating_sub(queued),
            Direction::Capture => queued,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, BackendError> {
        let mut inner = lock(&self.inner);
        inner.check_alive()?;
        if inner.block_next > 0 {
            inner.block_next -= 1;
            return Err(BackendError::WouldBlock);
        }
        match inner.state {
            DeviceState::Xrun => return Err(BackendError::Xrun),
            DeviceState::Open => return Err(BackendError::Native { code: EBADFD, op: "writei" }),
            _ => {}
        }
        let frame_bytes = inner.frame_bytes();
        let room = inner.config.buffer_frames.saturating_sub(inner.queued_frames());
        let frames = (data.len() / frame_bytes).min(room);
        if frames == 0 {
            return Err(BackendError::WouldBlock);
        }
        let bytes = &data[..frames * frame_bytes];
        inner.queue.extend(bytes);
        inner.written.extend(bytes);
        let limit = inner.history_bytes;
        VirtualInner::trim_history(&mut inner.written, limit, frame_bytes);
        Ok(frames)
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, BackendError> {
        let mut inner = lock(&self.inner);
        inner.check_alive()?;
        if inner.block_next > 0 {
            inner.block_next -= 1;
            return Err(BackendError::WouldBlock);
        }
        match inner.state {
            DeviceState::Xrun => return Err(BackendError::Xrun),
            DeviceState::Open => return Err(BackendError::Native { code: EBADFD, op: "readi" }),
            _ => {}
        }
        let frame_bytes = inner.frame_bytes();
        let frames = (data.len() / frame_bytes).min(inner.queued_frames());
        if frames == 0 {
            return Err(BackendError::WouldBlock);
        }
        for (dst, src) in data[..frames * frame_bytes]
            .iter_mut()
            .zip(inner.queue.drain(..frames * frame_bytes))
        {
            *dst = src;
        }
        Ok(frames)
    }

    fn state(&mut self) -> DeviceState {
        let mut inner = lock(&self.inner);
        if inner.disconnected {
            return DeviceState::Disconnected;
        }
        inner.sync_realtime();
        inner.state
    }

    fn start(&mut self) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        inner.check_alive()?;
        match inner.state {
            DeviceState::Running => Ok(()),
            DeviceState::Prepared => {
                inner.state = DeviceState::Running;
                inner.starts += 1;
                inner.restart_clock();
                Ok(())
            }
            _ => Err(BackendError::Native { code: EBADFD, op: "start" }),
        }
    }

    fn recover(&mut self, err: &BackendError) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        inner.check_alive()?;
        match err {
            BackendError::Xrun | BackendError::WouldBlock => {
                inner.queue.clear();
                inner.state = DeviceState::Prepared;
                Ok(())
            }
            other => Err(other.clone()),
        }
    }

    fn reset(&mut self) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        inner.check_alive()?;
        inner.queue.clear();
        inner.restart_clock();
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        inner.check_alive()?;
        inner.queue.clear();
        inner.state = DeviceState::Prepared;
        Ok(())
    }

    fn rewind(&mut self, frames: usize) -> Result<usize, BackendError> {
        let mut inner = lock(&self.inner);
        inner.check_alive()?;
        if inner.direction == Direction::Capture {
            return Ok(0);
        }
        let n = frames.min(inner.queued_frames());
        let keep = inner.queue.len() - n * inner.frame_bytes();
        inner.queue.truncate(keep);
        inner.rewound += n as u64;
        Ok(n)
    }
}

/// 驱动虚拟设备的句柄
#[derive(Clone)]
pub struct VirtualProbe {
    inner: Arc<Mutex<VirtualInner>>,
}

impl VirtualProbe {
    pub fn config(&self) -> HwConfig {
        lock(&self.inner).config
    }

    /// Render：硬件播放 `frames` 帧；队列不够时设备进入 XRUN
    pub fn consume(&self, frames: usize) -> usize {
        lock(&self.inner).play(frames)
    }

    /// Capture：硬件采集到一段交织字节
    pub fn inject(&self, bytes: &[u8]) {
        lock(&self.inner).capture(bytes);
    }

    /// 实时 capture 循环产生的数据
    pub fn set_capture_pattern(&self, pattern: Vec<u8>) {
        let mut inner = lock(&self.inner);
        inner.pattern = pattern;
        inner.pattern_pos = 0;
    }

    pub fn queued_frames(&self) -> usize {
        lock(&self.inner).queued_frames()
    }

    pub fn force_xrun(&self) {
        lock(&self.inner).state = DeviceState::Xrun;
    }

    /// 接下来 `calls` 次 I/O 返回 would-block
    pub fn block_next(&self, calls: usize) {
        lock(&self.inner).block_next = calls;
    }

    pub fn disconnect(&self) {
        lock(&self.inner).disconnected = true;
    }

    pub fn state(&self) -> DeviceState {
        let inner = lock(&self.inner);
        if inner.disconnected {
            DeviceState::Disconnected
        } else {
            inner.state
        }
    }

    /// 最近写入的字节（包括之后被 rewind 的），最多 `history_bytes`
    pub fn written(&self) -> Vec<u8> {
        lock(&self.inner).written.iter().copied().collect()
    }

    /// 最近播放的字节，最多 `history_bytes`
    pub fn played(&self) -> Vec<u8> {
        lock(&self.inner).played.iter().copied().collect()
    }

    pub fn rewound_frames(&self) -> u64 {
        lock(&self.inner).rewound
    }
}

impl std::fmt::Debug for VirtualProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("VirtualProbe")
            .field("direction", &inner.direction)
            .field("state", &inner.state)
            .field("queued_frames", &inner.queued_frames())
            .field("starts", &inner.starts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::StreamFormat;
    use crate::audio::timing::ManualClock;
    use std::time::Duration;

    fn request(channels: u16) -> HwRequest {
        HwRequest {
            format: StreamFormat::new(48000, channels, SampleEncoding::S16),
            period_frames: 4,
            buffer_frames: 8,
        }
    }

    #[test]
    fn test_open_unknown_endpoint() {
        let backend = VirtualBackend::default();
        let err = backend
            .open("hw:9", Direction::Render, &request(2))
            .err()
            .unwrap();
        assert_eq!(err, BackendError::DeviceNotFound("hw:9".to_string()));
    }

    #[test]
    fn test_fixed_hw_channels() {
        let backend = VirtualBackend::new(VirtualConfig {
            hw_channels: Some(4),
            ..Default::default()
        });
        let device = backend.open("default", Direction::Render, &request(2)).unwrap();
        assert_eq!(device.config().channels, 4);
        assert!(backend.open("default", Direction::Render, &request(6)).is_err());
    }

    #[test]
    fn test_render_queue() {
        let backend = VirtualBackend::default();
        let mut device = backend.open("default", Direction::Render, &request(1)).unwrap();
        let probe = backend.last_probe().unwrap();

        assert_eq!(device.avail().unwrap(), 8);
        assert_eq!(device.write(&[1u8; 20]).unwrap(), 8);
        assert_eq!(device.write(&[1u8; 2]), Err(BackendError::WouldBlock));

        device.start().unwrap();
        assert_eq!(probe.consume(3), 3);
        assert_eq!(device.avail().unwrap(), 3);
        assert_eq!(device.rewind(2).unwrap(), 2);
        assert_eq!(probe.queued_frames(), 3);

        // 队列被掏空 → underrun
        probe.consume(10);
        assert_eq!(device.avail(), Err(BackendError::Xrun));
        device.recover(&BackendError::Xrun).unwrap();
        assert_eq!(device.state(), DeviceState::Prepared);
        assert_eq!(device.avail().unwrap(), 8);
    }

    #[test]
    fn test_capture_queue() {
        let backend = VirtualBackend::default();
        let mut device = backend.open("default", Direction::Capture, &request(1)).unwrap();
        let probe = backend.last_probe().unwrap();

        probe.inject(&[1, 0, 2, 0]);
        assert_eq!(device.avail().unwrap(), 2);
        let mut buf = [0u8; 8];
        assert_eq!(device.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..4], &[1, 0, 2, 0]);
        assert_eq!(device.read(&mut buf), Err(BackendError::WouldBlock));
    }

    #[test]
    fn test_block_and_disconnect() {
        let backend = VirtualBackend::default();
        let mut device = backend.open("default", Direction::Render, &request(1)).unwrap();
        let probe = backend.last_probe().unwrap();

        probe.block_next(1);
        assert_eq!(device.write(&[0u8; 2]), Err(BackendError::WouldBlock));
        assert_eq!(device.write(&[0u8; 2]).unwrap(), 1);

        probe.disconnect();
        assert_eq!(device.avail(), Err(BackendError::Disconnected));
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn test_realtime_consumption() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = VirtualBackend::new(VirtualConfig {
            realtime: Some(clock.clone()),
            ..Default::default()
        });
        let mut device = backend.open("default", Direction::Render, &request(1)).unwrap();
        device.write(&[0u8; 16]).unwrap();
        device.start().unwrap();

        // 48 kHz 下 1/12 ms = 4 帧
        clock.advance(Duration::from_nanos(83_334));
        assert_eq!(device.avail().unwrap(), 4);
    }

    #[test]
    fn test_history_keeps_latest_whole_frames() {
        let backend = VirtualBackend::new(VirtualConfig {
            history_bytes: 5,
            ..Default::default()
        });
        // 1 声道 S16：2 字节一帧
        let mut device = backend.open("default", Direction::Render, &request(1)).unwrap();
        let probe = backend.last_probe().unwrap();

        device.write(&[1, 0, 2, 0, 3, 0, 4, 0]).unwrap();
        assert_eq!(probe.written(), vec![3, 0, 4, 0]);
        device.start().unwrap();
        probe.consume(4);
        assert_eq!(probe.played(), vec![3, 0, 4, 0]);

        device.write(&[5, 0]).unwrap();
        assert_eq!(probe.written(), vec![4, 0, 5, 0]);
    }

    #[test]
    fn test_fail_next_open() {
        let backend = VirtualBackend::default();
        backend.fail_next_open(BackendError::Native { code: -16, op: "open" });
        assert!(backend.open("default", Direction::Render, &request(2)).is_err());
        assert!(backend.open("default", Direction::Render, &request(2)).is_ok());
    }
}
