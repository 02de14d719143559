//! 流引擎
//!
//! [`AudioContext`] 是整个子系统的入口：持有硬件后端、session 表和配置，
//! 创建 [`Stream`]。context 销毁时 session 表随之销毁。

pub mod pump;
pub mod session;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use crate::audio::backend::PcmBackend;
use crate::audio::format::{Direction, SampleEncoding, StreamFormat};
use crate::audio::timing::{Clock, SystemClock};
use crate::error::{Result, StreamError};

pub use session::{SessionControl, SessionId, SessionKey, SessionRegistry, SessionState};
pub use stream::{CaptureRegion, RenderRegion, Stream, StreamParams, StreamPosition, StreamState};

/// pump 驱动方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// 每个 Started 的 Stream 一个后台线程
    Timer,
    /// 宿主自己调用 [`Stream::pump`]
    Manual,
}

/// mix format 的编码候选顺序
const MIX_ENCODINGS: [SampleEncoding; 5] = [
    SampleEncoding::F32,
    SampleEncoding::S16,
    SampleEncoding::U8,
    SampleEncoding::S32,
    SampleEncoding::S24Packed,
];

/// mix format 的采样率候选顺序
const MIX_RATES: [u32; 5] = [48000, 44100, 22050, 11025, 8000];

/// 引擎配置
#[derive(Clone)]
pub struct ContextConfig {
    pub pump_mode: PumpMode,
    /// pump 线程尝试 SCHED_FIFO
    pub realtime_priority: bool,
    /// mlock ring buffer
    pub lock_memory: bool,
    /// Stop 时 rewind 估计的安全余量
    pub rewind_safety: Duration,
    pub default_period: Duration,
    pub minimum_period: Duration,
    /// 所有墙上时间读数的来源
    pub clock: Arc<dyn Clock>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            pump_mode: PumpMode::Timer,
            realtime_priority: false,
            lock_memory: false,
            // 48kHz 下 64 帧
            rewind_safety: Duration::from_micros(1330),
            default_period: Duration::from_millis(10),
            minimum_period: Duration::from_millis(5),
            clock: Arc::new(SystemClock),
        }
    }
}

impl std::fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextConfig")
            .field("pump_mode", &self.pump_mode)
            .field("realtime_priority", &self.realtime_priority)
            .field("lock_memory", &self.lock_memory)
            .field("rewind_safety", &self.rewind_safety)
            .field("default_period", &self.default_period)
            .field("minimum_period", &self.minimum_period)
            .finish_non_exhaustive()
    }
}

/// 音频子系统 context
pub struct AudioContext {
    backend: Arc<dyn PcmBackend>,
    registry: Arc<SessionRegistry>,
    config: ContextConfig,
}

impl AudioContext {
    pub fn new(backend: Arc<dyn PcmBackend>, config: ContextConfig) -> Self {
        log::debug!("Audio context created on '{}' backend: {:?}", backend.name(), config);
        Self {
            backend,
            registry: Arc::new(SessionRegistry::new()),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn PcmBackend> {
        &self.backend
    }

    #[inline]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 创建一个 Created 状态的 Stream
    pub fn new_stream(&self, endpoint: &str, direction: Direction) -> Stream {
        Stream::new(
            endpoint.to_string(),
            direction,
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            self.config.clone(),
        )
    }

    /// 按 (id, endpoint) 获取 session 控制句柄；不存在时创建
    pub fn session(&self, id: SessionId, endpoint: &str) -> SessionControl {
        self.registry.control(SessionKey::new(id, endpoint))
    }

    /// 所有 session 的键
    pub fn sessions(&self) -> Vec<SessionKey> {
        self.registry.keys()
    }

    /// 共享模式下建议的格式
    pub fn mix_format(&self, endpoint: &str, direction: Direction) -> Result<StreamFormat> {
        let caps = self.backend.capabilities(endpoint, direction)?;

        let encoding = MIX_ENCODINGS
            .iter()
            .copied()
            .find(|enc| caps.encodings.contains(enc))
            .ok_or_else(|| StreamError::UnsupportedFormat("no usable sample encoding".to_string()))?;
        let channels = caps.max_channels.min(2).max(caps.min_channels);
        let sample_rate = MIX_RATES
            .iter()
            .copied()
            .find(|&rate| rate <= caps.max_rate && rate >= caps.min_rate)
            .ok_or_else(|| {
                StreamError::UnsupportedFormat(format!(
                    "no usable rate in {}..={} Hz",
                    caps.min_rate, caps.max_rate
                ))
            })?;

        let format = StreamFormat::new(sample_rate, channels, encoding);
        log::debug!("Mix format for '{}' {:?}: {}", endpoint, direction, format);
        Ok(format)
    }

    /// 设备是否能直接打开该格式
    pub fn is_format_supported(
        &self,
        endpoint: &str,
        direction: Direction,
        format: &StreamFormat,
    ) -> Result<bool> {
        format.validate()?;
        let caps = self.backend.capabilities(endpoint, direction)?;
        Ok(caps.accepts(format))
    }

    /// (默认周期, 最小周期)
    pub fn device_period(&self) -> (Duration, Duration) {
        (self.config.default_period, self.config.minimum_period)
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        log::debug!(
            "Audio context dropped with {} sessions",
            self.registry.len()
        );
    }
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("backend", &self.backend.name())
            .field("sessions", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}
