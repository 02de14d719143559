//! 硬件后端契约
//!
//! Stream 只通过 [`PcmBackend`] 打开设备，通过 [`PcmDevice`] 做非阻塞 I/O。
//! 关闭设备即 drop。

pub mod virtual_device;

#[cfg(feature = "alsa")]
pub mod alsa;

use super::format::{Direction, SampleEncoding, StreamFormat};
use crate::error::BackendError;

pub use virtual_device::{VirtualBackend, VirtualConfig, VirtualProbe};

/// 设备运行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// 已打开，尚未 prepare
    Open,
    /// 可以开始 I/O
    Prepared,
    Running,
    /// Underrun / overrun，需要 recover
    Xrun,
    Disconnected,
}

/// 设备能力
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCaps {
    pub encodings: Vec<SampleEncoding>,
    pub min_channels: u16,
    pub max_channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
}

impl DeviceCaps {
    /// 设备是否能直接接受该格式（不经过重映射）
    pub fn accepts(&self, format: &StreamFormat) -> bool {
        self.encodings.contains(&format.encoding)
            && (self.min_channels..=self.max_channels).contains(&format.channels)
            && (self.min_rate..=self.max_rate).contains(&format.sample_rate)
    }
}

/// 打开设备时的请求
#[derive(Clone, Copy, Debug)]
pub struct HwRequest {
    /// 客户端格式；设备可能使用更多的声道
    pub format: StreamFormat,
    pub period_frames: usize,
    pub buffer_frames: usize,
}

/// 设备实际采用的参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwConfig {
    pub channels: u16,
    pub encoding: SampleEncoding,
    pub sample_rate: u32,
    pub period_frames: usize,
    pub buffer_frames: usize,
}

impl HwConfig {
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }
}

/// 硬件后端：按 endpoint 名称打开设备
pub trait PcmBackend: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self, endpoint: &str, direction: Direction) -> Result<DeviceCaps, BackendError>;

    fn open(
        &self,
        endpoint: &str,
        direction: Direction,
        request: &HwRequest,
    ) -> Result<Box<dyn PcmDevice>, BackendError>;
}

/// 已打开的硬件 PCM
///
/// 所有 I/O 都是非阻塞的：不能推进时返回 `WouldBlock`
pub trait PcmDevice: Send {
    fn config(&self) -> HwConfig;

    /// 可写（render）或可读（capture）的帧数
    fn avail(&mut self) -> Result<usize, BackendError>;

    /// 写入交织帧，返回实际写入的帧数
    fn write(&mut self, data: &[u8]) -> Result<usize, BackendError>;

    /// 读取交织帧，返回实际读取的帧数
    fn read(&mut self, data: &mut [u8]) -> Result<usize, BackendError>;

    fn state(&mut self) -> DeviceState;

    fn start(&mut self) -> Result<(), BackendError>;

    /// 从 XRUN 恢复
    fn recover(&mut self, err: &BackendError) -> Result<(), BackendError>;

    /// 丢弃设备中排队的所有帧
    fn reset(&mut self) -> Result<(), BackendError>;

    fn prepare(&mut self) -> Result<(), BackendError>;

    /// 回退最多 `frames` 帧尚未播放的数据，返回实际回退的帧数
    fn rewind(&mut self, frames: usize) -> Result<usize, BackendError>;
}
