//! 音频核心模块
//!
//! 包含：
//! - Format: 样本编码、流格式、扬声器布局
//! - Ring Buffer: 客户端 StreamBuffer 和 acquire/commit 协议
//! - Volume: 合成增益和按编码选择的 gain 内循环
//! - Remap: 客户端 ↔ 硬件声道映射
//! - Clock: 单调插值的播放位置
//! - Timing: 时钟源和帧 / 时间换算
//! - Stats: pump 统计
//! - Backend: 硬件后端契约（虚拟设备、ALSA）
//! - Bridge: StreamBuffer ↔ 硬件 ring 的 pump

pub mod backend;
pub mod bridge;
pub mod clock;
pub mod format;
pub mod remap;
pub mod ring_buffer;
pub mod stats;
pub mod timing;
pub mod volume;

pub use backend::{DeviceCaps, DeviceState, HwConfig, PcmBackend, PcmDevice};
pub use bridge::HardwareBridge;
pub use clock::PositionClock;
pub use format::{default_layout, Direction, SampleEncoding, Speaker, StreamFormat};
pub use remap::{ChannelMap, ChannelRemapper};
pub use ring_buffer::StreamBuffer;
pub use stats::{PumpStats, StatsReport};
pub use volume::{GainStage, SessionVolume};
