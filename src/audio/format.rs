//! 音频格式和样本编码
//!
//! 所有编码都是 little-endian 交织（interleaved）布局：
//! - U8: 无符号，静音 = 0x80
//! - S16 / S32: 有符号整数
//! - S20 / S24: 3 字节 packed，有符号
//! - F32 / F64: IEEE float

use crate::error::StreamError;

/// 数据流向
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 播放：客户端写入，pump 推给硬件
    Render,
    /// 录音：pump 从硬件拉取，客户端读出
    Capture,
}

/// 样本编码（封闭集合）
///
/// 每个变体对应一个独立的 gain 内循环，见 [`crate::audio::volume::GainStage`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    U8,
    S16,
    /// 20-bit 有效位，存放在 3 字节容器的低 20 位
    S20Packed,
    S24Packed,
    S32,
    F32,
    F64,
}

impl SampleEncoding {
    /// 由 (容器位深, 有效位深, 是否浮点) 选择编码
    ///
    /// `valid_bits == 0` 表示与容器位深相同
    pub fn from_bits(bits: u16, valid_bits: u16, is_float: bool) -> Result<Self, StreamError> {
        let valid = if valid_bits == 0 { bits } else { valid_bits };
        let encoding = match (is_float, bits, valid) {
            (false, 8, 8) => Self::U8,
            (false, 16, 16) => Self::S16,
            (false, 24, 20) => Self::S20Packed,
            (false, 24, 24) => Self::S24Packed,
            (false, 32, 32) => Self::S32,
            (true, 32, 32) => Self::F32,
            (true, 64, 64) => Self::F64,
            _ => {
                return Err(StreamError::UnsupportedFormat(format!(
                    "{} {}-bit (valid {})",
                    if is_float { "float" } else { "pcm" },
                    bits,
                    valid
                )))
            }
        };
        Ok(encoding)
    }

    /// 容器位深
    #[inline]
    pub fn bits_per_sample(self) -> u16 {
        match self {
            Self::U8 => 8,
            Self::S16 => 16,
            Self::S20Packed | Self::S24Packed => 24,
            Self::S32 | Self::F32 => 32,
            Self::F64 => 64,
        }
    }

    /// 有效位深
    #[inline]
    pub fn valid_bits(self) -> u16 {
        match self {
            Self::S20Packed => 20,
            other => other.bits_per_sample(),
        }
    }

    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        self.bits_per_sample() as usize / 8
    }

    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// 硬件静音字节：U8 为中点 128，其余为 0
    #[inline]
    pub fn silence_byte(self) -> u8 {
        match self {
            Self::U8 => 0x80,
            _ => 0x00,
        }
    }

    /// 用静音填充整个区域
    #[inline]
    pub fn fill_silence(self, region: &mut [u8]) {
        region.fill(self.silence_byte());
    }
}

/// 解码 3 字节 packed 样本（little-endian），按 `valid_bits` 做符号扩展
///
/// 先左移把符号位移到 bit31，再算术右移恢复
#[inline]
pub fn read_packed(bytes: &[u8], valid_bits: u32) -> i32 {
    let raw = (bytes[0] as i32) | ((bytes[1] as i32) << 8) | ((bytes[2] as i32) << 16);
    let shift = 32 - valid_bits;
    (raw << shift) >> shift
}

/// 编码 3 字节 packed 样本
///
/// 20-bit 时只改写低 20 位，保留容器高 4 位原样
#[inline]
pub fn write_packed(bytes: &mut [u8], value: i32, valid_bits: u32) {
    bytes[0] = (value & 0xFF) as u8;
    bytes[1] = ((value >> 8) & 0xFF) as u8;
    if valid_bits >= 24 {
        bytes[2] = ((value >> 16) & 0xFF) as u8;
    } else {
        let high_mask = (0xFFu32 << (valid_bits - 16)) as u8;
        let low = ((value >> 16) as u8) & !high_mask;
        bytes[2] = (bytes[2] & high_mask) | low;
    }
}

/// 协商后的流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16, encoding: SampleEncoding) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
        }
    }

    /// 整数 PCM 格式
    pub fn pcm(sample_rate: u32, channels: u16, bits: u16) -> Result<Self, StreamError> {
        Ok(Self::new(
            sample_rate,
            channels,
            SampleEncoding::from_bits(bits, 0, false)?,
        ))
    }

    /// IEEE float 格式
    pub fn float(sample_rate: u32, channels: u16, bits: u16) -> Result<Self, StreamError> {
        Ok(Self::new(
            sample_rate,
            channels,
            SampleEncoding::from_bits(bits, 0, true)?,
        ))
    }

    /// 基本合法性检查
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.channels == 0 || self.channels as usize > MAX_CHANNELS {
            return Err(StreamError::UnsupportedFormat(format!(
                "{} channels",
                self.channels
            )));
        }
        if self.sample_rate == 0 {
            return Err(StreamError::UnsupportedFormat("0 Hz".to_string()));
        }
        Ok(())
    }

    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.encoding.bytes_per_sample()
    }

    /// 每帧字节数（block align）
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }

    #[inline]
    pub fn silence_byte(&self) -> u8 {
        self.encoding.silence_byte()
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {:?} ({} bytes/frame)",
            self.sample_rate,
            self.channels,
            self.encoding,
            self.bytes_per_frame()
        )
    }
}

/// 支持的最大声道数
pub const MAX_CHANNELS: usize = 8;

/// 扬声器位置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Speaker {
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    BackCenter,
    SideLeft,
    SideRight,
}

/// 给定声道数的默认扬声器布局
pub fn default_layout(channels: usize) -> Vec<Speaker> {
    use Speaker::*;
    match channels {
        0 => Vec::new(),
        1 => vec![FrontCenter],
        2 => vec![FrontLeft, FrontRight],
        3 => vec![FrontLeft, FrontRight, LowFrequency],
        4 => vec![FrontLeft, FrontRight, BackLeft, BackRight],
        5 => vec![FrontLeft, FrontRight, BackLeft, BackRight, LowFrequency],
        6 => vec![FrontLeft, FrontRight, BackLeft, BackRight, LowFrequency, FrontCenter],
        7 => vec![
            FrontLeft,
            FrontRight,
            BackLeft,
            BackRight,
            LowFrequency,
            FrontCenter,
            BackCenter,
        ],
        _ => vec![
            FrontLeft,
            FrontRight,
            FrontCenter,
            LowFrequency,
            BackLeft,
            BackRight,
            SideLeft,
            SideRight,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bits() {
        assert_eq!(SampleEncoding::from_bits(8, 0, false).unwrap(), SampleEncoding::U8);
        assert_eq!(SampleEncoding::from_bits(24, 20, false).unwrap(), SampleEncoding::S20Packed);
        assert_eq!(SampleEncoding::from_bits(24, 24, false).unwrap(), SampleEncoding::S24Packed);
        assert_eq!(SampleEncoding::from_bits(64, 0, true).unwrap(), SampleEncoding::F64);
        assert!(SampleEncoding::from_bits(16, 0, true).is_err());
        assert!(SampleEncoding::from_bits(12, 0, false).is_err());
    }

    #[test]
    fn test_bytes_per_frame() {
        let format = StreamFormat::pcm(48000, 2, 16).unwrap();
        assert_eq!(format.bytes_per_frame(), 4);

        let format = StreamFormat::pcm(96000, 6, 24).unwrap();
        assert_eq!(format.bytes_per_frame(), 18);

        let format = StreamFormat::float(44100, 2, 64).unwrap();
        assert_eq!(format.bytes_per_frame(), 16);
    }

    #[test]
    fn test_silence_pattern() {
        let mut buf = [0x11u8; 4];
        SampleEncoding::U8.fill_silence(&mut buf);
        assert_eq!(buf, [0x80; 4]);

        SampleEncoding::S16.fill_silence(&mut buf);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_24bit_sign_extend() {
        // 最大正值: 0x7FFFFF
        assert_eq!(read_packed(&[0xFF, 0xFF, 0x7F], 24), 0x7FFFFF);
        // 最小负值: 0x800000 = -8388608
        assert_eq!(read_packed(&[0x00, 0x00, 0x80], 24), -8388608);
        // -1: 0xFFFFFF
        assert_eq!(read_packed(&[0xFF, 0xFF, 0xFF], 24), -1);
    }

    #[test]
    fn test_20bit_sign_extend() {
        // 0x7FFFF 为 20-bit 最大正值
        assert_eq!(read_packed(&[0xFF, 0xFF, 0x07], 20), 0x7FFFF);
        // bit19 置位 → 负数，高 4 位被忽略
        assert_eq!(read_packed(&[0x00, 0x00, 0x08], 20), -524288);
        assert_eq!(read_packed(&[0x00, 0x00, 0xF8], 20), -524288);
    }

    #[test]
    fn test_packed_roundtrip() {
        let input = [0x00u8, 0x00, 0xC0]; // -0x400000
        let value = read_packed(&input, 24);
        assert!(value < 0, "negative sample should be negative after decode");
        let mut out = [0u8; 3];
        write_packed(&mut out, value, 24);
        assert_eq!(input, out);

        // 20-bit：高 4 位保留
        let input = [0x34u8, 0x12, 0xA9];
        let value = read_packed(&input, 20);
        let mut out = [0u8, 0, 0xA0];
        write_packed(&mut out, value, 20);
        assert_eq!(input, out);
    }

    #[test]
    fn test_default_layout() {
        assert_eq!(default_layout(1), vec![Speaker::FrontCenter]);
        assert_eq!(default_layout(4)[2], Speaker::BackLeft);
        assert_eq!(default_layout(6).len(), 6);
        assert_eq!(default_layout(8)[3], Speaker::LowFrequency);
    }

    #[test]
    fn test_validate() {
        assert!(StreamFormat::pcm(48000, 0, 16).unwrap().validate().is_err());
        assert!(StreamFormat::pcm(48000, 9, 16).unwrap().validate().is_err());
        assert!(StreamFormat::pcm(0, 2, 16).unwrap().validate().is_err());
        assert!(StreamFormat::pcm(48000, 2, 16).unwrap().validate().is_ok());
    }
}
