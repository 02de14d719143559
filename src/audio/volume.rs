//! 音量引擎
//!
//! - 合成增益：`stream.vol[c] * session.vol[c] * session.master`，静音时整体为 0
//! - 按编码选择的 gain 内循环，在 Initialize 时选定一次，不逐样本分派
//! - 已施加增益的帧窗口，保证重试写入时不会重复缩放
//!
//! 整数编码一律向零截断，并饱和到该编码的取值范围

use std::ops::Range;

use super::format::{read_packed, write_packed, SampleEncoding};

/// Session 级音量快照
///
/// 由 Session registry 在锁内写入每个成员 Stream，
/// Stream 自己的音量路径只读这份快照，不回头去拿 registry 锁
#[derive(Clone, Debug, PartialEq)]
pub struct SessionVolume {
    pub master: f32,
    pub muted: bool,
    pub channel_vols: Vec<f32>,
}

impl SessionVolume {
    pub fn unity(channels: usize) -> Self {
        Self {
            master: 1.0,
            muted: false,
            channel_vols: vec![1.0; channels],
        }
    }
}

/// 重新计算合成增益
///
/// `out` 长度固定为 Stream 声道数；Session 数组至少与之等宽
pub fn recompute_gain(
    stream_vols: &[f32],
    stream_muted: bool,
    session: &SessionVolume,
    out: &mut Vec<f32>,
) {
    out.clear();
    let muted = session.muted || stream_muted;
    out.extend(stream_vols.iter().enumerate().map(|(c, &v)| {
        if muted {
            0.0
        } else {
            let session_vol = session.channel_vols.get(c).copied().unwrap_or(1.0);
            v * session_vol * session.master
        }
    }));
}

/// Gain 内循环：`(region, gains)`，region 为交织样本，gains 每声道一项
pub type GainKernel = fn(&mut [u8], &[f32]);

/// 绑定了编码的增益阶段
#[derive(Clone, Copy)]
pub struct GainStage {
    encoding: SampleEncoding,
    kernel: GainKernel,
}

impl std::fmt::Debug for GainStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GainStage")
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl GainStage {
    /// 为编码选定内循环
    pub fn for_encoding(encoding: SampleEncoding) -> Self {
        let kernel: GainKernel = match encoding {
            SampleEncoding::U8 => scale_u8,
            SampleEncoding::S16 => scale_s16,
            SampleEncoding::S20Packed => scale_s20,
            SampleEncoding::S24Packed => scale_s24,
            SampleEncoding::S32 => scale_s32,
            SampleEncoding::F32 => scale_f32,
            SampleEncoding::F64 => scale_f64,
        };
        Self { encoding, kernel }
    }

    /// 对区域施加增益
    ///
    /// 全 0 增益直接写硬件静音（更便宜，也没有舍入噪声）；全 1 增益原样保留
    pub fn apply(&self, region: &mut [u8], gains: &[f32]) {
        if gains.is_empty() || region.is_empty() {
            return;
        }
        if gains.iter().all(|&g| g == 0.0) {
            self.encoding.fill_silence(region);
            return;
        }
        if gains.iter().all(|&g| g == 1.0) {
            return;
        }
        (self.kernel)(region, gains);
    }

    /// Capture 方向：增益恰好为 0 的声道写静音，其他声道不动
    pub fn mute_zero_channels(&self, region: &mut [u8], gains: &[f32]) {
        if !gains.iter().any(|&g| g == 0.0) {
            return;
        }
        let bps = self.encoding.bytes_per_sample();
        let silence = self.encoding.silence_byte();
        let channels = gains.len();
        for (i, sample) in region.chunks_exact_mut(bps).enumerate() {
            if gains[i % channels] == 0.0 {
                sample.fill(silence);
            }
        }
    }
}

fn scale_u8(region: &mut [u8], gains: &[f32]) {
    let channels = gains.len();
    for (i, sample) in region.iter_mut().enumerate() {
        let centered = *sample as f32 - 128.0;
        let scaled = (centered * gains[i % channels]).clamp(-128.0, 127.0) as i16;
        *sample = (scaled + 128) as u8;
    }
}

fn scale_s16(region: &mut [u8], gains: &[f32]) {
    let channels = gains.len();
    for (i, chunk) in region.chunks_exact_mut(2).enumerate() {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        // float → int 的 `as` 转换是饱和的
        let scaled = (sample as f32 * gains[i % channels]) as i16;
        chunk.copy_from_slice(&scaled.to_le_bytes());
    }
}

fn scale_packed(region: &mut [u8], gains: &[f32], valid_bits: u32) {
    let channels = gains.len();
    let max = (1i32 << (valid_bits - 1)) - 1;
    let min = -(1i32 << (valid_bits - 1));
    for (i, chunk) in region.chunks_exact_mut(3).enumerate() {
        let sample = read_packed(chunk, valid_bits);
        let scaled = (sample as f64 * gains[i % channels] as f64) as i64;
        let clamped = scaled.clamp(min as i64, max as i64) as i32;
        write_packed(chunk, clamped, valid_bits);
    }
}

fn scale_s20(region: &mut [u8], gains: &[f32]) {
    scale_packed(region, gains, 20);
}

fn scale_s24(region: &mut [u8], gains: &[f32]) {
    scale_packed(region, gains, 24);
}

fn scale_s32(region: &mut [u8], gains: &[f32]) {
    let channels = gains.len();
    for (i, chunk) in region.chunks_exact_mut(4).enumerate() {
        let sample = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        // f64 才能无损表示全部 i32
        let scaled = (sample as f64 * gains[i % channels] as f64) as i32;
        chunk.copy_from_slice(&scaled.to_le_bytes());
    }
}

fn scale_f32(region: &mut [u8], gains: &[f32]) {
    let channels = gains.len();
    for (i, chunk) in region.chunks_exact_mut(4).enumerate() {
        let sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let scaled = sample * gains[i % channels];
        chunk.copy_from_slice(&scaled.to_le_bytes());
    }
}

fn scale_f64(region: &mut [u8], gains: &[f32]) {
    let channels = gains.len();
    for (i, chunk) in region.chunks_exact_mut(8).enumerate() {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        let scaled = f64::from_le_bytes(bytes) * gains[i % channels] as f64;
        chunk.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// 已施加增益的帧窗口
///
/// 帧用绝对序号表示（与 `written_frames` 同一坐标系）。
/// 每个 tick 由环形缓冲区的计数器算出 pending 区间
/// `[pushed_end, pending_end)`，与 `scaled_end` 求差得到尚未缩放的部分：
/// `[max(scaled_end, pushed_end), pending_end)`。
/// rewind 把 `pushed_end` 往回拨时，这些帧已经缩放过，不会再缩放一次。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GainWindow {
    scaled_end: u64,
}

impl GainWindow {
    /// `span` 中尚未施加增益的部分
    #[inline]
    pub fn unscaled(&self, span: Range<u64>) -> Range<u64> {
        let start = self.scaled_end.clamp(span.start, span.end);
        start..span.end
    }

    /// 标记 `..end` 已缩放
    #[inline]
    pub fn mark_scaled(&mut self, end: u64) {
        self.scaled_end = self.scaled_end.max(end);
    }

    #[inline]
    pub fn scaled_end(&self) -> u64 {
        self.scaled_end
    }

    pub fn reset(&mut self) {
        self.scaled_end = 0;
    }
}
