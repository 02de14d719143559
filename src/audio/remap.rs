//! 声道重映射
//!
//! 客户端声道顺序 ↔ 硬件声道顺序。
//! 映射表 `map[client_channel] = hw_channel`，没有映射源的硬件声道填静音。

use super::format::Speaker;
use crate::error::{Result, StreamError};

/// 客户端 → 硬件的声道映射表
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMap {
    map: Vec<usize>,
    hw_channels: usize,
}

impl ChannelMap {
    /// 恒等映射
    pub fn identity(channels: usize) -> Self {
        Self {
            map: (0..channels).collect(),
            hw_channels: channels,
        }
    }

    /// 显式映射表：每个目标必须在硬件声道范围内且互不重复
    pub fn new(map: Vec<usize>, hw_channels: usize) -> Result<Self> {
        if map.is_empty() || map.len() > hw_channels {
            return Err(StreamError::InvalidArgument("channel map size"));
        }
        let mut used = vec![false; hw_channels];
        for &hw in &map {
            if hw >= hw_channels || used[hw] {
                return Err(StreamError::InvalidArgument("channel map entry"));
            }
            used[hw] = true;
        }
        Ok(Self { map, hw_channels })
    }

    /// 按扬声器位置推导默认映射
    ///
    /// 同位置优先；找不到同位置的客户端声道取最低的空闲硬件声道
    pub fn between(client: &[Speaker], hw: &[Speaker]) -> Result<Self> {
        if client.len() > hw.len() {
            return Err(StreamError::UnsupportedFormat(format!(
                "{} client channels on {}-channel hardware",
                client.len(),
                hw.len()
            )));
        }

        let mut used = vec![false; hw.len()];
        let mut map: Vec<Option<usize>> = vec![None; client.len()];
        for (c, speaker) in client.iter().enumerate() {
            if let Some(slot) = hw.iter().position(|s| s == speaker) {
                if !used[slot] {
                    used[slot] = true;
                    map[c] = Some(slot);
                }
            }
        }
        let mut free = (0..hw.len()).filter(|&slot| !used[slot]);
        let map = map
            .into_iter()
            .map(|slot| slot.or_else(|| free.next()))
            .collect::<Option<Vec<_>>>()
            .ok_or(StreamError::InvalidArgument("channel map"))?;

        Ok(Self {
            map,
            hw_channels: hw.len(),
        })
    }

    #[inline]
    pub fn client_channels(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn hw_channels(&self) -> usize {
        self.hw_channels
    }

    #[inline]
    pub fn target(&self, client_channel: usize) -> Option<usize> {
        self.map.get(client_channel).copied()
    }

    pub fn is_identity(&self) -> bool {
        self.map.len() == self.hw_channels && self.map.iter().enumerate().all(|(c, &hw)| c == hw)
    }
}

/// 带 scratch 区的重映射器
///
/// scratch 按见过的最大请求增长，从不收缩
#[derive(Debug)]
pub struct ChannelRemapper {
    map: ChannelMap,
    identity: bool,
    bytes_per_sample: usize,
    silence: u8,
    scratch: Vec<u8>,
}

impl ChannelRemapper {
    pub fn new(map: ChannelMap, bytes_per_sample: usize, silence: u8) -> Self {
        let identity = map.is_identity();
        Self {
            map,
            identity,
            bytes_per_sample,
            silence,
            scratch: Vec::new(),
        }
    }

    #[inline]
    pub fn map(&self) -> &ChannelMap {
        &self.map
    }

    /// 是否需要重排
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.identity
    }

    #[inline]
    fn client_frame_bytes(&self) -> usize {
        self.bytes_per_sample * self.map.client_channels()
    }

    #[inline]
    fn hw_frame_bytes(&self) -> usize {
        self.bytes_per_sample * self.map.hw_channels()
    }

    /// 预先把 scratch 扩到 `frames` 个硬件帧
    pub fn reserve(&mut self, frames: usize) -> Result<()> {
        let bytes = frames
            .checked_mul(self.hw_frame_bytes())
            .ok_or(StreamError::OutOfMemory)?;
        if self.scratch.len() < bytes {
            self.scratch.try_reserve_exact(bytes - self.scratch.len())?;
            self.scratch.resize(bytes, self.silence);
        }
        Ok(())
    }

    /// Render：客户端帧 → 硬件帧
    ///
    /// 恒等映射直接返回 `src`
    pub fn map_render<'a>(&'a mut self, src: &'a [u8]) -> Result<&'a [u8]> {
        if self.identity {
            return Ok(src);
        }
        let frames = src.len() / self.client_frame_bytes();
        self.reserve(frames)?;

        let bps = self.bytes_per_sample;
        let hw_frame = self.hw_frame_bytes();
        let out = &mut self.scratch[..frames * hw_frame];
        out.fill(self.silence);
        for (src_frame, dst_frame) in src
            .chunks_exact(self.map.client_channels() * bps)
            .zip(out.chunks_exact_mut(hw_frame))
        {
            for (c, sample) in src_frame.chunks_exact(bps).enumerate() {
                let hw = self.map.map[c];
                dst_frame[hw * bps..(hw + 1) * bps].copy_from_slice(sample);
            }
        }
        Ok(out)
    }

    /// Capture：为 `frames` 个硬件帧准备读缓冲
    pub fn capture_scratch(&mut self, frames: usize) -> Result<&mut [u8]> {
        self.reserve(frames)?;
        let bytes = frames * self.hw_frame_bytes();
        Ok(&mut self.scratch[..bytes])
    }

    /// Capture：把 scratch 中的 `frames` 个硬件帧取回客户端顺序写入 `dst`
    pub fn unmap_capture(&self, frames: usize, dst: &mut [u8]) {
        let bps = self.bytes_per_sample;
        let hw_frame = self.hw_frame_bytes();
        let src = &self.scratch[..frames * hw_frame];
        for (src_frame, dst_frame) in src
            .chunks_exact(hw_frame)
            .zip(dst.chunks_exact_mut(self.client_frame_bytes()))
        {
            for (c, sample) in dst_frame.chunks_exact_mut(bps).enumerate() {
                let hw = self.map.map[c];
                sample.copy_from_slice(&src_frame[hw * bps..(hw + 1) * bps]);
            }
        }
    }

    /// 当前 scratch 容量（字节）
    #[inline]
    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }
}
