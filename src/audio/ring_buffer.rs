//! StreamBuffer：面向客户端的环形缓冲区
//!
//! 以帧为单位管理一段预分配的字节环：
//!
//! ```text
//!            local_offset        + in_device_frames     write_offset
//!                 |<--- 已推给硬件 --->|<--- pending --->|
//!   [.............|====================|=================|..........]
//!                 |<------------- held_frames ---------->|
//! ```
//!
//! - Render：客户端在 `write_offset` 处 acquire/commit，pump 从 pending 段推给硬件，
//!   硬件消费后从 `local_offset` 释放
//! - Capture：pump 在 `write_offset` 处追加，客户端从 `local_offset` 处 acquire/commit
//!
//! 所有方法都在 Stream 锁内调用（`&mut self`）。
//! 客户端拿到的 region 在锁外被读写，但它和 pump 访问的字节区间永远不相交：
//! render 的写 region 位于 held 段之外，capture 的读 region 位于 held 段之内、
//! 而 pump 只往 held 段之外追加。
//! 跨越环尾的 region 使用独立的 scratch 区，commit 时再拷回环中。

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::error::{Result, StreamError};

/// 固定长度的字节存储
///
/// 用 `UnsafeCell` 存储，锁外的 region 指针与锁内 `&mut self` 可以共存
struct ByteCells {
    cells: Box<[UnsafeCell<u8>]>,
}

impl ByteCells {
    fn empty() -> Self {
        Self {
            cells: Box::new([]),
        }
    }

    fn alloc(len: usize, fill: u8) -> Result<Self> {
        let mut cells: Vec<UnsafeCell<u8>> = Vec::new();
        cells.try_reserve_exact(len)?;
        cells.extend((0..len).map(|_| UnsafeCell::new(fill)));
        Ok(Self {
            cells: cells.into_boxed_slice(),
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.cells.len()
    }

    /// 指向第 `offset` 字节的裸指针
    #[inline]
    fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.cells.len());
        // UnsafeCell<u8> 与 u8 布局相同
        unsafe { (self.cells.as_ptr() as *mut u8).add(offset) }
    }

    /// # Safety
    /// 调用方保证 `[offset, offset + len)` 没有被其他活跃引用访问
    #[inline]
    unsafe fn slice_mut<'a>(&self, offset: usize, len: usize) -> &'a mut [u8] {
        debug_assert!(offset + len <= self.cells.len());
        std::slice::from_raw_parts_mut(self.ptr(offset), len)
    }

    fn fill(&mut self, byte: u8) {
        for cell in self.cells.iter_mut() {
            *cell.get_mut() = byte;
        }
    }
}

/// 交给客户端的一段连续字节区域
///
/// 只是裸指针 + 长度；生命周期由外层的 region guard 约束
#[derive(Debug)]
pub struct RegionSpan {
    ptr: NonNull<u8>,
    len: usize,
    frames: usize,
}

unsafe impl Send for RegionSpan {}

impl RegionSpan {
    fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            frames: 0,
        }
    }

    fn new(ptr: *mut u8, len: usize, frames: usize) -> Self {
        match NonNull::new(ptr) {
            Some(ptr) => Self { ptr, len, frames },
            None => Self::empty(),
        }
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len
    }

    /// # Safety
    /// 只能在对应的 acquire 尚未 commit、且 StreamBuffer 存活期间使用
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    /// 同 [`RegionSpan::as_slice`]，且同一时刻只能有一个可变视图
    #[inline]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Write,
    Read,
}

/// 尚未 commit 的 acquire
#[derive(Clone, Copy, Debug)]
struct Outstanding {
    access: Access,
    frames: usize,
    wrapped: bool,
}

pub struct StreamBuffer {
    storage: ByteCells,
    capacity: usize,
    bytes_per_frame: usize,
    silence: u8,

    local_offset: usize,
    write_offset: usize,
    held_frames: usize,
    in_device_frames: usize,
    written_frames: u64,

    outstanding: Option<Outstanding>,
    /// 跨环尾 region 的中转区，只增不减
    scratch: ByteCells,

    memory_locked: bool,
}

impl StreamBuffer {
    /// 分配 `capacity` 帧的环，并预填静音
    pub fn new(capacity: usize, bytes_per_frame: usize, silence: u8) -> Result<Self> {
        if capacity == 0 || bytes_per_frame == 0 {
            return Err(StreamError::InvalidArgument("buffer size"));
        }
        let bytes = capacity
            .checked_mul(bytes_per_frame)
            .ok_or(StreamError::OutOfMemory)?;
        Ok(Self {
            storage: ByteCells::alloc(bytes, silence)?,
            capacity,
            bytes_per_frame,
            silence,
            local_offset: 0,
            write_offset: 0,
            held_frames: 0,
            in_device_frames: 0,
            written_frames: 0,
            outstanding: None,
            scratch: ByteCells::empty(),
            memory_locked: false,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    #[inline]
    pub fn held_frames(&self) -> usize {
        self.held_frames
    }

    #[inline]
    pub fn in_device_frames(&self) -> usize {
        self.in_device_frames
    }

    /// 已入队、尚未推给硬件的帧
    #[inline]
    pub fn pending_frames(&self) -> usize {
        self.held_frames - self.in_device_frames
    }

    #[inline]
    pub fn written_frames(&self) -> u64 {
        self.written_frames
    }

    #[inline]
    pub fn local_offset(&self) -> usize {
        self.local_offset
    }

    #[inline]
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    #[inline]
    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// 客户端还能写入的帧数
    #[inline]
    pub fn free_frames(&self) -> usize {
        self.capacity - self.held_frames
    }

    #[inline]
    fn wrap(&self, frame: usize) -> usize {
        frame % self.capacity
    }

    /// scratch 至少 `bytes` 字节，失败时返回 OutOfMemory
    fn ensure_scratch(&mut self, bytes: usize) -> Result<()> {
        if self.scratch.len() < bytes {
            self.scratch = ByteCells::alloc(bytes, self.silence)?;
        }
        Ok(())
    }

    // ---- 客户端：render ----

    /// 申请 `frames` 帧的写区域
    pub fn acquire_write(&mut self, frames: usize) -> Result<RegionSpan> {
        if self.outstanding.is_some() {
            return Err(StreamError::OutOfOrder);
        }
        if frames == 0 {
            self.outstanding = Some(Outstanding {
                access: Access::Write,
                frames: 0,
                wrapped: false,
            });
            return Ok(RegionSpan::empty());
        }
        // 先比较再做乘法，frames 可能接近 usize::MAX
        if frames > self.free_frames() {
            return Err(StreamError::BufferTooLarge);
        }

        let bytes = frames * self.bytes_per_frame;
        let wrapped = frames > self.capacity - self.write_offset;
        let ptr = if wrapped {
            self.ensure_scratch(bytes)?;
            self.scratch.ptr(0)
        } else {
            self.storage.ptr(self.write_offset * self.bytes_per_frame)
        };

        self.outstanding = Some(Outstanding {
            access: Access::Write,
            frames,
            wrapped,
        });
        Ok(RegionSpan::new(ptr, bytes, frames))
    }

    /// 提交写区域中的前 `frames` 帧
    pub fn commit_write(&mut self, frames: usize, silent: bool) -> Result<()> {
        let acquired = match self.outstanding {
            Some(o) if o.access == Access::Write => o,
            _ => return Err(StreamError::OutOfOrder),
        };
        if frames > acquired.frames {
            return Err(StreamError::InvalidSize);
        }
        if frames == 0 {
            self.outstanding = None;
            return Ok(());
        }

        let bytes = frames * self.bytes_per_frame;
        let dst = self.write_offset * self.bytes_per_frame;
        if acquired.wrapped {
            if silent {
                unsafe { self.scratch.slice_mut(0, bytes) }.fill(self.silence);
            }
            let src = unsafe { self.scratch.slice_mut(0, bytes) };
            self.copy_in(dst, src);
        } else if silent {
            unsafe { self.storage.slice_mut(dst, bytes) }.fill(self.silence);
        }

        self.write_offset = self.wrap(self.write_offset + frames);
        self.held_frames += frames;
        self.written_frames += frames as u64;
        self.outstanding = None;
        Ok(())
    }

    /// 把 `src` 从字节偏移 `dst` 开始拷入环，必要时绕回开头
    fn copy_in(&mut self, dst: usize, src: &[u8]) {
        let total = self.storage.len();
        let first = src.len().min(total - dst);
        unsafe {
            self.storage.slice_mut(dst, first).copy_from_slice(&src[..first]);
            if first < src.len() {
                self.storage
                    .slice_mut(0, src.len() - first)
                    .copy_from_slice(&src[first..]);
            }
        }
    }

    // ---- 客户端：capture ----

    /// 申请读区域：一次交出全部 held 帧
    pub fn acquire_read(&mut self) -> Result<RegionSpan> {
        if self.outstanding.is_some() {
            return Err(StreamError::OutOfOrder);
        }
        let frames = self.held_frames;
        if frames == 0 {
            self.outstanding = Some(Outstanding {
                access: Access::Read,
                frames: 0,
                wrapped: false,
            });
            return Ok(RegionSpan::empty());
        }

        let bytes = frames * self.bytes_per_frame;
        let src = self.local_offset * self.bytes_per_frame;
        let wrapped = self.local_offset + frames > self.capacity;
        let ptr = if wrapped {
            self.ensure_scratch(bytes)?;
            let chunk = self.storage.len() - src;
            unsafe {
                let scratch = self.scratch.slice_mut(0, bytes);
                scratch[..chunk].copy_from_slice(self.storage.slice_mut(src, chunk));
                scratch[chunk..].copy_from_slice(self.storage.slice_mut(0, bytes - chunk));
            }
            self.scratch.ptr(0)
        } else {
            self.storage.ptr(src)
        };

        self.outstanding = Some(Outstanding {
            access: Access::Read,
            frames,
            wrapped,
        });
        Ok(RegionSpan::new(ptr, bytes, frames))
    }

    /// 释放读区域中的前 `frames` 帧
    pub fn commit_read(&mut self, frames: usize) -> Result<()> {
        let acquired = match self.outstanding {
            Some(o) if o.access == Access::Read => o,
            _ => return Err(StreamError::OutOfOrder),
        };
        if frames > acquired.frames {
            return Err(StreamError::InvalidSize);
        }
        self.held_frames -= frames;
        self.local_offset = self.wrap(self.local_offset + frames);
        self.outstanding = None;
        Ok(())
    }

    // ---- pump：render ----

    /// pending 段第一帧的绝对序号（与 `written_frames` 同一坐标系）
    #[inline]
    pub fn pushed_end(&self) -> u64 {
        self.written_frames - self.pending_frames() as u64
    }

    /// pending 段开头的一段连续帧（不跨环尾），最多 `max_frames` 帧
    pub fn pending_run(&mut self, max_frames: usize) -> &mut [u8] {
        let start = self.wrap(self.local_offset + self.in_device_frames);
        let frames = self
            .pending_frames()
            .min(max_frames)
            .min(self.capacity - start);
        // pending 段在 held 之内，客户端的写 region 在 held 之外
        unsafe {
            self.storage
                .slice_mut(start * self.bytes_per_frame, frames * self.bytes_per_frame)
        }
    }

    /// `frames` 帧已写进硬件
    pub fn mark_pushed(&mut self, frames: usize) {
        debug_assert!(frames <= self.pending_frames());
        self.in_device_frames += frames.min(self.pending_frames());
    }

    /// 硬件已播放 `frames` 帧，释放它们；返回实际释放的帧数
    pub fn consume_played(&mut self, frames: usize) -> usize {
        let frames = frames.min(self.in_device_frames);
        self.in_device_frames -= frames;
        self.held_frames -= frames;
        self.local_offset = self.wrap(self.local_offset + frames);
        frames
    }

    /// 硬件 rewind 回退了 `frames` 帧：它们重新变为 pending
    pub fn unpush(&mut self, frames: usize) -> usize {
        let frames = frames.min(self.in_device_frames);
        self.in_device_frames -= frames;
        frames
    }

    // ---- pump：capture ----

    /// 为最多 `wanted` 帧的硬件数据准备一段连续的写入空间
    ///
    /// 空间不足且没有未提交的读 region 时，丢弃最旧的未读帧；
    /// 返回 (丢弃的帧数, 可写区域)
    pub fn capture_run(&mut self, wanted: usize) -> (usize, &mut [u8]) {
        let mut dropped = 0;
        let free = self.free_frames();
        if wanted > free && self.outstanding.is_none() {
            dropped = (wanted - free).min(self.held_frames);
            self.held_frames -= dropped;
            self.local_offset = self.wrap(self.local_offset + dropped);
        }
        let frames = wanted
            .min(self.free_frames())
            .min(self.capacity - self.write_offset);
        // 只写 held 段之外
        let run = unsafe {
            self.storage.slice_mut(
                self.write_offset * self.bytes_per_frame,
                frames * self.bytes_per_frame,
            )
        };
        (dropped, run)
    }

    /// 提交 `frames` 帧已采集数据
    pub fn store_captured(&mut self, frames: usize) {
        debug_assert!(self.held_frames + frames <= self.capacity);
        self.write_offset = self.wrap(self.write_offset + frames);
        self.held_frames += frames;
        self.written_frames += frames as u64;
    }

    // ---- 生命周期 ----

    /// 清零所有计数器和偏移
    pub fn reset(&mut self) -> Result<()> {
        if self.outstanding.is_some() {
            return Err(StreamError::BufferOperationPending);
        }
        self.local_offset = 0;
        self.write_offset = 0;
        self.held_frames = 0;
        self.in_device_frames = 0;
        self.written_frames = 0;
        self.storage.fill(self.silence);
        Ok(())
    }

    /// 锁定环内存，防止被换页
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }

        let ptr = self.storage.ptr(0) as *const libc::c_void;
        let len = self.storage.len();
        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked = true;
            log::debug!("Stream buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock stream buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        if self.memory_locked {
            let ptr = self.storage.ptr(0) as *const libc::c_void;
            unsafe {
                libc::munlock(ptr, self.storage.len());
            }
        }
    }
}
