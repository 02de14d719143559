//! 错误类型
//!
//! 两类错误：
//! - [`StreamError`]：同步返回给调用方（生命周期、buffer region 误用、格式协商、设备打开失败）
//! - [`BackendError`]：硬件后端返回的原始错误，由 pump 内部消化（would-block、XRUN），
//!   只有设备打开阶段的失败才会包装成 `StreamError::Device` 返回

/// 硬件后端错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// 非阻塞 I/O 暂时无法推进（硬件 buffer 满 / 空）
    #[error("device would block")]
    WouldBlock,

    /// Underrun / overrun，需要 recover
    #[error("device xrun")]
    Xrun,

    /// 设备已被拔出或失效
    #[error("device disconnected")]
    Disconnected,

    /// 找不到指定的 endpoint
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// 设备不支持请求的参数
    #[error("unsupported by device: {0}")]
    Unsupported(String),

    /// 后端原生错误码（例如 ALSA 的负 errno）
    #[error("{op} failed with native error {code}")]
    Native { code: i32, op: &'static str },
}

/// Stream / Session 操作错误
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream not initialized")]
    NotInitialized,

    #[error("stream already initialized")]
    AlreadyInitialized,

    #[error("stream not stopped")]
    NotStopped,

    /// Acquire/commit 顺序错误（重复 acquire、没有 acquire 就 commit）
    #[error("buffer operation out of order")]
    OutOfOrder,

    #[error("requested region larger than free buffer space")]
    BufferTooLarge,

    #[error("committed more frames than were acquired")]
    InvalidSize,

    #[error("a buffer region is still outstanding")]
    BufferOperationPending,

    #[error("event-driven stream started without an event handle")]
    EventHandleNotSet,

    #[error("stream was not initialized for event-driven mode")]
    EventHandleNotExpected,

    #[error("audio device has been invalidated")]
    DeviceInvalidated,

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of memory")]
    OutOfMemory,

    #[error("device error: {0}")]
    Device(#[from] BackendError),

    #[error("failed to spawn pump thread: {0}")]
    PumpSpawn(#[source] std::io::Error),
}

impl From<std::collections::TryReserveError> for StreamError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_wraps_native_code() {
        let err: StreamError = BackendError::Native { code: -19, op: "open" }.into();
        assert!(matches!(
            err,
            StreamError::Device(BackendError::Native { code: -19, .. })
        ));
        assert_eq!(err.to_string(), "device error: open failed with native error -19");
    }

    #[test]
    fn test_try_reserve_maps_to_oom() {
        let mut v: Vec<u8> = Vec::new();
        let err = v.try_reserve(usize::MAX).unwrap_err();
        assert!(matches!(StreamError::from(err), StreamError::OutOfMemory));
    }
}
