//! 周期 pump 线程
//!
//! 每个 Started 的 Stream 一个线程，按硬件周期调用 tick。
//! 关闭时同步等待线程退出，保证 in-flight tick 跑完之后才返回。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::error::{Result, StreamError};

/// pump 线程句柄
pub struct PumpHandle {
    running: Arc<CachePadded<AtomicBool>>,
    thread: Option<JoinHandle<()>>,
}

impl PumpHandle {
    /// 启动 pump 线程
    ///
    /// `tick` 返回 false 时线程退出（Stream 已被释放）
    pub fn spawn<F>(name: String, period: Duration, realtime: bool, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let running = Arc::new(CachePadded::new(AtomicBool::new(true)));
        let flag = Arc::clone(&running);
        let period = period.max(Duration::from_micros(100));

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                if realtime {
                    set_realtime_priority();
                }

                let mut next = Instant::now() + period;
                while flag.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < next {
                        // shutdown 时 unpark 立即唤醒
                        thread::park_timeout(next - now);
                        continue;
                    }
                    if !tick() {
                        break;
                    }
                    next += period;
                    // 落后超过一个周期时不补 tick
                    let now = Instant::now();
                    if next < now {
                        next = now + period;
                    }
                }
                log::debug!("Pump thread exiting");
            })
            .map_err(StreamError::PumpSpawn)?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 停止并等待线程退出
    ///
    /// 不能在持有 Stream 锁时调用：in-flight tick 需要拿到锁才能结束
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::warn!("Pump thread panicked");
            }
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// 尽力把当前线程切到 SCHED_FIFO
///
/// 通常需要 CAP_SYS_NICE / rtprio 权限，失败时保持默认调度
fn set_realtime_priority() {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        if max < 0 || min < 0 {
            log::debug!("SCHED_FIFO not available");
            return;
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        // 高于普通线程，但给系统音频服务留出余地
        param.sched_priority = (min + (max - min) / 2).max(min);

        let result = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if result == 0 {
            log::debug!("Pump thread realtime priority set: {}", param.sched_priority);
        } else {
            log::debug!(
                "Failed to set realtime priority ({}), using default scheduling",
                std::io::Error::from_raw_os_error(result)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_ticks_until_shutdown() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let pump = PumpHandle::spawn("test-pump".to_string(), Duration::from_millis(2), false, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        })
        .unwrap();
        assert!(pump.is_running());

        thread::sleep(Duration::from_millis(50));
        pump.shutdown();
        let after = count.load(Ordering::Relaxed);
        assert!(after > 0);

        // shutdown 返回后不会再有 tick
        thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::Relaxed), after);
    }

    #[test]
    fn test_tick_false_exits() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let pump = PumpHandle::spawn("test-pump".to_string(), Duration::from_millis(1), false, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            false
        })
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        drop(pump);
    }
}
