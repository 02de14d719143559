//! ALSA 后端（feature = "alsa"）
//!
//! 非阻塞、交织访问的 PCM。错误码按 errno 映射：
//! EAGAIN → would-block，EPIPE/ESTRPIPE → XRUN，ENODEV → 设备拔出。

use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{Direction as AlsaDirection, ValueOr};

use super::{DeviceCaps, DeviceState, HwConfig, HwRequest, PcmBackend, PcmDevice};
use crate::audio::format::{Direction, SampleEncoding};
use crate::error::BackendError;

/// mix format 候选顺序里会出现的编码
const PROBE_ENCODINGS: [SampleEncoding; 7] = [
    SampleEncoding::F32,
    SampleEncoding::S16,
    SampleEncoding::U8,
    SampleEncoding::S32,
    SampleEncoding::S24Packed,
    SampleEncoding::S20Packed,
    SampleEncoding::F64,
];

fn alsa_format(encoding: SampleEncoding) -> Format {
    match encoding {
        SampleEncoding::U8 => Format::U8,
        SampleEncoding::S16 => Format::S16LE,
        SampleEncoding::S20Packed => Format::S203LE,
        SampleEncoding::S24Packed => Format::S243LE,
        SampleEncoding::S32 => Format::S32LE,
        SampleEncoding::F32 => Format::FloatLE,
        SampleEncoding::F64 => Format::Float64LE,
    }
}

fn alsa_direction(direction: Direction) -> AlsaDirection {
    match direction {
        Direction::Render => AlsaDirection::Playback,
        Direction::Capture => AlsaDirection::Capture,
    }
}

fn map_err(err: alsa::Error, op: &'static str) -> BackendError {
    let code = err.errno().abs();
    if code == libc::EAGAIN {
        BackendError::WouldBlock
    } else if code == libc::EPIPE || code == libc::ESTRPIPE {
        BackendError::Xrun
    } else if code == libc::ENODEV {
        BackendError::Disconnected
    } else {
        BackendError::Native { code: -code, op }
    }
}

/// 基于 ALSA 的后端；endpoint 即 ALSA 设备名（如 `default`、`hw:0,0`）
#[derive(Debug, Default)]
pub struct AlsaBackend;

impl AlsaBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PcmBackend for AlsaBackend {
    fn name(&self) -> &str {
        "alsa"
    }

    fn capabilities(&self, endpoint: &str, direction: Direction) -> Result<DeviceCaps, BackendError> {
        let pcm = PCM::new(endpoint, alsa_direction(direction), true)
            .map_err(|e| map_err(e, "open"))?;
        let hwp = HwParams::any(&pcm).map_err(|e| map_err(e, "hw_params_any"))?;

        let encodings = PROBE_ENCODINGS
            .iter()
            .copied()
            .filter(|&enc| hwp.test_format(alsa_format(enc)).is_ok())
            .collect();

        Ok(DeviceCaps {
            encodings,
            min_channels: hwp.get_channels_min().map_err(|e| map_err(e, "channels_min"))? as u16,
            max_channels: hwp.get_channels_max().map_err(|e| map_err(e, "channels_max"))?.min(u16::MAX as u32) as u16,
            min_rate: hwp.get_rate_min().map_err(|e| map_err(e, "rate_min"))?,
            max_rate: hwp.get_rate_max().map_err(|e| map_err(e, "rate_max"))?,
        })
    }

    fn open(
        &self,
        endpoint: &str,
        direction: Direction,
        request: &HwRequest,
    ) -> Result<Box<dyn PcmDevice>, BackendError> {
        let format = &request.format;
        let pcm = PCM::new(endpoint, alsa_direction(direction), true)
            .map_err(|e| map_err(e, "open"))?;

        {
            let hwp = HwParams::any(&pcm).map_err(|e| map_err(e, "hw_params_any"))?;
            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| map_err(e, "set_access"))?;
            hwp.set_format(alsa_format(format.encoding))
                .map_err(|_| BackendError::Unsupported(format!("{:?}", format.encoding)))?;
            hwp.set_channels(format.channels as u32)
                .map_err(|_| BackendError::Unsupported(format!("{} channels", format.channels)))?;
            hwp.set_rate(format.sample_rate, ValueOr::Nearest)
                .map_err(|_| BackendError::Unsupported(format!("{} Hz", format.sample_rate)))?;
            hwp.set_period_size_near(request.period_frames as alsa::pcm::Frames, ValueOr::Nearest)
                .map_err(|e| map_err(e, "set_period_size"))?;
            hwp.set_buffer_size_near(request.buffer_frames as alsa::pcm::Frames)
                .map_err(|e| map_err(e, "set_buffer_size"))?;
            pcm.hw_params(&hwp).map_err(|e| map_err(e, "hw_params"))?;
        }

        let config = {
            let hwp = pcm
                .hw_params_current()
                .map_err(|e| map_err(e, "hw_params_current"))?;
            HwConfig {
                channels: hwp.get_channels().map_err(|e| map_err(e, "get_channels"))? as u16,
                encoding: format.encoding,
                sample_rate: hwp.get_rate().map_err(|e| map_err(e, "get_rate"))?,
                period_frames: hwp.get_period_size().map_err(|e| map_err(e, "get_period_size"))?
                    as usize,
                buffer_frames: hwp.get_buffer_size().map_err(|e| map_err(e, "get_buffer_size"))?
                    as usize,
            }
        };
        if config.sample_rate != format.sample_rate {
            return Err(BackendError::Unsupported(format!(
                "{} Hz (device offers {} Hz)",
                format.sample_rate, config.sample_rate
            )));
        }

        log::info!(
            "ALSA {:?} '{}' opened: {}ch {:?} {}Hz, period {} / buffer {} frames",
            direction,
            endpoint,
            config.channels,
            config.encoding,
            config.sample_rate,
            config.period_frames,
            config.buffer_frames
        );

        Ok(Box::new(AlsaDevice { pcm, config }))
    }
}

pub struct AlsaDevice {
    pcm: PCM,
    config: HwConfig,
}

impl PcmDevice for AlsaDevice {
    fn config(&self) -> HwConfig {
        self.config
    }

    fn avail(&mut self) -> Result<usize, BackendError> {
        self.pcm
            .avail_update()
            .map(|frames| frames.max(0) as usize)
            .map_err(|e| map_err(e, "avail_update"))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, BackendError> {
        self.pcm
            .io_bytes()
            .writei(data)
            .map_err(|e| map_err(e, "writei"))
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, BackendError> {
        self.pcm
            .io_bytes()
            .readi(data)
            .map_err(|e| map_err(e, "readi"))
    }

    fn state(&mut self) -> DeviceState {
        match self.pcm.state() {
            State::Open | State::Setup => DeviceState::Open,
            State::Prepared => DeviceState::Prepared,
            State::Running | State::Draining | State::Paused => DeviceState::Running,
            State::XRun | State::Suspended => DeviceState::Xrun,
            State::Disconnected => DeviceState::Disconnected,
        }
    }

    fn start(&mut self) -> Result<(), BackendError> {
        self.pcm.start().map_err(|e| map_err(e, "start"))
    }

    fn recover(&mut self, err: &BackendError) -> Result<(), BackendError> {
        let errno = match err {
            BackendError::Xrun => libc::EPIPE,
            BackendError::WouldBlock => return Ok(()),
            BackendError::Native { code, .. } => code.abs(),
            other => return Err(other.clone()),
        };
        self.pcm
            .recover(-errno, true)
            .map_err(|e| map_err(e, "recover"))
    }

    fn reset(&mut self) -> Result<(), BackendError> {
        self.pcm.drop().map_err(|e| map_err(e, "drop"))
    }

    fn prepare(&mut self) -> Result<(), BackendError> {
        self.pcm.prepare().map_err(|e| map_err(e, "prepare"))
    }

    fn rewind(&mut self, frames: usize) -> Result<usize, BackendError> {
        let rewindable = self
            .pcm
            .rewindable()
            .map_err(|e| map_err(e, "rewindable"))?
            .max(0) as usize;
        let frames = frames.min(rewindable);
        if frames == 0 {
            return Ok(0);
        }
        self.pcm
            .rewind(frames as alsa::pcm::Frames)
            .map(|n| n.max(0) as usize)
            .map_err(|e| map_err(e, "rewind"))
    }
}
