//! PCM Bridge - 实时 PCM 流引擎演示
//!
//! 子命令：
//! - info: 后端、mix format、设备周期
//! - tone: 播放正弦波 / 噪声，演示 stream / session 音量和声道重映射
//! - capture: 从设备录音，打印电平和位置

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use rand::Rng;

use pcm_bridge::audio::backend::PcmBackend;
use pcm_bridge::audio::format::{read_packed, write_packed};
use pcm_bridge::{
    AudioContext, ContextConfig, Direction, PumpMode, SampleEncoding, Stream, StreamFormat,
    StreamParams, SystemClock, VirtualBackend, VirtualConfig, VirtualProbe,
};

/// PCM Bridge - real-time PCM streaming engine
#[derive(Parser)]
#[command(name = "pcm-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Endpoint (device) name
    #[arg(short, long, default_value = "default", global = true)]
    device: String,

    /// Use the ALSA backend (requires the `alsa` feature)
    #[arg(long, global = true)]
    alsa: bool,

    /// Client buffer size in milliseconds
    #[arg(short, long, default_value = "100", global = true)]
    buffer_ms: u64,

    /// Device period in milliseconds (0 = default)
    #[arg(short, long, default_value = "0", global = true)]
    period_ms: u64,

    /// Try SCHED_FIFO for pump threads
    #[arg(long, global = true)]
    realtime: bool,

    /// mlock stream buffers
    #[arg(long, global = true)]
    lock_memory: bool,

    /// Virtual device: fixed hardware channel count
    #[arg(long, global = true)]
    hw_channels: Option<u16>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend, mix format and device periods
    Info,

    /// Render a test signal
    Tone {
        /// Sine frequency in Hz
        #[arg(short, long, default_value = "440")]
        freq: f32,

        /// White noise instead of a sine
        #[arg(long)]
        noise: bool,

        /// Duration in seconds
        #[arg(short, long, default_value = "3")]
        seconds: f32,

        /// Stream volume applied to every channel
        #[arg(long, default_value = "1.0")]
        volume: f32,

        /// Session master volume
        #[arg(long, default_value = "1.0")]
        session_volume: f32,

        /// Mute the session
        #[arg(long)]
        mute: bool,

        /// Client channel count (default: mix format)
        #[arg(long)]
        channels: Option<u16>,
    },

    /// Capture and print levels
    Capture {
        /// Duration in seconds
        #[arg(short, long, default_value = "3")]
        seconds: f32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let (backend, virtual_backend) = open_backend(&cli)?;
    let ctx = AudioContext::new(
        backend,
        ContextConfig {
            pump_mode: PumpMode::Timer,
            realtime_priority: cli.realtime,
            lock_memory: cli.lock_memory,
            ..Default::default()
        },
    );

    match cli.command {
        Commands::Info => show_info(&ctx, &cli)?,
        Commands::Tone {
            freq,
            noise,
            seconds,
            volume,
            session_volume,
            mute,
            channels,
        } => {
            let signal = if noise { Signal::Noise } else { Signal::Sine(freq) };
            let options = ToneOptions {
                signal,
                seconds,
                volume,
                session_volume,
                mute,
                channels,
            };
            play_tone(&ctx, &cli, &options)?;
        }
        Commands::Capture { seconds } => {
            capture(&ctx, &cli, seconds, virtual_backend.as_ref())?;
        }
    }

    Ok(())
}

/// 选择后端；虚拟设备按系统时钟实时消费 / 产生帧
fn open_backend(cli: &Cli) -> anyhow::Result<(Arc<dyn PcmBackend>, Option<Arc<VirtualBackend>>)> {
    if cli.alsa {
        return Ok((alsa_backend()?, None));
    }

    let backend = Arc::new(VirtualBackend::new(VirtualConfig {
        endpoints: vec![cli.device.clone()],
        hw_channels: cli.hw_channels,
        realtime: Some(Arc::new(SystemClock)),
        history_bytes: 0,
        ..Default::default()
    }));
    Ok((backend.clone(), Some(backend)))
}

#[cfg(feature = "alsa")]
fn alsa_backend() -> anyhow::Result<Arc<dyn PcmBackend>> {
    Ok(Arc::new(pcm_bridge::audio::backend::alsa::AlsaBackend::new()))
}

#[cfg(not(feature = "alsa"))]
fn alsa_backend() -> anyhow::Result<Arc<dyn PcmBackend>> {
    anyhow::bail!("built without the `alsa` feature")
}

fn show_info(ctx: &AudioContext, cli: &Cli) -> anyhow::Result<()> {
    println!("=== PCM Bridge ===\n");
    println!("Backend:  {}", ctx.backend().name());
    println!("Endpoint: {}", cli.device);

    let (default_period, minimum_period) = ctx.device_period();
    println!(
        "Periods:  default {:.2} ms, minimum {:.2} ms",
        default_period.as_secs_f64() * 1000.0,
        minimum_period.as_secs_f64() * 1000.0
    );

    for direction in [Direction::Render, Direction::Capture] {
        match ctx.mix_format(&cli.device, direction) {
            Ok(format) => println!("{:?} mix format: {}", direction, format),
            Err(e) => println!("{:?} mix format: unavailable ({})", direction, e),
        }
    }

    println!("\nSupported render formats:");
    for encoding in [
        SampleEncoding::U8,
        SampleEncoding::S16,
        SampleEncoding::S24Packed,
        SampleEncoding::S32,
        SampleEncoding::F32,
    ] {
        let format = StreamFormat::new(48000, 2, encoding);
        let supported = ctx.is_format_supported(&cli.device, Direction::Render, &format)?;
        println!("  {:<40} {}", format.to_string(), if supported { "yes" } else { "no" });
    }

    Ok(())
}

#[derive(Clone, Copy)]
enum Signal {
    Sine(f32),
    Noise,
}

struct ToneOptions {
    signal: Signal,
    seconds: f32,
    volume: f32,
    session_volume: f32,
    mute: bool,
    channels: Option<u16>,
}

fn stream_params(cli: &Cli, format: StreamFormat) -> StreamParams {
    StreamParams::new(format, Duration::from_millis(cli.buffer_ms))
        .with_period(Duration::from_millis(cli.period_ms))
}

/// Ctrl+C 时清除标志
fn install_interrupt() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

fn play_tone(ctx: &AudioContext, cli: &Cli, options: &ToneOptions) -> anyhow::Result<()> {
    let mut format = ctx.mix_format(&cli.device, Direction::Render)?;
    if let Some(channels) = options.channels {
        format.channels = channels;
    }

    let stream = ctx.new_stream(&cli.device, Direction::Render);
    stream.initialize(stream_params(cli, format))?;
    let channels = format.channels as usize;
    stream.set_all_volumes(&vec![options.volume; channels])?;
    let session = stream.session()?;
    session.set_master_volume(options.session_volume)?;
    session.set_mute(options.mute)?;

    let hw = stream.hardware_config()?;
    println!("Stream:   {}", format);
    println!(
        "Hardware: {}ch, period {} frames, buffer {} frames",
        hw.channels, hw.period_frames, hw.buffer_frames
    );
    println!("Latency:  {:?}", stream.stream_latency()?);
    println!("Gains:    {:?}", stream.combined_gains()?);
    println!("Press Ctrl+C to stop.\n");

    let running = install_interrupt()?;
    let mut generator = Generator::new(options.signal, format.sample_rate);

    // 先填满 buffer 再启动，避免一开始就 underrun
    fill(&stream, &mut generator, format)?;
    stream.start()?;

    let deadline = Instant::now() + Duration::from_secs_f32(options.seconds);
    // 半个周期写一次
    let poll = Duration::from_millis(hw.period_frames as u64 * 500 / format.sample_rate as u64)
        .max(Duration::from_millis(1));
    let mut last_print = Instant::now();
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(poll);
        fill(&stream, &mut generator, format)?;
        if last_print.elapsed() >= Duration::from_millis(500) {
            let position = stream.position()?;
            println!(
                "position {:>8} frames ({:.2}s), padding {:>5}",
                position.frames,
                position.frames as f64 / format.sample_rate as f64,
                stream.current_padding()?
            );
            last_print = Instant::now();
        }
    }

    stream.stop()?;
    println!("\n{}", stream.stats()?);
    Ok(())
}

/// 把 buffer 的空余空间全部写满
fn fill(stream: &Stream, generator: &mut Generator, format: StreamFormat) -> anyhow::Result<()> {
    let free = stream.buffer_size()? - stream.current_padding()?;
    if free == 0 {
        return Ok(());
    }
    let mut region = stream.acquire_write(free)?;
    let bps = format.bytes_per_sample();
    for frame in region.chunks_exact_mut(format.bytes_per_frame()) {
        let value = generator.next_sample();
        for sample in frame.chunks_exact_mut(bps) {
            encode_sample(format.encoding, value, sample);
        }
    }
    region.commit(free, false)?;
    Ok(())
}

struct Generator {
    signal: Signal,
    phase: f32,
    step: f32,
    rng: rand::rngs::ThreadRng,
}

impl Generator {
    fn new(signal: Signal, sample_rate: u32) -> Self {
        let step = match signal {
            Signal::Sine(freq) => freq / sample_rate as f32,
            Signal::Noise => 0.0,
        };
        Self {
            signal,
            phase: 0.0,
            step,
            rng: rand::thread_rng(),
        }
    }

    fn next_sample(&mut self) -> f32 {
        match self.signal {
            Signal::Sine(_) => {
                let value = (self.phase * std::f32::consts::TAU).sin() * 0.5;
                self.phase = (self.phase + self.step).fract();
                value
            }
            Signal::Noise => self.rng.gen_range(-0.5..0.5),
        }
    }
}

/// [-1, 1] 浮点 → 编码后的样本
fn encode_sample(encoding: SampleEncoding, value: f32, out: &mut [u8]) {
    let v = value.clamp(-1.0, 1.0);
    match encoding {
        SampleEncoding::U8 => out[0] = (v * 127.0 + 128.0) as u8,
        SampleEncoding::S16 => out.copy_from_slice(&((v * i16::MAX as f32) as i16).to_le_bytes()),
        SampleEncoding::S20Packed => write_packed(out, (v as f64 * 524_287.0) as i32, 20),
        SampleEncoding::S24Packed => write_packed(out, (v as f64 * 8_388_607.0) as i32, 24),
        SampleEncoding::S32 => out.copy_from_slice(&((v as f64 * i32::MAX as f64) as i32).to_le_bytes()),
        SampleEncoding::F32 => out.copy_from_slice(&v.to_le_bytes()),
        SampleEncoding::F64 => out.copy_from_slice(&(v as f64).to_le_bytes()),
    }
}

/// 编码后的样本 → [-1, 1] 浮点
fn decode_sample(encoding: SampleEncoding, bytes: &[u8]) -> f32 {
    match encoding {
        SampleEncoding::U8 => (bytes[0] as f32 - 128.0) / 128.0,
        SampleEncoding::S16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        SampleEncoding::S20Packed => read_packed(bytes, 20) as f32 / 524_288.0,
        SampleEncoding::S24Packed => read_packed(bytes, 24) as f32 / 8_388_608.0,
        SampleEncoding::S32 => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleEncoding::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        SampleEncoding::F64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            f64::from_le_bytes(b) as f32
        }
    }
}

fn capture(
    ctx: &AudioContext,
    cli: &Cli,
    seconds: f32,
    virtual_backend: Option<&Arc<VirtualBackend>>,
) -> anyhow::Result<()> {
    let format = ctx.mix_format(&cli.device, Direction::Capture)?;
    let stream = ctx.new_stream(&cli.device, Direction::Capture);
    stream.initialize(stream_params(cli, format))?;

    // 虚拟设备：循环产生一个 1kHz 正弦
    if let Some(probe) = virtual_backend.and_then(|b| b.last_probe()) {
        feed_test_pattern(&probe, format, stream.hardware_config()?.channels as usize);
    }

    println!("Capturing {} from '{}'", format, cli.device);
    println!("Press Ctrl+C to stop.\n");

    let running = install_interrupt()?;
    stream.start()?;

    let deadline = Instant::now() + Duration::from_secs_f32(seconds);
    let bps = format.bytes_per_sample();
    let channels = format.channels as usize;
    let mut peaks = vec![0.0f32; channels];
    let mut last_print = Instant::now();
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
        let region = stream.acquire_read()?;
        for (i, sample) in region.chunks_exact(bps).enumerate() {
            let level = decode_sample(format.encoding, sample).abs();
            let peak = &mut peaks[i % channels];
            *peak = peak.max(level);
        }
        let frames = region.frames();
        let first = region.position();
        region.commit(frames)?;

        if last_print.elapsed() >= Duration::from_millis(500) {
            let levels: Vec<String> = peaks
                .iter()
                .map(|p| format!("{:>6.1} dB", 20.0 * p.max(1e-6).log10()))
                .collect();
            println!("position {:>8} frames, peak [{}]", first + frames as u64, levels.join(", "));
            peaks.iter_mut().for_each(|p| *p = 0.0);
            last_print = Instant::now();
        }
    }

    stream.stop()?;
    println!("\n{}", stream.stats()?);
    Ok(())
}

fn feed_test_pattern(probe: &VirtualProbe, format: StreamFormat, hw_channels: usize) {
    let period = (format.sample_rate / 1000) as usize;
    let bps = format.bytes_per_sample();
    let mut pattern = vec![0u8; period * hw_channels * bps];
    for (i, frame) in pattern.chunks_exact_mut(hw_channels * bps).enumerate() {
        let value = (i as f32 / period as f32 * std::f32::consts::TAU).sin() * 0.25;
        for sample in frame.chunks_exact_mut(bps) {
            encode_sample(format.encoding, value, sample);
        }
    }
    probe.set_capture_pattern(pattern);
}
