use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use maix_video::audio::{AudioRecorder, ToneRecorder};
use maix_video::camera::{Camera, TestPattern};
use maix_video::config::{AppConfig, ConfigStore};
use maix_video::video::format::{MediaType, PixelFormat, Resolution};
use maix_video::video::{Decoder, VideoRecorder};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// maix-video command line arguments
#[derive(Parser, Debug)]
#[command(name = "maix-video")]
#[command(version, about = "Record, decode and inspect H.264 video files", long_about = None)]
struct CliArgs {
    /// JSON configuration file (defaults are used when it does not exist)
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record the camera (or a test pattern) to a file
    Record(RecordArgs),
    /// Decode a file and report every frame
    Decode(DecodeArgs),
    /// Print stream information
    Info {
        /// Input file
        input: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Output file; the suffix picks the container (.mp4, .flv, .h264)
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Stop after this many seconds (runs until Ctrl-C when omitted)
    #[arg(short = 'd', long, value_name = "SECS")]
    duration: Option<f64>,

    /// Frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Target bitrate in bps
    #[arg(long)]
    bitrate: Option<u32>,

    /// Recording resolution as WxH
    #[arg(short = 'r', long, value_name = "WxH")]
    resolution: Option<Resolution>,

    /// Camera device, e.g. /dev/video0 (needs the `v4l2` feature)
    #[arg(long, value_name = "DEVICE")]
    camera: Option<String>,

    /// Add a synthetic 440 Hz audio track
    #[arg(long)]
    tone: bool,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// Input file
    input: PathBuf,

    /// Seek to this position in seconds before decoding
    #[arg(short = 's', long, value_name = "SECS")]
    seek: Option<f64>,

    /// Output pixel format
    #[arg(short = 'f', long, value_name = "FORMAT")]
    format: Option<PixelFormat>,

    /// Stop after this many video frames
    #[arg(short = 'n', long)]
    frames: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting maix-video v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => (*ConfigStore::new(path).await?.get()).clone(),
        None => AppConfig::default(),
    };

    match args.command {
        Command::Record(record) => run_record(config, record).await,
        Command::Decode(decode) => {
            tokio::task::spawn_blocking(move || run_decode(&config, decode)).await?
        }
        Command::Info { input } => tokio::task::spawn_blocking(move || run_info(&input)).await?,
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "maix_video=error",
        LogLevel::Warn => "maix_video=warn",
        LogLevel::Info => "maix_video=info",
        LogLevel::Verbose => "maix_video=debug,openh264=info",
        LogLevel::Debug => "maix_video=debug,openh264=debug",
        LogLevel::Trace => "maix_video=trace,openh264=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

fn open_camera(device: Option<&str>, resolution: Resolution, fps: u32) -> anyhow::Result<Arc<dyn Camera>> {
    match device {
        #[cfg(feature = "v4l2")]
        Some(device) => {
            let camera = maix_video::camera::v4l2::V4l2Camera::open(device, resolution, fps)?;
            Ok(Arc::new(camera))
        }
        #[cfg(not(feature = "v4l2"))]
        Some(device) => anyhow::bail!(
            "camera {} requested but this build lacks the v4l2 feature",
            device
        ),
        None => {
            tracing::info!("No camera device, recording a test pattern");
            Ok(Arc::new(TestPattern::new(resolution, PixelFormat::Nv21, fps)?))
        }
    }
}

fn default_output() -> PathBuf {
    PathBuf::from(format!(
        "record_{}.mp4",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ))
}

async fn run_record(config: AppConfig, args: RecordArgs) -> anyhow::Result<()> {
    let mut settings = config.recorder.clone();
    if let Some(fps) = args.fps {
        settings.fps = fps;
    }
    if let Some(bitrate) = args.bitrate {
        settings.bitrate = bitrate;
    }
    let output = args
        .output
        .or_else(|| (!settings.path.is_empty()).then(|| PathBuf::from(&settings.path)))
        .unwrap_or_else(default_output);
    let resolution = args
        .resolution
        .or(settings.resolution)
        .unwrap_or(Resolution::VGA);
    let device = args.camera.or_else(|| settings.camera_device.clone());

    let camera = open_camera(device.as_deref(), resolution, settings.fps)?;
    let recorder = Arc::new(VideoRecorder::new(settings.clone()));
    recorder.bind_camera(camera)?;
    if let Some(audio) = open_audio(&config, args.tone)? {
        recorder.bind_audio(audio)?;
    }
    if settings.snapshot {
        recorder.config_snapshot(true, settings.snapshot_resolution, settings.snapshot_format)?;
    }
    recorder.config_path(&output)?;
    recorder.open()?;
    recorder.record_start()?;
    tracing::info!("Recording to {} (Ctrl-C to stop)", output.display());

    let limit = args.duration.map(Duration::from_secs_f64);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let started = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                tracing::debug!(
                    "Recorded {} frames, position {} ms",
                    recorder.frames_recorded(),
                    recorder.seek()
                );
                if limit.is_some_and(|limit| started.elapsed() >= limit) {
                    break;
                }
            }
        }
    }

    let closing = recorder.clone();
    tokio::task::spawn_blocking(move || closing.close()).await??;
    tracing::info!(
        "Saved {} ({} frames)",
        output.display(),
        recorder.frames_recorded()
    );
    Ok(())
}

fn open_audio(config: &AppConfig, tone: bool) -> anyhow::Result<Option<Arc<dyn AudioRecorder>>> {
    let audio = &config.audio;
    if tone {
        let recorder = ToneRecorder::new(audio.sample_rate, audio.channels, 440.0);
        return Ok(Some(Arc::new(recorder)));
    }
    if !audio.enabled {
        return Ok(None);
    }
    #[cfg(feature = "alsa")]
    {
        let recorder = maix_video::audio::AlsaRecorder::open(maix_video::audio::AlsaConfig {
            device_name: audio.device.clone(),
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            ..Default::default()
        })?;
        Ok(Some(Arc::new(recorder)))
    }
    #[cfg(not(feature = "alsa"))]
    {
        tracing::warn!("Audio enabled but this build lacks the alsa feature, recording video only");
        Ok(None)
    }
}

fn run_decode(config: &AppConfig, args: DecodeArgs) -> anyhow::Result<()> {
    let format = args.format.unwrap_or(config.decoder.format);
    let mut decoder = Decoder::open(&args.input, format)?;
    if let Some(seek) = args.seek {
        let landed = decoder.seek(seek)?;
        tracing::info!("Seek to {:.3}s landed at {:.3}s", seek, landed);
    }

    let (mut video, mut audio) = (0u64, 0u64);
    while let Some(mut ctx) = decoder.decode(config.decoder.block)? {
        match ctx.media_type {
            MediaType::Video => {
                if let Some(image) = ctx.take_image() {
                    video += 1;
                    println!(
                        "video pts={:.3}s {}x{} {}",
                        ctx.pts_seconds(),
                        image.width(),
                        image.height(),
                        image.format()
                    );
                }
            }
            MediaType::Audio => {
                audio += 1;
                let bytes = ctx.take_pcm().map(|pcm| pcm.len()).unwrap_or(0);
                tracing::debug!("audio pts={:.3}s {} bytes", ctx.pts_seconds(), bytes);
            }
            other => tracing::trace!("skipping {:?} context", other),
        }
        if args.frames.is_some_and(|n| video >= n) {
            break;
        }
    }
    decoder.close()?;
    println!("{} video frames, {} audio frames", video, audio);
    Ok(())
}

fn run_info(input: &Path) -> anyhow::Result<()> {
    let mut decoder = Decoder::open(input, PixelFormat::Nv21)?;
    println!("file:      {}", decoder.path().display());
    println!("container: {:?}", decoder.container());
    println!("duration:  {:.3}s", decoder.duration());
    if decoder.has_video() {
        println!(
            "video:     {}x{} @ {:.2}fps, {} bps, timebase {}",
            decoder.width(),
            decoder.height(),
            decoder.fps(),
            decoder.bitrate(),
            decoder.timebase()
        );
    }
    if decoder.has_audio() {
        println!(
            "audio:     {} Hz, {} ch, {:?}",
            decoder.audio_sample_rate(),
            decoder.audio_channels(),
            decoder.audio_format()
        );
    }
    decoder.close()?;
    Ok(())
}
