use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use shadow_cast::cancel::StickyCancelEvent;
use shadow_cast::desktop;
use shadow_cast::session::{run_session, GpuContext};
use shadow_cast::types::config::{Parameters, VideoOutputSize};
use shadow_cast::types::error::{Error, Result};
use shadow_cast::utils::FrameTime;

#[derive(Parser, Debug)]
#[command(name = "shadow-cast", version, about = "Real-time desktop and game recorder")]
struct Args {
    /// Output media file; the container format follows its extension
    output: PathBuf,

    /// Target frame rate
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..=240))]
    frame_rate: u32,

    /// Video codec name, e.g. h264_nvenc or hevc_nvenc
    #[arg(long, default_value = "h264_nvenc")]
    video_encoder: String,

    /// Audio codec name
    #[arg(long, default_value = "aac")]
    audio_encoder: String,

    /// Audio sample rate; must be supported by the audio codec
    #[arg(long, default_value_t = 48_000)]
    sample_rate: u32,

    /// Constant video bit rate in bits per second; zero selects
    /// constant-quality mode
    #[arg(long, default_value_t = 0)]
    bitrate: u64,

    /// Constant-quality level, only used when --bitrate is zero
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u32).range(1..=10))]
    quality: u32,

    /// Capture resolution override, e.g. 1920x1080
    #[arg(long)]
    resolution: Option<String>,

    /// Keep nanosecond frame-time precision instead of truncating to whole
    /// milliseconds
    #[arg(long)]
    strict_frame_time: bool,

    /// Write a CSV timing sidecar next to the output file
    #[arg(long)]
    metrics: bool,
}

fn parameters_from(args: &Args) -> Result<Parameters> {
    let mut frame_time = FrameTime::from_fps(args.frame_rate);
    if !args.strict_frame_time {
        frame_time = frame_time.truncate_to_millisecond();
    }

    let resolution = args
        .resolution
        .as_deref()
        .map(VideoOutputSize::parse)
        .transpose()?;

    Ok(Parameters {
        output_file: args.output.clone(),
        frame_time,
        video_encoder: args.video_encoder.clone(),
        audio_encoder: args.audio_encoder.clone(),
        sample_rate: args.sample_rate,
        bitrate: args.bitrate,
        quality: args.quality,
        resolution,
        enable_metrics: args.metrics,
    })
}

fn run(args: &Args) -> Result<()> {
    pipewire::init();
    ffmpeg_next::init().map_err(|err| Error::Config(format!("libav init failed: {err}")))?;

    let params = parameters_from(args)?;
    let desktop = desktop::detect()?;
    let gpu = GpuContext::new()?;

    let cancel = Arc::new(StickyCancelEvent::new());
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            log::info!("Interrupt received. Finalizing output...");
            cancel.trigger(1);
        })
        .map_err(|err| Error::Config(format!("failed to install signal handler: {err}")))?;
    }

    run_session(cancel, desktop, &params, &gpu)
}

fn main() {
    let args = Args::parse();
    simple_logging::log_to_stderr(log::LevelFilter::Info);

    if let Err(err) = run(&args) {
        eprintln!("shadow-cast: {err}");
        std::process::exit(1);
    }
}
