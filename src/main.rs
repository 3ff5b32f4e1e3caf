use anyhow::{Context, anyhow};
use avcapture::capture::{TestPatternSource, ToneSource};
use avcapture::config::{app_name, version};
use avcapture::encoder::{BackendSelector, EncoderConfig};
use avcapture::mux::ffmpeg::FfmpegFileSink;
use avcapture::pipeline::{HealthAlert, HealthMonitor, PipelineBuilder};
use avcapture::ConfigMap;
use clap::{Arg, ArgMatches, Command};
use log::{error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use std::{panic, process, thread};
use tokio::sync::mpsc;

/// Tone played by the synthetic audio source
const TONE_FREQUENCY: f32 = 440.0;

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output file; the container follows the extension.")
                .required(false),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Recording length, 0 records until Ctrl-C.")
                .value_parser(clap::value_parser!(u64))
                .default_value("10"),
        )
        .arg(
            Arg::new("video-codec")
                .long("video-codec")
                .value_name("CODEC")
                .help("h264, hevc, av1, vp9 or none.")
                .default_value("h264"),
        )
        .arg(
            Arg::new("audio-codec")
                .long("audio-codec")
                .value_name("CODEC")
                .help("aac, opus, mp3, flac or none.")
                .default_value("aac"),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_name("WIDTHxHEIGHT")
                .help("Video resolution.")
                .default_value("1280x720"),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("RATE")
                .value_parser(clap::value_parser!(u32).range(1..=240))
                .default_value("30"),
        )
        .arg(
            Arg::new("hw-accel")
                .long("hw-accel")
                .value_name("FAMILY")
                .help("auto, none, nvenc, qsv, amf or videotoolbox.")
                .ignore_case(true)
                .default_value("auto"),
        )
        .arg(
            Arg::new("title")
                .long("title")
                .value_name("TITLE")
                .help("Title stored in the container metadata.")
                .required(false),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration; command line options override it.")
                .required(false),
        )
}

fn parse_size(value: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("size must look like 1280x720, got '{}'", value))?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

fn codec_arg(matches: &ArgMatches, name: &str) -> String {
    match matches.get_one::<String>(name).map(|s| s.to_ascii_lowercase()) {
        Some(codec) if codec != "none" => codec,
        _ => String::new(),
    }
}

fn default_output() -> String {
    format!(
        "{}-{}.mkv",
        app_name(),
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    )
}

fn build_config(matches: &ArgMatches) -> anyhow::Result<ConfigMap> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            let document = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read configuration {}", path))?;
            ConfigMap::from_json_str(&document)?
        }
        None => ConfigMap::new(),
    };

    let size = matches.get_one::<String>("size").map_or("1280x720", |s| s.as_str());
    let (width, height) = parse_size(size)?;
    let fps = matches.get_one::<u32>("fps").copied().unwrap_or(30);
    let hw_accel = matches
        .get_one::<String>("hw-accel")
        .map_or("auto".to_string(), |s| s.to_ascii_lowercase());

    config.set_scoped("encode", "video_codec", codec_arg(matches, "video-codec"));
    config.set_scoped("encode", "audio_codec", codec_arg(matches, "audio-codec"));
    config.set_scoped("encode", "width", width);
    config.set_scoped("encode", "height", height);
    config.set_scoped("encode", "frame_rate", fps);
    config.set_scoped("encode", "hw_accel", hw_accel);

    let output = matches
        .get_one::<String>("output")
        .cloned()
        .unwrap_or_else(default_output);
    config.set_scoped("mux", "output_path", output);
    if let Some(title) = matches.get_one::<String>("title") {
        config.set_scoped("mux", "title", title.clone());
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = cli().get_matches();
    let config = build_config(&matches)?;
    let duration = matches.get_one::<u64>("duration").copied().unwrap_or(10);

    // kill the process as soon as a worker thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    // SIGINT/SIGTERM end the recording, the file is still finalised
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })
        .context("Error setting Ctrl-C handler")?;
    }

    let encode: EncoderConfig = config.settings("encode")?;
    let mut builder = PipelineBuilder::new(config.clone())
        .selector(BackendSelector::with_builtin())
        .sink(FfmpegFileSink::new());
    if !encode.video_codec.is_empty() {
        builder = builder.video_source(
            TestPatternSource::new(encode.width, encode.height, encode.frame_rate).realtime(true),
        );
    }
    if !encode.audio_codec.is_empty() {
        builder = builder.audio_source(
            ToneSource::new(encode.sample_rate, encode.channels, TONE_FREQUENCY).realtime(true),
        );
    }
    let mut pipeline = builder.build()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let (alert_tx, mut alert_rx) = mpsc::channel::<HealthAlert>(32);
    let monitor = HealthMonitor::new(pipeline.stats_handle(), alert_tx)
        .with_check_interval(Duration::from_secs(2))
        .with_stall_threshold(Duration::from_secs(3))
        .with_drop_rate_threshold(5.0);
    let monitor_task = runtime.spawn(async move { monitor.run().await });
    runtime.spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            if let HealthAlert::StageError { stage, message } = alert {
                error!("{} reported: {}", stage, message);
            }
        }
    });

    pipeline.init()?;
    pipeline.start()?;
    info!(
        "Recording {} to {}",
        if duration == 0 {
            "until Ctrl-C".to_string()
        } else {
            format!("{}s", duration)
        },
        config
            .scoped("mux")
            .get("output_path")
            .and_then(|v| v.as_str())
            .unwrap_or("output")
    );

    let started = Instant::now();
    let limit = Duration::from_secs(duration);
    while !interrupted.load(Ordering::SeqCst)
        && !pipeline.is_finished()
        && (duration == 0 || started.elapsed() < limit)
    {
        thread::sleep(Duration::from_millis(100));
    }

    let timeout = pipeline.drain_timeout();
    match pipeline.drain(timeout) {
        Ok(true) => {}
        Ok(false) => warn!("Pipeline did not drain within {:?}", timeout),
        Err(e) => error!("Pipeline stopped with an error: {}", e),
    }

    let stats = pipeline.stats();
    info!("{}", stats);
    for (stage, message) in stats.last_errors() {
        warn!("{}: {}", stage, message);
    }

    pipeline.destroy();
    if let Err(e) = runtime.block_on(monitor_task) {
        warn!("Health monitor ended abnormally: {}", e);
    }
    Ok(())
}
