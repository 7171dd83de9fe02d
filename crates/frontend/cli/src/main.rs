use anyhow::{Context, Result};
use clap::Parser;
use emu_core::logging::{LogConfig, LogLevel};
use emu_core::types::VideoFrame;
use emu_session::{Button, DeliveryStats, Session, SessionConfig, SessionEvent};
use emu_testcard::TestcardSystem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Run a ROM headless for a while and report what the session delivered.
#[derive(Parser)]
struct Args {
    /// Path to a test-card ROM image
    rom: PathBuf,

    /// Wall-clock seconds to run the frame pump
    #[arg(long, default_value_t = 2.0)]
    seconds: f64,

    /// Buttons held on port 0 while running, e.g. `start,a`
    #[arg(long, value_delimiter = ',')]
    hold: Vec<Button>,

    /// Skip rendering on most frames
    #[arg(long, default_value_t = false)]
    turbo: bool,

    /// Restore this slot (0-9) before running
    #[arg(long)]
    load_slot: Option<i32>,

    /// Save into this slot (0-9) after running
    #[arg(long)]
    save_slot: Option<i32>,

    /// Session configuration JSON; missing or invalid files fall back to defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for save data and snapshots (overrides the config)
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Session log level: off, error, warn, info, debug or trace
    #[arg(long, default_value = "warn")]
    log_level: LogLevel,

    /// Write session logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(serde::Serialize)]
struct Summary {
    rom: String,
    width: u32,
    height: u32,
    refresh_rate: f64,
    seconds: f64,
    video_frames: u64,
    audio_chunks: u64,
    audio_samples: u64,
    video: DeliveryStats,
    audio: DeliveryStats,
    /// Average RGB of the last delivered frame.
    last_frame_rgb: Option<[u8; 3]>,
    events: Vec<String>,
}

fn average_rgb(rgb: &[u8]) -> Option<[u8; 3]> {
    let pixels = rgb.len() / 3;
    if pixels == 0 {
        return None;
    }
    let mut sums = [0u64; 3];
    for px in rgb.chunks_exact(3) {
        for (sum, channel) in sums.iter_mut().zip(px) {
            *sum += *channel as u64;
        }
    }
    Some(sums.map(|sum| (sum / pixels as u64) as u8))
}

fn run_duration(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("--seconds must be finite and non-negative, got {}", seconds))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let run_for = run_duration(args.seconds)?;

    let logs = LogConfig::global();
    logs.set_global_level(args.log_level);
    if let Some(path) = &args.log_file {
        logs.set_log_file(path.clone())
            .with_context(|| format!("cannot open log file {}", path.display()))?;
    }

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path),
        None => SessionConfig::default(),
    };
    if args.base_dir.is_some() {
        config.base_dir = args.base_dir.clone();
    }
    config.turbo_mode |= args.turbo;
    log::debug!("session config: {:?}", config);

    let session = Session::new(TestcardSystem::new(), config)?;
    let events = session.subscribe();
    session.init()?;
    session
        .load_rom_file(&args.rom)
        .with_context(|| format!("cannot run {}", args.rom.display()))?;
    log::info!(
        "loaded {} ({}x{} @ {:.3} Hz)",
        args.rom.display(),
        session.frame_width(),
        session.frame_height(),
        session.frame_rate()
    );

    if let Some(slot) = args.load_slot {
        session
            .load_state(slot)
            .with_context(|| format!("cannot load slot {}", slot))?;
    }

    session.set_pressed(0, &args.hold);

    let video_frames = Arc::new(AtomicU64::new(0));
    let last_frame = Arc::new(Mutex::new(None::<VideoFrame>));
    let audio_chunks = Arc::new(AtomicU64::new(0));
    let audio_samples = Arc::new(AtomicU64::new(0));
    {
        let video_frames = Arc::clone(&video_frames);
        let last_frame = Arc::clone(&last_frame);
        session.register_video_sink(move |frame| {
            video_frames.fetch_add(1, Ordering::Relaxed);
            *last_frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
        });
    }
    {
        let audio_chunks = Arc::clone(&audio_chunks);
        let audio_samples = Arc::clone(&audio_samples);
        session.register_audio_sink(move |chunk| {
            audio_chunks.fetch_add(1, Ordering::Relaxed);
            audio_samples.fetch_add(chunk.sample_count as u64, Ordering::Relaxed);
        });
    }

    let started = Instant::now();
    session.start()?;
    thread::sleep(run_for);
    session.stop();
    let elapsed = started.elapsed().as_secs_f64();

    if let Some(slot) = args.save_slot {
        session
            .save_state(slot)
            .with_context(|| format!("cannot save slot {}", slot))?;
        log::info!("saved slot {} to {}", slot, session.slot_path(slot)?.display());
    }

    // a cleared sink is never called again, so the counters are final after this
    session.clear_video_sink();
    session.clear_audio_sink();

    let mut summary = Summary {
        rom: args.rom.display().to_string(),
        width: session.frame_width(),
        height: session.frame_height(),
        refresh_rate: session.frame_rate(),
        seconds: elapsed,
        video_frames: video_frames.load(Ordering::Relaxed),
        audio_chunks: audio_chunks.load(Ordering::Relaxed),
        audio_samples: audio_samples.load(Ordering::Relaxed),
        video: session.video_stats(),
        audio: session.audio_stats(),
        last_frame_rgb: last_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|frame| average_rgb(&frame.to_rgb24())),
        events: Vec::new(),
    };
    session.deinit();
    summary.events = events
        .try_iter()
        .map(|event| match event {
            SessionEvent::RomLoaded { name } => format!("rom loaded: {}", name),
            other => format!("{:?}", other),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
