//! End-to-end tests driving a session with the test-card engine.
//!
//! These run the real pacing thread and delivery threads, so assertions poll
//! with a deadline instead of expecting exact frame counts.

use emu_core::logging::{LogCategory, LogConfig, LogLevel};
use emu_core::types::{Region, NTSC_REFRESH_RATE, PAL_REFRESH_RATE};
use emu_session::{
    Button, Session, SessionConfig, SessionError, SessionEvent, SessionState, StateIoKind,
};
use emu_testcard::{Cartridge, TestcardSystem};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn session_in(name: &str) -> (Session<TestcardSystem>, PathBuf) {
    let dir = std::env::temp_dir().join(format!("emu_session_it_{}", name));
    let _ = fs::remove_dir_all(&dir);
    let config = SessionConfig {
        base_dir: Some(dir.clone()),
        ..Default::default()
    };
    let session = Session::new(TestcardSystem::new(), config).expect("session");
    session.init().expect("init");
    (session, dir)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn count_video(session: &Session<TestcardSystem>) -> Arc<AtomicUsize> {
    let frames = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&frames);
    session.register_video_sink(move |_frame| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    frames
}

#[test]
fn test_pump_delivers_frames_at_region_rate() {
    LogConfig::global().set_level(LogCategory::Session, LogLevel::Info);
    let (session, dir) = session_in("pump");
    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 1), "ntsc.tcrd")
        .unwrap();
    assert_eq!(session.state(), SessionState::RomLoaded);
    assert!((session.frame_rate() - NTSC_REFRESH_RATE).abs() < 1e-9);
    assert_eq!((session.frame_width(), session.frame_height()), (256, 224));

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        session.register_video_sink(move |frame| {
            seen.lock().unwrap().push((frame.width, frame.height, frame.refresh_rate));
        });
    }
    let audio = Arc::new(AtomicUsize::new(0));
    {
        let audio = Arc::clone(&audio);
        session.register_audio_sink(move |chunk| {
            assert_eq!(chunk.samples.len(), chunk.sample_count * 2);
            audio.fetch_add(1, Ordering::SeqCst);
        });
    }

    session.start().unwrap();
    assert!(session.is_running());
    assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() >= 5));
    assert!(wait_until(Duration::from_secs(2), || audio.load(Ordering::SeqCst) > 0));

    session.stop();
    assert!(!session.is_running());
    for (w, h, rate) in seen.lock().unwrap().iter() {
        assert_eq!((*w, *h), (256, 224));
        assert!((rate - NTSC_REFRESH_RATE).abs() < 1e-9);
    }

    session.deinit();
    assert_eq!(session.state(), SessionState::Deinitialized);
    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_pump_cadence_tracks_frame_interval() {
    let (session, dir) = session_in("cadence");
    session
        .load_rom_bytes(&Cartridge::image(Region::Pal, 0), "cadence.tcrd")
        .unwrap();
    let _frames = count_video(&session);
    let interval = session.geometry().frame_interval();

    let started = Instant::now();
    session.start().unwrap();
    thread::sleep(Duration::from_millis(500));
    session.stop();
    let elapsed = started.elapsed();

    // every step queues one frame, the first one immediately
    let produced = session.video_stats().queued;
    let intervals = (elapsed.as_secs_f64() / interval.as_secs_f64()).floor() as u64;
    assert!(
        produced <= intervals + 1,
        "{} frames in {} intervals: pump ran ahead of {:?}",
        produced,
        intervals,
        interval
    );
    // slack for sleep overshoot on a busy machine
    assert!(
        produced + 1 >= intervals * 9 / 10,
        "{} frames in {} intervals: pump fell behind",
        produced,
        intervals
    );

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_pal_rom_reports_pal_rate() {
    let (session, dir) = session_in("pal");
    session
        .load_rom_bytes(&Cartridge::image(Region::Pal, 0), "pal.tcrd")
        .unwrap();
    assert!((session.frame_rate() - PAL_REFRESH_RATE).abs() < 1e-9);
    assert_eq!(session.geometry().region, Region::Pal);
    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_pause_halts_delivery_and_resume_continues() {
    let (session, dir) = session_in("pause");
    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 0), "pause.tcrd")
        .unwrap();
    let frames = count_video(&session);

    session.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || frames.load(Ordering::SeqCst) >= 2));

    session.set_paused(true);
    assert!(session.is_paused());
    // let anything already queued drain
    thread::sleep(Duration::from_millis(100));
    let paused_at = frames.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(frames.load(Ordering::SeqCst), paused_at);

    session.set_paused(false);
    assert!(wait_until(Duration::from_secs(2), || {
        frames.load(Ordering::SeqCst) > paused_at
    }));

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_start_twice_and_stop_without_start() {
    let (session, dir) = session_in("start_twice");
    session.stop();
    assert!(!session.is_running());

    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 0), "twice.tcrd")
        .unwrap();
    session.start().unwrap();
    session.start().unwrap();
    assert!(session.is_running());
    session.stop();
    assert!(!session.is_running());
    session.stop();

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_slot_round_trip_restores_frame_counter() {
    let (session, dir) = session_in("slots");
    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 4), "slots.tcrd")
        .unwrap();

    for _ in 0..10 {
        assert!(session.run_frame());
    }
    session.save_state(2).unwrap();
    assert!(dir.join("snapshots").join("slots.2.frz").exists());

    let pixels = Arc::new(Mutex::new(Vec::new()));
    {
        let pixels = Arc::clone(&pixels);
        session.register_video_sink(move |frame| {
            pixels.lock().unwrap().push(frame.pixels[0]);
        });
    }
    for _ in 0..5 {
        session.run_frame();
    }
    session.load_state(2).unwrap();
    session.run_frame();

    assert!(wait_until(Duration::from_secs(2), || pixels.lock().unwrap().len() == 6));
    // pixel (0, 0) carries the frame counter in red and the seed in green
    let at = |frame: u16| (frame << 11) | (4 << 5);
    let seen = pixels.lock().unwrap().clone();
    assert_eq!(seen, vec![at(10), at(11), at(12), at(13), at(14), at(10)]);

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_out_of_range_slot_is_rejected_before_io() {
    let (session, dir) = session_in("bad_slot");
    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 0), "bad_slot.tcrd")
        .unwrap();

    for slot in [-1, 10, 99] {
        let err = session.save_state(slot).unwrap_err();
        assert_eq!(err.state_io_kind(), Some(&StateIoKind::SlotOutOfRange(slot)));
        let err = session.load_state(slot).unwrap_err();
        assert_eq!(err.state_io_kind(), Some(&StateIoKind::SlotOutOfRange(slot)));
    }
    assert!(!dir.join("snapshots").exists());

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_invalid_rom_leaves_session_without_rom() {
    let (session, dir) = session_in("invalid_rom");
    let err = session.load_rom_bytes(b"not a rom", "junk.bin").unwrap_err();
    assert!(matches!(err, SessionError::LoadFailure { .. }));
    assert!(!session.is_rom_loaded());
    assert_eq!(session.state(), SessionState::Initialized);
    assert_eq!(
        session.save_state(0).unwrap_err().state_io_kind(),
        Some(&StateIoKind::NoRomLoaded)
    );
    assert!(!session.run_frame());

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_replaced_sink_is_never_called_again() {
    let (session, dir) = session_in("sink_swap");
    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 0), "swap.tcrd")
        .unwrap();

    let retired = Arc::new(AtomicBool::new(false));
    let late_calls = Arc::new(AtomicUsize::new(0));
    {
        let retired = Arc::clone(&retired);
        let late_calls = Arc::clone(&late_calls);
        session.register_video_sink(move |_frame| {
            if retired.load(Ordering::SeqCst) {
                late_calls.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    session.set_turbo(true);
    session.set_turbo_skip_frames(0);
    session.start().unwrap();
    thread::sleep(Duration::from_millis(50));

    let frames = count_video(&session);
    retired.store(true, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(2), || frames.load(Ordering::SeqCst) >= 3));
    session.stop();

    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_save_data_survives_reload() {
    let (session, dir) = session_in("sram");
    let image = Cartridge::image(Region::Ntsc, 0);
    session.load_rom_bytes(&image, "battery.tcrd").unwrap();
    session.deinit();
    assert!(dir.join("sram").join("battery.srm").exists());

    session.init().unwrap();
    session.load_rom_bytes(&image, "battery.tcrd").unwrap();
    session.deinit();

    let bytes = fs::read(dir.join("sram").join("battery.srm")).unwrap();
    assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 2);

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_saturated_save_data_loads_cleanly() {
    let (session, dir) = session_in("sram_full");
    fs::create_dir_all(dir.join("sram")).unwrap();
    fs::write(dir.join("sram").join("full.srm"), [0xFF; 8]).unwrap();

    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 0), "full.tcrd")
        .unwrap();
    assert_eq!(session.state(), SessionState::RomLoaded);
    assert!(!session.is_halted());
    assert!(session.run_frame());

    session.deinit();
    let bytes = fs::read(dir.join("sram").join("full.srm")).unwrap();
    assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), u64::MAX);

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_named_buttons_reach_the_engine() {
    let (session, dir) = session_in("named_buttons");
    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 0), "buttons.tcrd")
        .unwrap();
    let rgb = Arc::new(Mutex::new(Vec::new()));
    {
        let rgb = Arc::clone(&rgb);
        session.register_video_sink(move |frame| {
            rgb.lock().unwrap().push(frame.to_rgb24());
        });
    }

    session.run_frame();
    session.set_pressed(0, &[Button::R, Button::Start]);
    session.run_frame();

    assert!(wait_until(Duration::from_secs(2), || rgb.lock().unwrap().len() == 2));
    let frames = rgb.lock().unwrap().clone();
    for frame in &frames {
        assert_eq!(frame.len(), 256 * 224 * 3);
    }
    // the test card tints blue with the low five button bits; R is 0x10
    assert_eq!(frames[0][2], 0);
    assert_eq!(frames[1][2], 0x10 << 3);

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_lifecycle_events_follow_the_session() {
    let (session, dir) = session_in("events");
    let events = session.subscribe();
    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 0), "events.tcrd")
        .unwrap();
    session.start().unwrap();
    session.set_paused(true);
    session.deinit();

    let seen: Vec<SessionEvent> = events.try_iter().collect();
    assert_eq!(
        seen,
        vec![
            SessionEvent::RomLoaded {
                name: "events.tcrd".to_string()
            },
            SessionEvent::EmulationStarted,
            SessionEvent::Paused(true),
            SessionEvent::EmulationStopped,
        ]
    );

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_deinit_from_running_session_returns() {
    let (session, dir) = session_in("deinit_running");
    session
        .load_rom_bytes(&Cartridge::image(Region::Ntsc, 0), "running.tcrd")
        .unwrap();
    let frames = count_video(&session);
    session.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || frames.load(Ordering::SeqCst) > 0));

    session.deinit();
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Deinitialized);
    session.start().unwrap();
    assert!(!session.is_running());

    drop(session);
    let _ = fs::remove_dir_all(&dir);
}
