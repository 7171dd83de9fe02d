//! Host that drives its own timing with `run_frame` instead of the pump.
//!
//! Usage: `headless [ntsc|pal] [frames]`. Writes a test-card ROM into the
//! temp directory, steps it and prints where save data ended up.

use emu_core::types::Region;
use emu_session::{Session, SessionConfig};
use emu_testcard::{Cartridge, TestcardSystem};
use std::env;
use std::sync::mpsc::channel;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let region = match args.get(1).map(|s| s.as_str()).unwrap_or("ntsc") {
        "pal" => Region::Pal,
        _ => Region::Ntsc,
    };
    let frames: u32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(60);

    let base = env::temp_dir().join("hemu-headless");
    let rom = base.join("demo.tcrd");
    std::fs::create_dir_all(&base)?;
    std::fs::write(&rom, Cartridge::image(region, 0x2A))?;

    let config = SessionConfig {
        base_dir: Some(base.clone()),
        ..Default::default()
    };
    let session = Session::new(TestcardSystem::new(), config)?;
    session.init()?;
    session.load_rom_file(&rom)?;

    let (tx, rx) = channel();
    session.register_video_sink(move |frame| {
        let _ = tx.send(frame.pixels[0]);
    });

    for _ in 0..frames {
        session.run_frame();
    }
    // delivery is asynchronous; wait for the first few before retiring the sink
    let first_pixels: Vec<u16> = rx.iter().take(frames.min(4) as usize).collect();
    session.clear_video_sink();
    println!(
        "{} frames at {:.3} Hz, first pixels {:04X?}",
        frames,
        session.frame_rate(),
        first_pixels
    );

    session.deinit();
    println!(
        "save data in {}",
        session.layout().sram_path("demo").display()
    );
    Ok(())
}
