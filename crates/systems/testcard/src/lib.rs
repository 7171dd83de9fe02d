//! Test-card engine: a deterministic stand-in for a real console core.
//!
//! Every frame is a 256x224 RGB565 gradient that scrolls with the frame
//! counter, tinted by the ROM seed and the port 0 buttons. Audio is a square
//! wave at the configured input rate. Battery-backed memory is an 8-byte
//! little-endian play counter.

mod cartridge;

pub use cartridge::Cartridge;

use emu_core::logging::LogLevel;
use emu_core::types::{
    EngineSettings, Geometry, PointerState, PortState, Region, RomSource, StepOptions,
    VideoFrameRef,
};
use emu_core::{Engine, FrameOutput};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const WIDTH: u32 = 256;
pub const HEIGHT: u32 = 224;
/// Row stride in bytes.
pub const STRIDE: u32 = WIDTH * 2;

const SQUARE_AMPLITUDE: i16 = 0x1000;
const SQUARE_PERIOD: u32 = 64;

#[derive(thiserror::Error, Debug)]
pub enum TestcardError {
    #[error("engine not initialized")]
    NotInitialized,
    #[error("no ROM loaded")]
    NoRom,
    #[error("invalid ROM: {0}")]
    InvalidRom(&'static str),
    #[error("state belongs to `{0}`, not testcard")]
    IncompatibleState(String),
    #[error("save data must be 8 bytes, found {0}")]
    InvalidSave(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    State(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    system: String,
    version: u32,
    frame: u64,
    seed: u8,
    buttons: u16,
}

#[derive(Debug, Default)]
pub struct TestcardSystem {
    settings: Option<EngineSettings>,
    cart: Option<Cartridge>,
    frame: u64,
    buttons: u16,
    pointer: Option<PointerState>,
    play_count: u64,
    phase: u32,
    pixels: Vec<u16>,
    audio: Vec<i16>,
}

impl TestcardSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames stepped since the last load or reset.
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    /// How many times the loaded ROM has been started, from its save data.
    pub fn play_count(&self) -> u64 {
        self.play_count
    }

    fn samples_per_frame(&self, region: Region) -> usize {
        let rate = self
            .settings
            .as_ref()
            .map(|s| s.input_rate)
            .unwrap_or_default();
        (rate as f64 / region.refresh_rate()).round() as usize
    }

    fn render(&mut self, seed: u8) {
        let frame = self.frame as u32;
        let blue = self.buttons as u32 & 0x1F;
        let row_len = (STRIDE / 2) as usize;
        for y in 0..HEIGHT {
            let green = (y + seed as u32) & 0x3F;
            let row = &mut self.pixels[y as usize * row_len..][..row_len];
            for (x, px) in row.iter_mut().enumerate().take(WIDTH as usize) {
                let red = (x as u32 + frame) & 0x1F;
                *px = ((red << 11) | (green << 5) | blue) as u16;
            }
        }
        // crosshair dot for an active pointer
        if let Some(p) = self.pointer {
            let (x, y) = (p.x.max(0) as usize, p.y.max(0) as usize);
            if x < WIDTH as usize && y < HEIGHT as usize {
                self.pixels[y * row_len + x] = 0xFFFF;
            }
        }
    }

    fn fill_audio(&mut self, count: usize) {
        self.audio.clear();
        for _ in 0..count {
            let high = (self.phase / (SQUARE_PERIOD / 2)) % 2 == 0;
            let sample = if high {
                SQUARE_AMPLITUDE
            } else {
                -SQUARE_AMPLITUDE
            };
            self.audio.push(sample);
            self.audio.push(sample);
            self.phase = (self.phase + 1) % SQUARE_PERIOD;
        }
    }
}

impl Engine for TestcardSystem {
    type Error = TestcardError;

    fn init(&mut self, settings: &EngineSettings) -> Result<(), Self::Error> {
        self.settings = Some(settings.clone());
        self.pixels = vec![0; (HEIGHT * STRIDE / 2) as usize];
        self.audio = Vec::new();
        Ok(())
    }

    fn deinit(&mut self) {
        self.settings = None;
        self.cart = None;
        self.pixels = Vec::new();
        self.audio = Vec::new();
    }

    fn load_rom(&mut self, rom: RomSource<'_>) -> Result<(), Self::Error> {
        if self.settings.is_none() {
            return Err(TestcardError::NotInitialized);
        }
        self.cart = None;
        let cart = match rom {
            RomSource::File(path) => Cartridge::from_file(path)?,
            RomSource::Memory { data, .. } => Cartridge::from_bytes(data)?,
        };
        self.cart = Some(cart);
        self.frame = 0;
        self.phase = 0;
        self.buttons = 0;
        self.pointer = None;
        self.play_count = 1;
        Ok(())
    }

    fn is_rom_loaded(&self) -> bool {
        self.cart.is_some()
    }

    fn step(&mut self, options: StepOptions, output: &mut dyn FrameOutput) -> Result<(), Self::Error> {
        if self.settings.is_none() {
            return Err(TestcardError::NotInitialized);
        }
        let (seed, region) = match &self.cart {
            Some(cart) => (cart.seed, cart.region),
            None => return Err(TestcardError::NoRom),
        };

        if options.render {
            self.render(seed);
            output.video(VideoFrameRef {
                pixels: &self.pixels,
                width: WIDTH,
                height: HEIGHT,
                stride: STRIDE,
                refresh_rate: region.refresh_rate(),
            });
        }

        let count = self.samples_per_frame(region);
        self.fill_audio(count);
        output.audio(&self.audio, count);

        self.frame += 1;
        if self.frame == 1 {
            output.message(LogLevel::Debug, "testcard: first frame");
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.frame = 0;
        self.phase = 0;
        self.buttons = 0;
        self.pointer = None;
    }

    fn soft_reset(&mut self) {
        self.frame = 0;
    }

    fn serialize_state(&mut self, path: &Path) -> Result<(), Self::Error> {
        let cart = self.cart.as_ref().ok_or(TestcardError::NoRom)?;
        let state = SavedState {
            system: "testcard".to_string(),
            version: 1,
            frame: self.frame,
            seed: cart.seed,
            buttons: self.buttons,
        };
        let s = serde_json::to_string_pretty(&state)?;
        std::fs::write(path, s)?;
        Ok(())
    }

    fn deserialize_state(&mut self, path: &Path) -> Result<(), Self::Error> {
        let cart = self.cart.as_mut().ok_or(TestcardError::NoRom)?;
        let s = std::fs::read_to_string(path)?;
        let state: SavedState = serde_json::from_str(&s)?;
        if state.system != "testcard" {
            return Err(TestcardError::IncompatibleState(state.system));
        }
        cart.seed = state.seed;
        self.frame = state.frame;
        self.buttons = state.buttons;
        Ok(())
    }

    fn geometry(&self) -> Geometry {
        let region = self.cart.as_ref().map(|c| c.region).unwrap_or_default();
        Geometry::new(WIDTH, HEIGHT, STRIDE, region)
    }

    fn set_control_port(&mut self, port: usize, state: &PortState) {
        if port == 0 {
            self.buttons = state.buttons;
            self.pointer = state.pointer;
        }
    }

    fn persist_durable_save_data(&mut self, path: &Path) -> Result<(), Self::Error> {
        if self.cart.is_none() {
            return Err(TestcardError::NoRom);
        }
        std::fs::write(path, self.play_count.to_le_bytes())?;
        Ok(())
    }

    fn load_durable_save_data(&mut self, path: &Path) -> Result<(), Self::Error> {
        let data = std::fs::read(path)?;
        let bytes: [u8; 8] = data
            .as_slice()
            .try_into()
            .map_err(|_| TestcardError::InvalidSave(data.len()))?;
        self.play_count = u64::from_le_bytes(bytes).saturating_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::types::{AudioChunk, VideoFrame};

    #[derive(Default)]
    struct Capture {
        frames: Vec<VideoFrame>,
        audio: Vec<AudioChunk>,
        messages: Vec<String>,
    }

    impl FrameOutput for Capture {
        fn video(&mut self, frame: VideoFrameRef<'_>) {
            self.frames.push(VideoFrame::copy_from(&frame));
        }

        fn audio(&mut self, samples: &[i16], sample_count: usize) {
            self.audio.push(AudioChunk::copy_from(samples, sample_count));
        }

        fn message(&mut self, _level: LogLevel, text: &str) {
            self.messages.push(text.to_string());
        }
    }

    fn loaded(region: Region, seed: u8) -> TestcardSystem {
        let mut sys = TestcardSystem::new();
        sys.init(&EngineSettings::default()).unwrap();
        let image = Cartridge::image(region, seed);
        sys.load_rom(RomSource::Memory {
            data: &image,
            name: "test",
        })
        .unwrap();
        sys
    }

    #[test]
    fn test_step_requires_init_and_rom() {
        let mut sys = TestcardSystem::new();
        let mut out = Capture::default();
        assert!(matches!(
            sys.step(StepOptions::default(), &mut out),
            Err(TestcardError::NotInitialized)
        ));
        sys.init(&EngineSettings::default()).unwrap();
        assert!(matches!(
            sys.step(StepOptions::default(), &mut out),
            Err(TestcardError::NoRom)
        ));
    }

    #[test]
    fn test_frame_pattern() {
        let mut sys = loaded(Region::Ntsc, 3);
        sys.set_control_port(
            0,
            &PortState {
                buttons: 0x0005,
                pointer: None,
            },
        );
        let mut out = Capture::default();
        sys.step(StepOptions::default(), &mut out).unwrap();
        sys.step(StepOptions::default(), &mut out).unwrap();

        let first = &out.frames[0];
        assert_eq!((first.width, first.height, first.stride), (256, 224, 512));
        assert_eq!(first.pixels.len(), 256 * 224);
        // pixel (0, 0) on frame 0: red 0, green seed, blue buttons
        assert_eq!(first.pixels[0], (3 << 5) | 5);
        // the gradient scrolls one step per frame
        assert_eq!(out.frames[1].pixels[0], (1 << 11) | (3 << 5) | 5);
        assert_eq!(out.messages, vec!["testcard: first frame".to_string()]);
    }

    #[test]
    fn test_no_render_still_advances() {
        let mut sys = loaded(Region::Ntsc, 0);
        let mut out = Capture::default();
        sys.step(StepOptions { render: false }, &mut out).unwrap();
        assert!(out.frames.is_empty());
        assert_eq!(out.audio.len(), 1);
        assert_eq!(sys.frame_count(), 1);
    }

    #[test]
    fn test_audio_per_region() {
        let mut out = Capture::default();
        loaded(Region::Ntsc, 0)
            .step(StepOptions::default(), &mut out)
            .unwrap();
        loaded(Region::Pal, 0)
            .step(StepOptions::default(), &mut out)
            .unwrap();
        assert_eq!(out.audio[0].sample_count, 533);
        assert_eq!(out.audio[1].sample_count, 641);
        assert_eq!(out.audio[0].samples.len(), 533 * 2);
    }

    #[test]
    fn test_pointer_marks_frame() {
        let mut sys = loaded(Region::Ntsc, 0);
        sys.set_control_port(
            0,
            &PortState {
                buttons: 0,
                pointer: Some(PointerState {
                    x: 10,
                    y: 2,
                    left: true,
                    right: false,
                }),
            },
        );
        let mut out = Capture::default();
        sys.step(StepOptions::default(), &mut out).unwrap();
        assert_eq!(out.frames[0].pixels[2 * 256 + 10], 0xFFFF);
    }

    #[test]
    fn test_state_save_and_restore() {
        let dir = std::env::temp_dir().join("emu_testcard_state");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("slot.frz");

        let mut sys = loaded(Region::Ntsc, 9);
        let mut out = Capture::default();
        for _ in 0..5 {
            sys.step(StepOptions::default(), &mut out).unwrap();
        }
        sys.serialize_state(&path).unwrap();
        for _ in 0..5 {
            sys.step(StepOptions::default(), &mut out).unwrap();
        }
        sys.deserialize_state(&path).unwrap();
        assert_eq!(sys.frame_count(), 5);

        std::fs::write(&path, r#"{"system":"nes","version":1,"frame":0,"seed":0,"buttons":0}"#)
            .unwrap();
        assert!(matches!(
            sys.deserialize_state(&path),
            Err(TestcardError::IncompatibleState(ref s)) if s == "nes"
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_play_counter_save_data() {
        let dir = std::env::temp_dir().join("emu_testcard_sram");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("game.srm");

        let mut sys = loaded(Region::Ntsc, 0);
        assert_eq!(sys.play_count(), 1);
        sys.persist_durable_save_data(&path).unwrap();

        let mut again = loaded(Region::Ntsc, 0);
        again.load_durable_save_data(&path).unwrap();
        assert_eq!(again.play_count(), 2);

        std::fs::write(&path, [1, 2, 3]).unwrap();
        assert!(matches!(
            again.load_durable_save_data(&path),
            Err(TestcardError::InvalidSave(3))
        ));

        // a counter at its ceiling stays there
        std::fs::write(&path, [0xFF; 8]).unwrap();
        again.load_durable_save_data(&path).unwrap();
        assert_eq!(again.play_count(), u64::MAX);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_failed_load_unloads_previous_rom() {
        let mut sys = loaded(Region::Pal, 0);
        assert!(sys.load_rom(RomSource::Memory { data: b"junk", name: "junk" }).is_err());
        assert!(!sys.is_rom_loaded());
        assert_eq!(sys.geometry().region, Region::Ntsc);
    }
}
