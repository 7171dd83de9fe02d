//! Core engine contract shared by the session host and the emulated systems.

pub mod logging;

pub mod types {
    use serde::{Deserialize, Serialize};
    use std::path::Path;
    use std::time::Duration;

    /// NTSC refresh rate in Hz.
    pub const NTSC_REFRESH_RATE: f64 = 60.09881389744051;
    /// PAL refresh rate in Hz.
    pub const PAL_REFRESH_RATE: f64 = 50.006977968;

    /// Video timing mode of the loaded ROM.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum Region {
        #[default]
        Ntsc,
        Pal,
    }

    impl Region {
        pub fn refresh_rate(self) -> f64 {
            match self {
                Region::Ntsc => NTSC_REFRESH_RATE,
                Region::Pal => PAL_REFRESH_RATE,
            }
        }
    }

    /// Output geometry reported by an engine.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Geometry {
        pub width: u32,
        pub height: u32,
        /// Row stride in bytes.
        pub stride: u32,
        pub region: Region,
    }

    impl Geometry {
        pub fn new(width: u32, height: u32, stride: u32, region: Region) -> Self {
            Self {
                width,
                height,
                stride,
                region,
            }
        }

        pub fn refresh_rate(&self) -> f64 {
            self.region.refresh_rate()
        }

        /// Wall-clock duration of one displayed frame.
        pub fn frame_interval(&self) -> Duration {
            Duration::from_secs_f64(1.0 / self.refresh_rate())
        }
    }

    impl Default for Geometry {
        fn default() -> Self {
            // 256x224 RGB565, the common 16-bit console layout
            Self::new(256, 224, 256 * 2, Region::Ntsc)
        }
    }

    /// A frame borrowed from engine memory for the duration of one output call.
    #[derive(Debug, Clone, Copy)]
    pub struct VideoFrameRef<'a> {
        pub pixels: &'a [u16],
        pub width: u32,
        pub height: u32,
        pub stride: u32,
        pub refresh_rate: f64,
    }

    /// An owned copy of a produced frame, safe to move across threads.
    #[derive(Debug, Clone, PartialEq)]
    pub struct VideoFrame {
        pub pixels: Vec<u16>,
        pub width: u32,
        pub height: u32,
        pub stride: u32,
        pub refresh_rate: f64,
    }

    impl VideoFrame {
        /// Copy `height * stride` bytes worth of pixels out of a borrowed frame.
        pub fn copy_from(frame: &VideoFrameRef<'_>) -> Self {
            let len = frame.height as usize * frame.stride as usize / std::mem::size_of::<u16>();
            let len = len.min(frame.pixels.len());
            Self {
                pixels: frame.pixels[..len].to_vec(),
                width: frame.width,
                height: frame.height,
                stride: frame.stride,
                refresh_rate: frame.refresh_rate,
            }
        }

        /// Visible pixels as packed 8-bit RGB, row stride dropped.
        ///
        /// Rows missing from a short buffer come out black.
        pub fn to_rgb24(&self) -> Vec<u8> {
            let (width, height) = (self.width as usize, self.height as usize);
            let row_pixels = self.stride as usize / std::mem::size_of::<u16>();
            let mut out = vec![0u8; width * height * 3];
            if out.is_empty() {
                return out;
            }
            for (y, row) in out.chunks_exact_mut(width * 3).enumerate().take(height) {
                let start = y * row_pixels;
                let Some(src) = self.pixels.get(start..start + width) else {
                    break;
                };
                for (dst, &pixel) in row.chunks_exact_mut(3).zip(src) {
                    dst.copy_from_slice(&rgb565_to_rgb24(pixel));
                }
            }
            out
        }
    }

    /// Expand one RGB565 pixel to 8 bits per channel by shifting left.
    pub fn rgb565_to_rgb24(pixel: u16) -> [u8; 3] {
        let r = ((pixel >> 11) & 0x1F) as u8;
        let g = ((pixel >> 5) & 0x3F) as u8;
        let b = (pixel & 0x1F) as u8;
        [r << 3, g << 2, b << 3]
    }

    /// Owned interleaved stereo samples; `sample_count` counts left/right pairs.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct AudioChunk {
        pub samples: Vec<i16>,
        pub sample_count: usize,
    }

    impl AudioChunk {
        pub fn copy_from(samples: &[i16], sample_count: usize) -> Self {
            let len = (sample_count * 2).min(samples.len());
            Self {
                samples: samples[..len].to_vec(),
                sample_count,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PointerState {
        pub x: i16,
        pub y: i16,
        pub left: bool,
        pub right: bool,
    }

    /// Input presented to one controller port before a step.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PortState {
        pub buttons: u16,
        pub pointer: Option<PointerState>,
    }

    /// Where a ROM image comes from.
    #[derive(Debug, Clone, Copy)]
    pub enum RomSource<'a> {
        File(&'a Path),
        Memory { data: &'a [u8], name: &'a str },
    }

    /// Per-step switches decided by the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StepOptions {
        /// When false the engine advances state without producing a frame.
        pub render: bool,
    }

    impl Default for StepOptions {
        fn default() -> Self {
            Self { render: true }
        }
    }

    /// Defaults handed to the engine at initialisation.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EngineSettings {
        pub sample_rate: u32,
        pub input_rate: u32,
        pub stereo: bool,
    }

    impl Default for EngineSettings {
        fn default() -> Self {
            Self {
                sample_rate: 48000,
                input_rate: 32040,
                stereo: true,
            }
        }
    }
}

use logging::LogLevel;
use std::path::Path;
use types::{EngineSettings, Geometry, PortState, RomSource, StepOptions, VideoFrameRef};

/// Receiver for everything an engine produces during a step.
///
/// Buffers passed in are only valid for the duration of the call.
pub trait FrameOutput {
    fn video(&mut self, frame: VideoFrameRef<'_>);

    /// `samples` holds at least `sample_count * 2` interleaved stereo samples.
    fn audio(&mut self, samples: &[i16], sample_count: usize);

    /// Informational, warning or error text from the engine.
    fn message(&mut self, _level: LogLevel, _text: &str) {}
}

/// A simulation engine that the session host can drive one frame at a time.
pub trait Engine: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Allocate subsystems and apply defaults.
    fn init(&mut self, settings: &EngineSettings) -> Result<(), Self::Error>;

    /// Release everything allocated by `init`.
    fn deinit(&mut self);

    fn load_rom(&mut self, rom: RomSource<'_>) -> Result<(), Self::Error>;

    fn is_rom_loaded(&self) -> bool;

    /// Advance exactly one frame, reporting any new frame or samples to `output`.
    fn step(&mut self, options: StepOptions, output: &mut dyn FrameOutput)
        -> Result<(), Self::Error>;

    /// Power-cycle reset
    fn reset(&mut self);

    /// Reset button
    fn soft_reset(&mut self);

    fn serialize_state(&mut self, path: &Path) -> Result<(), Self::Error>;

    fn deserialize_state(&mut self, path: &Path) -> Result<(), Self::Error>;

    fn geometry(&self) -> Geometry;

    fn set_control_port(&mut self, port: usize, state: &PortState);

    /// Write battery-backed memory for the loaded ROM.
    fn persist_durable_save_data(&mut self, path: &Path) -> Result<(), Self::Error>;

    /// Restore battery-backed memory for the loaded ROM.
    fn load_durable_save_data(&mut self, _path: &Path) -> Result<(), Self::Error> {
        Ok(())
    }
}
