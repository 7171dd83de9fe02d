//! Threaded session host for an emulator engine.
//!
//! A [`Session`] owns one [`emu_core::Engine`] and adds what a frontend needs
//! around it:
//!
//! - a lifecycle (`init`, ROM loading, `deinit`) guarded by one lock
//! - an optional background thread stepping at the region's refresh rate,
//!   with turbo frame skipping
//! - copy-out delivery of video frames and audio chunks to registered sinks
//! - numbered save-state slots and durable save data on disk
//! - lock-free controller input from any thread
//! - lifecycle events for observers
//!
//! ```no_run
//! use emu_session::{Session, SessionConfig};
//! # fn demo<E: emu_core::Engine>(engine: E) -> Result<(), emu_session::SessionError> {
//! let session = Session::new(engine, SessionConfig::default())?;
//! session.init()?;
//! session.load_rom_file("game.sfc")?;
//! session.register_video_sink(|frame| println!("{}x{}", frame.width, frame.height));
//! session.start()?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod input;
mod pump;
pub mod session;
pub mod snapshot;

pub use bridge::{CallbackBridge, DeliveryStats};
pub use config::{DirectoryLayout, SessionConfig};
pub use error::{SessionError, StateIoKind};
pub use events::SessionEvent;
pub use input::{button_mask, Button, ControlInputs, ParseButtonError, BUTTON_PORTS, POINTER_PORTS};
pub use session::{Session, SessionState};
pub use snapshot::Slot;
