//! Numbered save-state slots and explicit state files.

use crate::error::{SessionError, StateIoKind};
use crate::session::{Core, Session, SessionState};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::Engine;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of slot files.
pub const SNAPSHOT_EXTENSION: &str = "frz";

/// A validated save-state slot, 0 through 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(u8);

impl Slot {
    pub const COUNT: u8 = 10;

    pub fn new(index: i32) -> Result<Self, SessionError> {
        u8::try_from(index)
            .ok()
            .filter(|i| *i < Self::COUNT)
            .map(Slot)
            .ok_or_else(|| SessionError::state_io(StateIoKind::SlotOutOfRange(index)))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// `<rom stem>.<digit>.frz`
    pub fn file_name(self, rom_stem: &str) -> String {
        format!("{}.{}.{}", rom_stem, self.0, SNAPSHOT_EXTENSION)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn require_rom<E: Engine>(core: &Core<E>) -> Result<&str, SessionError> {
    match (&core.rom, core.state) {
        (Some(rom), SessionState::RomLoaded) => Ok(rom.stem.as_str()),
        _ => Err(SessionError::state_io(StateIoKind::NoRomLoaded)),
    }
}

fn write_state<E: Engine>(core: &mut Core<E>, path: &Path) -> Result<(), SessionError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            SessionError::state_io_with(StateIoKind::Filesystem(parent.to_path_buf()), e)
        })?;
    }
    core.engine
        .serialize_state(path)
        .map_err(|e| SessionError::state_io_with(StateIoKind::Serialize(path.to_path_buf()), e))
}

fn read_state<E: Engine>(core: &mut Core<E>, path: &Path) -> Result<(), SessionError> {
    core.engine
        .deserialize_state(path)
        .map_err(|e| SessionError::state_io_with(StateIoKind::Deserialize(path.to_path_buf()), e))
}

impl<E: Engine> Session<E> {
    /// Path of `slot` for the loaded ROM.
    pub fn slot_path(&self, slot: i32) -> Result<PathBuf, SessionError> {
        let slot = Slot::new(slot)?;
        let core = self.shared.lock_core();
        let stem = require_rom(&core)?;
        Ok(self.shared.layout.snapshot_dir().join(slot.file_name(stem)))
    }

    /// Write the current state to numbered slot `slot`.
    pub fn save_state(&self, slot: i32) -> Result<(), SessionError> {
        let slot = Slot::new(slot)?;
        let mut core = self.shared.lock_core();
        let path = self
            .shared
            .layout
            .snapshot_dir()
            .join(slot.file_name(require_rom(&core)?));
        write_state(&mut core, &path)?;
        log(LogCategory::Snapshot, LogLevel::Info, || {
            format!("saved slot {} to {}", slot, path.display())
        });
        Ok(())
    }

    /// Restore the state stored in numbered slot `slot`.
    pub fn load_state(&self, slot: i32) -> Result<(), SessionError> {
        let slot = Slot::new(slot)?;
        let mut core = self.shared.lock_core();
        let path = self
            .shared
            .layout
            .snapshot_dir()
            .join(slot.file_name(require_rom(&core)?));
        read_state(&mut core, &path)?;
        self.shared.recovered(&mut core);
        log(LogCategory::Snapshot, LogLevel::Info, || {
            format!("loaded slot {} from {}", slot, path.display())
        });
        Ok(())
    }

    /// Write the current state to an arbitrary file.
    pub fn save_state_to_file(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        let mut core = self.shared.lock_core();
        require_rom(&core)?;
        write_state(&mut core, path)?;
        log(LogCategory::Snapshot, LogLevel::Info, || {
            format!("saved state to {}", path.display())
        });
        Ok(())
    }

    /// Restore state from an arbitrary file.
    pub fn load_state_from_file(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        let mut core = self.shared.lock_core();
        require_rom(&core)?;
        read_state(&mut core, path)?;
        self.shared.recovered(&mut core);
        log(LogCategory::Snapshot, LogLevel::Info, || {
            format!("loaded state from {}", path.display())
        });
        Ok(())
    }
}
