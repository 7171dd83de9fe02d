//! Session configuration and on-disk directory layout.

use crate::error::SessionError;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::types::EngineSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Tunables for a session, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root for `sram/` and `snapshots/`. `None` means `$HOME/.hemu`.
    pub base_dir: Option<PathBuf>,
    pub turbo_mode: bool,
    /// Frames skipped between rendered frames in turbo mode.
    pub turbo_skip_frames: u32,
    /// `None` queues frames without bound.
    pub video_queue_depth: Option<usize>,
    pub audio_queue_depth: Option<usize>,
    /// Consecutive failed steps before the session halts; 0 never halts.
    pub max_consecutive_step_failures: u32,
    pub sample_rate: u32,
    pub input_rate: u32,
    pub start_paused: bool,
    /// State file restored right after every ROM load, relative to the base dir.
    pub quicksave: Option<PathBuf>,
    /// Start the frame pump as soon as a ROM has loaded.
    pub start_on_load: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            base_dir: None,
            turbo_mode: false,
            turbo_skip_frames: 9,
            video_queue_depth: None,
            audio_queue_depth: None,
            max_consecutive_step_failures: 3,
            sample_rate: engine.sample_rate,
            input_rate: engine.input_rate,
            start_paused: false,
            quicksave: None,
            start_on_load: false,
        }
    }
}

impl SessionConfig {
    /// Load from `path`, falling back to defaults when the file is missing or invalid.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => config,
            Err(e) => {
                if path.exists() {
                    log(LogCategory::Session, LogLevel::Warn, || {
                        format!("{}. Using defaults.", e)
                    });
                }
                Self::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> Result<Self, SessionError> {
        let contents = fs::read_to_string(path).map_err(|e| SessionError::Config {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        serde_json::from_str(&contents).map_err(|e| SessionError::Config {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let to_config_error = |source: crate::error::BoxError| SessionError::Config {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| to_config_error(e.into()))?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(|e| to_config_error(e.into()))?;
        fs::write(path, contents).map_err(|e| to_config_error(e.into()))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            sample_rate: self.sample_rate,
            input_rate: self.input_rate,
            ..EngineSettings::default()
        }
    }

    pub fn layout(&self) -> DirectoryLayout {
        match &self.base_dir {
            Some(dir) => DirectoryLayout::new(dir.clone()),
            None => DirectoryLayout::new(DirectoryLayout::default_base()),
        }
    }
}

/// Where durable save data and snapshots live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLayout {
    base: PathBuf,
}

impl DirectoryLayout {
    pub const SRAM_EXTENSION: &'static str = "srm";

    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// `$HOME/.hemu`, or `./.hemu` when no home directory is known.
    pub fn default_base() -> PathBuf {
        std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hemu")
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn sram_dir(&self) -> PathBuf {
        self.base.join("sram")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.base.join("snapshots")
    }

    pub fn sram_path(&self, rom_stem: &str) -> PathBuf {
        self.sram_dir()
            .join(format!("{}.{}", rom_stem, Self::SRAM_EXTENSION))
    }
}
