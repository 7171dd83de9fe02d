//! The session: one engine instance plus the lifecycle around it.

use crate::bridge::{CallbackBridge, DeliveryStats};
use crate::config::{DirectoryLayout, SessionConfig};
use crate::error::{BoxError, SessionError};
use crate::events::{EventHub, SessionEvent};
use crate::input::{button_mask, Button, ControlInputs};
use crate::pump::{FramePump, FrameSkipper, FrameSource};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::types::{AudioChunk, Geometry, RomSource, StepOptions, VideoFrame};
use emu_core::Engine;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Initialized = 1,
    RomLoaded = 2,
    Deinitialized = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Initialized,
            2 => SessionState::RomLoaded,
            3 => SessionState::Deinitialized,
            _ => SessionState::Uninitialized,
        }
    }

    /// States from which a ROM may be loaded or the pump started.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Initialized | SessionState::RomLoaded)
    }
}

/// Name of the loaded ROM and the stem used for its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RomIdentity {
    pub(crate) name: String,
    pub(crate) stem: String,
}

impl RomIdentity {
    fn from_path(path: &Path) -> Self {
        let name = path.display().to_string();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "rom".to_string());
        Self { name, stem }
    }

    /// In-memory images are named by the caller, or by content hash if unnamed.
    fn from_memory(data: &[u8], name: &str) -> Self {
        let stem = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty());
        match stem {
            Some(stem) => Self {
                name: name.to_string(),
                stem,
            },
            None => {
                let digest = Sha256::digest(data);
                let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
                let stem = format!("rom-{}", hex);
                Self {
                    name: stem.clone(),
                    stem,
                }
            }
        }
    }
}

/// Everything guarded by the session lock.
pub(crate) struct Core<E: Engine> {
    pub(crate) engine: E,
    pub(crate) state: SessionState,
    pub(crate) rom: Option<RomIdentity>,
    skipper: FrameSkipper,
    failures: u32,
}

/// State reachable from both caller threads and the pump thread.
pub(crate) struct Shared<E: Engine> {
    core: Mutex<Core<E>>,
    state: AtomicU8,
    paused: AtomicBool,
    halted: AtomicBool,
    turbo: AtomicBool,
    turbo_skip_frames: AtomicU32,
    geometry: Mutex<Geometry>,
    pub(crate) inputs: ControlInputs,
    pub(crate) bridge: CallbackBridge,
    pub(crate) layout: DirectoryLayout,
    events: EventHub,
    config: SessionConfig,
}

impl<E: Engine> Shared<E> {
    pub(crate) fn lock_core(&self) -> MutexGuard<'_, Core<E>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, core: &mut Core<E>, state: SessionState) {
        core.state = state;
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn geometry(&self) -> Geometry {
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_geometry(&self, core: &Core<E>) {
        let geometry = core.engine.geometry();
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner) = geometry;
        self.inputs.set_bounds(geometry.width, geometry.height);
    }

    /// Clears the step-failure halt after the engine state was replaced.
    pub(crate) fn recovered(&self, core: &mut Core<E>) {
        core.failures = 0;
        core.skipper.reset();
        self.halted.store(false, Ordering::Release);
    }

    fn may_step(&self) -> bool {
        self.state() == SessionState::RomLoaded
            && !self.paused.load(Ordering::Acquire)
            && !self.halted.load(Ordering::Acquire)
    }

    /// One gated step with the session lock held.
    fn step_locked(&self, core: &mut Core<E>) -> bool {
        if core.state != SessionState::RomLoaded || !self.may_step() {
            return false;
        }

        for (port, state) in self.inputs.snapshot().iter().enumerate() {
            core.engine.set_control_port(port, state);
        }

        let render = core.skipper.next_frame(
            self.turbo.load(Ordering::Acquire),
            self.turbo_skip_frames.load(Ordering::Acquire),
        );
        let mut output = self.bridge.output();
        match core.engine.step(StepOptions { render }, &mut output) {
            Ok(()) => {
                core.failures = 0;
                true
            }
            Err(e) => {
                core.failures += 1;
                let failures = core.failures;
                log(LogCategory::Session, LogLevel::Warn, || {
                    format!("step failed ({} in a row): {}", failures, e)
                });
                let limit = self.config.max_consecutive_step_failures;
                if limit > 0 && failures >= limit {
                    self.halted.store(true, Ordering::Release);
                    log(LogCategory::Session, LogLevel::Error, || {
                        format!(
                            "halting after {} consecutive step failures; reset or reload to resume",
                            failures
                        )
                    });
                }
                false
            }
        }
    }

    /// Write battery-backed memory of the loaded ROM. Failures are logged.
    fn persist_save_data(&self, core: &mut Core<E>) {
        let Some(rom) = &core.rom else {
            return;
        };
        let path = self.layout.sram_path(&rom.stem);
        if let Err(e) = std::fs::create_dir_all(self.layout.sram_dir()) {
            log(LogCategory::Session, LogLevel::Warn, || {
                format!("cannot create {}: {}", self.layout.sram_dir().display(), e)
            });
            return;
        }
        match core.engine.persist_durable_save_data(&path) {
            Ok(()) => log(LogCategory::Session, LogLevel::Debug, || {
                format!("saved durable data to {}", path.display())
            }),
            Err(e) => log(LogCategory::Session, LogLevel::Warn, || {
                format!("failed to save durable data to {}: {}", path.display(), e)
            }),
        }
    }

    fn restore_save_data(&self, core: &mut Core<E>, rom: &RomIdentity) {
        let path = self.layout.sram_path(&rom.stem);
        if !path.exists() {
            return;
        }
        if let Err(e) = core.engine.load_durable_save_data(&path) {
            log(LogCategory::Session, LogLevel::Warn, || {
                format!("failed to load durable data from {}: {}", path.display(), e)
            });
        }
    }
}

impl<E: Engine> FrameSource for Shared<E> {
    fn pump_frame(&self) -> bool {
        // cheap check first so an idle pump never contends for the lock
        if !self.may_step() {
            return false;
        }
        let mut core = self.lock_core();
        self.step_locked(&mut core)
    }

    fn frame_interval(&self) -> Duration {
        self.geometry().frame_interval()
    }
}

/// Lifts the halt raised while a ROM loads, whichever way the load exits.
struct LoadHalt<'a>(&'a AtomicBool);

impl Drop for LoadHalt<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A single emulation session driving one engine.
///
/// All methods take `&self` and may be called from any thread; engine calls
/// are serialized by an internal lock. Dropping the session deinitializes it.
pub struct Session<E: Engine> {
    pub(crate) shared: Arc<Shared<E>>,
    pump: FramePump,
}

impl<E: Engine> Session<E> {
    /// Create a session around `engine`. The engine is not initialized yet.
    pub fn new(engine: E, config: SessionConfig) -> Result<Self, SessionError> {
        let bridge = CallbackBridge::new(config.video_queue_depth, config.audio_queue_depth)?;
        let shared = Shared {
            core: Mutex::new(Core {
                engine,
                state: SessionState::Uninitialized,
                rom: None,
                skipper: FrameSkipper::default(),
                failures: 0,
            }),
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            paused: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            turbo: AtomicBool::new(config.turbo_mode),
            turbo_skip_frames: AtomicU32::new(config.turbo_skip_frames),
            geometry: Mutex::new(Geometry::default()),
            inputs: ControlInputs::new(),
            bridge,
            layout: config.layout(),
            events: EventHub::default(),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
            pump: FramePump::new(),
        })
    }

    pub fn init(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        match core.state {
            SessionState::Uninitialized | SessionState::Deinitialized => {}
            state => {
                return Err(SessionError::InvalidState {
                    operation: "initialize",
                    state,
                })
            }
        }

        let settings = shared.config.engine_settings();
        core.engine
            .init(&settings)
            .map_err(|e| SessionError::InitFailure(Box::new(e)))?;

        shared.refresh_geometry(&core);
        shared.recovered(&mut core);
        let paused = shared.config.start_paused;
        shared.paused.store(paused, Ordering::Release);
        shared.bridge.set_audio_muted(paused);
        shared.set_state(&mut core, SessionState::Initialized);

        log(LogCategory::Session, LogLevel::Info, || {
            format!(
                "session initialized ({} Hz output, base dir {})",
                settings.sample_rate,
                shared.layout.base().display()
            )
        });
        Ok(())
    }

    pub fn load_rom_file(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        self.load_rom(RomSource::File(path), RomIdentity::from_path(path))
    }

    /// Load an in-memory image. `name` names its save files; may be empty.
    pub fn load_rom_bytes(&self, data: &[u8], name: &str) -> Result<(), SessionError> {
        self.load_rom(
            RomSource::Memory { data, name },
            RomIdentity::from_memory(data, name),
        )
    }

    fn load_rom(&self, source: RomSource<'_>, identity: RomIdentity) -> Result<(), SessionError> {
        let name = self.swap_rom(source, identity)?;
        self.shared.events.publish(SessionEvent::RomLoaded { name });

        if let Some(quicksave) = &self.shared.config.quicksave {
            let path = self.shared.layout.base().join(quicksave);
            if path.exists() {
                if let Err(e) = self.load_state_from_file(&path) {
                    log(LogCategory::Session, LogLevel::Warn, || {
                        format!("quicksave {} not restored: {}", path.display(), e)
                    });
                }
            } else {
                log(LogCategory::Session, LogLevel::Debug, || {
                    format!("no quicksave at {}", path.display())
                });
            }
        }
        if self.shared.config.start_on_load {
            self.start()?;
        }
        Ok(())
    }

    /// Replace the engine's image under the session lock; returns the new ROM's name.
    fn swap_rom(&self, source: RomSource<'_>, identity: RomIdentity) -> Result<String, SessionError> {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        if !core.state.is_active() {
            return Err(SessionError::InvalidState {
                operation: "load a ROM",
                state: core.state,
            });
        }

        if core.state == SessionState::RomLoaded {
            shared.persist_save_data(&mut core);
        }
        // nothing steps while the engine swaps images
        shared.halted.store(true, Ordering::Release);
        let _halt = LoadHalt(&shared.halted);
        core.rom = None;
        shared.set_state(&mut core, SessionState::Initialized);

        let loaded: Result<(), BoxError> = match core.engine.load_rom(source) {
            Ok(()) if core.engine.is_rom_loaded() => Ok(()),
            Ok(()) => Err("engine reported no ROM after loading".into()),
            Err(e) => Err(BoxError::from(e)),
        };
        if let Err(source) = loaded {
            log(LogCategory::Session, LogLevel::Error, || {
                format!("failed to load {}: {}", identity.name, source)
            });
            return Err(SessionError::LoadFailure {
                name: identity.name,
                source,
            });
        }

        shared.refresh_geometry(&core);
        shared.restore_save_data(&mut core, &identity);
        let name = identity.name.clone();
        core.rom = Some(identity);
        shared.recovered(&mut core);
        shared.set_state(&mut core, SessionState::RomLoaded);

        let geometry = shared.geometry();
        log(LogCategory::Session, LogLevel::Info, || {
            format!(
                "loaded {} ({}x{}, {:?}, {:.3} Hz)",
                name,
                geometry.width,
                geometry.height,
                geometry.region,
                geometry.refresh_rate()
            )
        });
        Ok(name)
    }

    /// Power-cycle the loaded ROM. Does nothing without one.
    pub fn reset(&self) {
        self.reset_with(SessionEvent::Reset, |engine| engine.reset());
    }

    /// Press the reset button. Does nothing without a ROM.
    pub fn soft_reset(&self) {
        self.reset_with(SessionEvent::SoftReset, |engine| engine.soft_reset());
    }

    fn reset_with(&self, event: SessionEvent, action: impl FnOnce(&mut E)) {
        {
            let mut core = self.shared.lock_core();
            if core.state != SessionState::RomLoaded {
                log(LogCategory::Session, LogLevel::Debug, || {
                    format!("{:?} ignored: no ROM loaded", event)
                });
                return;
            }
            action(&mut core.engine);
            self.shared.recovered(&mut core);
        }
        log(LogCategory::Session, LogLevel::Info, || format!("{:?}", event));
        self.shared.events.publish(event);
    }

    /// Pause or resume stepping. Audio delivery is muted while paused.
    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Release);
        self.shared.bridge.set_audio_muted(paused);
        log(LogCategory::Session, LogLevel::Debug, || {
            format!("paused = {}", paused)
        });
        self.shared.events.publish(SessionEvent::Paused(paused));
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// True after repeated step failures, until the next reset or load.
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    /// Stop the pump, persist durable data and release the engine.
    ///
    /// Calling it again is a no-op. The session can be initialized afresh.
    pub fn deinit(&self) {
        let mut stopped = self.pump.stop();
        {
            let shared = &self.shared;
            let mut core = shared.lock_core();
            match core.state {
                SessionState::Uninitialized | SessionState::Deinitialized => return,
                SessionState::Initialized | SessionState::RomLoaded => {}
            }
            if core.state == SessionState::RomLoaded {
                shared.persist_save_data(&mut core);
            }
            core.engine.deinit();
            core.rom = None;
            shared.inputs.clear();
            shared.set_state(&mut core, SessionState::Deinitialized);
        }
        // a start that passed its state check before the store above has
        // already published its worker; one that did not is refused
        stopped |= self.pump.stop();
        if stopped {
            self.shared.events.publish(SessionEvent::EmulationStopped);
        }
        log(LogCategory::Session, LogLevel::Info, || {
            "session deinitialized".to_string()
        });
    }

    /// Start stepping at the refresh rate on a background thread.
    ///
    /// Starting an already running or inactive session does nothing.
    pub fn start(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let started = self.pump.start(Arc::clone(shared), || {
            let state = shared.state();
            if !state.is_active() {
                log(LogCategory::Pump, LogLevel::Debug, || {
                    format!("start ignored while {:?}", state)
                });
            }
            state.is_active()
        })?;
        if started {
            shared.events.publish(SessionEvent::EmulationStarted);
        }
        Ok(())
    }

    /// Stop the background thread, waiting for an in-progress step to finish.
    pub fn stop(&self) {
        if self.pump.stop() {
            self.shared.events.publish(SessionEvent::EmulationStopped);
        }
    }

    pub fn is_running(&self) -> bool {
        self.pump.is_running()
    }

    /// Step one frame on the calling thread, subject to the same gating as the pump.
    pub fn run_frame(&self) -> bool {
        let mut core = self.shared.lock_core();
        self.shared.step_locked(&mut core)
    }

    pub fn set_turbo(&self, enabled: bool) {
        self.shared.turbo.store(enabled, Ordering::Release);
    }

    pub fn is_turbo(&self) -> bool {
        self.shared.turbo.load(Ordering::Acquire)
    }

    /// Frames skipped between rendered frames while turbo is on.
    pub fn set_turbo_skip_frames(&self, frames: u32) {
        self.shared.turbo_skip_frames.store(frames, Ordering::Release);
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_rom_loaded(&self) -> bool {
        self.state() == SessionState::RomLoaded
    }

    pub fn rom_name(&self) -> Option<String> {
        self.shared.lock_core().rom.as_ref().map(|r| r.name.clone())
    }

    pub fn geometry(&self) -> Geometry {
        self.shared.geometry()
    }

    pub fn frame_width(&self) -> u32 {
        self.geometry().width
    }

    pub fn frame_height(&self) -> u32 {
        self.geometry().height
    }

    /// Refresh rate in Hz of the current region.
    pub fn frame_rate(&self) -> f64 {
        self.geometry().refresh_rate()
    }

    pub fn layout(&self) -> &DirectoryLayout {
        &self.shared.layout
    }

    pub fn set_buttons(&self, port: usize, mask: u16) {
        self.shared.inputs.set_buttons(port, mask);
    }

    /// Hold exactly `buttons` on `port`, releasing the rest.
    pub fn set_pressed(&self, port: usize, buttons: &[Button]) {
        self.shared
            .inputs
            .set_buttons(port, button_mask(buttons.iter().copied()));
    }

    pub fn set_pointer(&self, port: usize, x: i32, y: i32) {
        self.shared.inputs.set_pointer(port, x, y);
    }

    pub fn set_pointer_buttons(&self, port: usize, left: bool, right: bool) {
        self.shared.inputs.set_pointer_buttons(port, left, right);
    }

    /// Replace the video sink. After this returns the previous sink is never called again.
    pub fn register_video_sink<F>(&self, sink: F)
    where
        F: FnMut(VideoFrame) + Send + 'static,
    {
        self.shared.bridge.register_video_sink(sink);
    }

    /// Replace the audio sink. After this returns the previous sink is never called again.
    pub fn register_audio_sink<F>(&self, sink: F)
    where
        F: FnMut(AudioChunk) + Send + 'static,
    {
        self.shared.bridge.register_audio_sink(sink);
    }

    pub fn clear_video_sink(&self) {
        self.shared.bridge.clear_video_sink();
    }

    pub fn clear_audio_sink(&self) {
        self.shared.bridge.clear_audio_sink();
    }

    /// Receive lifecycle events from now on. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn video_stats(&self) -> DeliveryStats {
        self.shared.bridge.video_stats()
    }

    pub fn audio_stats(&self) -> DeliveryStats {
        self.shared.bridge.audio_stats()
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        self.deinit();
    }
}
