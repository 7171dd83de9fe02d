//! Background thread that steps the engine at the region's refresh rate.

use crate::error::SessionError;
use emu_core::logging::{log, LogCategory, LogLevel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Idle wait when there is nothing to step (paused, halted, no ROM).
const IDLE_INTERVAL: Duration = Duration::from_millis(5);

/// What the pump drives.
pub(crate) trait FrameSource: Send + Sync + 'static {
    /// Step one frame if the session allows it; returns whether a step ran.
    fn pump_frame(&self) -> bool;

    /// Target wall-clock duration of one frame.
    fn frame_interval(&self) -> Duration;
}

/// Sleeps away whatever is left of each frame interval.
///
/// Overruns are not paid back: a late frame starts the next interval
/// immediately rather than bursting to catch up.
#[derive(Debug)]
pub(crate) struct Pacer {
    last: Instant,
}

impl Pacer {
    pub(crate) fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Time left in the current interval as of `now`.
    pub(crate) fn remaining(&self, now: Instant, interval: Duration) -> Duration {
        interval.saturating_sub(now.saturating_duration_since(self.last))
    }

    pub(crate) fn wait(&mut self, interval: Duration, stop: &AtomicBool) {
        let remaining = self.remaining(Instant::now(), interval);
        if !remaining.is_zero() && !stop.load(Ordering::Acquire) {
            thread::sleep(remaining);
        }
        self.last = Instant::now();
    }
}

/// Decides which turbo frames get rendered.
#[derive(Debug, Default)]
pub(crate) struct FrameSkipper {
    skipped: u32,
}

impl FrameSkipper {
    /// Whether the next frame should be rendered.
    pub(crate) fn next_frame(&mut self, turbo: bool, skip_frames: u32) -> bool {
        if !turbo {
            self.skipped = 0;
            return true;
        }
        self.skipped += 1;
        if self.skipped > skip_frames {
            self.skipped = 0;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset(&mut self) {
        self.skipped = 0;
    }
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Owner of the optional pacing thread. At most one worker exists at a time.
#[derive(Default)]
pub(crate) struct FramePump {
    worker: Mutex<Option<Worker>>,
    running: AtomicBool,
}

impl FramePump {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the pacing thread; returns whether a worker was spawned.
    /// Starting while running does nothing.
    ///
    /// `can_start` is checked with the worker slot held, so a stop that runs
    /// after the gate closes always sees the worker it has to join.
    pub(crate) fn start<S: FrameSource>(
        &self,
        source: Arc<S>,
        can_start: impl FnOnce() -> bool,
    ) -> Result<bool, SessionError> {
        let mut slot = self.lock();
        if slot.is_some() {
            log(LogCategory::Pump, LogLevel::Debug, || {
                "frame pump already running".to_string()
            });
            return Ok(false);
        }
        if !can_start() {
            return Ok(false);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("frame-pump".to_string())
            .spawn(move || run(source, thread_stop))
            .map_err(|source| SessionError::Spawn {
                name: "frame-pump",
                source,
            })?;

        *slot = Some(Worker { handle, stop });
        self.running.store(true, Ordering::Release);
        log(LogCategory::Pump, LogLevel::Info, || {
            "frame pump started".to_string()
        });
        Ok(true)
    }

    /// Stop and join the pacing thread; returns whether a worker was running.
    /// Stopping while idle does nothing.
    ///
    /// Called from the pump thread itself (a sink or engine callback), the
    /// worker is told to stop and detached instead of joined.
    pub(crate) fn stop(&self) -> bool {
        let mut slot = self.lock();
        let Some(worker) = slot.take() else {
            return false;
        };
        worker.stop.store(true, Ordering::Release);
        if thread::current().id() == worker.handle.thread().id() {
            self.running.store(false, Ordering::Release);
            log(LogCategory::Pump, LogLevel::Debug, || {
                "frame pump stopped from its own thread".to_string()
            });
            return true;
        }
        // held while joining so a concurrent start cannot spawn a second worker
        if worker.handle.join().is_err() {
            log(LogCategory::Pump, LogLevel::Error, || {
                "frame pump thread panicked".to_string()
            });
        }
        self.running.store(false, Ordering::Release);
        drop(slot);
        log(LogCategory::Pump, LogLevel::Info, || {
            "frame pump stopped".to_string()
        });
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

fn run<S: FrameSource>(source: Arc<S>, stop: Arc<AtomicBool>) {
    let mut pacer = Pacer::new();
    let mut frames: u64 = 0;
    while !stop.load(Ordering::Acquire) {
        if source.pump_frame() {
            frames += 1;
            pacer.wait(source.frame_interval(), &stop);
        } else {
            pacer.wait(IDLE_INTERVAL, &stop);
        }
    }
    log(LogCategory::Pump, LogLevel::Debug, || {
        format!("frame pump exiting after {} frames", frames)
    });
}
