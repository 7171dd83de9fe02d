//! Hand-off of produced video and audio from the stepping thread to sinks.
//!
//! The engine hands out borrowed buffers that are only valid during a step,
//! so every delivery starts with a copy. The copy is queued and a dedicated
//! delivery thread per medium calls the registered sink, keeping the
//! producer independent of how long the consumer takes.
//!
//! Each registration has a generation number. Items are tagged with the
//! generation current when they were produced; the delivery thread drops any
//! item whose generation no longer matches, so a replaced sink never sees a
//! frame after `register_*` returns.

use crate::error::SessionError;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::types::{AudioChunk, VideoFrame, VideoFrameRef};
use emu_core::FrameOutput;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

/// A registered consumer of one medium.
pub type Sink<T> = Box<dyn FnMut(T) + Send + 'static>;

/// Counters for one delivery channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeliveryStats {
    /// Items copied and queued.
    pub queued: u64,
    /// Items handed to a sink.
    pub delivered: u64,
    /// Items refused because a bounded queue was full.
    pub dropped: u64,
    /// Items discarded because their sink was replaced or the channel closed.
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
}

struct Registration<T> {
    sink: Option<Sink<T>>,
    generation: u64,
    /// The sink has been taken out by the delivery thread and is running.
    in_flight: bool,
}

struct SinkSlot<T> {
    registration: Mutex<Registration<T>>,
    idle: Condvar,
    generation: AtomicU64,
    registered: AtomicBool,
    closing: AtomicBool,
    counters: Counters,
}

impl<T> SinkSlot<T> {
    fn lock(&self) -> MutexGuard<'_, Registration<T>> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

enum Queue<T> {
    Unbounded(Sender<(u64, T)>),
    Bounded(SyncSender<(u64, T)>),
}

/// One medium's queue, delivery thread and sink registration.
pub struct DeliveryChannel<T: Send + 'static> {
    name: &'static str,
    slot: Arc<SinkSlot<T>>,
    queue: Option<Queue<T>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl<T: Send + 'static> DeliveryChannel<T> {
    fn spawn(name: &'static str, depth: Option<usize>) -> Result<Self, SessionError> {
        let slot = Arc::new(SinkSlot {
            registration: Mutex::new(Registration {
                sink: None,
                generation: 0,
                in_flight: false,
            }),
            idle: Condvar::new(),
            generation: AtomicU64::new(0),
            registered: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let (queue, receiver) = match depth {
            Some(depth) => {
                let (tx, rx) = mpsc::sync_channel(depth.max(1));
                (Queue::Bounded(tx), rx)
            }
            None => {
                let (tx, rx) = mpsc::channel();
                (Queue::Unbounded(tx), rx)
            }
        };

        let worker_slot = Arc::clone(&slot);
        let handle = thread::Builder::new()
            .name(format!("{}-delivery", name))
            .spawn(move || deliver_loop(name, worker_slot, receiver))
            .map_err(|source| SessionError::Spawn { name, source })?;

        Ok(Self {
            name,
            slot,
            queue: Some(queue),
            thread_id: handle.thread().id(),
            thread: Some(handle),
        })
    }

    /// Replace the current sink; `None` leaves the channel without one.
    ///
    /// Blocks until a delivery already running on the old sink has returned,
    /// unless called from a delivery thread of the same bridge (this one or
    /// `sibling`). Waiting there could deadlock against a sink doing the same
    /// on the other channel, so the old sink is instead retired as soon as
    /// its running callback returns.
    pub(crate) fn register(&self, sink: Option<Sink<T>>, sibling: ThreadId) {
        let current = thread::current().id();
        let reentrant = current == self.thread_id || current == sibling;
        let retired = {
            let mut reg = self.slot.lock();
            if !reentrant {
                while reg.in_flight {
                    reg = self
                        .slot
                        .idle
                        .wait(reg)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            reg.generation = reg.generation.wrapping_add(1);
            let retired = std::mem::replace(&mut reg.sink, sink);
            self.slot.generation.store(reg.generation, Ordering::Release);
            self.slot
                .registered
                .store(reg.sink.is_some(), Ordering::Release);
            retired
        };
        // the old sink may run arbitrary code on drop; not under the lock
        drop(retired);
        log(LogCategory::Bridge, LogLevel::Debug, || {
            format!("{} sink registration replaced", self.name)
        });
    }

    pub fn is_registered(&self) -> bool {
        self.slot.registered.load(Ordering::Acquire)
    }

    /// Queue the item built by `make`, which only runs when a sink is registered.
    fn send_with(&self, make: impl FnOnce() -> T) -> bool {
        if !self.is_registered() {
            return false;
        }
        let Some(queue) = &self.queue else {
            return false;
        };
        let generation = self.slot.generation.load(Ordering::Acquire);
        let item = (generation, make());

        let counters = &self.slot.counters;
        let sent = match queue {
            Queue::Unbounded(tx) => tx.send(item).is_ok(),
            Queue::Bounded(tx) => match tx.try_send(item) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    log(LogCategory::Bridge, LogLevel::Debug, || {
                        format!("{} queue full, dropping item", self.name)
                    });
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
        };
        if sent {
            counters.queued.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    pub fn stats(&self) -> DeliveryStats {
        let c = &self.slot.counters;
        DeliveryStats {
            queued: c.queued.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send + 'static> Drop for DeliveryChannel<T> {
    fn drop(&mut self) {
        self.slot.closing.store(true, Ordering::Release);
        // closing the queue ends the delivery loop
        self.queue.take();
        if let Some(handle) = self.thread.take() {
            if thread::current().id() != self.thread_id && handle.join().is_err() {
                log(LogCategory::Bridge, LogLevel::Error, || {
                    format!("{} delivery thread panicked", self.name)
                });
            }
        }
    }
}

fn deliver_loop<T>(name: &'static str, slot: Arc<SinkSlot<T>>, receiver: Receiver<(u64, T)>) {
    let counters = &slot.counters;
    while let Ok((generation, item)) = receiver.recv() {
        if slot.closing.load(Ordering::Acquire) {
            counters.discarded.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let mut sink = {
            let mut reg = slot.lock();
            match reg.sink.take() {
                Some(sink) if reg.generation == generation => {
                    reg.in_flight = true;
                    sink
                }
                other => {
                    reg.sink = other;
                    counters.discarded.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink(item)));

        let retired = {
            let mut reg = slot.lock();
            reg.in_flight = false;
            let current = reg.generation == generation;
            if outcome.is_ok() && current && reg.sink.is_none() {
                reg.sink = Some(sink);
                None
            } else {
                if current {
                    slot.registered.store(false, Ordering::Release);
                }
                Some(sink)
            }
        };
        slot.idle.notify_all();
        drop(retired);

        match outcome {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => log(LogCategory::Bridge, LogLevel::Error, || {
                format!("{} sink panicked and was unregistered", name)
            }),
        }
    }
}

/// Video and audio delivery for one session.
pub struct CallbackBridge {
    video: DeliveryChannel<VideoFrame>,
    audio: DeliveryChannel<AudioChunk>,
    audio_muted: AtomicBool,
}

impl CallbackBridge {
    /// Spawn both delivery threads. `None` depths queue without bound.
    pub fn new(
        video_depth: Option<usize>,
        audio_depth: Option<usize>,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            video: DeliveryChannel::spawn("video", video_depth)?,
            audio: DeliveryChannel::spawn("audio", audio_depth)?,
            audio_muted: AtomicBool::new(false),
        })
    }

    pub fn register_video_sink<F>(&self, sink: F)
    where
        F: FnMut(VideoFrame) + Send + 'static,
    {
        self.video.register(Some(Box::new(sink)), self.audio.thread_id);
    }

    pub fn register_audio_sink<F>(&self, sink: F)
    where
        F: FnMut(AudioChunk) + Send + 'static,
    {
        self.audio.register(Some(Box::new(sink)), self.video.thread_id);
    }

    pub fn clear_video_sink(&self) {
        self.video.register(None, self.audio.thread_id);
    }

    pub fn clear_audio_sink(&self) {
        self.audio.register(None, self.video.thread_id);
    }

    /// Copy a frame and queue it for the video sink. No-op without a sink.
    pub fn deliver_video(&self, frame: VideoFrameRef<'_>) -> bool {
        self.video.send_with(|| VideoFrame::copy_from(&frame))
    }

    /// Copy `sample_count` stereo samples and queue them for the audio sink.
    pub fn deliver_audio(&self, samples: &[i16], sample_count: usize) -> bool {
        if sample_count == 0 || self.audio_muted.load(Ordering::Acquire) {
            return false;
        }
        self.audio
            .send_with(|| AudioChunk::copy_from(samples, sample_count))
    }

    pub fn set_audio_muted(&self, muted: bool) {
        self.audio_muted.store(muted, Ordering::Release);
    }

    pub fn video_stats(&self) -> DeliveryStats {
        self.video.stats()
    }

    pub fn audio_stats(&self) -> DeliveryStats {
        self.audio.stats()
    }

    pub(crate) fn output(&self) -> StepOutput<'_> {
        StepOutput { bridge: self }
    }
}

/// `FrameOutput` handed to the engine for a single step.
pub(crate) struct StepOutput<'a> {
    bridge: &'a CallbackBridge,
}

impl FrameOutput for StepOutput<'_> {
    fn video(&mut self, frame: VideoFrameRef<'_>) {
        self.bridge.deliver_video(frame);
    }

    fn audio(&mut self, samples: &[i16], sample_count: usize) {
        self.bridge.deliver_audio(samples, sample_count);
    }

    fn message(&mut self, level: LogLevel, text: &str) {
        log(LogCategory::Engine, level, || text.to_string());
    }
}
