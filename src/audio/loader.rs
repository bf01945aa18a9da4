//! Background worker that uploads pending buffer loads and keeps streaming
//! sources fed.

use crate::audio::buffer::{decode_all, upload, Buffer};
use crate::audio::context::Context;
use crate::audio::decoder::Decoder;
use crate::audio::error::AudioError;
use crate::audio::format::HwFormat;
use crate::audio::source::SourceId;
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

const LOG_TARGET: &str = "voicepool::audio::loader";

/// A buffer whose samples still have to be decoded and uploaded. Consumed
/// exactly once by the worker.
pub(crate) struct PendingBufferLoad {
    pub buffer: Arc<Buffer>,
    pub decoder: Box<dyn Decoder>,
    pub format: HwFormat,
    pub frames: u64,
    pub name: String,
}

type LoadConsumer = Consumer<PendingBufferLoad>;

/// Per-context worker state: the bounded pending-load ring, the streaming
/// source set and the wake signalling.
pub struct AsyncLoader {
    producer: Mutex<Producer<PendingBufferLoad>>,
    consumer: Mutex<Option<LoadConsumer>>,
    streaming: Mutex<Vec<SourceId>>,
    wake: Mutex<()>,
    wake_cv: Condvar,
    quit: AtomicBool,
    wake_interval_ms: AtomicU32,
    worker: Mutex<Option<JoinHandle<LoadConsumer>>>,
}

impl AsyncLoader {
    pub(crate) fn new(capacity: usize, wake_interval_ms: u32) -> Self {
        let (producer, consumer) = RingBuffer::new(capacity.max(1));
        AsyncLoader {
            producer: Mutex::new(producer),
            consumer: Mutex::new(Some(consumer)),
            streaming: Mutex::new(Vec::new()),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
            quit: AtomicBool::new(false),
            wake_interval_ms: AtomicU32::new(wake_interval_ms),
            worker: Mutex::new(None),
        }
    }

    fn streaming(&self) -> MutexGuard<'_, Vec<SourceId>> {
        self.streaming.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn should_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Spawns the worker for `ctx` unless it is already running.
    pub(crate) fn ensure_started(&self, ctx: &Arc<Context>) -> Result<(), AudioError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| AudioError::InvalidOperation("Loader has been shut down".to_string()))?;

        let thread_ctx = Arc::clone(ctx);
        let handle = thread::Builder::new()
            .name(format!("voicepool-loader-{}", ctx.id()))
            .spawn(move || worker_loop(thread_ctx, consumer))
            .map_err(|e| AudioError::InvalidOperation(format!("Failed to spawn loader thread: {}", e)))?;
        info!(target: LOG_TARGET, "Started background loader for context {}", ctx.id());
        *worker = Some(handle);
        Ok(())
    }

    /// Queues a load, yielding while the ring is full.
    pub(crate) fn enqueue(&self, mut load: PendingBufferLoad) {
        {
            let mut producer = self.producer.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                match producer.push(load) {
                    Ok(()) => break,
                    Err(PushError::Full(rejected)) => {
                        trace!(target: LOG_TARGET, "Pending load ring full; yielding.");
                        load = rejected;
                        thread::yield_now();
                    }
                }
            }
        }
        self.wake();
    }

    /// Wakes the worker, synchronising with its idle check so the signal
    /// cannot be missed.
    pub(crate) fn wake(&self) {
        drop(self.wake.lock().unwrap_or_else(|e| e.into_inner()));
        self.wake_cv.notify_all();
    }

    /// Wakes the worker without taking its lock.
    pub(crate) fn nudge(&self) {
        self.wake_cv.notify_all();
    }

    pub(crate) fn set_wake_interval(&self, msec: u32) {
        self.wake_interval_ms.store(msec, Ordering::Release);
        self.wake();
    }

    pub(crate) fn wake_interval(&self) -> u32 {
        self.wake_interval_ms.load(Ordering::Acquire)
    }

    pub(crate) fn add_stream(&self, source: SourceId) {
        let mut streaming = self.streaming();
        if let Err(pos) = streaming.binary_search(&source) {
            streaming.insert(pos, source);
        }
    }

    pub(crate) fn remove_stream(&self, source: SourceId) {
        let mut streaming = self.streaming();
        if let Ok(pos) = streaming.binary_search(&source) {
            streaming.remove(pos);
        }
    }

    pub fn streaming_count(&self) -> usize {
        self.streaming().len()
    }

    pub fn is_streaming(&self, source: SourceId) -> bool {
        self.streaming().binary_search(&source).is_ok()
    }

    fn streaming_snapshot(&self) -> Vec<SourceId> {
        self.streaming().clone()
    }

    pub(crate) fn request_quit(&self) {
        let guard = self.wake.lock().unwrap_or_else(|e| e.into_inner());
        self.quit.store(true, Ordering::Release);
        drop(guard);
        self.wake_cv.notify_all();
    }

    /// Joins the worker (if it ever ran) and drops any loads still queued
    /// without executing them, leaving their buffers `Failed`. Returns how
    /// many were dropped. `Context::destroy` refuses while buffers are
    /// registered, so from there the queue is normally already empty.
    #[instrument(skip(self))]
    pub(crate) fn join(&self) -> usize {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let consumer = match handle {
            Some(handle) => match handle.join() {
                Ok(consumer) => Some(consumer),
                Err(_) => {
                    error!(target: LOG_TARGET, "Background loader panicked.");
                    None
                }
            },
            None => self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take(),
        };

        let mut dropped = 0;
        if let Some(mut consumer) = consumer {
            while let Ok(load) = consumer.pop() {
                debug!(target: LOG_TARGET, "Dropping unconsumed load of {}", load.name);
                load.buffer.mark_failed();
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(target: LOG_TARGET, "Dropped {} queued buffer loads at shutdown", dropped);
        }
        dropped
    }
}

/// Decodes and uploads one pending load, leaving the buffer `Ready` or
/// `Failed`.
fn complete_load(ctx: &Context, load: PendingBufferLoad) {
    let PendingBufferLoad {
        buffer,
        mut decoder,
        format,
        frames,
        name,
    } = load;
    debug!(target: LOG_TARGET, "Loading {} ({} frames) in background", name, frames);

    let handler = ctx.message_handler();
    let extensions = ctx.extensions();
    let result = decode_all(decoder.as_mut(), &name, frames).and_then(|decoded| {
        handler.buffer_loading(
            &name,
            format.channels,
            format.sample_type,
            buffer.frequency(),
            &decoded.data,
        );
        upload(
            ctx.hardware().as_ref(),
            buffer.hw_id(),
            format,
            buffer.frequency(),
            &decoded,
            &extensions,
        )?;
        Ok(decoded)
    });

    match result {
        Ok(decoded) => buffer.mark_ready(decoded.frames, decoded.loop_points),
        Err(e) => {
            error!(target: LOG_TARGET, "Background load of {} failed: {}", name, e);
            buffer.mark_failed();
            handler.buffer_load_failed(&name, &e);
        }
    }
}

/// Services streaming sources once. Sources that report completion have
/// already left the streaming set by the time `update_stream` returns.
fn sweep_streams(ctx: &Context, loader: &AsyncLoader) {
    for source in loader.streaming_snapshot() {
        if !ctx.update_stream(source) {
            trace!(target: LOG_TARGET, "Stream on {} no longer serviced", source);
        }
    }
}

fn worker_loop(ctx: Arc<Context>, mut consumer: LoadConsumer) -> LoadConsumer {
    let loader = ctx.loader();
    let hardware = Arc::clone(ctx.hardware());
    let thread_local = hardware.supports_thread_local();
    if thread_local {
        if let Err(e) = hardware.set_thread_context(Some(ctx.hw_handle())) {
            warn!(target: LOG_TARGET, "Could not bind loader thread: {}", e);
        }
    }
    debug!(target: LOG_TARGET, "Loader running (thread-local binding: {})", thread_local);

    let base = Instant::now();
    let mut next_tick = Duration::ZERO;
    let mut bound = ctx.wait_until_bound(ctx.lock_binding());
    while !loader.should_quit() {
        sweep_streams(&ctx, loader);

        // One load per pass so streaming sources are serviced between
        // large decodes.
        if let Ok(load) = consumer.pop() {
            complete_load(&ctx, load);
            continue;
        }

        let wake = loader.wake.lock().unwrap_or_else(|e| e.into_inner());
        if loader.should_quit() || !consumer.is_empty() {
            continue;
        }
        drop(bound);

        let interval = loader.wake_interval();
        let wake = if interval == 0 {
            loader.wake_cv.wait(wake).unwrap_or_else(|e| e.into_inner())
        } else {
            let period = Duration::from_millis(u64::from(interval));
            let now = base.elapsed();
            while next_tick <= now {
                next_tick += period;
            }
            loader
                .wake_cv
                .wait_timeout(wake, next_tick - now)
                .unwrap_or_else(|e| e.into_inner())
                .0
        };
        drop(wake);

        bound = ctx.wait_until_bound(ctx.lock_binding());
    }
    drop(bound);

    if thread_local {
        let _ = hardware.set_thread_context(None);
    }
    debug!(target: LOG_TARGET, "Loader for context {} exiting", ctx.id());
    consumer
}
