//! The unit of exclusive hardware binding. A context owns its buffer
//! registry, its source pool and its background loader.

use crate::audio::binding::BindingManager;
use crate::audio::buffer::{decode_all, upload, Buffer, BufferLoadStatus};
use crate::audio::buffer_registry::BufferRegistry;
use crate::audio::decoder::Decoder;
use crate::audio::error::AudioError;
use crate::audio::extensions::{Extension, ExtensionTable};
use crate::audio::file_io::ResourceResolver;
use crate::audio::format::{ChannelConfig, HwFormat, SampleType};
use crate::audio::hardware::{HardwareApi, HwContext, HwError, VoiceId, VoiceState};
use crate::audio::loader::{AsyncLoader, PendingBufferLoad};
use crate::audio::message::{MessageHandler, NullMessageHandler};
use crate::audio::source::{PlaybackState, SourceId, StreamProgress, StreamState};
use crate::audio::source_pool::SourcePool;
use crate::config::Settings;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, error, info, instrument, trace, warn};

const LOG_TARGET: &str = "voicepool::audio::context";

pub struct Context {
    id: u64,
    hw: HwContext,
    hardware: Arc<dyn HardwareApi>,
    manager: Weak<BindingManager>,
    resolver: Arc<ResourceResolver>,
    self_ref: Weak<Context>,
    refs: AtomicU32,
    binding: Mutex<()>,
    binding_changed: Condvar,
    extensions: RwLock<Option<ExtensionTable>>,
    buffers: BufferRegistry,
    sources: SourcePool,
    loader: AsyncLoader,
    message: RwLock<Arc<dyn MessageHandler>>,
    default_priority: AtomicU32,
    stream_chunk_frames: u32,
    stream_queue_size: u32,
    connected: AtomicBool,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("hw", &self.hw)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(
        id: u64,
        hw: HwContext,
        manager: &Arc<BindingManager>,
        settings: &Settings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Context {
            id,
            hw,
            hardware: Arc::clone(manager.hardware()),
            manager: Arc::downgrade(manager),
            resolver: Arc::clone(manager.resolver()),
            self_ref: self_ref.clone(),
            refs: AtomicU32::new(0),
            binding: Mutex::new(()),
            binding_changed: Condvar::new(),
            extensions: RwLock::new(None),
            buffers: BufferRegistry::new(),
            sources: SourcePool::new(),
            loader: AsyncLoader::new(settings.pending_queue_capacity, settings.async_wake_interval_ms),
            message: RwLock::new(Arc::new(NullMessageHandler)),
            default_priority: AtomicU32::new(settings.default_priority),
            stream_chunk_frames: settings.stream_chunk_frames.max(1),
            stream_queue_size: settings.stream_queue_size.max(1),
            connected: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of bindings (global or per-thread) currently holding this
    /// context.
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn hw_handle(&self) -> HwContext {
        self.hw
    }

    pub(crate) fn hardware(&self) -> &Arc<dyn HardwareApi> {
        &self.hardware
    }

    pub(crate) fn loader(&self) -> &AsyncLoader {
        &self.loader
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Never below zero.
            self.refs.store(0, Ordering::Release);
            error!(target: LOG_TARGET, "Context {} reference count underflow", self.id);
        }
    }

    pub(crate) fn lock_binding(&self) -> MutexGuard<'_, ()> {
        self.binding.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until this context is the effective binding of the calling
    /// thread or the loader is told to quit.
    pub(crate) fn wait_until_bound<'a>(&'a self, mut guard: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        while !self.loader.should_quit() && self.hardware.current_context() != Some(self.hw) {
            trace!(target: LOG_TARGET, "Loader for context {} waiting for binding", self.id);
            guard = self.binding_changed.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        guard
    }

    pub(crate) fn notify_binding_changed(&self) {
        drop(self.lock_binding());
        self.binding_changed.notify_all();
    }

    /// Probes the capability strings the first time the context is bound.
    /// Callers hold the binding lock with the context current.
    pub(crate) fn ensure_extensions(&self) {
        let mut extensions = self.extensions.write().unwrap_or_else(|e| e.into_inner());
        if extensions.is_none() {
            debug!(target: LOG_TARGET, "Probing extensions for context {}", self.id);
            *extensions = Some(ExtensionTable::probe(self.hardware.as_ref()));
        }
    }

    /// The probed capabilities, empty until the first bind.
    pub fn extensions(&self) -> ExtensionTable {
        self.extensions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    pub fn has_extension(&self, ext: Extension) -> bool {
        self.extensions().has(ext)
    }

    /// Fails unless this context is the caller's effective binding.
    pub fn check(&self) -> Result<(), AudioError> {
        if self.is_destroyed() {
            return Err(AudioError::InvalidOperation(format!(
                "Context {} has been destroyed",
                self.id
            )));
        }
        let manager = self.manager.upgrade().ok_or_else(|| {
            AudioError::InvalidOperation("Binding manager no longer exists".to_string())
        })?;
        manager.check_context(self)
    }

    fn self_arc(&self) -> Result<Arc<Context>, AudioError> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| AudioError::InvalidOperation("Context is being dropped".to_string()))
    }

    pub fn message_handler(&self) -> Arc<dyn MessageHandler> {
        self.message.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Installs `handler` and returns the one it replaces.
    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        let mut message = self.message.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *message, handler)
    }

    /// Sets the periodic wake interval of the background worker; 0 turns
    /// periodic wakes off.
    pub fn set_async_wake_interval(&self, msec: u32) {
        debug!(target: LOG_TARGET, "Context {} wake interval set to {}ms", self.id, msec);
        self.loader.set_wake_interval(msec);
    }

    pub fn async_wake_interval(&self) -> u32 {
        self.loader.wake_interval()
    }

    pub fn is_supported(&self, channels: ChannelConfig, sample_type: SampleType) -> bool {
        HwFormat::resolve(channels, sample_type, &self.extensions()).is_some()
    }

    fn resolve_format(&self, channels: ChannelConfig, sample_type: SampleType) -> Result<HwFormat, AudioError> {
        HwFormat::resolve(channels, sample_type, &self.extensions()).ok_or_else(|| {
            AudioError::UnsupportedFormat(format!("Format not supported ({}, {})", sample_type, channels))
        })
    }

    /// Opens `name` through the resolver, offering the message handler a
    /// chance to substitute missing resources.
    pub fn create_decoder(&self, name: &str) -> Result<Box<dyn Decoder>, AudioError> {
        let handler = self.message_handler();
        self.resolver.create_decoder(name, handler.as_ref())
    }

    pub fn resolver(&self) -> &Arc<ResourceResolver> {
        &self.resolver
    }

    fn ensure_worker(&self) -> Result<(), AudioError> {
        let me = self.self_arc()?;
        self.loader.ensure_started(&me)
    }

    // Buffers

    fn await_ready(&self, buffer: Arc<Buffer>) -> Result<Arc<Buffer>, AudioError> {
        match buffer.wait_loaded() {
            BufferLoadStatus::Ready => Ok(buffer),
            _ => Err(AudioError::LoadFailed(format!("Buffer {} failed to load", buffer.name()))),
        }
    }

    /// Returns the buffer named `name`, loading it on the calling thread if
    /// needed. The result is always `Ready`.
    #[instrument(skip(self), fields(context = self.id))]
    pub fn get_buffer(&self, name: &str) -> Result<Arc<Buffer>, AudioError> {
        self.check()?;
        if let Some(buffer) = self.buffers.find(name) {
            return self.await_ready(buffer);
        }

        let handler = self.message_handler();
        let mut decoder = self.resolver.create_decoder(name, handler.as_ref())?;
        let frequency = decoder.frequency();
        let channels = decoder.channel_config();
        let sample_type = decoder.sample_type();
        let length = decoder.length();

        let decoded = decode_all(decoder.as_mut(), name, length)?;
        let format = self.resolve_format(channels, sample_type)?;

        handler.buffer_loading(name, channels, sample_type, frequency, &decoded.data);
        let id = self.hardware.gen_buffer()?;
        let extensions = self.extensions();
        if let Err(e) = upload(self.hardware.as_ref(), id, format, frequency, &decoded, &extensions) {
            self.hardware.delete_buffer(id);
            return Err(e);
        }

        let buffer = Arc::new(Buffer::new(name, id, frequency, channels, sample_type));
        buffer.mark_ready(decoded.frames, decoded.loop_points);
        let (buffer, inserted) = self.buffers.insert_or_existing(buffer);
        if !inserted {
            debug!(target: LOG_TARGET, "Buffer {} was loaded concurrently; discarding ours", name);
            self.hardware.delete_buffer(id);
            return self.await_ready(buffer);
        }
        info!(target: LOG_TARGET, "Loaded buffer {} ({} frames)", name, decoded.frames);
        Ok(buffer)
    }

    /// Returns the buffer named `name`, queueing its load on the background
    /// worker if needed. The result may still be `Pending`.
    #[instrument(skip(self), fields(context = self.id))]
    pub fn get_buffer_async(&self, name: &str) -> Result<Arc<Buffer>, AudioError> {
        self.check()?;
        if let Some(buffer) = self.buffers.find(name) {
            return Ok(buffer);
        }

        let decoder = self.create_decoder(name)?;
        let frequency = decoder.frequency();
        let channels = decoder.channel_config();
        let sample_type = decoder.sample_type();
        let frames = decoder.length();
        let format = self.resolve_format(channels, sample_type)?;

        let id = self.hardware.gen_buffer()?;
        let buffer = Arc::new(Buffer::new(name, id, frequency, channels, sample_type));
        let (buffer, inserted) = self.buffers.insert_or_existing(buffer);
        if !inserted {
            self.hardware.delete_buffer(id);
            return Ok(buffer);
        }

        if let Err(e) = self.ensure_worker() {
            self.buffers.remove(name);
            buffer.mark_failed();
            self.hardware.delete_buffer(id);
            return Err(e);
        }
        self.loader.enqueue(PendingBufferLoad {
            buffer: Arc::clone(&buffer),
            decoder,
            format,
            frames,
            name: name.to_string(),
        });
        debug!(target: LOG_TARGET, "Queued background load of {}", name);
        Ok(buffer)
    }

    /// The registered buffer named `name`, in whatever state it is.
    pub fn find_buffer(&self, name: &str) -> Option<Arc<Buffer>> {
        self.buffers.find(name)
    }

    pub fn buffer_names(&self) -> Vec<String> {
        self.buffers.names()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Deletes the buffer named `name`. Absent names are ignored. An
    /// in-flight background load is waited for first; buffers still bound
    /// to sources are refused.
    #[instrument(skip(self), fields(context = self.id))]
    pub fn remove_buffer(&self, name: &str) -> Result<(), AudioError> {
        self.check()?;
        let buffer = match self.buffers.find(name) {
            Some(buffer) => buffer,
            None => return Ok(()),
        };
        self.delete_buffer(buffer)
    }

    /// Deletes `buffer`. A handle that is no longer registered, including
    /// one whose name now maps to a reloaded buffer, is ignored.
    pub fn remove_buffer_handle(&self, buffer: &Arc<Buffer>) -> Result<(), AudioError> {
        self.check()?;
        match self.buffers.find(buffer.name()) {
            Some(found) if Arc::ptr_eq(&found, buffer) => self.delete_buffer(found),
            Some(_) => {
                debug!(target: LOG_TARGET, "Stale handle for {}; registered buffer kept", buffer.name());
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn delete_buffer(&self, buffer: Arc<Buffer>) -> Result<(), AudioError> {
        buffer.wait_loaded();
        if buffer.is_in_use() {
            return Err(AudioError::InvalidOperation(format!("Buffer {} is in use", buffer.name())));
        }
        self.buffers.remove(buffer.name());
        self.hardware.delete_buffer(buffer.hw_id());
        debug!(target: LOG_TARGET, "Removed buffer {}", buffer.name());
        Ok(())
    }

    /// Changes the loop range of an idle, ready buffer.
    pub fn set_loop_points(&self, buffer: &Arc<Buffer>, start: u64, end: u64) -> Result<(), AudioError> {
        self.check()?;
        if !buffer.is_ready() {
            return Err(AudioError::InvalidOperation(format!("Buffer {} is not loaded", buffer.name())));
        }
        if start >= end || end > buffer.length() {
            return Err(AudioError::InvalidOperation(format!(
                "Loop points out of range ({}, {}) for {} frames",
                start,
                end,
                buffer.length()
            )));
        }
        if buffer.is_in_use() {
            return Err(AudioError::InvalidOperation(format!("Buffer {} is in use", buffer.name())));
        }
        if !self.has_extension(Extension::SOFT_loop_points) {
            return Err(AudioError::UnsupportedOperation("Loop points not supported".to_string()));
        }
        self.hardware
            .buffer_set_loop_points(buffer.hw_id(), start as u32, end as u32)?;
        buffer.store_loop_points(start, end);
        Ok(())
    }

    // Sources

    pub fn create_source(&self) -> Result<SourceId, AudioError> {
        self.check()?;
        let priority = self.default_priority.load(Ordering::Acquire);
        let id = self.sources.lock().create_source(priority);
        trace!(target: LOG_TARGET, "Created {}", id);
        Ok(id)
    }

    /// Stops `source` and returns it to the pool. The handle is stale
    /// afterwards.
    pub fn release_source(&self, source: SourceId) -> Result<(), AudioError> {
        self.check()?;
        let mut pool = self.sources.lock();
        pool.release_source(self.hardware.as_ref(), source)?;
        self.loader.remove_stream(source);
        Ok(())
    }

    pub fn set_default_priority(&self, priority: u32) {
        self.default_priority.store(priority, Ordering::Release);
    }

    pub fn set_priority(&self, source: SourceId, priority: u32) -> Result<(), AudioError> {
        self.check()?;
        self.sources.lock().slot_mut(source)?.priority = priority;
        Ok(())
    }

    pub fn priority(&self, source: SourceId) -> Result<u32, AudioError> {
        Ok(self.sources.lock().slot(source)?.priority)
    }

    pub fn set_looping(&self, source: SourceId, looping: bool) -> Result<(), AudioError> {
        self.check()?;
        let mut pool = self.sources.lock();
        let slot = pool.slot_mut(source)?;
        slot.looping = looping;
        if let (Some(voice), false) = (slot.voice, slot.is_streaming()) {
            self.hardware.source_set_looping(voice, looping)?;
        }
        Ok(())
    }

    pub fn state(&self, source: SourceId) -> Result<PlaybackState, AudioError> {
        Ok(self.sources.lock().slot(source)?.state)
    }

    pub fn is_playing(&self, source: SourceId) -> Result<bool, AudioError> {
        Ok(self.state(source)? == PlaybackState::Playing)
    }

    /// The buffer `source` is bound to, if any.
    pub fn buffer_of(&self, source: SourceId) -> Result<Option<Arc<Buffer>>, AudioError> {
        Ok(self.sources.lock().slot(source)?.buffer.clone())
    }

    /// Stops whatever `source` was doing and returns a voice for it:
    /// its own if it held one, else one from the pool.
    fn claim_voice(
        &self,
        pool: &mut crate::audio::source_pool::PoolState,
        source: SourceId,
    ) -> Result<(VoiceId, Option<SourceId>), AudioError> {
        let hardware = self.hardware.as_ref();
        let slot = pool.slot_mut(source)?;
        let priority = slot.priority;
        self.loader.remove_stream(source);
        match slot.make_stopped(hardware, source) {
            Some(voice) => Ok((voice, None)),
            None => {
                let (voice, evicted) = pool.acquire_voice(hardware, source, priority)?;
                if let Some(victim) = evicted {
                    self.loader.remove_stream(victim);
                }
                Ok((voice, evicted))
            }
        }
    }

    fn notify_evicted(&self, evicted: Option<SourceId>) {
        if let Some(victim) = evicted {
            self.message_handler().source_stopped(victim, true);
        }
    }

    /// Plays a ready buffer on `source`, evicting a lower-priority source if
    /// every voice is busy.
    #[instrument(skip(self, buffer), fields(buffer = buffer.name()))]
    pub fn play(&self, source: SourceId, buffer: &Arc<Buffer>) -> Result<(), AudioError> {
        self.check()?;
        match buffer.load_status() {
            BufferLoadStatus::Ready => {}
            BufferLoadStatus::Pending => {
                return Err(AudioError::InvalidOperation(format!(
                    "Buffer {} is not yet playable",
                    buffer.name()
                )))
            }
            BufferLoadStatus::Failed => {
                return Err(AudioError::InvalidOperation(format!("Buffer {} failed to load", buffer.name())))
            }
        }
        match self.buffers.find(buffer.name()) {
            Some(found) if Arc::ptr_eq(&found, buffer) => {}
            _ => {
                return Err(AudioError::InvalidOperation(format!(
                    "Buffer {} does not belong to this context",
                    buffer.name()
                )))
            }
        }

        let evicted = {
            let mut pool = self.sources.lock();
            let (voice, evicted) = self.claim_voice(&mut pool, source)?;
            let looping = pool.slot(source)?.looping;
            let started: Result<(), HwError> = (|| {
                self.hardware.source_set_buffer(voice, Some(buffer.hw_id()))?;
                self.hardware.source_set_looping(voice, looping)?;
                self.hardware.source_play(voice)
            })();
            if let Err(e) = started {
                let _ = self.hardware.source_set_buffer(voice, None);
                pool.return_voice(voice);
                drop(pool);
                self.notify_evicted(evicted);
                return Err(e.into());
            }

            let slot = pool.slot_mut(source)?;
            slot.voice = Some(voice);
            slot.buffer = Some(Arc::clone(buffer));
            slot.state = PlaybackState::Playing;
            buffer.add_source(source);
            debug!(target: LOG_TARGET, "{} playing {} on {}", source, buffer.name(), voice);
            evicted
        };
        self.notify_evicted(evicted);
        Ok(())
    }

    /// Plays `decoder` on `source` incrementally with the context's
    /// configured chunking.
    pub fn play_stream_default(&self, source: SourceId, decoder: Box<dyn Decoder>) -> Result<(), AudioError> {
        self.play_stream(source, decoder, self.stream_chunk_frames, self.stream_queue_size)
    }

    /// Plays `decoder` on `source`, `chunk_frames` at a time across
    /// `queue_size` hardware buffers. The background worker keeps the queue
    /// filled until the decoder runs out.
    #[instrument(skip(self, decoder))]
    pub fn play_stream(
        &self,
        source: SourceId,
        decoder: Box<dyn Decoder>,
        chunk_frames: u32,
        queue_size: u32,
    ) -> Result<(), AudioError> {
        self.check()?;
        if chunk_frames == 0 || queue_size == 0 {
            return Err(AudioError::InvalidOperation(
                "Stream chunk and queue sizes must be non-zero".to_string(),
            ));
        }
        let format = self.resolve_format(decoder.channel_config(), decoder.sample_type())?;

        let evicted = {
            let mut pool = self.sources.lock();
            let hardware = self.hardware.as_ref();
            let (voice, evicted) = self.claim_voice(&mut pool, source)?;

            let mut stream = match StreamState::new(hardware, decoder, format, chunk_frames, queue_size) {
                Ok(stream) => stream,
                Err(e) => {
                    pool.return_voice(voice);
                    drop(pool);
                    self.notify_evicted(evicted);
                    return Err(e);
                }
            };
            let started = stream.prime(hardware, voice).and_then(|queued| {
                if queued == 0 {
                    return Err(AudioError::EmptyResource(format!("No samples to stream on {}", source)));
                }
                hardware.source_set_looping(voice, false)?;
                hardware.source_play(voice)?;
                Ok(())
            });
            if let Err(e) = started {
                let _ = hardware.source_stop(voice);
                let _ = hardware.source_set_buffer(voice, None);
                stream.release(hardware);
                pool.return_voice(voice);
                drop(pool);
                self.notify_evicted(evicted);
                return Err(e);
            }

            let slot = pool.slot_mut(source)?;
            slot.voice = Some(voice);
            slot.stream = Some(stream);
            slot.state = PlaybackState::Playing;
            self.loader.add_stream(source);
            debug!(target: LOG_TARGET, "{} streaming on {}", source, voice);
            evicted
        };
        self.notify_evicted(evicted);
        self.ensure_worker()
    }

    pub fn pause(&self, source: SourceId) -> Result<(), AudioError> {
        self.check()?;
        let mut pool = self.sources.lock();
        let slot = pool.slot_mut(source)?;
        if slot.state != PlaybackState::Playing {
            return Ok(());
        }
        if let Some(voice) = slot.voice {
            self.hardware.source_pause(voice)?;
        }
        slot.state = PlaybackState::Paused;
        Ok(())
    }

    pub fn resume(&self, source: SourceId) -> Result<(), AudioError> {
        self.check()?;
        let mut pool = self.sources.lock();
        let slot = pool.slot_mut(source)?;
        if slot.state != PlaybackState::Paused {
            return Ok(());
        }
        if let Some(voice) = slot.voice {
            self.hardware.source_play(voice)?;
        }
        slot.state = PlaybackState::Playing;
        Ok(())
    }

    /// Stops `source` and hands its voice back to the pool. No notification
    /// is sent for an explicit stop.
    pub fn stop(&self, source: SourceId) -> Result<(), AudioError> {
        self.check()?;
        {
            let mut pool = self.sources.lock();
            let slot = pool.slot_mut(source)?;
            if let Some(voice) = slot.make_stopped(self.hardware.as_ref(), source) {
                pool.return_voice(voice);
            }
            self.loader.remove_stream(source);
        }
        Ok(())
    }

    /// Services one streaming source. Returns false once the source no
    /// longer needs servicing.
    pub(crate) fn update_stream(&self, source: SourceId) -> bool {
        let hardware = self.hardware.as_ref();
        let stopped = {
            let mut pool = self.sources.lock();
            let slot = match pool.slot_mut(source) {
                Ok(slot) => slot,
                Err(_) => {
                    self.loader.remove_stream(source);
                    return false;
                }
            };
            let active = match (slot.state, slot.voice, slot.stream.as_mut()) {
                (PlaybackState::Playing, Some(voice), Some(stream)) => Some(stream.refill(hardware, voice, false)),
                (PlaybackState::Paused, Some(voice), Some(stream)) => Some(stream.refill(hardware, voice, true)),
                _ => None,
            };
            let progress = match active {
                Some(progress) => progress,
                None => {
                    self.loader.remove_stream(source);
                    return false;
                }
            };
            match progress {
                Ok(StreamProgress::Active) => return true,
                Ok(StreamProgress::Finished) => {
                    debug!(target: LOG_TARGET, "Stream on {} finished", source);
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, "Stream on {} failed: {}", source, e);
                }
            }
            if let Some(voice) = slot.make_stopped(hardware, source) {
                pool.return_voice(voice);
            }
            // Leave the set before the handler runs so a restart from the
            // notification registers afresh.
            self.loader.remove_stream(source);
            source
        };
        self.message_handler().source_stopped(stopped, false);
        false
    }

    /// Polls every used source for natural completion, nudges the worker
    /// when no wake interval is set and watches for device loss.
    #[instrument(skip(self), fields(context = self.id))]
    pub fn update(&self) -> Result<(), AudioError> {
        self.check()?;
        let hardware = self.hardware.as_ref();
        let mut stopped = Vec::new();
        {
            let mut pool = self.sources.lock();
            let used = pool.used().to_vec();
            for id in used {
                let slot = match pool.slot_mut(id) {
                    Ok(slot) => slot,
                    Err(e) => {
                        warn!(target: LOG_TARGET, "Skipping {} during update: {}", id, e);
                        continue;
                    }
                };
                if slot.state != PlaybackState::Playing || slot.is_streaming() {
                    continue;
                }
                let voice = match slot.voice {
                    Some(voice) => voice,
                    None => continue,
                };
                let state = match hardware.source_state(voice) {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(target: LOG_TARGET, "Could not query {} for {}: {}", voice, id, e);
                        continue;
                    }
                };
                if state == VoiceState::Stopped {
                    if let Some(voice) = slot.make_stopped(hardware, id) {
                        pool.return_voice(voice);
                    }
                    stopped.push(id);
                }
            }
        }

        let handler = self.message_handler();
        for id in stopped {
            trace!(target: LOG_TARGET, "{} finished playing", id);
            handler.source_stopped(id, false);
        }

        if self.loader.wake_interval() == 0 {
            self.loader.nudge();
        }

        if self.has_extension(Extension::EXT_disconnect)
            && self.connected.load(Ordering::Acquire)
            && !hardware.is_connected()
        {
            self.connected.store(false, Ordering::Release);
            warn!(target: LOG_TARGET, "Device for context {} disconnected", self.id);
            handler.device_disconnected();
        }
        Ok(())
    }

    pub fn live_sources(&self) -> usize {
        self.sources.live_count()
    }

    pub fn allocated_sources(&self) -> usize {
        self.sources.allocated_count()
    }

    pub fn idle_voices(&self) -> usize {
        self.sources.idle_voices()
    }

    pub fn streaming_count(&self) -> usize {
        self.loader.streaming_count()
    }

    pub fn is_streaming(&self, source: SourceId) -> bool {
        self.loader.is_streaming(source)
    }

    pub fn loader_running(&self) -> bool {
        self.loader.is_running()
    }

    /// Tears the context down. Refused while it is bound anywhere or still
    /// owns buffers. Stops and joins the background worker; loads still
    /// queued are dropped unexecuted.
    #[instrument(skip(self), fields(context = self.id))]
    pub fn destroy(&self) -> Result<(), AudioError> {
        if self.is_destroyed() {
            return Err(AudioError::InvalidOperation(format!(
                "Context {} already destroyed",
                self.id
            )));
        }
        if self.ref_count() != 0 {
            return Err(AudioError::InvalidOperation("Trying to destroy an in-use context".to_string()));
        }
        if !self.buffers.is_empty() {
            return Err(AudioError::InvalidOperation(
                "Trying to destroy a context with buffers".to_string(),
            ));
        }

        self.loader.request_quit();
        self.notify_binding_changed();
        let dropped = self.loader.join();

        // The hardware frees the context's voices along with it.
        let abandoned = self.sources.lock().drain_unbound();
        self.destroyed.store(true, Ordering::Release);
        self.hardware.destroy_context(self.hw);
        info!(
            target: LOG_TARGET,
            "Destroyed context {} ({} sources abandoned, {} loads dropped)",
            self.id, abandoned, dropped
        );
        Ok(())
    }
}
