//! An in-process output device implementing [`HardwareApi`].
//!
//! Voices "play" against a clock: a static buffer stops once its duration
//! has elapsed, queued buffers move to the processed list as they are
//! played through. The clock is either wall time or advanced by hand for
//! deterministic tests.

use crate::audio::extensions::{Extension, ExtensionTable};
use crate::audio::format::HwFormat;
use crate::audio::hardware::{HardwareApi, HwBufferId, HwContext, HwError, VoiceId, VoiceState};
use crate::config::Settings;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const LOG_TARGET: &str = "voicepool::audio::virtual_device";

#[derive(Debug, Default)]
struct BufferData {
    frames: u64,
    frequency: u32,
    loop_points: (u32, u32),
}

impl BufferData {
    fn duration(&self) -> Duration {
        if self.frequency == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((u128::from(self.frames) * 1_000_000_000 / u128::from(self.frequency)) as u64)
    }
}

#[derive(Debug)]
struct Voice {
    owner: HwContext,
    buffer: Option<u32>,
    queue: VecDeque<u32>,
    processed: Vec<u32>,
    state: VoiceState,
    looping: bool,
    /// Time played into the current buffer.
    offset: Duration,
    last_tick: Duration,
}

impl Voice {
    fn new(owner: HwContext) -> Self {
        Voice {
            owner,
            buffer: None,
            queue: VecDeque::new(),
            processed: Vec::new(),
            state: VoiceState::Initial,
            looping: false,
            offset: Duration::ZERO,
            last_tick: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    contexts: HashSet<u32>,
    next_context: u32,
    global: Option<HwContext>,
    thread_bindings: HashMap<ThreadId, HwContext>,
    voices: HashMap<u32, Voice>,
    next_voice: u32,
    buffers: HashMap<u32, BufferData>,
    next_buffer: u32,
    connected: bool,
    manual_now: Option<Duration>,
}

impl DeviceState {
    fn binding(&self) -> Option<HwContext> {
        self.thread_bindings
            .get(&thread::current().id())
            .copied()
            .or(self.global)
    }

    fn require_context(&self) -> Result<HwContext, HwError> {
        self.binding().ok_or(HwError::NoContext)
    }

    fn voice_mut(&mut self, voice: VoiceId) -> Result<&mut Voice, HwError> {
        let ctx = self.require_context()?;
        match self.voices.get_mut(&voice.0) {
            Some(v) if v.owner == ctx => Ok(v),
            _ => Err(HwError::InvalidName(voice.0)),
        }
    }

    /// Plays `voice` forward to `now`.
    fn advance_voice(&mut self, voice: VoiceId, now: Duration) -> Result<(), HwError> {
        let ctx = self.require_context()?;
        let DeviceState { voices, buffers, .. } = self;
        let v = match voices.get_mut(&voice.0) {
            Some(v) if v.owner == ctx => v,
            _ => return Err(HwError::InvalidName(voice.0)),
        };
        if v.state != VoiceState::Playing {
            v.last_tick = now;
            return Ok(());
        }
        v.offset += now.saturating_sub(v.last_tick);
        v.last_tick = now;

        let duration_of = |id: &u32| buffers.get(id).map(BufferData::duration).unwrap_or_default();
        if let Some(id) = v.buffer {
            let total = duration_of(&id);
            if v.offset >= total {
                if v.looping && !total.is_zero() {
                    v.offset = Duration::from_nanos((v.offset.as_nanos() % total.as_nanos()) as u64);
                } else {
                    v.offset = Duration::ZERO;
                    v.state = VoiceState::Stopped;
                }
            }
            return Ok(());
        }

        while let Some(head) = v.queue.front().copied() {
            let total = duration_of(&head);
            if v.offset < total {
                break;
            }
            v.offset -= total;
            v.queue.pop_front();
            v.processed.push(head);
        }
        if v.queue.is_empty() {
            v.offset = Duration::ZERO;
            v.state = VoiceState::Stopped;
        }
        Ok(())
    }
}

/// Construction options for [`VirtualDevice`].
#[derive(Debug, Clone)]
pub struct VirtualDeviceBuilder {
    max_voices: usize,
    thread_local: bool,
    extensions: Vec<Extension>,
    manual_clock: bool,
}

impl Default for VirtualDeviceBuilder {
    fn default() -> Self {
        VirtualDeviceBuilder {
            max_voices: 64,
            thread_local: true,
            extensions: Extension::all().collect(),
            manual_clock: false,
        }
    }
}

impl VirtualDeviceBuilder {
    /// Total voices the device can allocate across all contexts.
    pub fn max_voices(mut self, count: usize) -> Self {
        self.max_voices = count;
        self
    }

    pub fn thread_local(mut self, supported: bool) -> Self {
        self.thread_local = supported;
        self
    }

    /// Replaces the advertised capability set.
    pub fn extensions(mut self, exts: &[Extension]) -> Self {
        self.extensions = exts.to_vec();
        self
    }

    /// Freezes the clock; it only moves through [`VirtualDevice::advance`].
    pub fn manual_clock(mut self) -> Self {
        self.manual_clock = true;
        self
    }

    pub fn build(self) -> VirtualDevice {
        let table = ExtensionTable::with(&self.extensions);
        let names = self.extensions.iter().map(|e| e.name()).collect();
        info!(
            target: LOG_TARGET,
            "Virtual device: {} voices, thread-local {}, {} extensions",
            self.max_voices,
            self.thread_local,
            self.extensions.len()
        );
        VirtualDevice {
            max_voices: self.max_voices,
            thread_local: self.thread_local,
            extension_names: names,
            extensions: table,
            start: Instant::now(),
            state: Mutex::new(DeviceState {
                connected: true,
                manual_now: self.manual_clock.then_some(Duration::ZERO),
                next_context: 1,
                next_voice: 1,
                next_buffer: 1,
                ..DeviceState::default()
            }),
        }
    }
}

pub struct VirtualDevice {
    max_voices: usize,
    thread_local: bool,
    extension_names: HashSet<&'static str>,
    extensions: ExtensionTable,
    start: Instant,
    state: Mutex<DeviceState>,
}

impl Default for VirtualDevice {
    fn default() -> Self {
        VirtualDeviceBuilder::default().build()
    }
}

impl VirtualDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> VirtualDeviceBuilder {
        VirtualDeviceBuilder::default()
    }

    /// A wall-clock device sized by `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::builder()
            .max_voices(settings.virtual_voices)
            .thread_local(settings.thread_local_binding)
            .build()
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self, state: &DeviceState) -> Duration {
        state.manual_now.unwrap_or_else(|| self.start.elapsed())
    }

    /// Moves a manual clock forward. Ignored on a wall-clock device.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state();
        match state.manual_now.as_mut() {
            Some(now) => *now += by,
            None => warn!(target: LOG_TARGET, "advance() ignored on a wall-clock device"),
        }
    }

    /// Simulates losing the output device.
    pub fn disconnect(&self) {
        warn!(target: LOG_TARGET, "Virtual device disconnected");
        self.state().connected = false;
    }

    pub fn max_voices(&self) -> usize {
        self.max_voices
    }

    /// Voices allocated across all contexts.
    pub fn voice_count(&self) -> usize {
        self.state().voices.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn context_count(&self) -> usize {
        self.state().contexts.len()
    }

    /// Frames uploaded to `buffer`, if it exists.
    pub fn buffer_frames(&self, buffer: HwBufferId) -> Option<u64> {
        self.state().buffers.get(&buffer.0).map(|b| b.frames)
    }

    pub fn buffer_loop_points(&self, buffer: HwBufferId) -> Option<(u32, u32)> {
        self.state().buffers.get(&buffer.0).map(|b| b.loop_points)
    }

    /// The global binding, ignoring any thread override.
    pub fn global_context(&self) -> Option<HwContext> {
        self.state().global
    }
}

impl HardwareApi for VirtualDevice {
    fn create_context(&self) -> Result<HwContext, HwError> {
        let mut state = self.state();
        if !state.connected {
            return Err(HwError::Disconnected);
        }
        let id = state.next_context;
        state.next_context += 1;
        state.contexts.insert(id);
        debug!(target: LOG_TARGET, "Created hardware context {}", id);
        Ok(HwContext(id))
    }

    fn destroy_context(&self, ctx: HwContext) {
        let mut state = self.state();
        if !state.contexts.remove(&ctx.0) {
            warn!(target: LOG_TARGET, "Destroying unknown hardware context {}", ctx.0);
            return;
        }
        state.voices.retain(|_, v| v.owner != ctx);
        if state.global == Some(ctx) {
            state.global = None;
        }
        state.thread_bindings.retain(|_, c| *c != ctx);
        debug!(target: LOG_TARGET, "Destroyed hardware context {}", ctx.0);
    }

    fn make_context_current(&self, ctx: Option<HwContext>) -> Result<(), HwError> {
        let mut state = self.state();
        if let Some(ctx) = ctx {
            if !state.contexts.contains(&ctx.0) {
                return Err(HwError::InvalidName(ctx.0));
            }
        }
        state.global = ctx;
        Ok(())
    }

    fn supports_thread_local(&self) -> bool {
        self.thread_local
    }

    fn set_thread_context(&self, ctx: Option<HwContext>) -> Result<(), HwError> {
        if !self.thread_local {
            return Err(HwError::Unsupported);
        }
        let mut state = self.state();
        let tid = thread::current().id();
        match ctx {
            Some(ctx) => {
                if !state.contexts.contains(&ctx.0) {
                    return Err(HwError::InvalidName(ctx.0));
                }
                state.thread_bindings.insert(tid, ctx);
            }
            None => {
                state.thread_bindings.remove(&tid);
            }
        }
        Ok(())
    }

    fn current_context(&self) -> Option<HwContext> {
        self.state().binding()
    }

    fn is_extension_present(&self, name: &str) -> bool {
        self.extension_names.contains(name)
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn gen_source(&self) -> Result<VoiceId, HwError> {
        let mut state = self.state();
        let ctx = state.require_context()?;
        if state.voices.len() >= self.max_voices {
            return Err(HwError::OutOfResources);
        }
        let id = state.next_voice;
        state.next_voice += 1;
        state.voices.insert(id, Voice::new(ctx));
        trace!(target: LOG_TARGET, "gen_source -> {}", id);
        Ok(VoiceId(id))
    }

    fn delete_source(&self, voice: VoiceId) {
        let mut state = self.state();
        if state.voice_mut(voice).is_ok() {
            state.voices.remove(&voice.0);
        }
    }

    fn source_set_buffer(&self, voice: VoiceId, buffer: Option<HwBufferId>) -> Result<(), HwError> {
        let mut state = self.state();
        if let Some(buffer) = buffer {
            if !state.buffers.contains_key(&buffer.0) {
                return Err(HwError::InvalidName(buffer.0));
            }
        }
        let v = state.voice_mut(voice)?;
        if v.state == VoiceState::Playing || v.state == VoiceState::Paused {
            return Err(HwError::InvalidValue(format!("{} is active", voice)));
        }
        v.buffer = buffer.map(|b| b.0);
        v.queue.clear();
        v.processed.clear();
        v.offset = Duration::ZERO;
        v.state = VoiceState::Initial;
        Ok(())
    }

    fn source_set_looping(&self, voice: VoiceId, looping: bool) -> Result<(), HwError> {
        self.state().voice_mut(voice)?.looping = looping;
        Ok(())
    }

    fn source_play(&self, voice: VoiceId) -> Result<(), HwError> {
        let mut state = self.state();
        let now = self.now(&state);
        state.advance_voice(voice, now)?;
        let v = state.voice_mut(voice)?;
        if v.state != VoiceState::Paused {
            v.offset = Duration::ZERO;
        }
        v.last_tick = now;
        v.state = if v.buffer.is_some() || !v.queue.is_empty() {
            VoiceState::Playing
        } else {
            VoiceState::Stopped
        };
        Ok(())
    }

    fn source_pause(&self, voice: VoiceId) -> Result<(), HwError> {
        let mut state = self.state();
        let now = self.now(&state);
        state.advance_voice(voice, now)?;
        let v = state.voice_mut(voice)?;
        if v.state == VoiceState::Playing {
            v.state = VoiceState::Paused;
        }
        Ok(())
    }

    fn source_stop(&self, voice: VoiceId) -> Result<(), HwError> {
        let mut state = self.state();
        let v = state.voice_mut(voice)?;
        let pending: Vec<u32> = v.queue.drain(..).collect();
        v.processed.extend(pending);
        v.offset = Duration::ZERO;
        if v.state != VoiceState::Initial {
            v.state = VoiceState::Stopped;
        }
        Ok(())
    }

    fn source_state(&self, voice: VoiceId) -> Result<VoiceState, HwError> {
        let mut state = self.state();
        let now = self.now(&state);
        state.advance_voice(voice, now)?;
        Ok(state.voice_mut(voice)?.state)
    }

    fn source_queue_buffers(&self, voice: VoiceId, buffers: &[HwBufferId]) -> Result<(), HwError> {
        let mut state = self.state();
        if let Some(missing) = buffers.iter().find(|b| !state.buffers.contains_key(&b.0)) {
            return Err(HwError::InvalidName(missing.0));
        }
        let v = state.voice_mut(voice)?;
        if v.buffer.is_some() {
            return Err(HwError::InvalidValue(format!("{} has a static buffer", voice)));
        }
        v.queue.extend(buffers.iter().map(|b| b.0));
        Ok(())
    }

    fn source_unqueue_processed(&self, voice: VoiceId) -> Result<Vec<HwBufferId>, HwError> {
        let mut state = self.state();
        let now = self.now(&state);
        state.advance_voice(voice, now)?;
        let v = state.voice_mut(voice)?;
        Ok(v.processed.drain(..).map(HwBufferId).collect())
    }

    fn source_buffers_queued(&self, voice: VoiceId) -> Result<usize, HwError> {
        let mut state = self.state();
        let now = self.now(&state);
        state.advance_voice(voice, now)?;
        Ok(state.voice_mut(voice)?.queue.len())
    }

    fn gen_buffer(&self) -> Result<HwBufferId, HwError> {
        let mut state = self.state();
        state.require_context()?;
        let id = state.next_buffer;
        state.next_buffer += 1;
        state.buffers.insert(id, BufferData::default());
        trace!(target: LOG_TARGET, "gen_buffer -> {}", id);
        Ok(HwBufferId(id))
    }

    fn delete_buffer(&self, buffer: HwBufferId) {
        let mut state = self.state();
        if state.require_context().is_err() {
            warn!(target: LOG_TARGET, "delete_buffer({}) with no context current", buffer);
        }
        state.buffers.remove(&buffer.0);
    }

    fn buffer_data(&self, buffer: HwBufferId, format: HwFormat, data: &[u8], frequency: u32) -> Result<(), HwError> {
        let mut state = self.state();
        state.require_context()?;
        if HwFormat::resolve(format.channels, format.sample_type, &self.extensions).is_none() {
            return Err(HwError::InvalidValue(format!(
                "format {} {} not supported",
                format.channels, format.sample_type
            )));
        }
        let frame_size = format.frame_size() as usize;
        if frequency == 0 || frame_size == 0 || data.len() % frame_size != 0 {
            return Err(HwError::InvalidValue(format!(
                "{} bytes at {}hz is not a whole number of frames",
                data.len(),
                frequency
            )));
        }
        let entry = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(HwError::InvalidName(buffer.0))?;
        entry.frames = (data.len() / frame_size) as u64;
        entry.frequency = frequency;
        entry.loop_points = (0, entry.frames as u32);
        Ok(())
    }

    fn buffer_set_loop_points(&self, buffer: HwBufferId, start: u32, end: u32) -> Result<(), HwError> {
        if !self.extensions.has(Extension::SOFT_loop_points) {
            return Err(HwError::Unsupported);
        }
        let mut state = self.state();
        state.require_context()?;
        let entry = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(HwError::InvalidName(buffer.0))?;
        if start >= end || u64::from(end) > entry.frames {
            return Err(HwError::InvalidValue(format!("loop points {}..{} out of range", start, end)));
        }
        entry.loop_points = (start, end);
        Ok(())
    }
}
