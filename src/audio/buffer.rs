use crate::audio::decoder::Decoder;
use crate::audio::error::AudioError;
use crate::audio::extensions::{Extension, ExtensionTable};
use crate::audio::format::{frames_to_bytes, ChannelConfig, HwFormat, SampleType};
use crate::audio::hardware::{HardwareApi, HwBufferId};
use crate::audio::source::SourceId;
use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

const LOG_TARGET: &str = "voicepool::audio::buffer";

/// Frames requested per decoder read.
const READ_CHUNK_FRAMES: u64 = 16384;

/// Upper bound on memory reserved up front from a decoder's length claim.
const MAX_PREALLOC_BYTES: usize = 64 << 20;

/// Load progress of a buffer. Transitions are one-way out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLoadStatus {
    /// Hardware object allocated, samples not uploaded yet.
    Pending,
    Ready,
    /// The background load failed; the buffer will never become playable.
    Failed,
}

#[derive(Debug)]
struct BufferState {
    status: BufferLoadStatus,
    frames: u64,
    loop_points: (u64, u64),
}

/// Decoded audio content cached in a context under a unique name.
#[derive(Debug)]
pub struct Buffer {
    name: String,
    id: HwBufferId,
    frequency: u32,
    channels: ChannelConfig,
    sample_type: SampleType,
    state: Mutex<BufferState>,
    loaded: Condvar,
    sources: Mutex<Vec<SourceId>>,
}

/// The complete PCM content of a resource, ready for upload.
pub(crate) struct DecodedData {
    pub data: Vec<u8>,
    pub frames: u64,
    pub loop_points: (u64, u64),
}

/// Clamps decoder loop points into `[0, frames]`. Inverted or empty
/// ranges select the whole buffer.
pub fn normalize_loop_points(points: (u64, u64), frames: u64) -> (u64, u64) {
    let (start, end) = points;
    if start >= end {
        return (0, frames);
    }
    let end = end.min(frames);
    let start = start.min(end.saturating_sub(1));
    (start, end)
}

/// Reads the whole resource. Fails with `EmptyResource` if nothing decodes.
pub(crate) fn decode_all(
    decoder: &mut dyn Decoder,
    name: &str,
    length_hint: u64,
) -> Result<DecodedData, AudioError> {
    let frame_size = frames_to_bytes(1, decoder.channel_config(), decoder.sample_type()) as usize;
    let reserve = usize::try_from(length_hint)
        .ok()
        .and_then(|frames| frames.checked_mul(frame_size))
        .map_or(0, |bytes| bytes.min(MAX_PREALLOC_BYTES));
    let mut data = Vec::with_capacity(reserve);
    let mut frames = 0u64;
    loop {
        let want = if length_hint > 0 {
            if frames >= length_hint {
                break;
            }
            (length_hint - frames).min(READ_CHUNK_FRAMES)
        } else {
            READ_CHUNK_FRAMES
        };
        let start = data.len();
        data.resize(start + want as usize * frame_size, 0);
        let got = decoder.read(&mut data[start..], want as u32);
        data.truncate(start + got as usize * frame_size);
        frames += u64::from(got);
        if got == 0 {
            break;
        }
    }
    trace!(target: LOG_TARGET, "Decoded {} frames ({} bytes) for {}", frames, data.len(), name);

    if frames == 0 {
        return Err(AudioError::EmptyResource(format!("No samples for buffer {}", name)));
    }
    let loop_points = normalize_loop_points(decoder.loop_points(), frames);
    Ok(DecodedData { data, frames, loop_points })
}

/// Uploads decoded samples to a hardware buffer object.
pub(crate) fn upload(
    hardware: &dyn HardwareApi,
    id: HwBufferId,
    format: HwFormat,
    frequency: u32,
    decoded: &DecodedData,
    extensions: &ExtensionTable,
) -> Result<(), AudioError> {
    hardware.buffer_data(id, format, &decoded.data, frequency)?;
    if extensions.has(Extension::SOFT_loop_points) {
        let (start, end) = decoded.loop_points;
        hardware.buffer_set_loop_points(id, start as u32, end as u32)?;
    }
    Ok(())
}

impl Buffer {
    pub(crate) fn new(
        name: &str,
        id: HwBufferId,
        frequency: u32,
        channels: ChannelConfig,
        sample_type: SampleType,
    ) -> Self {
        Buffer {
            name: name.to_string(),
            id,
            frequency,
            channels,
            sample_type,
            state: Mutex::new(BufferState {
                status: BufferLoadStatus::Pending,
                frames: 0,
                loop_points: (0, 0),
            }),
            loaded: Condvar::new(),
            sources: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Leaves `Pending` for `Ready` and wakes every waiter. No-op if the
    /// buffer already left `Pending`.
    pub(crate) fn mark_ready(&self, frames: u64, loop_points: (u64, u64)) {
        let mut state = self.state();
        if state.status != BufferLoadStatus::Pending {
            return;
        }
        state.status = BufferLoadStatus::Ready;
        state.frames = frames;
        state.loop_points = loop_points;
        drop(state);
        debug!(target: LOG_TARGET, "Buffer {} ready ({} frames)", self.name, frames);
        self.loaded.notify_all();
    }

    pub(crate) fn mark_failed(&self) {
        let mut state = self.state();
        if state.status != BufferLoadStatus::Pending {
            return;
        }
        state.status = BufferLoadStatus::Failed;
        drop(state);
        self.loaded.notify_all();
    }

    /// Blocks until the buffer leaves `Pending` and returns the final status.
    pub fn wait_loaded(&self) -> BufferLoadStatus {
        let mut state = self.state();
        while state.status == BufferLoadStatus::Pending {
            state = self.loaded.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.status
    }

    pub fn load_status(&self) -> BufferLoadStatus {
        self.state().status
    }

    pub fn is_ready(&self) -> bool {
        self.load_status() == BufferLoadStatus::Ready
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn hw_id(&self) -> HwBufferId {
        self.id
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn channel_config(&self) -> ChannelConfig {
        self.channels
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    /// Length in sample frames; 0 until the buffer is ready.
    pub fn length(&self) -> u64 {
        self.state().frames
    }

    /// Size of the uploaded data in bytes.
    pub fn size(&self) -> u64 {
        frames_to_bytes(self.length(), self.channels, self.sample_type)
    }

    pub fn loop_points(&self) -> (u64, u64) {
        self.state().loop_points
    }

    pub(crate) fn store_loop_points(&self, start: u64, end: u64) {
        self.state().loop_points = (start, end);
    }

    /// Sources currently bound to this buffer.
    pub fn sources(&self) -> Vec<SourceId> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_in_use(&self) -> bool {
        !self.sources.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    pub(crate) fn add_source(&self, source: SourceId) {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    pub(crate) fn remove_source(&self, source: SourceId) {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| *s != source);
    }
}
