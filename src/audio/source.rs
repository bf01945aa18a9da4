use crate::audio::buffer::Buffer;
use crate::audio::decoder::Decoder;
use crate::audio::error::AudioError;
use crate::audio::format::{frames_to_bytes, HwFormat};
use crate::audio::hardware::{HardwareApi, HwBufferId, VoiceId, VoiceState};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const LOG_TARGET: &str = "voicepool::audio::source";

/// Generation-checked handle to a pooled source. A handle goes stale when
/// its source is released, even though the slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId {
    index: u32,
    generation: u32,
}

impl SourceId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        SourceId { index, generation }
    }

    /// Arena slot this handle addresses.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}.{}", self.index, self.generation)
    }
}

/// Lifecycle of a playback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// Incremental playback state of a streaming source.
pub(crate) struct StreamState {
    decoder: Box<dyn Decoder>,
    format: HwFormat,
    frequency: u32,
    chunk_frames: u32,
    buffers: Vec<HwBufferId>,
    scratch: Vec<u8>,
    exhausted: bool,
}

/// What a streaming update concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamProgress {
    /// Still has queued or undecoded data.
    Active,
    /// Decoder exhausted and every queued buffer was played.
    Finished,
}

impl StreamState {
    /// Allocates `queue_size` hardware buffers for the stream.
    pub(crate) fn new(
        hardware: &dyn HardwareApi,
        decoder: Box<dyn Decoder>,
        format: HwFormat,
        chunk_frames: u32,
        queue_size: u32,
    ) -> Result<Self, AudioError> {
        let mut buffers = Vec::with_capacity(queue_size as usize);
        for _ in 0..queue_size {
            match hardware.gen_buffer() {
                Ok(id) => buffers.push(id),
                Err(e) => {
                    for id in buffers {
                        hardware.delete_buffer(id);
                    }
                    return Err(e.into());
                }
            }
        }
        let frequency = decoder.frequency();
        let scratch = vec![0u8; frames_to_bytes(u64::from(chunk_frames), format.channels, format.sample_type) as usize];
        Ok(StreamState {
            decoder,
            format,
            frequency,
            chunk_frames,
            buffers,
            scratch,
            exhausted: false,
        })
    }

    /// Decodes one chunk into `buffer`. Returns false once the decoder has
    /// nothing left.
    fn fill(&mut self, hardware: &dyn HardwareApi, buffer: HwBufferId) -> Result<bool, AudioError> {
        if self.exhausted {
            return Ok(false);
        }
        let frames = self.decoder.read(&mut self.scratch, self.chunk_frames);
        if frames == 0 {
            trace!(target: LOG_TARGET, "Stream decoder exhausted.");
            self.exhausted = true;
            return Ok(false);
        }
        let bytes = frames_to_bytes(u64::from(frames), self.format.channels, self.format.sample_type) as usize;
        hardware.buffer_data(buffer, self.format, &self.scratch[..bytes], self.frequency)?;
        Ok(true)
    }

    /// Fills and queues the initial chunks on `voice`.
    pub(crate) fn prime(&mut self, hardware: &dyn HardwareApi, voice: VoiceId) -> Result<usize, AudioError> {
        let ids = self.buffers.clone();
        let mut queued = 0;
        for id in ids {
            if !self.fill(hardware, id)? {
                break;
            }
            hardware.source_queue_buffers(voice, &[id])?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Recycles processed buffers with fresh chunks. Restarts the voice if
    /// it ran dry while data was still queued.
    pub(crate) fn refill(
        &mut self,
        hardware: &dyn HardwareApi,
        voice: VoiceId,
        paused: bool,
    ) -> Result<StreamProgress, AudioError> {
        let processed = hardware.source_unqueue_processed(voice)?;
        for id in processed {
            if self.fill(hardware, id)? {
                hardware.source_queue_buffers(voice, &[id])?;
            }
        }
        let queued = hardware.source_buffers_queued(voice)?;
        if queued == 0 && self.exhausted {
            return Ok(StreamProgress::Finished);
        }
        if !paused && queued > 0 && hardware.source_state(voice)? == VoiceState::Stopped {
            warn!(target: LOG_TARGET, "Stream on {} underran; restarting.", voice);
            hardware.source_play(voice)?;
        }
        Ok(StreamProgress::Active)
    }

    pub(crate) fn release(self, hardware: &dyn HardwareApi) {
        for id in self.buffers {
            hardware.delete_buffer(id);
        }
    }
}

/// Arena entry backing a [`SourceId`].
pub(crate) struct SourceSlot {
    pub generation: u32,
    pub live: bool,
    pub priority: u32,
    pub voice: Option<VoiceId>,
    pub state: PlaybackState,
    pub buffer: Option<Arc<Buffer>>,
    pub stream: Option<StreamState>,
    pub looping: bool,
}

impl SourceSlot {
    pub(crate) fn new(priority: u32) -> Self {
        SourceSlot {
            generation: 0,
            live: true,
            priority,
            voice: None,
            state: PlaybackState::Initial,
            buffer: None,
            stream: None,
            looping: false,
        }
    }

    /// Puts a recycled slot back into its initial configuration.
    pub(crate) fn revive(&mut self, priority: u32) {
        self.live = true;
        self.priority = priority;
        self.state = PlaybackState::Initial;
        self.looping = false;
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Stops hardware playback, detaches the buffer or stream and hands the
    /// voice back to the caller for the free stack.
    pub(crate) fn make_stopped(&mut self, hardware: &dyn HardwareApi, id: SourceId) -> Option<VoiceId> {
        if let Some(voice) = self.voice {
            if let Err(e) = hardware.source_stop(voice) {
                warn!(target: LOG_TARGET, "Failed to stop {} for {}: {}", voice, id, e);
            }
            if let Err(e) = hardware.source_set_buffer(voice, None) {
                warn!(target: LOG_TARGET, "Failed to detach {} for {}: {}", voice, id, e);
            }
            if let Err(e) = hardware.source_set_looping(voice, false) {
                trace!(target: LOG_TARGET, "Failed to reset looping on {}: {}", voice, e);
            }
        }
        if let Some(buffer) = self.buffer.take() {
            buffer.remove_source(id);
        }
        if let Some(stream) = self.stream.take() {
            stream.release(hardware);
        }
        if self.state != PlaybackState::Initial {
            self.state = PlaybackState::Stopped;
        }
        let voice = self.voice.take();
        if let Some(voice) = voice {
            debug!(target: LOG_TARGET, "{} released {}", id, voice);
        }
        voice
    }
}
