//! Handle-based hardware audio API consumed by the runtime.
//!
//! The model mirrors graphics-style APIs: a single mutable "current" binding
//! per process (optionally overridden per thread), and every object call
//! implicitly targets whatever binding is current on the calling thread.

use crate::audio::format::HwFormat;
use std::fmt;
use thiserror::Error;

/// Hardware binding handle (one per context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HwContext(pub u32);

/// Hardware voice handle. Scarce; owned by at most one source at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u32);

/// Hardware buffer object handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HwBufferId(pub u32);

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voice#{}", self.0)
    }
}

impl fmt::Display for HwBufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hwbuf#{}", self.0)
    }
}

/// Playback state reported by the hardware for a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// Error codes reported by hardware calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("no context is current on this thread")]
    NoContext,
    #[error("invalid name {0}")]
    InvalidName(u32),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("out of hardware resources")]
    OutOfResources,
    #[error("thread-local contexts unsupported")]
    Unsupported,
    #[error("device disconnected")]
    Disconnected,
}

/// The consumed hardware capability. Implementations must be usable from
/// several threads at once; binding state is tracked per calling thread.
pub trait HardwareApi: Send + Sync {
    fn create_context(&self) -> Result<HwContext, HwError>;
    fn destroy_context(&self, ctx: HwContext);

    /// Switches the process-wide binding.
    fn make_context_current(&self, ctx: Option<HwContext>) -> Result<(), HwError>;
    fn supports_thread_local(&self) -> bool;
    /// Overrides the binding for the calling thread only.
    fn set_thread_context(&self, ctx: Option<HwContext>) -> Result<(), HwError>;
    /// The calling thread's effective binding: thread-local first, else global.
    fn current_context(&self) -> Option<HwContext>;

    fn is_extension_present(&self, name: &str) -> bool;
    fn is_connected(&self) -> bool;

    fn gen_source(&self) -> Result<VoiceId, HwError>;
    fn delete_source(&self, voice: VoiceId);
    fn source_set_buffer(&self, voice: VoiceId, buffer: Option<HwBufferId>) -> Result<(), HwError>;
    fn source_set_looping(&self, voice: VoiceId, looping: bool) -> Result<(), HwError>;
    fn source_play(&self, voice: VoiceId) -> Result<(), HwError>;
    fn source_pause(&self, voice: VoiceId) -> Result<(), HwError>;
    fn source_stop(&self, voice: VoiceId) -> Result<(), HwError>;
    fn source_state(&self, voice: VoiceId) -> Result<VoiceState, HwError>;
    fn source_queue_buffers(&self, voice: VoiceId, buffers: &[HwBufferId]) -> Result<(), HwError>;
    fn source_unqueue_processed(&self, voice: VoiceId) -> Result<Vec<HwBufferId>, HwError>;
    fn source_buffers_queued(&self, voice: VoiceId) -> Result<usize, HwError>;

    fn gen_buffer(&self) -> Result<HwBufferId, HwError>;
    fn delete_buffer(&self, buffer: HwBufferId);
    fn buffer_data(
        &self,
        buffer: HwBufferId,
        format: HwFormat,
        data: &[u8],
        frequency: u32,
    ) -> Result<(), HwError>;
    fn buffer_set_loop_points(&self, buffer: HwBufferId, start: u32, end: u32) -> Result<(), HwError>;
}
