use crate::audio::error::AudioError;
use crate::audio::format::{ChannelConfig, SampleType};
use crate::audio::source::SourceId;

/// Receives diagnostic events from a context. Every method defaults to a
/// no-op; at most one handler is installed per context.
///
/// Handlers are always invoked with no internal lock held, so they may call
/// back into the context.
pub trait MessageHandler: Send + Sync {
    /// The output device stopped responding.
    fn device_disconnected(&self) {}

    /// A source stopped playing. `forced` is set when it was evicted to free
    /// its voice for a higher-priority request.
    fn source_stopped(&self, _source: SourceId, _forced: bool) {}

    /// A buffer is about to be uploaded with the given decoded data.
    fn buffer_loading(
        &self,
        _name: &str,
        _channels: ChannelConfig,
        _sample_type: SampleType,
        _frequency: u32,
        _data: &[u8],
    ) {
    }

    /// A background load ended in the failed state.
    fn buffer_load_failed(&self, _name: &str, _error: &AudioError) {}

    /// `name` could not be opened. Return a substitute name to try, or
    /// `None` to give up.
    fn resource_not_found(&self, _name: &str) -> Option<String> {
        None
    }
}

/// The handler installed when none has been set.
#[derive(Debug, Default)]
pub struct NullMessageHandler;

impl MessageHandler for NullMessageHandler {}
