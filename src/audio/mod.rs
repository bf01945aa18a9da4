//! Voice pooling, buffer caching and background loading on top of a
//! handle-based hardware audio API.

mod binding;
mod buffer;
mod buffer_registry;
mod context;
mod decoder;
pub mod decoders;
mod error;
mod extensions;
mod file_io;
mod format;
mod hardware;
mod loader;
mod message;
mod source;
mod source_pool;
mod virtual_device;

pub use binding::BindingManager;
pub use buffer::{normalize_loop_points, Buffer, BufferLoadStatus};
pub use buffer_registry::BufferRegistry;
pub use context::Context;
pub use decoder::{Decoder, DecoderFactory, DecoderRegistry, MediaStream};
pub use error::AudioError;
pub use extensions::{Extension, ExtensionTable};
pub use file_io::{DefaultFileIOFactory, FileIOFactory, ResourceResolver};
pub use format::{bytes_to_frames, frames_to_bytes, ChannelConfig, HwFormat, SampleType};
pub use hardware::{HardwareApi, HwBufferId, HwContext, HwError, VoiceId, VoiceState};
pub use loader::AsyncLoader;
pub use message::{MessageHandler, NullMessageHandler};
pub use source::{PlaybackState, SourceId};
pub use source_pool::SourcePool;
pub use virtual_device::{VirtualDevice, VirtualDeviceBuilder};
