use crate::audio::error::AudioError;
use crate::audio::format::{ChannelConfig, SampleType};
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

const LOG_TARGET: &str = "voicepool::audio::decoder";

/// A readable, rewindable byte stream handed to decoder factories.
pub trait MediaStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> MediaStream for T {}

/// Yields PCM frames for a single resource.
pub trait Decoder: Send {
    fn frequency(&self) -> u32;
    fn channel_config(&self) -> ChannelConfig;
    fn sample_type(&self) -> SampleType;

    /// Total length in sample frames, or 0 when unknown.
    fn length(&self) -> u64;

    /// Decodes up to `frames` interleaved frames into `dst` and returns how
    /// many were written. Returns 0 at end of stream.
    fn read(&mut self, dst: &mut [u8], frames: u32) -> u32;

    /// Loop start/end in frames. `start >= end` means "no loop points".
    fn loop_points(&self) -> (u64, u64) {
        (0, 0)
    }
}

/// Inspects a stream and produces a decoder for it.
///
/// A factory that accepts the stream takes it out of `stream`. A factory
/// that rejects it must leave it in place so the caller can rewind it for
/// the next factory; a rejecting factory that consumed the stream anyway
/// aborts decoder selection with an I/O error.
pub trait DecoderFactory: Send + Sync {
    fn create_decoder(&self, stream: &mut Option<Box<dyn MediaStream>>) -> Option<Box<dyn Decoder>>;
}

type NamedFactory = (String, Arc<dyn DecoderFactory>);

/// User-registered factories (tried first, in registration order) followed
/// by the built-in ones.
pub struct DecoderRegistry {
    custom: RwLock<Vec<NamedFactory>>,
    builtin: Vec<NamedFactory>,
}

impl DecoderRegistry {
    /// A registry with the built-in factories: custom containers first,
    /// the generic symphonia probe last.
    pub fn new() -> Self {
        Self::with_builtin(crate::audio::decoders::builtin_factories())
    }

    pub fn with_builtin(builtin: Vec<(&'static str, Arc<dyn DecoderFactory>)>) -> Self {
        DecoderRegistry {
            custom: RwLock::new(Vec::new()),
            builtin: builtin
                .into_iter()
                .map(|(name, factory)| (name.to_string(), factory))
                .collect(),
        }
    }

    pub fn register(&self, name: &str, factory: Arc<dyn DecoderFactory>) -> Result<(), AudioError> {
        let mut custom = self.custom.write().unwrap_or_else(|e| e.into_inner());
        if custom.iter().any(|(existing, _)| existing == name) {
            return Err(AudioError::InvalidOperation(format!(
                "Decoder factory \"{}\" already registered",
                name
            )));
        }
        debug!(target: LOG_TARGET, "Registered decoder factory \"{}\"", name);
        custom.push((name.to_string(), factory));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn DecoderFactory>> {
        let mut custom = self.custom.write().unwrap_or_else(|e| e.into_inner());
        let pos = custom.iter().position(|(existing, _)| existing == name)?;
        debug!(target: LOG_TARGET, "Unregistered decoder factory \"{}\"", name);
        Some(custom.remove(pos).1)
    }

    /// Tries every factory in order, rewinding the stream after each
    /// rejection. Fails with `IoError` if a rewind is impossible and with
    /// `UnsupportedFormat` if nobody accepts the stream.
    pub fn select(&self, name: &str, stream: Box<dyn MediaStream>) -> Result<Box<dyn Decoder>, AudioError> {
        let custom: Vec<NamedFactory> = self
            .custom
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut stream = Some(stream);
        for (factory_name, factory) in custom.iter().chain(self.builtin.iter()) {
            trace!(target: LOG_TARGET, "Trying decoder factory \"{}\" for {}", factory_name, name);
            if let Some(decoder) = factory.create_decoder(&mut stream) {
                debug!(target: LOG_TARGET, "Decoder factory \"{}\" accepted {}", factory_name, name);
                return Ok(decoder);
            }
            rewind(name, &mut stream)?;
        }
        Err(AudioError::UnsupportedFormat(format!("No decoder for {}", name)))
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn rewind(name: &str, stream: &mut Option<Box<dyn MediaStream>>) -> Result<(), AudioError> {
    let failed = |why: String| {
        AudioError::IoError(format!(
            "Failed to rewind {} for the next decoder factory: {}",
            name, why
        ))
    };
    match stream.as_mut() {
        Some(s) => s.seek(SeekFrom::Start(0)).map(|_| ()).map_err(|e| failed(e.to_string())),
        None => Err(failed("stream was consumed".to_string())),
    }
}
