use crate::audio::decoder::{Decoder, DecoderRegistry, MediaStream};
use crate::audio::error::AudioError;
use crate::audio::message::MessageHandler;
use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument, warn};

const LOG_TARGET: &str = "voicepool::audio::file_io";

/// Resolves resource names to byte streams.
pub trait FileIOFactory: Send + Sync {
    fn open_file(&self, name: &str) -> Option<Box<dyn MediaStream>>;
}

/// Opens names as paths on the local filesystem.
#[derive(Debug, Default)]
pub struct DefaultFileIOFactory;

impl FileIOFactory for DefaultFileIOFactory {
    fn open_file(&self, name: &str) -> Option<Box<dyn MediaStream>> {
        match File::open(name) {
            Ok(file) => Some(Box::new(BufReader::new(file))),
            Err(e) => {
                debug!(target: LOG_TARGET, "Could not open {}: {}", name, e);
                None
            }
        }
    }
}

/// Turns resource names into decoders: file lookup, substitution through
/// the message handler, then decoder selection.
pub struct ResourceResolver {
    decoders: DecoderRegistry,
    file_factory: RwLock<Arc<dyn FileIOFactory>>,
}

impl ResourceResolver {
    pub fn new() -> Self {
        Self::with_registry(DecoderRegistry::new())
    }

    pub fn with_registry(decoders: DecoderRegistry) -> Self {
        ResourceResolver {
            decoders,
            file_factory: RwLock::new(Arc::new(DefaultFileIOFactory)),
        }
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    /// Installs a new file factory and returns the previous one.
    pub fn set_file_factory(&self, factory: Arc<dyn FileIOFactory>) -> Arc<dyn FileIOFactory> {
        let mut slot = self.file_factory.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, factory)
    }

    pub fn file_factory(&self) -> Arc<dyn FileIOFactory> {
        self.file_factory.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Opens `name` and selects a decoder for it. When the name cannot be
    /// opened, `handler` may offer substitutes until one opens.
    #[instrument(skip(self, handler))]
    pub fn create_decoder(
        &self,
        name: &str,
        handler: &dyn MessageHandler,
    ) -> Result<Box<dyn Decoder>, AudioError> {
        let factory = self.file_factory();
        if let Some(stream) = factory.open_file(name) {
            return self.decoders.select(name, stream);
        }

        let mut current = name.to_string();
        loop {
            let substitute = handler
                .resource_not_found(&current)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| AudioError::ResourceNotFound(format!("Failed to open {}", current)))?;
            info!(target: LOG_TARGET, "Substituting \"{}\" for missing \"{}\"", substitute, current);
            current = substitute;
            match factory.open_file(&current) {
                Some(stream) => return self.decoders.select(&current, stream),
                None => warn!(target: LOG_TARGET, "Substitute \"{}\" could not be opened either", current),
            }
        }
    }
}

impl Default for ResourceResolver {
    fn default() -> Self {
        Self::new()
    }
}
