use crate::audio::buffer::Buffer;
use crate::audio::error::AudioError;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

const LOG_TARGET: &str = "voicepool::audio::buffer_registry";

/// Buffers of one context, kept sorted by name for binary search.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    entries: Mutex<Vec<Arc<Buffer>>>,
}

fn locate(entries: &[Arc<Buffer>], name: &str) -> Result<usize, usize> {
    entries.binary_search_by(|b| b.name().cmp(name))
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Arc<Buffer>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn find(&self, name: &str) -> Option<Arc<Buffer>> {
        let entries = self.entries();
        locate(&entries, name).ok().map(|idx| entries[idx].clone())
    }

    /// Inserts in sorted position. Duplicate names are rejected.
    pub fn insert(&self, buffer: Arc<Buffer>) -> Result<(), AudioError> {
        let mut entries = self.entries();
        match locate(&entries, buffer.name()) {
            Ok(_) => Err(AudioError::InvalidOperation(format!(
                "Buffer \"{}\" already exists",
                buffer.name()
            ))),
            Err(idx) => {
                trace!(target: LOG_TARGET, "Inserting buffer \"{}\" at {}", buffer.name(), idx);
                entries.insert(idx, buffer);
                Ok(())
            }
        }
    }

    /// Inserts `buffer` unless its name is already taken, in which case the
    /// existing entry is returned instead. The flag tells which happened.
    pub fn insert_or_existing(&self, buffer: Arc<Buffer>) -> (Arc<Buffer>, bool) {
        let mut entries = self.entries();
        match locate(&entries, buffer.name()) {
            Ok(idx) => (entries[idx].clone(), false),
            Err(idx) => {
                entries.insert(idx, buffer.clone());
                (buffer, true)
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Buffer>> {
        let mut entries = self.entries();
        let idx = locate(&entries, name).ok()?;
        Some(entries.remove(idx))
    }

    /// Names in registry (sorted) order.
    pub fn names(&self) -> Vec<String> {
        self.entries().iter().map(|b| b.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
