use crate::audio::error::AudioError;
use crate::audio::hardware::{HardwareApi, VoiceId};
use crate::audio::source::{SourceId, SourceSlot};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "voicepool::audio::source_pool";

/// Everything guarded by the pool lock: the source arena with its free
/// list, the sorted used-source index and the stack of idle voices.
#[derive(Default)]
pub(crate) struct PoolState {
    slots: Vec<SourceSlot>,
    free: Vec<u32>,
    used: Vec<SourceId>,
    voices: Vec<VoiceId>,
}

/// Recycles source objects and shares the bounded set of hardware voices
/// among them.
#[derive(Default)]
pub struct SourcePool {
    state: Mutex<PoolState>,
}

impl SourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of sources created and not yet released.
    pub fn live_count(&self) -> usize {
        self.lock().used.len()
    }

    /// Number of source objects ever allocated.
    pub fn allocated_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Idle voices waiting on the free stack.
    pub fn idle_voices(&self) -> usize {
        self.lock().voices.len()
    }
}

impl PoolState {
    /// Draws a recycled source from the free list, allocating a new one only
    /// when the list is empty.
    pub(crate) fn create_source(&mut self, priority: u32) -> SourceId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.revive(priority);
                SourceId::new(index, slot.generation)
            }
            None => {
                self.slots.push(SourceSlot::new(priority));
                SourceId::new((self.slots.len() - 1) as u32, 0)
            }
        };
        if let Err(pos) = self.used.binary_search(&id) {
            self.used.insert(pos, id);
        }
        id
    }

    /// Stops the source, returns its voice to the stack and puts the object
    /// on the free list. The handle is stale afterwards.
    pub(crate) fn release_source(&mut self, hardware: &dyn HardwareApi, id: SourceId) -> Result<(), AudioError> {
        let slot = self.slot_mut(id)?;
        let voice = slot.make_stopped(hardware, id);
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(voice) = voice {
            self.voices.push(voice);
        }
        if let Ok(pos) = self.used.binary_search(&id) {
            self.used.remove(pos);
        }
        self.free.push(id.index());
        debug!(target: LOG_TARGET, "Released {}", id);
        Ok(())
    }

    pub(crate) fn slot(&self, id: SourceId) -> Result<&SourceSlot, AudioError> {
        match self.slots.get(id.index() as usize) {
            Some(slot) if slot.live && slot.generation == id.generation() => Ok(slot),
            _ => Err(AudioError::InvalidOperation(format!("{} is not a live source", id))),
        }
    }

    pub(crate) fn slot_mut(&mut self, id: SourceId) -> Result<&mut SourceSlot, AudioError> {
        match self.slots.get_mut(id.index() as usize) {
            Some(slot) if slot.live && slot.generation == id.generation() => Ok(slot),
            _ => Err(AudioError::InvalidOperation(format!("{} is not a live source", id))),
        }
    }

    pub(crate) fn used(&self) -> &[SourceId] {
        &self.used
    }

    pub(crate) fn return_voice(&mut self, voice: VoiceId) {
        self.voices.push(voice);
    }

    /// Finds a voice for `requester`: the idle stack first, then a fresh
    /// hardware allocation, then eviction of the lowest-priority sounding
    /// source if its priority is strictly below `priority`. Ties go to the
    /// first source in used-index order. Returns the evicted source so the
    /// caller can notify after dropping the lock.
    pub(crate) fn acquire_voice(
        &mut self,
        hardware: &dyn HardwareApi,
        requester: SourceId,
        priority: u32,
    ) -> Result<(VoiceId, Option<SourceId>), AudioError> {
        if let Some(voice) = self.voices.pop() {
            return Ok((voice, None));
        }
        match hardware.gen_source() {
            Ok(voice) => {
                debug!(target: LOG_TARGET, "Allocated hardware {}", voice);
                return Ok((voice, None));
            }
            Err(e) => debug!(target: LOG_TARGET, "Hardware voice allocation failed ({}); trying eviction", e),
        }

        let mut lowest: Option<(SourceId, u32)> = None;
        for id in &self.used {
            if *id == requester {
                continue;
            }
            let slot = &self.slots[id.index() as usize];
            if slot.voice.is_some() && lowest.map_or(true, |(_, p)| slot.priority < p) {
                lowest = Some((*id, slot.priority));
            }
        }

        if let Some((victim, victim_priority)) = lowest {
            if victim_priority < priority {
                info!(
                    target: LOG_TARGET,
                    "Evicting {} (priority {}) for {} (priority {})",
                    victim, victim_priority, requester, priority
                );
                let slot = &mut self.slots[victim.index() as usize];
                if let Some(voice) = slot.make_stopped(hardware, victim) {
                    return Ok((voice, Some(victim)));
                }
            }
        }

        warn!(target: LOG_TARGET, "No voice available for {} (priority {})", requester, priority);
        Err(AudioError::ResourceExhausted("No available sources".to_string()))
    }

    /// Forgets every source without touching the hardware. Used when the
    /// hardware context is destroyed, which frees its voices with it.
    /// Returns how many sources were still live.
    pub(crate) fn drain_unbound(&mut self) -> usize {
        let live = self.used.len();
        *self = PoolState::default();
        live
    }
}
