//! Process-wide binding of contexts to the hardware.
//!
//! One global binding plus an optional per-thread override table. The
//! effective binding of a thread is its override if present, else the global
//! one.

use crate::audio::context::Context;
use crate::audio::error::AudioError;
use crate::audio::file_io::ResourceResolver;
use crate::audio::hardware::HardwareApi;
use crate::config::Settings;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::{debug, info, instrument, warn};

const LOG_TARGET: &str = "voicepool::audio::binding";

pub struct BindingManager {
    hardware: Arc<dyn HardwareApi>,
    resolver: Arc<ResourceResolver>,
    current: Mutex<Option<Arc<Context>>>,
    thread_current: Mutex<HashMap<ThreadId, Arc<Context>>>,
    next_id: AtomicU64,
}

fn same(a: Option<&Arc<Context>>, b: Option<&Arc<Context>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl BindingManager {
    pub fn new(hardware: Arc<dyn HardwareApi>) -> Arc<Self> {
        Self::with_resolver(hardware, Arc::new(ResourceResolver::new()))
    }

    /// Uses a caller-supplied resolver, e.g. one with custom decoders or a
    /// custom file factory installed.
    pub fn with_resolver(hardware: Arc<dyn HardwareApi>, resolver: Arc<ResourceResolver>) -> Arc<Self> {
        Arc::new(BindingManager {
            hardware,
            resolver,
            current: Mutex::new(None),
            thread_current: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn hardware(&self) -> &Arc<dyn HardwareApi> {
        &self.hardware
    }

    pub fn resolver(&self) -> &Arc<ResourceResolver> {
        &self.resolver
    }

    fn current_slot(&self) -> MutexGuard<'_, Option<Arc<Context>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn thread_table(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<Context>>> {
        self.thread_current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates an unbound context. Its capabilities are probed the first
    /// time it is made current.
    #[instrument(skip(self, settings))]
    pub fn create_context(self: &Arc<Self>, settings: &Settings) -> Result<Arc<Context>, AudioError> {
        let hw = self.hardware.create_context()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(target: LOG_TARGET, "Created context {} ({:?})", id, hw);
        Ok(Context::new(id, hw, self, settings))
    }

    /// The global binding.
    pub fn current(&self) -> Option<Arc<Context>> {
        self.current_slot().clone()
    }

    /// The calling thread's override, if any.
    pub fn thread_current(&self) -> Option<Arc<Context>> {
        self.thread_table().get(&thread::current().id()).cloned()
    }

    /// What the calling thread's calls target: its override, else the
    /// global binding.
    pub fn effective_current(&self) -> Option<Arc<Context>> {
        self.thread_current().or_else(|| self.current())
    }

    /// Switches the global binding to `ctx`, clearing the calling thread's
    /// override. The switch is serialised against both contexts' workers.
    #[instrument(skip_all, fields(context = ctx.map(|c| c.id())))]
    pub fn make_current(&self, ctx: Option<&Arc<Context>>) -> Result<(), AudioError> {
        if let Some(ctx) = ctx {
            if ctx.is_destroyed() {
                return Err(AudioError::InvalidOperation(format!("Context {} has been destroyed", ctx.id())));
            }
        }

        // Binding locks are always taken before the slot lock. Lock the
        // contexts involved, then retry if another switch won the race.
        let old = loop {
            let old = self.current();
            let mut involved: Vec<&Arc<Context>> = old.iter().collect();
            if let Some(ctx) = ctx {
                if !same(old.as_ref(), Some(ctx)) {
                    involved.push(ctx);
                }
            }
            involved.sort_by_key(|c| c.id());
            let guards: Vec<_> = involved.iter().map(|c| c.lock_binding()).collect();

            let mut current = self.current_slot();
            if !same(current.as_ref(), old.as_ref()) {
                debug!(target: LOG_TARGET, "Global binding changed concurrently; retrying");
                continue;
            }
            self.hardware.make_context_current(ctx.map(|c| c.hw_handle()))?;
            if let Some(ctx) = ctx {
                ctx.add_ref();
                ctx.ensure_extensions();
            }
            *current = ctx.cloned();
            drop(current);
            drop(guards);
            break old;
        };
        if let Some(old) = &old {
            old.dec_ref();
        }

        let stale = self.thread_table().remove(&thread::current().id());
        if let Some(stale) = stale {
            debug!(target: LOG_TARGET, "Clearing thread override for context {}", stale.id());
            if self.hardware.supports_thread_local() {
                if let Err(e) = self.hardware.set_thread_context(None) {
                    warn!(target: LOG_TARGET, "Failed to clear thread binding: {}", e);
                }
            }
            stale.dec_ref();
        }

        if let Some(old) = &old {
            old.notify_binding_changed();
        }
        if let Some(ctx) = ctx {
            ctx.notify_binding_changed();
        }
        debug!(target: LOG_TARGET, "Global binding now {:?}", ctx.map(|c| c.id()));
        Ok(())
    }

    /// Overrides the binding for the calling thread only. The override holds
    /// a reference until it is cleared; a thread that exits without clearing
    /// it keeps its context alive until [`release_thread`](Self::release_thread)
    /// is called for it.
    #[instrument(skip_all, fields(context = ctx.map(|c| c.id())))]
    pub fn make_thread_current(&self, ctx: Option<&Arc<Context>>) -> Result<(), AudioError> {
        if !self.hardware.supports_thread_local() {
            return Err(AudioError::UnsupportedOperation(
                "Thread-local contexts unsupported".to_string(),
            ));
        }
        if let Some(ctx) = ctx {
            if ctx.is_destroyed() {
                return Err(AudioError::InvalidOperation(format!("Context {} has been destroyed", ctx.id())));
            }
        }

        {
            let _bound = ctx.map(|c| c.lock_binding());
            self.hardware.set_thread_context(ctx.map(|c| c.hw_handle()))?;
            if let Some(ctx) = ctx {
                ctx.add_ref();
                ctx.ensure_extensions();
            }
        }
        let tid = thread::current().id();
        let old = {
            let mut table = self.thread_table();
            match ctx {
                Some(ctx) => table.insert(tid, Arc::clone(ctx)),
                None => table.remove(&tid),
            }
        };

        if let Some(old) = old {
            old.dec_ref();
            old.notify_binding_changed();
        }
        if let Some(ctx) = ctx {
            ctx.notify_binding_changed();
        }
        Ok(())
    }

    /// Drops the override registered by `thread`, typically one that exited
    /// while still holding it. Returns false when `thread` had none. The
    /// backend's own binding for that thread goes away with its context.
    #[instrument(skip(self))]
    pub fn release_thread(&self, thread: ThreadId) -> bool {
        let stale = self.thread_table().remove(&thread);
        match stale {
            Some(ctx) => {
                debug!(target: LOG_TARGET, "Released override of {:?} on context {}", thread, ctx.id());
                ctx.dec_ref();
                ctx.notify_binding_changed();
                true
            }
            None => false,
        }
    }

    /// Succeeds only when `ctx` is the calling thread's effective binding.
    pub fn check_context(&self, ctx: &Context) -> Result<(), AudioError> {
        let bound = self.effective_current();
        match bound {
            Some(bound) if std::ptr::eq(Arc::as_ptr(&bound), ctx) => Ok(()),
            _ => Err(AudioError::InvalidOperation("Called context is not current".to_string())),
        }
    }
}
