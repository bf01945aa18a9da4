//! Integration tests for context binding
//!
//! These tests verify global and per-thread binding, reference counting
//! and the current-context checks guarding every operation.

use crate::test_utils::Rig;
use std::sync::Arc;
use std::thread;
use voicepool::audio::{AudioError, BindingManager, Extension, VirtualDevice};
use voicepool::config::Settings;

#[cfg(test)]
mod binding_integration_tests {
    use super::*;

    fn manager(thread_local: bool) -> Arc<BindingManager> {
        BindingManager::new(Arc::new(VirtualDevice::builder().thread_local(thread_local).build()))
    }

    #[test]
    fn test_make_current_moves_references() {
        let manager = manager(true);
        let settings = Settings::default();
        let a = manager.create_context(&settings).expect("context a");
        let b = manager.create_context(&settings).expect("context b");

        manager.make_current(Some(&a)).expect("bind a");
        assert_eq!(a.ref_count(), 1);
        assert!(Arc::ptr_eq(&manager.current().expect("current"), &a));

        manager.make_current(Some(&b)).expect("bind b");
        assert_eq!(a.ref_count(), 0);
        assert_eq!(b.ref_count(), 1);

        manager.make_current(Some(&b)).expect("rebind b");
        assert_eq!(b.ref_count(), 1);

        manager.make_current(None).expect("unbind");
        assert_eq!(b.ref_count(), 0);
        assert!(manager.current().is_none());

        a.destroy().expect("destroy a");
        b.destroy().expect("destroy b");
    }

    #[test]
    fn test_operations_require_current_context() {
        let manager = manager(true);
        let settings = Settings::default();
        let a = manager.create_context(&settings).expect("context a");
        let b = manager.create_context(&settings).expect("context b");

        assert!(matches!(a.create_source(), Err(AudioError::InvalidOperation(_))));
        manager.make_current(Some(&a)).expect("bind a");
        assert!(a.create_source().is_ok());
        assert!(matches!(b.create_source(), Err(AudioError::InvalidOperation(_))));
        assert!(matches!(b.get_buffer("tone.wav"), Err(AudioError::InvalidOperation(_))));

        manager.make_current(None).expect("unbind");
        a.destroy().expect("destroy a");
        b.destroy().expect("destroy b");
    }

    #[test]
    fn test_thread_override_wins_on_its_thread_only() {
        let manager = manager(true);
        let settings = Settings::default();
        let a = manager.create_context(&settings).expect("context a");
        let b = manager.create_context(&settings).expect("context b");

        manager.make_current(Some(&a)).expect("bind a");
        manager.make_thread_current(Some(&b)).expect("bind b on this thread");
        assert_eq!(b.ref_count(), 1);
        assert!(b.check().is_ok());
        assert!(a.check().is_err());

        thread::scope(|s| {
            s.spawn(|| {
                assert!(a.check().is_ok());
                assert!(b.check().is_err());
            });
        });

        // A global switch clears this thread's override.
        manager.make_current(Some(&a)).expect("rebind a");
        assert_eq!(b.ref_count(), 0);
        assert!(manager.thread_current().is_none());
        assert!(a.check().is_ok());

        manager.make_current(None).expect("unbind");
        a.destroy().expect("destroy a");
        b.destroy().expect("destroy b");
    }

    #[test]
    fn test_thread_binding_unsupported() {
        let manager = manager(false);
        let ctx = manager.create_context(&Settings::default()).expect("context");
        assert!(matches!(
            manager.make_thread_current(Some(&ctx)),
            Err(AudioError::UnsupportedOperation(_))
        ));
        assert_eq!(ctx.ref_count(), 0);
        ctx.destroy().expect("destroy");
    }

    #[test]
    fn test_extensions_probed_on_first_bind() {
        let device = VirtualDevice::builder()
            .extensions(&[Extension::EXT_FLOAT32, Extension::SOFT_loop_points])
            .build();
        let manager = BindingManager::new(Arc::new(device));
        let ctx = manager.create_context(&Settings::default()).expect("context");
        assert!(!ctx.has_extension(Extension::EXT_FLOAT32));

        manager.make_current(Some(&ctx)).expect("bind");
        assert!(ctx.has_extension(Extension::EXT_FLOAT32));
        assert!(ctx.has_extension(Extension::SOFT_loop_points));
        assert!(!ctx.has_extension(Extension::EXT_MCFORMATS));

        manager.make_current(None).expect("unbind");
        ctx.destroy().expect("destroy");
    }

    #[test]
    fn test_destroy_rules() {
        let rig = Rig::new(VirtualDevice::new());
        assert!(matches!(rig.ctx.destroy(), Err(AudioError::InvalidOperation(_))));

        rig.ctx.get_buffer("short.wav").expect("load");
        rig.manager.make_current(None).expect("unbind");
        assert!(matches!(rig.ctx.destroy(), Err(AudioError::InvalidOperation(_))));

        rig.manager.make_current(Some(&rig.ctx)).expect("rebind");
        rig.ctx.remove_buffer("short.wav").expect("remove");
        rig.manager.make_current(None).expect("unbind");
        rig.ctx.destroy().expect("destroy");
        assert!(rig.ctx.is_destroyed());
        assert_eq!(rig.device.context_count(), 0);

        assert!(matches!(rig.ctx.destroy(), Err(AudioError::InvalidOperation(_))));
        assert!(rig.manager.make_current(Some(&rig.ctx)).is_err());
    }

    #[test]
    fn test_release_override_of_exited_thread() {
        let rig = Rig::new(VirtualDevice::new());
        let worker = {
            let manager = rig.manager.clone();
            let ctx = rig.ctx.clone();
            thread::spawn(move || {
                manager
                    .make_thread_current(Some(&ctx))
                    .expect("thread bind");
            })
        };
        let exited = worker.thread().id();
        worker.join().expect("thread");
        assert_eq!(rig.ctx.ref_count(), 2);

        rig.manager.make_current(None).expect("unbind");
        assert_eq!(rig.ctx.ref_count(), 1);
        assert!(matches!(rig.ctx.destroy(), Err(AudioError::InvalidOperation(_))));

        assert!(rig.manager.release_thread(exited));
        assert!(!rig.manager.release_thread(exited));
        assert_eq!(rig.ctx.ref_count(), 0);
        rig.teardown();
    }
}
