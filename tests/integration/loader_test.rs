//! Integration tests for the background loader
//!
//! These tests verify asynchronous loads, the failure policy, queue
//! backpressure and worker shutdown.

use crate::test_utils::{tone, wait_until, Event, Rig};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use voicepool::audio::{AudioError, BufferLoadStatus, VirtualDevice};
use voicepool::config::Settings;

#[cfg(test)]
mod loader_integration_tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_async_load_becomes_ready() {
        let rig = Rig::new(VirtualDevice::new());
        let gate = rig.install_gate();

        let buffer = rig.ctx.get_buffer_async("gated.raw").expect("queue load");
        assert_eq!(buffer.load_status(), BufferLoadStatus::Pending);
        assert!(rig.ctx.loader_running());

        let again = rig.ctx.get_buffer_async("gated.raw").expect("existing");
        assert!(Arc::ptr_eq(&buffer, &again));

        let source = rig.ctx.create_source().expect("source");
        assert!(matches!(rig.ctx.play(source, &buffer), Err(AudioError::InvalidOperation(_))));

        gate.open();
        assert_eq!(buffer.wait_loaded(), BufferLoadStatus::Ready);
        assert_eq!(buffer.length(), 200);
        assert_eq!(buffer.load_status(), BufferLoadStatus::Ready);

        let sync = rig.ctx.get_buffer("gated.raw").expect("sync fetch");
        assert!(Arc::ptr_eq(&buffer, &sync));
        rig.ctx.play(source, &buffer).expect("play once ready");
        rig.ctx.release_source(source).expect("release");
        rig.teardown();
    }

    #[test]
    fn test_sync_fetch_waits_for_pending_load() {
        let rig = Rig::new(VirtualDevice::new());
        let gate = rig.install_gate();
        let buffer = rig.ctx.get_buffer_async("gated.raw").expect("queue load");

        let opener = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                gate.open();
            })
        };
        let ready = rig.ctx.get_buffer("gated.raw").expect("sync fetch");
        assert!(Arc::ptr_eq(&buffer, &ready));
        assert_eq!(ready.load_status(), BufferLoadStatus::Ready);
        opener.join().expect("opener");
        rig.teardown();
    }

    #[test]
    fn test_status_never_goes_back() {
        let rig = Rig::new(VirtualDevice::new());
        let buffer = rig.ctx.get_buffer_async("tone.wav").expect("queue load");
        let mut seen_ready = false;
        assert!(wait_until(TIMEOUT, || {
            match buffer.load_status() {
                BufferLoadStatus::Ready => seen_ready = true,
                BufferLoadStatus::Pending => assert!(!seen_ready),
                BufferLoadStatus::Failed => panic!("load failed"),
            }
            seen_ready
        }));
        assert_eq!(buffer.load_status(), BufferLoadStatus::Ready);
        rig.teardown();
    }

    #[test]
    fn test_failed_background_load() {
        let rig = Rig::new(VirtualDevice::new());
        let buffer = rig.ctx.get_buffer_async("hollow.raw").expect("queue load");
        assert_eq!(buffer.wait_loaded(), BufferLoadStatus::Failed);
        assert!(wait_until(TIMEOUT, || {
            rig.recorder.count(&Event::LoadFailed("hollow.raw".to_string())) == 1
        }));

        assert!(matches!(rig.ctx.get_buffer("hollow.raw"), Err(AudioError::LoadFailed(_))));
        let source = rig.ctx.create_source().expect("source");
        assert!(matches!(rig.ctx.play(source, &buffer), Err(AudioError::InvalidOperation(_))));
        rig.ctx.release_source(source).expect("release");

        rig.ctx.remove_buffer("hollow.raw").expect("remove failed buffer");
        assert!(rig.ctx.find_buffer("hollow.raw").is_none());
        rig.teardown();
    }

    #[test]
    fn test_sync_load_of_hollow_resource_is_empty() {
        let rig = Rig::new(VirtualDevice::new());
        assert!(matches!(rig.ctx.get_buffer("hollow.raw"), Err(AudioError::EmptyResource(_))));
        rig.teardown();
    }

    #[test]
    fn test_backpressure_with_small_queue() {
        let settings = Settings {
            pending_queue_capacity: 1,
            ..Settings::default()
        };
        let rig = Rig::with_settings(VirtualDevice::new(), &settings);
        let names: Vec<String> = (0..6).map(|i| format!("clip{}.wav", i)).collect();
        for name in &names {
            rig.files.insert(name, tone(500));
        }

        let buffers: Vec<_> = names
            .iter()
            .map(|name| rig.ctx.get_buffer_async(name).expect("queue load"))
            .collect();
        for buffer in &buffers {
            assert_eq!(buffer.wait_loaded(), BufferLoadStatus::Ready);
            assert_eq!(buffer.length(), 500);
        }
        rig.teardown();
    }

    #[test]
    fn test_worker_follows_global_binding() {
        let device = VirtualDevice::builder().thread_local(false).build();
        let rig = Rig::new(device);
        let buffer = rig.ctx.get_buffer_async("tone.wav").expect("queue load");
        assert_eq!(buffer.wait_loaded(), BufferLoadStatus::Ready);
        rig.teardown();
    }

    #[test]
    fn test_wake_interval() {
        let rig = Rig::new(VirtualDevice::new());
        assert_eq!(rig.ctx.async_wake_interval(), 0);
        rig.ctx.set_async_wake_interval(5);
        assert_eq!(rig.ctx.async_wake_interval(), 5);

        let buffer = rig.ctx.get_buffer_async("short.wav").expect("queue load");
        assert_eq!(buffer.wait_loaded(), BufferLoadStatus::Ready);
        rig.ctx.set_async_wake_interval(0);
        rig.teardown();
    }

    #[test]
    fn test_destroy_joins_worker() {
        let rig = Rig::new(VirtualDevice::new());
        let buffer = rig.ctx.get_buffer_async("short.wav").expect("queue load");
        buffer.wait_loaded();
        assert!(rig.ctx.loader_running());

        let ctx = rig.ctx.clone();
        rig.teardown();
        assert!(!ctx.loader_running());
        assert!(ctx.is_destroyed());
    }
}
