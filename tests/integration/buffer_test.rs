//! Integration tests for buffer loading and the buffer registry
//!
//! These tests verify synchronous loads, resource substitution, format
//! checks, loop points and removal rules.

use crate::test_utils::{wav_bytes, Event, Rig, FLOAT, PCM};
use std::error::Error;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;
use voicepool::audio::{
    AudioError, BindingManager, BufferLoadStatus, ChannelConfig, Extension, SampleType, VirtualDevice,
};
use voicepool::config::Settings;

#[cfg(test)]
mod buffer_integration_tests {
    use super::*;

    #[test]
    fn test_sync_load_is_ready_and_cached() {
        let rig = Rig::new(VirtualDevice::new());
        let buffer = rig.ctx.get_buffer("tone.wav").expect("load");
        assert_eq!(buffer.load_status(), BufferLoadStatus::Ready);
        assert_eq!(buffer.length(), 1000);
        assert_eq!(buffer.frequency(), 1000);
        assert_eq!(buffer.channel_config(), ChannelConfig::Mono);
        assert_eq!(buffer.sample_type(), SampleType::Int16);
        assert_eq!(buffer.size(), 2000);

        let again = rig.ctx.get_buffer("tone.wav").expect("cached");
        assert!(Arc::ptr_eq(&buffer, &again));
        assert_eq!(rig.recorder.count(&Event::Loading("tone.wav".to_string())), 1);
        assert_eq!(rig.device.buffer_count(), 1);
        rig.teardown();
    }

    #[test]
    fn test_registry_lists_names_in_order() {
        let rig = Rig::new(VirtualDevice::new());
        rig.files.insert("b.wav", crate::test_utils::tone(10));
        rig.files.insert("a.wav", crate::test_utils::tone(10));
        rig.files.insert("c.wav", crate::test_utils::tone(10));
        for name in ["b.wav", "a.wav", "c.wav"] {
            rig.ctx.get_buffer(name).expect("load");
        }
        assert_eq!(rig.ctx.buffer_names(), vec!["a.wav", "b.wav", "c.wav"]);
        assert_eq!(rig.ctx.buffer_count(), 3);
        rig.teardown();
    }

    #[test]
    fn test_missing_resource_and_substitution() {
        let rig = Rig::new(VirtualDevice::new());
        assert!(matches!(
            rig.ctx.get_buffer("missing.wav"),
            Err(AudioError::ResourceNotFound(_))
        ));
        assert!(rig.ctx.find_buffer("missing.wav").is_none());

        rig.recorder.substitute("missing.wav", "also-missing.wav");
        rig.recorder.substitute("also-missing.wav", "short.wav");
        let buffer = rig.ctx.get_buffer("missing.wav").expect("substituted");
        assert_eq!(buffer.name(), "missing.wav");
        assert_eq!(buffer.length(), 100);
        assert!(rig
            .recorder
            .events()
            .contains(&Event::NotFound("also-missing.wav".to_string())));
        rig.teardown();
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let device = VirtualDevice::builder().extensions(&[]).build();
        let rig = Rig::new(device);
        rig.files.insert("float.wav", wav_bytes(1, 32, FLOAT, 8000, 64, None));
        assert!(!rig.ctx.is_supported(ChannelConfig::Mono, SampleType::Float32));

        match rig.ctx.get_buffer("float.wav") {
            Err(AudioError::UnsupportedFormat(msg)) => assert!(msg.contains("Format not supported")),
            other => panic!("expected unsupported format, got {:?}", other.map(|b| b.name().to_string())),
        }
        assert!(matches!(
            rig.ctx.get_buffer_async("float.wav"),
            Err(AudioError::UnsupportedFormat(_))
        ));
        assert_eq!(rig.ctx.buffer_count(), 0);
        rig.teardown();
    }

    #[test]
    fn test_empty_resource_rejected() {
        let rig = Rig::new(VirtualDevice::new());
        rig.files.insert("silent.wav", wav_bytes(1, 16, PCM, 1000, 0, None));
        assert!(matches!(rig.ctx.get_buffer("silent.wav"), Err(AudioError::EmptyResource(_))));
        assert!(rig.ctx.find_buffer("silent.wav").is_none());
        assert_eq!(rig.device.buffer_count(), 0);
        rig.teardown();
    }

    #[test]
    fn test_loop_points_from_file() {
        let rig = Rig::new(VirtualDevice::new());
        rig.files.insert("looped.wav", wav_bytes(1, 16, PCM, 1000, 100, Some((10, 500))));
        rig.files.insert("inverted.wav", wav_bytes(1, 16, PCM, 1000, 100, Some((5, 4))));

        let clamped = rig.ctx.get_buffer("looped.wav").expect("load");
        assert_eq!(clamped.loop_points(), (10, 100));
        let whole = rig.ctx.get_buffer("inverted.wav").expect("load");
        assert_eq!(whole.loop_points(), (0, 100));
        rig.teardown();
    }

    #[test]
    fn test_set_loop_points() {
        let rig = Rig::new(VirtualDevice::new());
        let buffer = rig.ctx.get_buffer("short.wav").expect("load");
        rig.ctx.set_loop_points(&buffer, 20, 80).expect("loop points");
        assert_eq!(buffer.loop_points(), (20, 80));
        assert!(matches!(
            rig.ctx.set_loop_points(&buffer, 80, 20),
            Err(AudioError::InvalidOperation(_))
        ));
        assert!(matches!(
            rig.ctx.set_loop_points(&buffer, 0, 101),
            Err(AudioError::InvalidOperation(_))
        ));
        rig.teardown();

        let rig = Rig::new(VirtualDevice::builder().extensions(&[Extension::EXT_disconnect]).build());
        let buffer = rig.ctx.get_buffer("short.wav").expect("load");
        assert!(matches!(
            rig.ctx.set_loop_points(&buffer, 20, 80),
            Err(AudioError::UnsupportedOperation(_))
        ));
        rig.teardown();
    }

    #[test]
    fn test_remove_buffer_rules() {
        let rig = Rig::new(VirtualDevice::new());
        rig.ctx.remove_buffer("never-loaded.wav").expect("absent is a no-op");

        let buffer = rig.ctx.get_buffer("tone.wav").expect("load");
        let source = rig.ctx.create_source().expect("source");
        rig.ctx.play(source, &buffer).expect("play");
        assert!(buffer.is_in_use());
        assert!(matches!(
            rig.ctx.remove_buffer("tone.wav"),
            Err(AudioError::InvalidOperation(_))
        ));

        rig.ctx.stop(source).expect("stop");
        assert!(!buffer.is_in_use());
        rig.ctx.remove_buffer_handle(&buffer).expect("remove");
        assert!(rig.ctx.find_buffer("tone.wav").is_none());
        assert_eq!(rig.device.buffer_count(), 0);
        rig.ctx.release_source(source).expect("release");
        rig.teardown();
    }

    #[test]
    fn test_remove_stale_handle_is_noop() {
        let rig = Rig::new(VirtualDevice::new());
        let first = rig.ctx.get_buffer("short.wav").expect("load");
        rig.ctx.remove_buffer("short.wav").expect("remove by name");
        rig.ctx.remove_buffer_handle(&first).expect("absent handle is a no-op");

        let second = rig.ctx.get_buffer("short.wav").expect("reload");
        rig.ctx.remove_buffer_handle(&first).expect("stale handle is a no-op");
        let kept = rig.ctx.find_buffer("short.wav").expect("reloaded buffer kept");
        assert!(Arc::ptr_eq(&kept, &second));
        assert_eq!(rig.device.buffer_count(), 1);

        rig.ctx.remove_buffer_handle(&second).expect("remove");
        assert_eq!(rig.ctx.buffer_count(), 0);
        rig.teardown();
    }

    #[test]
    fn test_wave_with_inflated_data_size() {
        let rig = Rig::new(VirtualDevice::new());
        let mut bytes = wav_bytes(1, 16, PCM, 1000, 16, None);
        let data = bytes.windows(4).position(|w| w == b"data").expect("data chunk");
        bytes[data + 4..data + 8].copy_from_slice(&0x1000_0000u32.to_le_bytes());
        rig.files.insert("inflated.wav", bytes);

        let buffer = rig.ctx.get_buffer("inflated.wav").expect("load");
        assert_eq!(buffer.length(), 16);
        assert_eq!(buffer.size(), 32);
        rig.teardown();
    }

    #[test]
    fn test_buffer_from_disk() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("disk.wav");
        fs::write(&path, wav_bytes(2, 16, PCM, 44100, 441, Some((0, 200))))?;

        let manager = BindingManager::new(Arc::new(VirtualDevice::new()));
        let ctx = manager.create_context(&Settings::default())?;
        manager.make_current(Some(&ctx))?;

        let name = path.to_string_lossy().to_string();
        let buffer = ctx.get_buffer(&name)?;
        assert_eq!(buffer.channel_config(), ChannelConfig::Stereo);
        assert_eq!(buffer.length(), 441);
        assert_eq!(buffer.loop_points(), (0, 200));

        ctx.remove_buffer(&name)?;
        manager.make_current(None)?;
        ctx.destroy()?;
        Ok(())
    }
}
