//! Integration tests for sources and the voice pool
//!
//! These tests verify playback state, natural completion, priority
//! eviction and streaming on a manually clocked virtual device.

use crate::test_utils::{tone, wait_until, wav_bytes, Event, FlakyDevice, MemoryFiles, Recorder, Rig, PCM};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use voicepool::audio::{
    AudioError, BindingManager, Context, MessageHandler, PlaybackState, ResourceResolver, SourceId, VirtualDevice,
};
use voicepool::config::Settings;

/// Restarts a stream from its first natural-stop notification.
struct Restarter {
    ctx: Weak<Context>,
    restarted: Mutex<Option<Result<(), String>>>,
    stops: AtomicUsize,
}

impl Restarter {
    fn new(ctx: &Arc<Context>) -> Self {
        Restarter {
            ctx: Arc::downgrade(ctx),
            restarted: Mutex::new(None),
            stops: AtomicUsize::new(0),
        }
    }

    fn restarted(&self) -> Option<Result<(), String>> {
        self.restarted.lock().unwrap().clone()
    }
}

impl MessageHandler for Restarter {
    fn source_stopped(&self, source: SourceId, forced: bool) {
        let seen = self.stops.fetch_add(1, Ordering::SeqCst);
        if forced || seen > 0 {
            return;
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let result = ctx
            .create_decoder("tone.wav")
            .and_then(|decoder| ctx.play_stream(source, decoder, 250, 2));
        *self.restarted.lock().unwrap() = Some(result.map_err(|e| e.to_string()));
    }
}

#[cfg(test)]
mod source_integration_tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_natural_stop_returns_voice() {
        let rig = Rig::manual(4);
        let buffer = rig.ctx.get_buffer("short.wav").expect("load");
        let source = rig.ctx.create_source().expect("source");
        assert_eq!(rig.ctx.state(source).expect("state"), PlaybackState::Initial);

        rig.ctx.play(source, &buffer).expect("play");
        assert!(rig.ctx.is_playing(source).expect("state"));
        assert_eq!(buffer.sources(), vec![source]);
        rig.ctx.update().expect("update");
        assert!(rig.ctx.is_playing(source).expect("state"));

        rig.device.advance(Duration::from_millis(150));
        rig.ctx.update().expect("update");
        assert_eq!(rig.ctx.state(source).expect("state"), PlaybackState::Stopped);
        assert_eq!(rig.recorder.count(&Event::Stopped(source, false)), 1);
        assert_eq!(rig.ctx.idle_voices(), 1);
        assert!(!buffer.is_in_use());
        assert!(rig.ctx.buffer_of(source).expect("buffer").is_none());

        rig.ctx.release_source(source).expect("release");
        rig.teardown();
    }

    #[test]
    fn test_priority_eviction() {
        let rig = Rig::manual(2);
        let buffer = rig.ctx.get_buffer("tone.wav").expect("load");
        let mut sources = Vec::new();
        for priority in 1..=3 {
            let source = rig.ctx.create_source().expect("source");
            rig.ctx.set_priority(source, priority).expect("priority");
            sources.push(source);
        }
        let (low, mid, high) = (sources[0], sources[1], sources[2]);

        rig.ctx.play(low, &buffer).expect("play low");
        rig.ctx.play(mid, &buffer).expect("play mid");
        rig.ctx.play(high, &buffer).expect("play high evicts low");

        assert_eq!(rig.ctx.state(low).expect("state"), PlaybackState::Stopped);
        assert!(rig.ctx.is_playing(high).expect("state"));
        let stops: Vec<Event> = rig
            .recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Stopped(..)))
            .collect();
        assert_eq!(stops, vec![Event::Stopped(low, true)]);
        let mut users = buffer.sources();
        users.sort();
        assert_eq!(users, vec![mid, high]);
        assert_eq!(rig.device.voice_count(), 2);

        let equal = rig.ctx.create_source().expect("source");
        rig.ctx.set_priority(equal, 2).expect("priority");
        assert!(matches!(
            rig.ctx.play(equal, &buffer),
            Err(AudioError::ResourceExhausted(_))
        ));
        assert_eq!(rig.ctx.state(equal).expect("state"), PlaybackState::Initial);
        assert!(rig.ctx.is_playing(mid).expect("state"));

        for source in [low, mid, high, equal] {
            rig.ctx.release_source(source).expect("release");
        }
        assert_eq!(rig.ctx.idle_voices(), 2);
        rig.teardown();
    }

    #[test]
    fn test_released_handles_go_stale() {
        let rig = Rig::manual(4);
        let first = rig.ctx.create_source().expect("source");
        rig.ctx.release_source(first).expect("release");
        assert!(matches!(rig.ctx.state(first), Err(AudioError::InvalidOperation(_))));
        assert!(matches!(rig.ctx.release_source(first), Err(AudioError::InvalidOperation(_))));

        let second = rig.ctx.create_source().expect("source");
        assert_eq!(second.index(), first.index());
        assert_eq!(rig.ctx.allocated_sources(), 1);
        assert_eq!(rig.ctx.live_sources(), 1);
        rig.ctx.release_source(second).expect("release");
        rig.teardown();
    }

    #[test]
    fn test_pause_resume_and_stop() {
        let rig = Rig::manual(4);
        let buffer = rig.ctx.get_buffer("tone.wav").expect("load");
        let source = rig.ctx.create_source().expect("source");
        rig.ctx.play(source, &buffer).expect("play");

        rig.ctx.pause(source).expect("pause");
        assert_eq!(rig.ctx.state(source).expect("state"), PlaybackState::Paused);
        rig.device.advance(Duration::from_secs(5));
        rig.ctx.update().expect("update");
        assert_eq!(rig.ctx.state(source).expect("state"), PlaybackState::Paused);

        rig.ctx.resume(source).expect("resume");
        assert!(rig.ctx.is_playing(source).expect("state"));
        rig.device.advance(Duration::from_millis(1100));
        rig.ctx.update().expect("update");
        assert_eq!(rig.ctx.state(source).expect("state"), PlaybackState::Stopped);

        rig.ctx.play(source, &buffer).expect("replay");
        rig.ctx.stop(source).expect("stop");
        assert_eq!(rig.ctx.state(source).expect("state"), PlaybackState::Stopped);
        assert_eq!(rig.recorder.count(&Event::Stopped(source, false)), 1);
        assert_eq!(rig.ctx.idle_voices(), 1);

        rig.ctx.release_source(source).expect("release");
        rig.teardown();
    }

    #[test]
    fn test_looping_source_keeps_playing() {
        let rig = Rig::manual(4);
        let buffer = rig.ctx.get_buffer("short.wav").expect("load");
        let source = rig.ctx.create_source().expect("source");
        rig.ctx.set_looping(source, true).expect("looping");
        rig.ctx.play(source, &buffer).expect("play");

        rig.device.advance(Duration::from_millis(550));
        rig.ctx.update().expect("update");
        assert!(rig.ctx.is_playing(source).expect("state"));

        rig.ctx.release_source(source).expect("release");
        rig.teardown();
    }

    #[test]
    fn test_stream_plays_to_completion() {
        let rig = Rig::manual(4);
        rig.ctx.set_async_wake_interval(1);
        let source = rig.ctx.create_source().expect("source");
        let decoder = rig.ctx.create_decoder("tone.wav").expect("decoder");
        rig.ctx.play_stream(source, decoder, 250, 2).expect("stream");
        assert!(rig.ctx.is_streaming(source));
        assert_eq!(rig.ctx.streaming_count(), 1);
        assert!(rig.ctx.is_playing(source).expect("state"));

        let finished = wait_until(TIMEOUT, || {
            rig.device.advance(Duration::from_millis(50));
            rig.ctx.update().expect("update");
            !rig.ctx.is_playing(source).expect("state") && rig.ctx.streaming_count() == 0
        });
        assert!(finished, "stream never finished");
        assert_eq!(rig.ctx.state(source).expect("state"), PlaybackState::Stopped);
        assert_eq!(rig.recorder.count(&Event::Stopped(source, false)), 1);
        assert_eq!(rig.device.buffer_count(), 0);

        rig.ctx.release_source(source).expect("release");
        rig.teardown();
    }

    #[test]
    fn test_stream_stop_and_empty_stream() {
        let rig = Rig::manual(4);
        let source = rig.ctx.create_source().expect("source");
        let decoder = rig.ctx.create_decoder("tone.wav").expect("decoder");
        rig.ctx.play_stream_default(source, decoder).expect("stream");
        rig.ctx.stop(source).expect("stop");
        assert_eq!(rig.ctx.streaming_count(), 0);
        assert_eq!(rig.device.buffer_count(), 0);

        rig.files.insert("silent.wav", wav_bytes(1, 16, PCM, 1000, 0, None));
        let decoder = rig.ctx.create_decoder("silent.wav").expect("decoder");
        assert!(matches!(
            rig.ctx.play_stream(source, decoder, 100, 2),
            Err(AudioError::EmptyResource(_))
        ));
        assert_eq!(rig.ctx.streaming_count(), 0);
        assert_eq!(rig.device.buffer_count(), 0);
        assert_eq!(rig.ctx.idle_voices(), 1);

        rig.ctx.release_source(source).expect("release");
        rig.teardown();
    }

    #[test]
    fn test_disconnect_reported_once() {
        let rig = Rig::manual(4);
        rig.ctx.update().expect("update");
        assert_eq!(rig.recorder.count(&Event::Disconnected), 0);

        rig.device.disconnect();
        rig.ctx.update().expect("update");
        rig.ctx.update().expect("update");
        assert_eq!(rig.recorder.count(&Event::Disconnected), 1);
        rig.teardown();
    }

    #[test]
    fn test_stream_restarted_from_stop_notification() {
        let rig = Rig::manual(4);
        rig.ctx.set_async_wake_interval(1);
        let restarter = Arc::new(Restarter::new(&rig.ctx));
        rig.ctx.set_message_handler(restarter.clone());

        let source = rig.ctx.create_source().expect("source");
        let decoder = rig.ctx.create_decoder("tone.wav").expect("decoder");
        rig.ctx.play_stream(source, decoder, 250, 2).expect("stream");

        let restarted = wait_until(TIMEOUT, || {
            rig.device.advance(Duration::from_millis(50));
            rig.ctx.update().expect("update");
            restarter.restarted().is_some()
        });
        assert!(restarted, "stream never finished the first time");
        assert!(matches!(restarter.restarted(), Some(Ok(()))));
        assert!(rig.ctx.is_playing(source).expect("state"));
        assert!(rig.ctx.is_streaming(source));

        let finished = wait_until(TIMEOUT, || {
            rig.device.advance(Duration::from_millis(50));
            rig.ctx.update().expect("update");
            restarter.stops.load(Ordering::SeqCst) == 2
        });
        assert!(finished, "restarted stream was never serviced");
        assert_eq!(rig.ctx.state(source).expect("state"), PlaybackState::Stopped);
        assert_eq!(rig.ctx.streaming_count(), 0);
        assert_eq!(rig.device.buffer_count(), 0);

        rig.ctx.release_source(source).expect("release");
        rig.teardown();
    }

    #[test]
    fn test_update_continues_past_failed_voice() {
        let device = Arc::new(FlakyDevice::new(
            VirtualDevice::builder().max_voices(4).manual_clock().build(),
        ));
        let files = Arc::new(MemoryFiles::default());
        files.insert("short.wav", tone(100));
        let resolver = Arc::new(ResourceResolver::new());
        resolver.set_file_factory(files);
        let manager = BindingManager::with_resolver(device.clone(), resolver);
        let ctx = manager.create_context(&Settings::default()).expect("create context");
        manager.make_current(Some(&ctx)).expect("make current");
        let recorder = Arc::new(Recorder::default());
        ctx.set_message_handler(recorder.clone());

        let buffer = ctx.get_buffer("short.wav").expect("load");
        let first = ctx.create_source().expect("source");
        let second = ctx.create_source().expect("source");
        ctx.play(first, &buffer).expect("play first");
        ctx.play(second, &buffer).expect("play second");
        let voices = device.allocated();
        assert_eq!(voices.len(), 2);

        device.set_broken(voices[0], true);
        device.inner.advance(Duration::from_millis(150));
        ctx.update().expect("update keeps going");
        assert_eq!(ctx.state(first).expect("state"), PlaybackState::Playing);
        assert_eq!(ctx.state(second).expect("state"), PlaybackState::Stopped);
        assert_eq!(recorder.count(&Event::Stopped(second, false)), 1);

        device.set_broken(voices[0], false);
        ctx.update().expect("update");
        assert_eq!(ctx.state(first).expect("state"), PlaybackState::Stopped);
        assert_eq!(recorder.count(&Event::Stopped(first, false)), 1);

        ctx.release_source(first).expect("release");
        ctx.release_source(second).expect("release");
        ctx.remove_buffer("short.wav").expect("remove");
        manager.make_current(None).expect("unbind");
        ctx.destroy().expect("destroy");
    }
}
