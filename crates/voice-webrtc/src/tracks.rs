//! Playback sink lifecycle for inbound tracks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::platform::{AudioSink, AudioSinkFactory, TrackId};

/// Owns one playback sink per live remote track.
///
/// Attach and detach are paired exactly: re-adding a live track id is a
/// no-op, removing an unknown id is a no-op, and teardown detaches whatever
/// remains. Sink count therefore never exceeds live track count.
pub struct TrackLifecycle {
    factory: Arc<dyn AudioSinkFactory>,
    sinks: HashMap<TrackId, Arc<dyn AudioSink>>,
    playback_muted: bool,
}

impl TrackLifecycle {
    pub fn new(factory: Arc<dyn AudioSinkFactory>) -> Self {
        Self {
            factory,
            sinks: HashMap::new(),
            playback_muted: false,
        }
    }

    /// Attach a sink for a newly received track. Returns true when a sink
    /// was created, false when the id already had one.
    pub fn on_track_added(&mut self, track_id: &str, stream_id: &str) -> bool {
        if self.sinks.contains_key(track_id) {
            tracing::debug!(
                target = "voice::tracks",
                track = track_id,
                "track re-added, keeping existing sink"
            );
            return false;
        }
        let sink = self.factory.attach(track_id, stream_id);
        sink.set_muted(self.playback_muted);
        self.sinks.insert(track_id.to_string(), sink);
        tracing::debug!(
            target = "voice::tracks",
            track = track_id,
            stream = stream_id,
            live = self.sinks.len(),
            "sink attached"
        );
        true
    }

    /// Detach and release the sink for an ended track. Returns true when a
    /// sink was released.
    pub fn on_track_ended(&mut self, track_id: &str) -> bool {
        match self.sinks.remove(track_id) {
            Some(sink) => {
                sink.detach();
                tracing::debug!(
                    target = "voice::tracks",
                    track = track_id,
                    live = self.sinks.len(),
                    "sink detached"
                );
                true
            }
            None => {
                tracing::debug!(
                    target = "voice::tracks",
                    track = track_id,
                    "track ended with no sink"
                );
                false
            }
        }
    }

    /// Mute or unmute all playback sinks without touching the negotiated
    /// session. New sinks inherit the setting.
    pub fn set_playback_muted(&mut self, muted: bool) {
        self.playback_muted = muted;
        for sink in self.sinks.values() {
            sink.set_muted(muted);
        }
    }

    /// Detach every remaining sink. Used on session teardown.
    pub fn detach_all(&mut self) {
        for (_, sink) in self.sinks.drain() {
            sink.detach();
        }
    }

    pub fn live_count(&self) -> usize {
        self.sinks.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        muted: AtomicBool,
        detached: AtomicBool,
    }

    impl AudioSink for RecordingSink {
        fn set_muted(&self, muted: bool) {
            self.muted.store(muted, Ordering::SeqCst);
        }

        fn detach(&self) {
            assert!(
                !self.detached.swap(true, Ordering::SeqCst),
                "sink detached twice"
            );
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        attached: AtomicUsize,
        sinks: Mutex<Vec<Arc<RecordingSink>>>,
    }

    impl AudioSinkFactory for RecordingFactory {
        fn attach(&self, _track_id: &str, _stream_id: &str) -> Arc<dyn AudioSink> {
            self.attached.fetch_add(1, Ordering::SeqCst);
            let sink = Arc::new(RecordingSink::default());
            self.sinks.lock().push(sink.clone());
            sink
        }
    }

    #[test]
    fn double_add_yields_one_sink() {
        let factory = Arc::new(RecordingFactory::default());
        let mut tracks = TrackLifecycle::new(factory.clone());
        assert!(tracks.on_track_added("t1", "s1"));
        assert!(!tracks.on_track_added("t1", "s1"));
        assert_eq!(tracks.live_count(), 1);
        assert_eq!(factory.attached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_and_detach_are_paired() {
        let factory = Arc::new(RecordingFactory::default());
        let mut tracks = TrackLifecycle::new(factory.clone());
        tracks.on_track_added("t1", "s1");
        assert!(tracks.on_track_ended("t1"));
        assert!(!tracks.on_track_ended("t1"));
        assert!(!tracks.on_track_ended("never-seen"));
        assert_eq!(tracks.live_count(), 0);
        assert!(factory.sinks.lock()[0].detached.load(Ordering::SeqCst));
    }

    #[test]
    fn teardown_detaches_remaining_sinks_once() {
        let factory = Arc::new(RecordingFactory::default());
        let mut tracks = TrackLifecycle::new(factory.clone());
        tracks.on_track_added("t1", "s1");
        tracks.on_track_added("t2", "s1");
        tracks.detach_all();
        assert_eq!(tracks.live_count(), 0);
        for sink in factory.sinks.lock().iter() {
            assert!(sink.detached.load(Ordering::SeqCst));
        }
        // detach_all on an empty manager is fine.
        tracks.detach_all();
    }

    #[test]
    fn playback_mute_applies_to_current_and_future_sinks() {
        let factory = Arc::new(RecordingFactory::default());
        let mut tracks = TrackLifecycle::new(factory.clone());
        tracks.on_track_added("t1", "s1");
        tracks.set_playback_muted(true);
        tracks.on_track_added("t2", "s1");
        for sink in factory.sinks.lock().iter() {
            assert!(sink.muted.load(Ordering::SeqCst));
        }
        tracks.set_playback_muted(false);
        assert!(!factory.sinks.lock()[0].muted.load(Ordering::SeqCst));
    }
}
