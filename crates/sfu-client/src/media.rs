//! Track and stream model.
//!
//! A [`MediaTrack`] is a handle: cloning the Rust value shares the same track.
//! [`MediaTrack::clone_track`] instead creates an independent track that
//! shares the underlying capture source. Each track has its own live flag, and
//! the source stays held while any of its tracks is live.

use signaling_protocol::rtp::MediaKind;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Notified when a capture source is released.
pub trait SourceObserver: Send + Sync {
    /// The last live track of a source on `device_id` stopped.
    fn source_released(&self, kind: MediaKind, device_id: &str);
}

/// Hardware capture source shared by a track and its clones.
struct CaptureSource {
    device_id: String,
    live_tracks: AtomicUsize,
    observer: Option<Arc<dyn SourceObserver>>,
}

impl CaptureSource {
    /// Count one more live track unless the source is already released.
    fn retain(&self) -> bool {
        self.live_tracks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_one(&self, kind: MediaKind) {
        if self.live_tracks.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(observer) = &self.observer {
                observer.source_released(kind, &self.device_id);
            }
        }
    }
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    live: AtomicBool,
    source: Option<Arc<CaptureSource>>,
}

/// One audio or video track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Track backed by a capture device. The observer learns when every
    /// track on the device has stopped.
    pub fn captured(
        kind: MediaKind,
        device_id: impl Into<String>,
        label: impl Into<String>,
        observer: Option<Arc<dyn SourceObserver>>,
    ) -> Self {
        let source = CaptureSource {
            device_id: device_id.into(),
            live_tracks: AtomicUsize::new(1),
            observer,
        };
        Self::with_source(kind, label.into(), Some(Arc::new(source)))
    }

    /// Track fed by a remote consumer. Stopping it holds no hardware.
    pub fn remote(kind: MediaKind, label: impl Into<String>) -> Self {
        Self::with_source(kind, label.into(), None)
    }

    fn with_source(kind: MediaKind, label: String, source: Option<Arc<CaptureSource>>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                label,
                live: AtomicBool::new(true),
                source,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Device the track captures from, if any.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.inner.source.as_ref().map(|s| s.device_id.as_str())
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Create an independent track on the same source.
    ///
    /// The clone starts live if this track is live. Stopping either one
    /// leaves the other running.
    #[must_use]
    pub fn clone_track(&self) -> MediaTrack {
        // A concurrent stop may release the source after `is_live` reads true.
        let live = self.is_live()
            && self
                .inner
                .source
                .as_ref()
                .map_or(true, |source| source.retain());
        let clone = Self::with_source(
            self.inner.kind,
            self.inner.label.clone(),
            self.inner.source.clone(),
        );
        if !live {
            clone.inner.live.store(false, Ordering::Release);
        }
        clone
    }

    /// Stop the track. Stopping twice is a no-op.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::AcqRel) {
            if let Some(source) = &self.inner.source {
                source.release_one(self.inner.kind);
            }
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("device_id", &self.device_id())
            .field("live", &self.is_live())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// An ordered set of tracks.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// First live track of `kind`.
    #[must_use]
    pub fn live_track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks_of(kind).find(|t| t.is_live())
    }

    #[must_use]
    pub fn has_live(&self, kind: MediaKind) -> bool {
        self.live_track(kind).is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn track_ids(&self) -> Vec<&str> {
        self.tracks.iter().map(MediaTrack::id).collect()
    }

    /// Stop every track of `kind`.
    pub fn stop_kind(&self, kind: MediaKind) {
        self.tracks_of(kind).for_each(MediaTrack::stop);
    }

    pub fn stop_all(&self) {
        self.tracks.iter().for_each(MediaTrack::stop);
    }

    /// New stream holding this stream's tracks other than `kind`.
    #[must_use]
    pub fn without_kind(&self, kind: MediaKind) -> MediaStream {
        MediaStream::new(
            self.tracks
                .iter()
                .filter(|t| t.kind() != kind)
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Releases(Mutex<Vec<(MediaKind, String)>>);

    impl SourceObserver for Releases {
        fn source_released(&self, kind: MediaKind, device_id: &str) {
            self.0.lock().push((kind, device_id.to_string()));
        }
    }

    fn camera(observer: &Arc<Releases>) -> MediaTrack {
        let observer: Arc<dyn SourceObserver> = observer.clone();
        MediaTrack::captured(MediaKind::Video, "cam-1", "Camera", Some(observer))
    }

    #[test]
    fn test_clone_survives_stopping_original() {
        let releases = Arc::new(Releases::default());
        let original = camera(&releases);
        let clone = original.clone_track();

        assert_ne!(original.id(), clone.id());
        original.stop();

        assert!(!original.is_live());
        assert!(clone.is_live());
        assert!(releases.0.lock().is_empty(), "source still held by clone");

        clone.stop();
        assert_eq!(
            releases.0.lock().as_slice(),
            &[(MediaKind::Video, "cam-1".to_string())]
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let releases = Arc::new(Releases::default());
        let track = camera(&releases);
        track.stop();
        track.stop();
        assert_eq!(releases.0.lock().len(), 1);
    }

    #[test]
    fn test_clone_of_stopped_track_is_stopped() {
        let releases = Arc::new(Releases::default());
        let track = camera(&releases);
        track.stop();
        let clone = track.clone_track();
        assert!(!clone.is_live());
        clone.stop();
        assert_eq!(releases.0.lock().len(), 1);
    }

    #[test]
    fn test_clone_racing_stop_never_revives_released_source() {
        for _ in 0..200 {
            let releases = Arc::new(Releases::default());
            let original = camera(&releases);
            let barrier = std::sync::Barrier::new(2);

            let clone = std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    original.stop();
                });
                let cloner = scope.spawn(|| {
                    barrier.wait();
                    original.clone_track()
                });
                cloner.join().unwrap()
            });

            if clone.is_live() {
                assert!(releases.0.lock().is_empty());
            }
            clone.stop();
            assert_eq!(releases.0.lock().len(), 1);
        }
    }

    #[test]
    fn test_handle_clone_shares_track() {
        let track = MediaTrack::remote(MediaKind::Audio, "remote");
        let handle = track.clone();
        handle.stop();
        assert!(!track.is_live());
        assert_eq!(track, handle);
        assert!(track.device_id().is_none());
    }

    #[test]
    fn test_stream_queries() {
        let audio = MediaTrack::remote(MediaKind::Audio, "mic");
        let video = MediaTrack::remote(MediaKind::Video, "cam");
        let stream = MediaStream::new(vec![audio.clone(), video.clone()]);

        assert!(stream.has_live(MediaKind::Audio));
        assert!(stream.has_live(MediaKind::Video));

        stream.stop_kind(MediaKind::Video);
        assert!(!stream.has_live(MediaKind::Video));
        assert!(audio.is_live());

        let audio_only = stream.without_kind(MediaKind::Video);
        assert_eq!(audio_only.track_ids(), vec![audio.id()]);
        assert_ne!(audio_only.id(), stream.id());
    }
}
