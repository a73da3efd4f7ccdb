//! Pre-join preview.
//!
//! Every capture attempt takes a ticket from a growing generation counter.
//! A finished capture is adopted only if its ticket is still the newest and
//! the session is neither joining nor joined; otherwise the stream is stopped
//! on the spot. Overlapping captures are allowed and resolved by that check.
//!
//! Device ownership moves in one direction: preview, then session. The
//! session always receives clones, so the preview can be stopped as soon as
//! the join settles.

use crate::devices::{MediaConstraints, MediaDevices, TrackConstraint};
use crate::errors::{CaptureError, SessionError};
use crate::media::MediaStream;
use crate::session::{JoinIntent, SessionHandle};
use parking_lot::Mutex;
use signaling_protocol::rtp::MediaKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the preview should show.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewWants {
    pub audio: bool,
    pub video: bool,
    pub audio_device_id: Option<String>,
    pub video_device_id: Option<String>,
}

impl PreviewWants {
    #[must_use]
    pub fn new(audio: bool, video: bool) -> Self {
        Self {
            audio,
            video,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: TrackConstraint::from_choice(self.audio, self.audio_device_id.as_deref()),
            video: TrackConstraint::from_choice(self.video, self.video_device_id.as_deref()),
        }
    }

    /// True if `stream` already shows exactly what is wanted.
    #[must_use]
    pub fn satisfied_by(&self, stream: &MediaStream) -> bool {
        let constraints = self.constraints();
        [MediaKind::Audio, MediaKind::Video].into_iter().all(|kind| {
            let constraint = constraints.get(kind);
            match stream.live_track(kind) {
                None => !constraint.is_wanted(),
                Some(track) => match constraint {
                    TrackConstraint::Disabled => false,
                    TrackConstraint::Any => true,
                    TrackConstraint::Exact(id) => track.device_id() == Some(id.as_str()),
                },
            }
        })
    }
}

/// Result of a preview refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewOutcome {
    /// A fresh capture became the preview.
    Adopted,
    /// The current preview already matched.
    Unchanged,
    /// Nothing wanted; the preview was stopped.
    Cleared,
    /// The capture was superseded and its stream stopped.
    Discarded,
    /// The session is joining or joined.
    Skipped,
    /// The capture failed.
    Failed(CaptureError),
}

#[derive(Default)]
struct PreviewState {
    stream: Option<MediaStream>,
    error: Option<String>,
}

/// Owns capture before the session joins.
pub struct PreviewCoordinator {
    devices: Arc<dyn MediaDevices>,
    session: SessionHandle,
    generation: AtomicU64,
    joining: AtomicBool,
    state: Mutex<PreviewState>,
}

impl PreviewCoordinator {
    pub fn new(devices: Arc<dyn MediaDevices>, session: SessionHandle) -> Self {
        Self {
            devices,
            session,
            generation: AtomicU64::new(0),
            joining: AtomicBool::new(false),
            state: Mutex::new(PreviewState::default()),
        }
    }

    #[must_use]
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    #[must_use]
    pub fn preview_stream(&self) -> Option<MediaStream> {
        self.state.lock().stream.clone()
    }

    /// Message from the last failed capture or join.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Supersede every capture in flight. Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply new wants: turn the camera off at once if needed, then refresh.
    pub async fn update(&self, wants: &PreviewWants) -> PreviewOutcome {
        let has_video = self
            .state
            .lock()
            .stream
            .as_ref()
            .is_some_and(|s| s.has_live(MediaKind::Video));
        if !wants.video && has_video {
            self.camera_off();
        }
        self.refresh(wants).await
    }

    /// Stop video tracks now and keep showing the remaining audio.
    pub fn camera_off(&self) {
        self.invalidate();
        let mut state = self.state.lock();
        if let Some(stream) = state.stream.take() {
            stream.stop_kind(MediaKind::Video);
            let rest = stream.without_kind(MediaKind::Video);
            state.stream = (!rest.is_empty()).then_some(rest);
        }
        debug!(target: "sfu.client.preview", "Camera off");
    }

    /// Stop the preview and supersede captures in flight.
    pub fn stop_preview(&self) {
        self.invalidate();
        let stream = self.state.lock().stream.take();
        if let Some(stream) = stream {
            stream.stop_all();
        }
    }

    fn is_blocked(&self) -> bool {
        self.joining.load(Ordering::SeqCst) || self.session.phase().is_active()
    }

    /// Capture a preview matching `wants` unless the current one already does.
    pub async fn refresh(&self, wants: &PreviewWants) -> PreviewOutcome {
        if self.is_blocked() {
            return PreviewOutcome::Skipped;
        }
        if !wants.audio && !wants.video {
            self.stop_preview();
            return PreviewOutcome::Cleared;
        }
        let current_matches = self
            .state
            .lock()
            .stream
            .as_ref()
            .is_some_and(|s| wants.satisfied_by(s));
        if current_matches {
            return PreviewOutcome::Unchanged;
        }

        // The device must be free before it is opened again.
        self.stop_preview();
        let ticket = self.invalidate();
        let result = self.devices.get_user_media(&wants.constraints()).await;

        let mut state = self.state.lock();
        if ticket != self.generation() || self.is_blocked() {
            drop(state);
            if let Ok(stream) = result {
                stream.stop_all();
            }
            debug!(target: "sfu.client.preview", ticket, "Discarded stale capture");
            return PreviewOutcome::Discarded;
        }

        match result {
            Ok(stream) => {
                if let Some(previous) = state.stream.replace(stream) {
                    previous.stop_all();
                }
                state.error = None;
                PreviewOutcome::Adopted
            }
            Err(e) => {
                warn!(target: "sfu.client.preview", error = %e, "Preview capture failed");
                state.error = Some(e.user_message().to_string());
                PreviewOutcome::Failed(e)
            }
        }
    }

    /// Hand the devices to the session and join.
    ///
    /// The preview is reused as the clone source when it already has every
    /// kind the intent needs. Otherwise it is stopped and a base stream is
    /// captured here. On success the preview is stopped; on failure the
    /// error message is set and no base stream stays open.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoToken`] without a credential,
    /// [`SessionError::NoRoomId`] for a blank room, a capture error
    /// when the base stream cannot be opened, or the session's join error.
    pub async fn join(&self, intent: JoinIntent) -> Result<(), SessionError> {
        // Rejected before the preview is touched or any device is opened.
        let invalid = if !intent.has_credential() {
            Some(SessionError::NoToken)
        } else if intent.room_id.is_blank() {
            Some(SessionError::NoRoomId)
        } else {
            None
        };
        if let Some(e) = invalid {
            self.set_error(e.user_message());
            return Err(e);
        }

        self.joining.store(true, Ordering::SeqCst);
        self.invalidate();

        let result = self.hand_off(intent).await;
        match &result {
            Ok(()) => {
                self.stop_preview();
                self.state.lock().error = None;
            }
            Err(e) => self.set_error(e.user_message()),
        }

        self.joining.store(false, Ordering::SeqCst);
        result
    }

    async fn hand_off(&self, intent: JoinIntent) -> Result<(), SessionError> {
        let needed = intent.constraints();
        let reusable = self
            .preview_stream()
            .filter(|stream| needed.kinds().into_iter().all(|kind| stream.has_live(kind)));

        let (base, owned) = match reusable {
            Some(stream) => (Some(stream), false),
            None if needed.is_empty() => (None, false),
            None => {
                self.stop_preview();
                (Some(self.devices.get_user_media(&needed).await?), true)
            }
        };

        let result = self.session.join(intent, base.clone()).await;
        if owned {
            if let Some(base) = base {
                base.stop_all();
            }
        }
        result
    }

    fn set_error(&self, message: &str) {
        self.state.lock().error = Some(message.to_string());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;

    fn stream(kinds: &[(MediaKind, &str)]) -> MediaStream {
        MediaStream::new(
            kinds
                .iter()
                .map(|(kind, device)| MediaTrack::captured(*kind, *device, "dev", None))
                .collect(),
        )
    }

    #[test]
    fn test_satisfied_by_exact_kinds() {
        let both = stream(&[(MediaKind::Audio, "mic-1"), (MediaKind::Video, "cam-1")]);
        assert!(PreviewWants::new(true, true).satisfied_by(&both));
        assert!(!PreviewWants::new(true, false).satisfied_by(&both));

        let audio = stream(&[(MediaKind::Audio, "mic-1")]);
        assert!(PreviewWants::new(true, false).satisfied_by(&audio));
        assert!(!PreviewWants::new(true, true).satisfied_by(&audio));
    }

    #[test]
    fn test_satisfied_by_checks_pinned_device() {
        let video = stream(&[(MediaKind::Video, "cam-1")]);
        let mut wants = PreviewWants::new(false, true);
        wants.video_device_id = Some("cam-2".to_string());
        assert!(!wants.satisfied_by(&video));

        wants.video_device_id = Some("cam-1".to_string());
        assert!(wants.satisfied_by(&video));
    }

    #[test]
    fn test_stopped_tracks_do_not_satisfy() {
        let video = stream(&[(MediaKind::Video, "cam-1")]);
        video.stop_all();
        assert!(!PreviewWants::new(false, true).satisfied_by(&video));
        assert!(PreviewWants::new(false, false).satisfied_by(&video));
    }
}
