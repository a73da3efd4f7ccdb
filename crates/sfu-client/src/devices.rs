//! Capture device seam.

use crate::errors::CaptureError;
use crate::media::MediaStream;
use async_trait::async_trait;
use signaling_protocol::rtp::MediaKind;

/// Constraint for one kind of track.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TrackConstraint {
    /// Do not capture this kind.
    #[default]
    Disabled,
    /// Any device of this kind.
    Any,
    /// The device with this id.
    Exact(String),
}

impl TrackConstraint {
    /// Constraint for a kind that is `enabled`, optionally pinned to a device.
    #[must_use]
    pub fn from_choice(enabled: bool, device_id: Option<&str>) -> Self {
        match (enabled, device_id) {
            (false, _) => TrackConstraint::Disabled,
            (true, Some(id)) if !id.is_empty() => TrackConstraint::Exact(id.to_string()),
            (true, _) => TrackConstraint::Any,
        }
    }

    #[must_use]
    pub fn is_wanted(&self) -> bool {
        !matches!(self, TrackConstraint::Disabled)
    }

    /// Device id this constraint pins, if any.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self {
            TrackConstraint::Exact(id) => Some(id),
            _ => None,
        }
    }
}

/// What to capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: TrackConstraint,
    pub video: TrackConstraint,
}

impl MediaConstraints {
    /// Constraints capturing only `kind`.
    #[must_use]
    pub fn only(kind: MediaKind, constraint: TrackConstraint) -> Self {
        match kind {
            MediaKind::Audio => Self {
                audio: constraint,
                video: TrackConstraint::Disabled,
            },
            MediaKind::Video => Self {
                audio: TrackConstraint::Disabled,
                video: constraint,
            },
        }
    }

    #[must_use]
    pub fn get(&self, kind: MediaKind) -> &TrackConstraint {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    /// Kinds that should be captured, audio first.
    #[must_use]
    pub fn kinds(&self) -> Vec<MediaKind> {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .filter(|kind| self.get(*kind).is_wanted())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.audio.is_wanted() && !self.video.is_wanted()
    }
}

/// An input device reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: MediaKind,
    pub label: String,
}

/// Platform capture API.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture a stream matching `constraints`.
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CaptureError>;

    /// List available input devices.
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError>;
}

/// The user's chosen input devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelection {
    pub audio: Option<String>,
    pub video: Option<String>,
}

impl DeviceSelection {
    /// Keep each choice that is still present, otherwise fall back to the
    /// first device of that kind.
    #[must_use]
    pub fn resolve(&self, devices: &[DeviceInfo]) -> DeviceSelection {
        let pick = |kind: MediaKind, chosen: &Option<String>| {
            let mut of_kind = devices.iter().filter(|d| d.kind == kind);
            match chosen {
                Some(id) if devices.iter().any(|d| d.kind == kind && &d.device_id == id) => {
                    Some(id.clone())
                }
                _ => of_kind.next().map(|d| d.device_id.clone()),
            }
        };
        DeviceSelection {
            audio: pick(MediaKind::Audio, &self.audio),
            video: pick(MediaKind::Video, &self.video),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn device(id: &str, kind: MediaKind) -> DeviceInfo {
        DeviceInfo {
            device_id: id.to_string(),
            kind,
            label: id.to_uppercase(),
        }
    }

    #[test]
    fn test_constraint_from_choice() {
        assert_eq!(TrackConstraint::from_choice(false, Some("x")), TrackConstraint::Disabled);
        assert_eq!(TrackConstraint::from_choice(true, None), TrackConstraint::Any);
        assert_eq!(TrackConstraint::from_choice(true, Some("")), TrackConstraint::Any);
        assert_eq!(
            TrackConstraint::from_choice(true, Some("cam-2")),
            TrackConstraint::Exact("cam-2".to_string())
        );
    }

    #[test]
    fn test_constraint_kinds() {
        let both = MediaConstraints {
            audio: TrackConstraint::Any,
            video: TrackConstraint::Any,
        };
        assert_eq!(both.kinds(), vec![MediaKind::Audio, MediaKind::Video]);

        let video = MediaConstraints::only(MediaKind::Video, TrackConstraint::Any);
        assert_eq!(video.kinds(), vec![MediaKind::Video]);
        assert!(MediaConstraints::default().is_empty());
    }

    #[test]
    fn test_resolve_keeps_present_choice() {
        let devices = vec![
            device("mic-1", MediaKind::Audio),
            device("cam-1", MediaKind::Video),
            device("cam-2", MediaKind::Video),
        ];
        let selection = DeviceSelection {
            audio: Some("mic-1".to_string()),
            video: Some("cam-2".to_string()),
        };
        assert_eq!(selection.resolve(&devices), selection);
    }

    #[test]
    fn test_resolve_falls_back_when_choice_missing() {
        let devices = vec![
            device("mic-1", MediaKind::Audio),
            device("cam-1", MediaKind::Video),
        ];
        let selection = DeviceSelection {
            audio: Some("unplugged".to_string()),
            video: None,
        };
        let resolved = selection.resolve(&devices);
        assert_eq!(resolved.audio.as_deref(), Some("mic-1"));
        assert_eq!(resolved.video.as_deref(), Some("cam-1"));
    }

    #[test]
    fn test_resolve_with_no_devices() {
        let selection = DeviceSelection {
            audio: Some("mic-1".to_string()),
            video: None,
        };
        assert_eq!(selection.resolve(&[]), DeviceSelection::default());
    }

    #[test]
    fn test_choice_of_wrong_kind_is_not_kept() {
        let devices = vec![device("dev-1", MediaKind::Audio), device("cam-1", MediaKind::Video)];
        let selection = DeviceSelection {
            audio: None,
            video: Some("dev-1".to_string()),
        };
        assert_eq!(selection.resolve(&devices).video.as_deref(), Some("cam-1"));
    }
}
