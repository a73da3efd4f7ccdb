//! Scriptable capture devices.
//!
//! `FakeMediaDevices` hands out tracks backed by fake hardware sources and
//! tracks how many sources are open per device. In exclusive mode a capture
//! that needs an already-open device fails with `Busy`, as some platforms do.
//! Captures can be gated so tests control exactly when each one resolves.

use async_trait::async_trait;
use parking_lot::Mutex;
use sfu_client::devices::{DeviceInfo, MediaConstraints, MediaDevices, TrackConstraint};
use sfu_client::errors::CaptureError;
use sfu_client::media::{MediaStream, MediaTrack, SourceObserver};
use signaling_protocol::rtp::MediaKind;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Default)]
struct FakeState {
    devices: Vec<DeviceInfo>,
    open_sources: HashMap<String, usize>,
    next_failure: Option<CaptureError>,
    gates: VecDeque<oneshot::Sender<()>>,
}

struct FakeInner {
    state: Mutex<FakeState>,
    exclusive: AtomicBool,
    gated: AtomicBool,
    captures: AtomicUsize,
}

impl SourceObserver for FakeInner {
    fn source_released(&self, _kind: MediaKind, device_id: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.open_sources.get_mut(device_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.open_sources.remove(device_id);
            }
        }
    }
}

/// Fake platform capture API.
#[derive(Clone)]
pub struct FakeMediaDevices {
    inner: Arc<FakeInner>,
}

impl Default for FakeMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMediaDevices {
    /// One microphone (`mic-1`) and one camera (`cam-1`), exclusive mode on.
    pub fn new() -> Self {
        let devices = Self::empty();
        devices.add_device("mic-1", MediaKind::Audio, "Built-in Microphone");
        devices.add_device("cam-1", MediaKind::Video, "Built-in Camera");
        devices
    }

    /// No devices.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(FakeInner {
                state: Mutex::new(FakeState::default()),
                exclusive: AtomicBool::new(true),
                gated: AtomicBool::new(false),
                captures: AtomicUsize::new(0),
            }),
        }
    }

    pub fn add_device(&self, device_id: &str, kind: MediaKind, label: &str) {
        self.inner.state.lock().devices.push(DeviceInfo {
            device_id: device_id.to_string(),
            kind,
            label: label.to_string(),
        });
    }

    pub fn remove_device(&self, device_id: &str) {
        self.inner
            .state
            .lock()
            .devices
            .retain(|d| d.device_id != device_id);
    }

    /// Whether an already-open device refuses a second capture.
    pub fn set_exclusive(&self, exclusive: bool) {
        self.inner.exclusive.store(exclusive, Ordering::SeqCst);
    }

    /// Hold every capture until `release_next` is called.
    pub fn set_gated(&self, gated: bool) {
        self.inner.gated.store(gated, Ordering::SeqCst);
    }

    /// Make the next capture fail with `error`.
    pub fn fail_next(&self, error: CaptureError) {
        self.inner.state.lock().next_failure = Some(error);
    }

    /// Release the oldest gated capture. Returns false if none is waiting.
    pub fn release_next(&self) -> bool {
        let gate = self.inner.state.lock().gates.pop_front();
        match gate {
            Some(gate) => gate.send(()).is_ok(),
            None => false,
        }
    }

    /// Number of gated captures waiting for release.
    pub fn pending_captures(&self) -> usize {
        self.inner.state.lock().gates.len()
    }

    /// Number of capture calls made.
    pub fn capture_count(&self) -> usize {
        self.inner.captures.load(Ordering::SeqCst)
    }

    /// Open sources on devices of `kind`.
    pub fn open_sources(&self, kind: MediaKind) -> usize {
        let state = self.inner.state.lock();
        state
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .map(|d| state.open_sources.get(&d.device_id).copied().unwrap_or(0))
            .sum()
    }

    /// Open sources on every device.
    pub fn total_open_sources(&self) -> usize {
        self.inner.state.lock().open_sources.values().sum()
    }

    fn pick_device(
        state: &FakeState,
        kind: MediaKind,
        constraint: &TrackConstraint,
    ) -> Result<DeviceInfo, CaptureError> {
        let mut of_kind = state.devices.iter().filter(|d| d.kind == kind);
        let found = match constraint {
            TrackConstraint::Exact(id) => of_kind.find(|d| &d.device_id == id),
            _ => of_kind.next(),
        };
        found.cloned().ok_or(CaptureError::NotFound(kind))
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CaptureError> {
        self.inner.captures.fetch_add(1, Ordering::SeqCst);

        if self.inner.gated.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            self.inner.state.lock().gates.push_back(tx);
            rx.await
                .map_err(|_| CaptureError::Other("capture abandoned".to_string()))?;
        }

        let observer: Arc<dyn SourceObserver> = self.inner.clone();
        let mut state = self.inner.state.lock();
        if let Some(error) = state.next_failure.take() {
            return Err(error);
        }

        let mut picked = Vec::new();
        for kind in constraints.kinds() {
            picked.push(Self::pick_device(&state, kind, constraints.get(kind))?);
        }
        if self.inner.exclusive.load(Ordering::SeqCst)
            && picked
                .iter()
                .any(|d| state.open_sources.contains_key(&d.device_id))
        {
            return Err(CaptureError::Busy);
        }

        let tracks = picked
            .into_iter()
            .map(|device| {
                *state
                    .open_sources
                    .entry(device.device_id.clone())
                    .or_insert(0) += 1;
                MediaTrack::captured(
                    device.kind,
                    device.device_id,
                    device.label,
                    Some(observer.clone()),
                )
            })
            .collect();
        Ok(MediaStream::new(tracks))
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        Ok(self.inner.state.lock().devices.clone())
    }
}
