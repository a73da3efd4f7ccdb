//! Session controller.
//!
//! A [`SessionHandle`] fronts a single actor task that owns the channel and
//! every negotiation object of the current session. Joins, leaves and toggles
//! are processed one at a time in arrival order. Pushes are forwarded into the
//! same mailbox by a pump task, and each remote producer is consumed in its
//! own task so that one failing subscription cannot stall the session.
//!
//! Phase transitions:
//!
//! ```text
//! NOT_JOINED -> JOINING -> JOINED -> LEAVING -> NOT_JOINED
//! ```

use crate::channel::{SignalingChannel, SignalingConnector};
use crate::devices::{MediaConstraints, MediaDevices, TrackConstraint};
use crate::errors::{CaptureError, ChannelError, SessionError};
use crate::media::{MediaStream, MediaTrack};
use crate::negotiation::{Device, LocalConsumer, LocalProducer, LocalTransport};
use common::secret::{ExposeSecret, SecretString};
use common::types::{ConsumerId, ParticipantId, ProducerId, RoomId};
use signaling_protocol::rtp::{MediaKind, TransportDirection};
use signaling_protocol::{Push, Request, Response};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const MAILBOX_CAPACITY: usize = 64;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    NotJoined,
    Joining,
    Joined,
    Leaving,
}

impl SessionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::NotJoined => "NOT_JOINED",
            SessionPhase::Joining => "JOINING",
            SessionPhase::Joined => "JOINED",
            SessionPhase::Leaving => "LEAVING",
        }
    }

    /// `JOINING` or `JOINED`.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, SessionPhase::Joining | SessionPhase::Joined)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user asked for when joining.
#[derive(Debug)]
pub struct JoinIntent {
    pub room_id: RoomId,
    pub credential: Option<SecretString>,
    pub mic_on: bool,
    pub cam_on: bool,
    pub audio_device_id: Option<String>,
    pub video_device_id: Option<String>,
}

impl JoinIntent {
    /// Intent with microphone and camera on and default devices.
    pub fn new(room_id: impl Into<RoomId>, credential: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            credential: Some(SecretString::from(credential.into())),
            mic_on: true,
            cam_on: true,
            audio_device_id: None,
            video_device_id: None,
        }
    }

    #[must_use]
    pub fn with_mic(mut self, on: bool) -> Self {
        self.mic_on = on;
        self
    }

    #[must_use]
    pub fn with_cam(mut self, on: bool) -> Self {
        self.cam_on = on;
        self
    }

    #[must_use]
    pub fn with_devices(mut self, audio: Option<String>, video: Option<String>) -> Self {
        self.audio_device_id = audio;
        self.video_device_id = video;
        self
    }

    #[must_use]
    pub fn wants(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.mic_on,
            MediaKind::Video => self.cam_on,
        }
    }

    #[must_use]
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: TrackConstraint::from_choice(self.mic_on, self.audio_device_id.as_deref()),
            video: TrackConstraint::from_choice(self.cam_on, self.video_device_id.as_deref()),
        }
    }

    pub(crate) fn has_credential(&self) -> bool {
        self.credential
            .as_ref()
            .is_some_and(|c| !c.expose_secret().trim().is_empty())
    }
}

/// A playable remote track.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTrack {
    pub participant_id: ParticipantId,
    pub producer_id: ProducerId,
    pub consumer_id: ConsumerId,
    pub kind: MediaKind,
    pub track: MediaTrack,
}

/// Counts of objects the session currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub producers: usize,
    pub consumers: usize,
    pub transports: usize,
    pub consumes_in_flight: usize,
    pub channel_open: bool,
}

impl SessionStats {
    /// True when nothing is held.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        *self == SessionStats::default()
    }
}

enum SessionMessage {
    Join {
        intent: JoinIntent,
        supplied: Option<MediaStream>,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Leave {
        respond_to: oneshot::Sender<()>,
    },
    SetEnabled {
        kind: MediaKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Push {
        epoch: u64,
        push: Push,
    },
    ConsumerReady {
        epoch: u64,
        participant_id: ParticipantId,
        consumer: Arc<LocalConsumer>,
        respond_to: oneshot::Sender<bool>,
    },
    ConsumeFailed {
        epoch: u64,
        producer_id: ProducerId,
    },
    Stats {
        respond_to: oneshot::Sender<SessionStats>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a session actor.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    participant_id: ParticipantId,
    phase: watch::Receiver<SessionPhase>,
    local_stream: watch::Receiver<Option<MediaStream>>,
    remote_tracks: watch::Receiver<Vec<RemoteTrack>>,
    cancel_token: CancellationToken,
}

impl SessionHandle {
    /// Spawn a session actor for `participant_id`.
    pub fn new(
        connector: Arc<dyn SignalingConnector>,
        devices: Arc<dyn MediaDevices>,
        participant_id: ParticipantId,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let (phase_tx, phase) = watch::channel(SessionPhase::NotJoined);
        let (local_tx, local_stream) = watch::channel(None);
        let (remote_tx, remote_tracks) = watch::channel(Vec::new());
        let cancel_token = CancellationToken::new();

        let actor = SessionActor {
            connector,
            devices,
            participant_id: participant_id.clone(),
            receiver,
            mailbox: sender.downgrade(),
            phase_tx,
            local_tx,
            remote_tx,
            active: None,
            epoch: 0,
            cancel_token: cancel_token.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            participant_id,
            phase,
            local_stream,
            remote_tracks,
            cancel_token,
        }
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// The tracks currently being produced. Replaced only when track
    /// identities change.
    #[must_use]
    pub fn local_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.local_stream.clone()
    }

    #[must_use]
    pub fn remote_tracks(&self) -> watch::Receiver<Vec<RemoteTrack>> {
        self.remote_tracks.clone()
    }

    /// Join a room, tearing down any previous session first.
    ///
    /// Tracks in `supplied` are cloned, never produced directly, so the
    /// caller may stop them once this returns.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NoToken`] / [`SessionError::NoRoomId`] for an incomplete intent
    /// - [`SessionError::Capture`] when a device cannot be opened
    /// - [`SessionError::Channel`] / [`SessionError::Negotiation`] when setup fails
    pub async fn join(
        &self,
        intent: JoinIntent,
        supplied: Option<MediaStream>,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Join {
            intent,
            supplied,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the current session. Returns once every resource is released.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Internal`] if the actor is gone.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Leave { respond_to: tx }).await?;
        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))
    }

    /// # Errors
    ///
    /// Returns [`SessionError::NotJoined`] outside `JOINED`, or a capture or
    /// channel error when enabling fails.
    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.set_enabled(MediaKind::Audio, enabled).await
    }

    /// # Errors
    ///
    /// Returns [`SessionError::NotJoined`] outside `JOINED`, or a capture or
    /// channel error when enabling fails.
    pub async fn set_cam_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.set_enabled(MediaKind::Video, enabled).await
    }

    async fn set_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::SetEnabled {
            kind,
            enabled,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))?
    }

    /// Objects the session currently holds.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Internal`] if the actor is gone.
    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Stats { respond_to: tx }).await?;
        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))
    }

    /// Leave and stop the actor.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Internal`] if the actor is already gone.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Shutdown { respond_to: tx }).await?;
        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop the actor without waiting. The current session is torn down.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn send(&self, message: SessionMessage) -> Result<(), SessionError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }
}

struct RemoteEntry {
    participant_id: ParticipantId,
    consumer: Arc<LocalConsumer>,
}

/// Everything held for one joined room.
struct ActiveSession {
    epoch: u64,
    room_id: RoomId,
    channel: Arc<SignalingChannel>,
    device: Option<Arc<Device>>,
    send_transport: Option<LocalTransport>,
    recv_transport: Option<Arc<LocalTransport>>,
    audio: Option<LocalProducer>,
    video: Option<LocalProducer>,
    remotes: Vec<RemoteEntry>,
    in_flight: HashSet<ProducerId>,
    audio_device_id: Option<String>,
    video_device_id: Option<String>,
    background: CancellationToken,
}

impl ActiveSession {
    fn producer(&self, kind: MediaKind) -> Option<&LocalProducer> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    fn producer_slot(&mut self, kind: MediaKind) -> &mut Option<LocalProducer> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    fn pinned_device(&self, kind: MediaKind) -> Option<&str> {
        match kind {
            MediaKind::Audio => self.audio_device_id.as_deref(),
            MediaKind::Video => self.video_device_id.as_deref(),
        }
    }

    fn is_subscribed(&self, producer_id: &ProducerId) -> bool {
        self.in_flight.contains(producer_id)
            || self
                .remotes
                .iter()
                .any(|r| r.consumer.producer_id() == producer_id)
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            producers: usize::from(self.audio.is_some()) + usize::from(self.video.is_some()),
            consumers: self.remotes.len(),
            transports: usize::from(self.send_transport.is_some())
                + usize::from(self.recv_transport.is_some()),
            consumes_in_flight: self.in_flight.len(),
            channel_open: !self.channel.is_closed(),
        }
    }
}

struct SessionActor {
    connector: Arc<dyn SignalingConnector>,
    devices: Arc<dyn MediaDevices>,
    participant_id: ParticipantId,
    receiver: mpsc::Receiver<SessionMessage>,
    mailbox: mpsc::WeakSender<SessionMessage>,
    phase_tx: watch::Sender<SessionPhase>,
    local_tx: watch::Sender<Option<MediaStream>>,
    remote_tx: watch::Sender<Vec<RemoteTrack>>,
    active: Option<ActiveSession>,
    epoch: u64,
    cancel_token: CancellationToken,
}

impl SessionActor {
    #[instrument(skip_all, name = "sfu.client.session", fields(participant_id = %self.participant_id))]
    async fn run(mut self) {
        debug!(target: "sfu.client.session", "Session actor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.teardown();
                    break;
                }
                message = self.receiver.recv() => match message {
                    Some(SessionMessage::Shutdown { respond_to }) => {
                        self.teardown();
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(message) => self.handle_message(message).await,
                    None => {
                        self.teardown();
                        break;
                    }
                }
            }
        }

        debug!(target: "sfu.client.session", "Session actor stopped");
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join {
                intent,
                supplied,
                respond_to,
            } => {
                let result = self.join(intent, supplied).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::Leave { respond_to } => {
                self.teardown();
                let _ = respond_to.send(());
            }
            SessionMessage::SetEnabled {
                kind,
                enabled,
                respond_to,
            } => {
                let result = self.set_enabled(kind, enabled).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::Push { epoch, push } => self.on_push(epoch, push),
            SessionMessage::ConsumerReady {
                epoch,
                participant_id,
                consumer,
                respond_to,
            } => {
                let accepted = self.on_consumer_ready(epoch, participant_id, &consumer);
                if !accepted {
                    consumer.close();
                }
                let _ = respond_to.send(accepted);
            }
            SessionMessage::ConsumeFailed { epoch, producer_id } => {
                if let Some(active) = self.active.as_mut().filter(|a| a.epoch == epoch) {
                    active.in_flight.remove(&producer_id);
                }
            }
            SessionMessage::Stats { respond_to } => {
                let stats = self
                    .active
                    .as_ref()
                    .map(ActiveSession::stats)
                    .unwrap_or_default();
                let _ = respond_to.send(stats);
            }
            SessionMessage::Shutdown { respond_to } => {
                // Handled in run(); kept for exhaustiveness.
                let _ = respond_to.send(());
            }
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase_tx.send_replace(phase);
    }

    fn active(&self) -> Result<&ActiveSession, SessionError> {
        self.active.as_ref().ok_or(SessionError::NotJoined)
    }

    fn active_mut(&mut self) -> Result<&mut ActiveSession, SessionError> {
        self.active.as_mut().ok_or(SessionError::NotJoined)
    }

    async fn join(
        &mut self,
        intent: JoinIntent,
        supplied: Option<MediaStream>,
    ) -> Result<(), SessionError> {
        if !intent.has_credential() {
            return Err(SessionError::NoToken);
        }
        if intent.room_id.is_blank() {
            return Err(SessionError::NoRoomId);
        }

        if self.active.is_some() {
            self.teardown();
        }
        self.set_phase(SessionPhase::Joining);

        match self.establish(&intent, supplied.as_ref()).await {
            Ok(()) => {
                self.set_phase(SessionPhase::Joined);
                info!(
                    target: "sfu.client.session",
                    room_id = %intent.room_id,
                    "Joined room"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "sfu.client.session",
                    room_id = %intent.room_id,
                    error = %e,
                    "Join failed"
                );
                self.teardown();
                Err(e)
            }
        }
    }

    async fn establish(
        &mut self,
        intent: &JoinIntent,
        supplied: Option<&MediaStream>,
    ) -> Result<(), SessionError> {
        self.epoch += 1;
        let channel = Arc::new(
            self.connector
                .connect(&intent.room_id, &self.participant_id)
                .await?,
        );
        let Some(notifications) = channel.take_notifications() else {
            return Err(SessionError::Internal(
                "push subscription already taken".to_string(),
            ));
        };

        self.active = Some(ActiveSession {
            epoch: self.epoch,
            room_id: intent.room_id.clone(),
            channel: Arc::clone(&channel),
            device: None,
            send_transport: None,
            recv_transport: None,
            audio: None,
            video: None,
            remotes: Vec::new(),
            in_flight: HashSet::new(),
            audio_device_id: intent.audio_device_id.clone(),
            video_device_id: intent.video_device_id.clone(),
            background: self.cancel_token.child_token(),
        });

        let response = channel.request(Request::CapabilitiesRequest).await?;
        let Response::CapabilitiesResponse {
            rtp_capabilities, ..
        } = response
        else {
            return Err(unexpected("CAPABILITIES_RESPONSE", &response));
        };
        let mut device = Device::new();
        device.load(&rtp_capabilities)?;
        let device = Arc::new(device);
        self.active_mut()?.device = Some(Arc::clone(&device));

        let send = open_transport(&channel, &device, TransportDirection::Send).await?;
        self.active_mut()?.send_transport = Some(send);
        let recv = open_transport(&channel, &device, TransportDirection::Recv).await?;
        self.active_mut()?.recv_transport = Some(Arc::new(recv));

        for kind in [MediaKind::Audio, MediaKind::Video] {
            if !intent.wants(kind) {
                continue;
            }
            let track = match supplied.and_then(|s| s.live_track(kind)) {
                Some(track) => track.clone_track(),
                None => self.capture(kind).await?,
            };
            self.produce(kind, track).await?;
        }

        self.start_pump(notifications)?;
        self.sync_local_stream();
        Ok(())
    }

    /// Capture one fresh device track of `kind`.
    async fn capture(&self, kind: MediaKind) -> Result<MediaTrack, SessionError> {
        let constraint =
            TrackConstraint::from_choice(true, self.active()?.pinned_device(kind));
        let stream = self
            .devices
            .get_user_media(&MediaConstraints::only(kind, constraint))
            .await?;

        let track = stream.live_track(kind).cloned();
        for other in stream.tracks() {
            if Some(other) != track.as_ref() {
                other.stop();
            }
        }
        track.ok_or(SessionError::Capture(CaptureError::NotFound(kind)))
    }

    /// Produce `track`. The track is stopped if producing fails.
    async fn produce(&mut self, kind: MediaKind, track: MediaTrack) -> Result<(), SessionError> {
        match self.send_produce(kind, &track).await {
            Ok(producer_id) => {
                debug!(
                    target: "sfu.client.session",
                    producer_id = %producer_id,
                    kind = %kind,
                    "Producing"
                );
                let active = self.active_mut()?;
                *active.producer_slot(kind) = Some(LocalProducer::new(producer_id, track));
                Ok(())
            }
            Err(e) => {
                track.stop();
                Err(e)
            }
        }
    }

    async fn send_produce(
        &self,
        kind: MediaKind,
        track: &MediaTrack,
    ) -> Result<ProducerId, SessionError> {
        let active = self.active()?;
        let channel = Arc::clone(&active.channel);
        let (Some(device), Some(transport)) = (&active.device, &active.send_transport) else {
            return Err(SessionError::NotJoined);
        };
        transport.ensure_open()?;
        let rtp_parameters = device.send_parameters(track)?;
        let request = Request::Produce {
            transport_id: transport.id().clone(),
            kind,
            rtp_parameters,
        };

        match channel.request(request).await? {
            Response::Produced { producer_id } => Ok(producer_id),
            other => Err(unexpected("PRODUCED", &other)),
        }
    }

    async fn set_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<(), SessionError> {
        if *self.phase_tx.borrow() != SessionPhase::Joined {
            return Err(SessionError::NotJoined);
        }

        let result = if enabled {
            self.enable(kind).await
        } else {
            self.disable(kind).await;
            Ok(())
        };
        self.sync_local_stream();
        result
    }

    async fn enable(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        let current = self
            .active()?
            .producer(kind)
            .map(|producer| producer.track().is_live() && !producer.is_closed());
        match current {
            Some(true) => return Ok(()),
            // Track ended underneath us; replace it.
            Some(false) => self.disable(kind).await,
            None => {}
        }

        let track = self.capture(kind).await?;
        self.produce(kind, track).await
    }

    async fn disable(&mut self, kind: MediaKind) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(producer) = active.producer_slot(kind).take() else {
            return;
        };
        producer.track().stop();
        producer.close();

        let channel = Arc::clone(&active.channel);
        let request = Request::CloseProducer {
            producer_id: producer.id().clone(),
        };
        if let Err(e) = channel.request(request).await {
            warn!(
                target: "sfu.client.session",
                producer_id = %producer.id(),
                error = %e,
                "Server-side producer close failed"
            );
        }
    }

    fn start_pump(
        &mut self,
        mut notifications: mpsc::UnboundedReceiver<Push>,
    ) -> Result<(), SessionError> {
        let active = self.active()?;
        let epoch = active.epoch;
        let background = active.background.clone();
        let mailbox = self.mailbox.clone();

        tokio::spawn(async move {
            loop {
                let push = tokio::select! {
                    () = background.cancelled() => break,
                    push = notifications.recv() => push,
                };
                let Some(push) = push else { break };
                let Some(sender) = mailbox.upgrade() else { break };
                if sender.send(SessionMessage::Push { epoch, push }).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn on_push(&mut self, epoch: u64, push: Push) {
        let Some(active) = self.active.as_mut().filter(|a| a.epoch == epoch) else {
            return;
        };
        if push.room_id() != &active.room_id {
            debug!(
                target: "sfu.client.session",
                room_id = %push.room_id(),
                "Ignoring push for another room"
            );
            return;
        }

        match push {
            Push::NewProducer {
                producer_id,
                participant_id,
                ..
            } => {
                if participant_id == self.participant_id || active.is_subscribed(&producer_id) {
                    return;
                }
                let (Some(device), Some(transport)) =
                    (active.device.clone(), active.recv_transport.clone())
                else {
                    return;
                };
                active.in_flight.insert(producer_id.clone());

                let job = ConsumeJob {
                    epoch,
                    channel: Arc::clone(&active.channel),
                    device,
                    transport,
                    producer_id,
                    participant_id,
                };
                tokio::spawn(job.run(self.mailbox.clone(), active.background.clone()));
            }
            Push::ProducerClosed { producer_id, .. } => {
                active.in_flight.remove(&producer_id);
                let before = active.remotes.len();
                active.remotes.retain(|remote| {
                    if remote.consumer.producer_id() == &producer_id {
                        remote.consumer.close();
                        false
                    } else {
                        true
                    }
                });
                if active.remotes.len() != before {
                    debug!(
                        target: "sfu.client.session",
                        producer_id = %producer_id,
                        "Remote producer closed"
                    );
                    self.publish_remote_tracks();
                }
            }
        }
    }

    fn on_consumer_ready(
        &mut self,
        epoch: u64,
        participant_id: ParticipantId,
        consumer: &Arc<LocalConsumer>,
    ) -> bool {
        let Some(active) = self.active.as_mut().filter(|a| a.epoch == epoch) else {
            return false;
        };
        // Absent when the producer closed while the consume was in flight.
        if !active.in_flight.remove(consumer.producer_id()) {
            return false;
        }
        active.remotes.push(RemoteEntry {
            participant_id,
            consumer: Arc::clone(consumer),
        });
        self.publish_remote_tracks();
        true
    }

    fn publish_remote_tracks(&self) {
        let tracks = self
            .active
            .as_ref()
            .map(|active| {
                active
                    .remotes
                    .iter()
                    .map(|remote| RemoteTrack {
                        participant_id: remote.participant_id.clone(),
                        producer_id: remote.consumer.producer_id().clone(),
                        consumer_id: remote.consumer.id().clone(),
                        kind: remote.consumer.kind(),
                        track: remote.consumer.track().clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.remote_tx.send_replace(tracks);
    }

    /// Replace the local stream only when the produced track set changed.
    fn sync_local_stream(&self) {
        let tracks: Vec<MediaTrack> = self
            .active
            .as_ref()
            .map(|active| {
                [&active.audio, &active.video]
                    .into_iter()
                    .flatten()
                    .map(|producer| producer.track().clone())
                    .collect()
            })
            .unwrap_or_default();

        self.local_tx.send_if_modified(|current| {
            let current_ids: Vec<&str> = current
                .as_ref()
                .map(MediaStream::track_ids)
                .unwrap_or_default();
            let next_ids: Vec<&str> = tracks.iter().map(MediaTrack::id).collect();
            if current_ids == next_ids {
                return false;
            }
            *current = if tracks.is_empty() {
                None
            } else {
                Some(MediaStream::new(tracks.clone()))
            };
            true
        });
    }

    /// Release everything held for the current session.
    ///
    /// Each step runs regardless of the others; none of them can fail.
    fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            self.set_phase(SessionPhase::NotJoined);
            return;
        };
        self.set_phase(SessionPhase::Leaving);

        active.background.cancel();

        for producer in [active.audio, active.video].into_iter().flatten() {
            producer.track().stop();
            producer.close();
        }
        for remote in &active.remotes {
            remote.consumer.close();
        }
        if let Some(transport) = &active.send_transport {
            transport.close();
        }
        if let Some(transport) = &active.recv_transport {
            transport.close();
        }
        active.channel.close();

        info!(
            target: "sfu.client.session",
            room_id = %active.room_id,
            "Session torn down"
        );

        self.sync_local_stream();
        self.publish_remote_tracks();
        self.set_phase(SessionPhase::NotJoined);
    }
}

/// Create a transport on the server and connect its local half.
async fn open_transport(
    channel: &SignalingChannel,
    device: &Device,
    direction: TransportDirection,
) -> Result<LocalTransport, SessionError> {
    let response = channel
        .request(Request::CreateTransport { direction })
        .await?;
    let Response::TransportCreated { params, .. } = response else {
        return Err(unexpected("TRANSPORT_CREATED", &response));
    };
    let transport = device.create_transport(params, direction);

    if transport.begin_connect()? {
        let request = Request::ConnectTransport {
            transport_id: transport.id().clone(),
            dtls_parameters: transport.dtls_parameters().clone(),
        };
        if let Err(e) = channel.request(request).await {
            transport.close();
            return Err(e.into());
        }
    }
    Ok(transport)
}

fn unexpected(expected: &'static str, actual: &Response) -> SessionError {
    SessionError::Channel(ChannelError::UnexpectedResponse {
        expected,
        actual: actual.type_name(),
    })
}

/// Subscription to one remote producer.
struct ConsumeJob {
    epoch: u64,
    channel: Arc<SignalingChannel>,
    device: Arc<Device>,
    transport: Arc<LocalTransport>,
    producer_id: ProducerId,
    participant_id: ParticipantId,
}

impl ConsumeJob {
    async fn run(
        self,
        mailbox: mpsc::WeakSender<SessionMessage>,
        background: CancellationToken,
    ) {
        let outcome = tokio::select! {
            () = background.cancelled() => return,
            outcome = self.consume() => outcome,
        };
        let Some(sender) = mailbox.upgrade() else {
            if let Ok(consumer) = outcome {
                consumer.close();
            }
            return;
        };

        let consumer = match outcome {
            Ok(consumer) => Arc::new(consumer),
            Err(e) => {
                warn!(
                    target: "sfu.client.session",
                    producer_id = %self.producer_id,
                    error = %e,
                    "Consume failed"
                );
                let _ = sender
                    .send(SessionMessage::ConsumeFailed {
                        epoch: self.epoch,
                        producer_id: self.producer_id,
                    })
                    .await;
                return;
            }
        };

        let (tx, rx) = oneshot::channel();
        let ready = SessionMessage::ConsumerReady {
            epoch: self.epoch,
            participant_id: self.participant_id.clone(),
            consumer: Arc::clone(&consumer),
            respond_to: tx,
        };
        if sender.send(ready).await.is_err() {
            consumer.close();
            return;
        }
        drop(sender);
        if !matches!(rx.await, Ok(true)) {
            return;
        }

        let request = Request::ResumeConsumer {
            consumer_id: consumer.id().clone(),
        };
        match self.channel.request(request).await {
            Ok(_) => consumer.mark_resumed(),
            Err(e) => warn!(
                target: "sfu.client.session",
                consumer_id = %consumer.id(),
                error = %e,
                "Resume failed"
            ),
        }
    }

    async fn consume(&self) -> Result<LocalConsumer, SessionError> {
        self.transport.ensure_open()?;
        let request = Request::Consume {
            transport_id: self.transport.id().clone(),
            producer_id: self.producer_id.clone(),
            rtp_capabilities: self.device.rtp_capabilities()?.clone(),
        };

        match self.channel.request(request).await? {
            Response::Consumed {
                consumer_id,
                producer_id,
                kind,
                rtp_parameters,
            } => Ok(LocalConsumer::new(
                consumer_id,
                producer_id,
                kind,
                rtp_parameters,
            )),
            other => Err(unexpected("CONSUMED", &other)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(SessionPhase::NotJoined.to_string(), "NOT_JOINED");
        assert_eq!(SessionPhase::Leaving.to_string(), "LEAVING");
        assert!(SessionPhase::Joining.is_active());
        assert!(SessionPhase::Joined.is_active());
        assert!(!SessionPhase::Leaving.is_active());
    }

    #[test]
    fn test_intent_constraints() {
        let intent = JoinIntent::new("r1", "token")
            .with_cam(false)
            .with_devices(Some("mic-2".to_string()), Some("cam-1".to_string()));
        let constraints = intent.constraints();
        assert_eq!(constraints.audio, TrackConstraint::Exact("mic-2".to_string()));
        assert_eq!(constraints.video, TrackConstraint::Disabled);
        assert!(intent.wants(MediaKind::Audio));
        assert!(!intent.wants(MediaKind::Video));
    }

    #[test]
    fn test_intent_credential_check() {
        assert!(JoinIntent::new("r1", "token").has_credential());
        assert!(!JoinIntent::new("r1", "  ").has_credential());

        let intent = JoinIntent::new("r1", "s3cr3t-bearer");
        assert!(!format!("{intent:?}").contains("s3cr3t-bearer"));

        let mut intent = JoinIntent::new("r1", "token");
        intent.credential = None;
        assert!(!intent.has_credential());
    }

    #[test]
    fn test_idle_stats() {
        assert!(SessionStats::default().is_idle());
        let busy = SessionStats {
            transports: 1,
            ..SessionStats::default()
        };
        assert!(!busy.is_idle());
    }
}
