//! Preview coordinator tests: stale captures, device hand-off, and
//! interaction with a live session.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use common::types::ParticipantId;
use sfu_client::{
    CaptureError, JoinIntent, PreviewCoordinator, PreviewOutcome, PreviewWants, SessionError,
    SessionHandle, SessionPhase, WebSocketConnector,
};
use sfu_test_utils::{assert_eventually, ConsistencyCategory, FakeMediaDevices, TestSfuServer};
use signaling_protocol::rtp::MediaKind;
use std::sync::Arc;
use std::time::Duration;

fn coordinator(url: &str, devices: &FakeMediaDevices) -> Arc<PreviewCoordinator> {
    let session = SessionHandle::new(
        Arc::new(WebSocketConnector::new(url, Some(Duration::from_secs(5)))),
        Arc::new(devices.clone()),
        ParticipantId::new("alice"),
    );
    Arc::new(PreviewCoordinator::new(Arc::new(devices.clone()), session))
}

async fn wait_for_pending(devices: &FakeMediaDevices, count: usize) {
    assert_eventually(ConsistencyCategory::ClientState, || {
        let pending = devices.pending_captures();
        async move { pending == count }
    })
    .await
    .unwrap();
}

fn live_kinds(preview: &PreviewCoordinator) -> Vec<MediaKind> {
    preview
        .preview_stream()
        .map(|s| {
            s.tracks()
                .iter()
                .filter(|t| t.is_live())
                .map(|t| t.kind())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_refresh_adopts_then_keeps_matching_preview() {
    let devices = FakeMediaDevices::new();
    let preview = coordinator("ws://127.0.0.1:1/sfu", &devices);
    let wants = PreviewWants::new(true, true);

    assert_eq!(preview.update(&wants).await, PreviewOutcome::Adopted);
    assert_eq!(live_kinds(&preview).len(), 2);

    assert_eq!(preview.update(&wants).await, PreviewOutcome::Unchanged);
    assert_eq!(devices.capture_count(), 1);
}

#[tokio::test]
async fn test_camera_off_releases_video_immediately() {
    let devices = FakeMediaDevices::new();
    let preview = coordinator("ws://127.0.0.1:1/sfu", &devices);
    preview.update(&PreviewWants::new(true, true)).await;

    let outcome = preview.update(&PreviewWants::new(true, false)).await;

    assert_eq!(outcome, PreviewOutcome::Unchanged);
    assert_eq!(live_kinds(&preview), vec![MediaKind::Audio]);
    assert_eq!(devices.open_sources(MediaKind::Video), 0);
    assert_eq!(devices.capture_count(), 1);
}

#[tokio::test]
async fn test_nothing_wanted_clears_preview() {
    let devices = FakeMediaDevices::new();
    let preview = coordinator("ws://127.0.0.1:1/sfu", &devices);
    preview.update(&PreviewWants::new(true, true)).await;

    let outcome = preview.update(&PreviewWants::new(false, false)).await;

    assert_eq!(outcome, PreviewOutcome::Cleared);
    assert!(preview.preview_stream().is_none());
    assert_eq!(devices.total_open_sources(), 0);
}

#[tokio::test]
async fn test_rapid_camera_toggle_leaves_one_video_track() {
    let devices = FakeMediaDevices::new();
    let preview = coordinator("ws://127.0.0.1:1/sfu", &devices);
    let on = PreviewWants::new(false, true);
    let off = PreviewWants::new(false, false);
    assert_eq!(preview.update(&on).await, PreviewOutcome::Adopted);

    devices.set_gated(true);

    assert_eq!(preview.update(&off).await, PreviewOutcome::Cleared);
    let first = tokio::spawn({
        let preview = Arc::clone(&preview);
        let on = on.clone();
        async move { preview.update(&on).await }
    });
    wait_for_pending(&devices, 1).await;

    assert_eq!(preview.update(&off).await, PreviewOutcome::Cleared);
    let second = tokio::spawn({
        let preview = Arc::clone(&preview);
        let on = on.clone();
        async move { preview.update(&on).await }
    });
    wait_for_pending(&devices, 2).await;

    assert!(devices.release_next());
    assert_eq!(first.await.unwrap(), PreviewOutcome::Discarded);
    assert_eq!(devices.open_sources(MediaKind::Video), 0);

    assert!(devices.release_next());
    assert_eq!(second.await.unwrap(), PreviewOutcome::Adopted);

    assert_eq!(live_kinds(&preview), vec![MediaKind::Video]);
    assert_eq!(devices.open_sources(MediaKind::Video), 1);
    assert!(preview.error_message().is_none());
}

#[tokio::test]
async fn test_capture_failure_sets_user_message() {
    let devices = FakeMediaDevices::new();
    let preview = coordinator("ws://127.0.0.1:1/sfu", &devices);
    devices.fail_next(CaptureError::PermissionDenied);

    let outcome = preview.update(&PreviewWants::new(true, true)).await;

    assert_eq!(outcome, PreviewOutcome::Failed(CaptureError::PermissionDenied));
    assert_eq!(
        preview.error_message().as_deref(),
        Some("Permission denied. Please allow camera/microphone access in your browser settings.")
    );

    assert_eq!(
        preview.update(&PreviewWants::new(true, true)).await,
        PreviewOutcome::Adopted
    );
    assert!(preview.error_message().is_none());
}

#[tokio::test]
async fn test_join_reuses_preview_without_second_capture() {
    let server = TestSfuServer::spawn().await.unwrap();
    let devices = FakeMediaDevices::new();
    let preview = coordinator(&server.url(), &devices);
    preview.update(&PreviewWants::new(true, true)).await;

    preview.join(JoinIntent::new("r1", "token")).await.unwrap();

    let session = preview.session();
    assert_eq!(session.phase(), SessionPhase::Joined);
    assert!(preview.preview_stream().is_none());
    assert_eq!(devices.capture_count(), 1);
    assert_eq!(devices.open_sources(MediaKind::Audio), 1);
    assert_eq!(devices.open_sources(MediaKind::Video), 1);

    let local = session.local_stream().borrow().clone().unwrap();
    assert!(local.tracks().iter().all(|t| t.is_live()));

    session.leave().await.unwrap();
    assert_eq!(devices.total_open_sources(), 0);
}

#[tokio::test]
async fn test_join_captures_base_when_preview_lacks_a_kind() {
    let server = TestSfuServer::spawn().await.unwrap();
    let devices = FakeMediaDevices::new();
    let preview = coordinator(&server.url(), &devices);
    preview.update(&PreviewWants::new(true, false)).await;

    // Exclusive devices: the preview must let go before the base capture.
    preview.join(JoinIntent::new("r1", "token")).await.unwrap();

    assert_eq!(devices.capture_count(), 2);
    assert_eq!(devices.total_open_sources(), 2);
    assert_eq!(preview.session().stats().await.unwrap().producers, 2);
    assert!(preview.error_message().is_none());
}

#[tokio::test]
async fn test_join_capture_failure_sets_message_and_releases() {
    let server = TestSfuServer::spawn().await.unwrap();
    let devices = FakeMediaDevices::new();
    let preview = coordinator(&server.url(), &devices);
    devices.fail_next(CaptureError::Busy);

    let err = preview
        .join(JoinIntent::new("r1", "token"))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Capture(CaptureError::Busy)));
    assert_eq!(
        preview.error_message().as_deref(),
        Some("Camera is busy (used by another app/tab).")
    );
    assert_eq!(preview.session().phase(), SessionPhase::NotJoined);
    assert_eq!(devices.total_open_sources(), 0);
}

#[tokio::test]
async fn test_join_failure_keeps_preview_running() {
    let devices = FakeMediaDevices::new();
    let preview = coordinator("ws://127.0.0.1:1/sfu", &devices);
    preview.update(&PreviewWants::new(true, true)).await;

    let err = preview
        .join(JoinIntent::new("r1", "token"))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Channel(_)));
    assert_eq!(preview.error_message().as_deref(), Some("Could not join the room."));
    assert_eq!(live_kinds(&preview).len(), 2);
    assert_eq!(devices.total_open_sources(), 2);
}

#[tokio::test]
async fn test_blank_room_is_rejected_before_capture() {
    let devices = FakeMediaDevices::new();
    let preview = coordinator("ws://127.0.0.1:1/sfu", &devices);

    let err = preview.join(JoinIntent::new("", "token")).await.unwrap_err();

    assert!(matches!(err, SessionError::NoRoomId));
    assert!(preview.error_message().is_some());
    assert_eq!(devices.capture_count(), 0);
}

#[tokio::test]
async fn test_refresh_skipped_while_joined() {
    let server = TestSfuServer::spawn().await.unwrap();
    let devices = FakeMediaDevices::new();
    let preview = coordinator(&server.url(), &devices);
    preview.join(JoinIntent::new("r1", "token")).await.unwrap();
    let captures = devices.capture_count();

    let outcome = preview.update(&PreviewWants::new(true, true)).await;

    assert_eq!(outcome, PreviewOutcome::Skipped);
    assert_eq!(devices.capture_count(), captures);
    assert!(preview.preview_stream().is_none());
}

#[tokio::test]
async fn test_capture_resolving_after_join_is_discarded() {
    let server = TestSfuServer::spawn().await.unwrap();
    let devices = FakeMediaDevices::new();
    let preview = coordinator(&server.url(), &devices);

    devices.set_gated(true);
    let pending = tokio::spawn({
        let preview = Arc::clone(&preview);
        async move { preview.update(&PreviewWants::new(true, true)).await }
    });
    wait_for_pending(&devices, 1).await;

    let listen_only = JoinIntent::new("r1", "token").with_mic(false).with_cam(false);
    preview.join(listen_only).await.unwrap();
    assert_eq!(preview.session().phase(), SessionPhase::Joined);

    assert!(devices.release_next());
    assert_eq!(pending.await.unwrap(), PreviewOutcome::Discarded);
    assert!(preview.preview_stream().is_none());
    assert_eq!(devices.total_open_sources(), 0);
}

#[tokio::test]
async fn test_missing_credential_keeps_preview_and_opens_nothing() {
    let devices = FakeMediaDevices::new();
    let preview = coordinator("ws://127.0.0.1:1/sfu", &devices);
    preview.update(&PreviewWants::new(true, false)).await;
    assert_eq!(devices.capture_count(), 1);

    let mut intent = JoinIntent::new("r1", "token");
    intent.credential = None;
    let err = preview.join(intent).await.unwrap_err();

    assert!(matches!(err, SessionError::NoToken));
    assert!(preview.error_message().is_some());
    assert_eq!(devices.capture_count(), 1);
    assert_eq!(live_kinds(&preview), vec![MediaKind::Audio]);
    assert_eq!(devices.open_sources(MediaKind::Video), 0);
}
