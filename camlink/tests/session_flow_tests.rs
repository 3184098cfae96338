//! End-to-end tests for the session registry
//!
//! A scripted decoder and an in-memory sink stand in for openh264 and the
//! v4l2loopback device; packets go out through a [`ChannelPacketSender`].

use bytes::Bytes;
use camlink::*;
use camlink_media::{H264Backend, I420Image, MediaError, MediaResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const DEVICE: &str = "pixel-7";

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct ScriptedDecoder {
    failures: Arc<Mutex<VecDeque<bool>>>,
}

impl H264Backend for ScriptedDecoder {
    fn decode(&mut self, data: &[u8]) -> MediaResult<Option<I420Image>> {
        if camlink_media::nal::validate_config(data).is_ok() {
            return Ok(None);
        }
        // only deltas are corrupted
        if camlink_media::nal::contains_idr(data) {
            return Ok(Some(I420Image::black(8, 4)));
        }
        let fail = self
            .failures
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(false);
        if fail {
            return Err(MediaError::DecodingFailed {
                codec: "H.264".to_string(),
                reason: "corrupt slice".to_string(),
            });
        }
        Ok(Some(I420Image::black(8, 4)))
    }

    fn reset(&mut self) -> MediaResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[derive(Clone)]
struct TestBackend {
    sink: MemorySink,
    failures: Arc<Mutex<VecDeque<bool>>>,
}

impl TestBackend {
    fn new() -> Self {
        Self {
            sink: MemorySink::new(),
            failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn fail_next(&self, count: usize) {
        self.failures
            .lock()
            .unwrap()
            .extend(std::iter::repeat(true).take(count));
    }
}

impl MediaBackend for TestBackend {
    fn create_decoder(&self) -> MediaResult<Box<dyn H264Backend>> {
        Ok(Box::new(ScriptedDecoder {
            failures: self.failures.clone(),
        }))
    }

    fn create_sink(&self, _config: &WriterConfig) -> MediaResult<Box<dyn VideoSink>> {
        Ok(Box::new(self.sink.clone()))
    }
}

struct Harness {
    registry: SessionRegistry,
    backend: TestBackend,
    outbound: mpsc::UnboundedReceiver<OutboundPacket>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    fn new() -> Self {
        camlink::try_init_logging();
        let backend = TestBackend::new();
        let (sender, outbound) = ChannelPacketSender::new();
        let mut config = BridgeConfig::default();
        config.writer.device_path = None;
        config.session.tick_interval = Duration::from_millis(20);
        let registry =
            SessionRegistry::new(config, Arc::new(backend.clone()), Arc::new(sender)).unwrap();
        let events = registry.subscribe();
        Self {
            registry,
            backend,
            outbound,
            events,
        }
    }

    async fn send(&self, body: &impl PacketBody) -> CoreResult<()> {
        self.registry
            .handle_packet(DEVICE, body.to_packet()?, None)
            .await
    }

    async fn send_frame(&self, frame_type: FrameType, sequence: u64) {
        let payload = Bytes::from_static(match frame_type {
            FrameType::ConfigData => &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce],
            FrameType::KeyFrame => &[0, 0, 0, 1, 0x65, 0x88],
            FrameType::DeltaFrame => &[0, 0, 0, 1, 0x41, 0x9a],
        });
        let header = FrameHeader {
            frame_type,
            timestamp_us: sequence * 33_333,
            sequence_number: sequence,
            size: payload.len() as u64,
        };
        let packet = header.to_frame_packet().unwrap();
        assert_ok!(
            self.registry
                .handle_packet(DEVICE, packet, Some(payload))
                .await
        );
    }

    async fn start_streaming(&mut self) -> NegotiatedSettings {
        assert_ok!(self.send(&capabilities()).await);
        let settings = assert_ok!(self.registry.start(DEVICE, request()).await);
        assert_ok!(
            self.send(&StatusReport::streaming(1, Resolution::p720(), 30, 2000))
                .await
        );
        self.wait_for_state(SessionState::Streaming).await;
        settings
    }

    async fn wait_for_state(&mut self, state: SessionState) {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(event) = self.events.recv().await {
                    if let SessionEventKind::StateChanged { to, .. } = event.kind {
                        if to == state {
                            return;
                        }
                    }
                }
            }
        })
        .await
        .expect("state not reached in time");
    }

    async fn wait_for_written(&self, count: usize) {
        timeout(Duration::from_secs(2), async {
            while self.backend.sink.snapshot().frames.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frames not written in time");
    }

    /// Packet types sent so far, waiting briefly for stragglers
    async fn drain_outbound(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(Some(outbound)) =
            timeout(Duration::from_millis(150), self.outbound.recv()).await
        {
            assert_eq!(outbound.device_id, DEVICE);
            packets.push(outbound.packet);
        }
        packets
    }
}

fn capabilities() -> CapabilitySet {
    CapabilitySet {
        cameras: vec![
            CameraDescriptor {
                id: 0,
                name: "Back Camera".to_string(),
                facing: camlink_core::CameraFacing::Back,
                max_resolution: Resolution::p1080(),
                resolutions: vec![Resolution::p720(), Resolution::p1080()],
            },
            CameraDescriptor {
                id: 1,
                name: "Front Camera".to_string(),
                facing: camlink_core::CameraFacing::Front,
                max_resolution: Resolution::p720(),
                resolutions: vec![Resolution::p480(), Resolution::p720()],
            },
        ],
        supported_codecs: vec!["h264".to_string()],
        audio_supported: false,
        max_resolution: Resolution::p1080(),
        max_bitrate: 8000,
        max_fps: 60,
    }
}

fn request() -> StreamRequest {
    StreamRequest {
        camera_id: 1,
        resolution: Resolution::p720(),
        fps: 30,
        bitrate: 2000,
        codec: "h264".to_string(),
    }
}

fn is_keyframe_request(packet: &Packet) -> bool {
    packet.packet_type == "cconnect.camera.settings" && packet.body == serde_json::json!({})
}

// ============================================================================
// NEGOTIATION TESTS
// ============================================================================

#[tokio::test]
async fn test_capability_creates_session_and_start_is_negotiated() {
    let mut harness = Harness::new();
    assert_ok!(harness.send(&capabilities()).await);
    assert_eq!(harness.registry.device_ids(), vec![DEVICE.to_string()]);

    let settings = assert_ok!(harness.registry.start(DEVICE, request()).await);
    assert_eq!(settings.to_request(), request());

    let packets = harness.drain_outbound().await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, "cconnect.camera.start");
    let sent: StreamRequest = assert_ok!(packets[0].body_as());
    assert_eq!(sent, request());

    let snapshot = assert_ok!(harness.registry.snapshot(DEVICE).await);
    assert_eq!(snapshot.state, SessionState::Starting);
}

#[tokio::test]
async fn test_rejected_start_sends_nothing() {
    let mut harness = Harness::new();
    assert_ok!(harness.send(&capabilities()).await);

    let mut too_big = request();
    too_big.resolution = Resolution::p1080();
    let err = assert_err!(harness.registry.start(DEVICE, too_big).await);
    assert!(matches!(err, CamLinkError::Negotiation(_)));

    assert!(harness.drain_outbound().await.is_empty());
    let snapshot = assert_ok!(harness.registry.snapshot(DEVICE).await);
    assert_eq!(snapshot.state, SessionState::CapabilityKnown);
}

// ============================================================================
// STREAMING TESTS
// ============================================================================

#[tokio::test]
async fn test_clean_stream_reaches_virtual_device() {
    let mut harness = Harness::new();
    harness.start_streaming().await;

    harness.send_frame(FrameType::ConfigData, 0).await;
    harness.send_frame(FrameType::KeyFrame, 1).await;
    harness.send_frame(FrameType::DeltaFrame, 2).await;
    harness.send_frame(FrameType::DeltaFrame, 3).await;
    harness.wait_for_written(3).await;

    let state = harness.backend.sink.snapshot();
    assert_eq!(state.formats, vec![Resolution::new(8, 4)]);

    let snapshot = assert_ok!(harness.registry.snapshot(DEVICE).await);
    assert_eq!(snapshot.stats.frames_received, 4);
    assert_eq!(snapshot.stats.frames_forwarded, 4);
    assert_eq!(snapshot.stats.gaps, 0);

    let packets = harness.drain_outbound().await;
    assert!(packets.iter().all(|p| !is_keyframe_request(p)));
}

#[tokio::test]
async fn test_gap_sends_exactly_one_keyframe_request() {
    let mut harness = Harness::new();
    harness.start_streaming().await;
    harness.drain_outbound().await;

    harness.send_frame(FrameType::ConfigData, 0).await;
    harness.send_frame(FrameType::KeyFrame, 1).await;
    harness.send_frame(FrameType::DeltaFrame, 3).await;
    harness.send_frame(FrameType::DeltaFrame, 5).await;

    let packets = harness.drain_outbound().await;
    assert_eq!(packets.iter().filter(|p| is_keyframe_request(p)).count(), 1);

    let snapshot = assert_ok!(harness.registry.snapshot(DEVICE).await);
    assert_eq!(snapshot.stats.gaps, 2);
    assert_eq!(snapshot.stats.frames_forwarded, 2);
}

#[tokio::test]
async fn test_decoder_fault_requests_keyframe_without_failing() {
    let mut harness = Harness::new();
    harness.start_streaming().await;
    harness.drain_outbound().await;

    harness.send_frame(FrameType::ConfigData, 0).await;
    harness.send_frame(FrameType::KeyFrame, 1).await;
    harness.wait_for_written(1).await;

    harness.backend.fail_next(5);
    for sequence in 2..7 {
        harness.send_frame(FrameType::DeltaFrame, sequence).await;
    }

    let packets = harness.drain_outbound().await;
    assert_eq!(packets.iter().filter(|p| is_keyframe_request(p)).count(), 1);

    let mut fault_requests = 0;
    let mut restarts = 0;
    while let Ok(event) = harness.events.try_recv() {
        match event.kind {
            SessionEventKind::KeyframeRequested {
                trigger: Some(camlink_core::RecoveryTrigger::DecoderFaulted),
            } => fault_requests += 1,
            SessionEventKind::StreamRestarted { .. } => restarts += 1,
            _ => {}
        }
    }
    assert_eq!(fault_requests, 1);
    assert_eq!(restarts, 0);

    let snapshot = assert_ok!(harness.registry.snapshot(DEVICE).await);
    assert_eq!(snapshot.state, SessionState::Streaming);
    assert_eq!(snapshot.stats.decode_errors, 3);
    assert_eq!(snapshot.stats.restarts, 0);

    // the decoder restores its configuration at the keyframe
    harness.send_frame(FrameType::KeyFrame, 7).await;
    harness.wait_for_written(2).await;
}

#[tokio::test]
async fn test_frames_ahead_of_streaming_status_are_written() {
    let mut harness = Harness::new();
    assert_ok!(harness.send(&capabilities()).await);
    assert_ok!(harness.registry.start(DEVICE, request()).await);

    harness.send_frame(FrameType::ConfigData, 0).await;
    harness.send_frame(FrameType::KeyFrame, 1).await;
    harness.wait_for_state(SessionState::Streaming).await;
    harness.wait_for_written(1).await;

    assert_ok!(
        harness
            .send(&StatusReport::streaming(1, Resolution::p720(), 30, 2000))
            .await
    );
    harness.send_frame(FrameType::DeltaFrame, 2).await;
    harness.wait_for_written(2).await;

    let snapshot = assert_ok!(harness.registry.snapshot(DEVICE).await);
    assert_eq!(snapshot.state, SessionState::Streaming);
    assert_eq!(snapshot.stats.frames_forwarded, 3);
}

#[tokio::test]
async fn test_settings_change_sends_partial_update() {
    let mut harness = Harness::new();
    harness.start_streaming().await;
    harness.drain_outbound().await;

    let updated = assert_ok!(
        harness
            .registry
            .change_settings(DEVICE, StreamSettings::change_resolution(Resolution::p480()))
            .await
    );
    assert_eq!(updated.resolution, Resolution::p480());

    let packets = harness.drain_outbound().await;
    assert_eq!(packets.len(), 1);
    assert_eq!(
        packets[0].body,
        serde_json::json!({"resolution": {"width": 854, "height": 480}})
    );
}

// ============================================================================
// FAILURE AND DISCONNECT TESTS
// ============================================================================

#[tokio::test]
async fn test_remote_error_surfaced_verbatim() {
    let mut harness = Harness::new();
    harness.start_streaming().await;

    assert_ok!(
        harness
            .send(&StatusReport::error("Camera is being used by another app"))
            .await
    );
    harness.wait_for_state(SessionState::Error).await;

    let snapshot = assert_ok!(harness.registry.snapshot(DEVICE).await);
    assert_eq!(
        snapshot.failure,
        Some(SessionFailure::RemoteCamera(
            "Camera is being used by another app".to_string()
        ))
    );
    assert_eq!(harness.backend.sink.snapshot().closes, 1);
}

#[tokio::test]
async fn test_disconnect_mid_stream_releases_device() {
    let mut harness = Harness::new();
    harness.start_streaming().await;
    harness.send_frame(FrameType::ConfigData, 0).await;
    harness.send_frame(FrameType::KeyFrame, 1).await;
    harness.wait_for_written(1).await;

    assert_ok!(harness.registry.disconnect(DEVICE).await);

    // released and blanked before disconnect returned
    let state = harness.backend.sink.snapshot();
    assert_eq!(state.closes, 1);
    assert_eq!(
        state.frames.last(),
        Some(&camlink_media::black_yuyv(8, 4))
    );

    assert_eq!(harness.registry.session_count(), 0);
    let header = FrameHeader {
        frame_type: FrameType::DeltaFrame,
        timestamp_us: 0,
        sequence_number: 2,
        size: 1,
    };
    let err = assert_err!(
        harness
            .registry
            .handle_packet(DEVICE, header.to_frame_packet().unwrap(), Some(Bytes::from_static(&[0])))
            .await
    );
    assert_eq!(err.error_code(), "SESSION_NOT_FOUND");

    // a new announcement starts a fresh session
    assert_ok!(harness.send(&capabilities()).await);
    let snapshot = assert_ok!(harness.registry.snapshot(DEVICE).await);
    assert_eq!(snapshot.state, SessionState::CapabilityKnown);
}

#[tokio::test]
async fn test_stop_blanks_device_and_waits_for_confirmation() {
    let mut harness = Harness::new();
    harness.start_streaming().await;
    harness.send_frame(FrameType::ConfigData, 0).await;
    harness.send_frame(FrameType::KeyFrame, 1).await;
    harness.wait_for_written(1).await;
    harness.drain_outbound().await;

    assert_ok!(harness.registry.stop(DEVICE).await);
    let state = harness.backend.sink.snapshot();
    assert_eq!(state.closes, 1);
    assert_eq!(
        state.frames.last(),
        Some(&camlink_media::black_yuyv(8, 4))
    );
    let packets = harness.drain_outbound().await;
    assert_eq!(packets[0].packet_type, "cconnect.camera.stop");

    assert_ok!(
        harness
            .send(&StatusReport::bare(StreamingStatus::Stopped))
            .await
    );
    harness.wait_for_state(SessionState::Stopped).await;
}

#[tokio::test]
async fn test_shutdown_disconnects_all_devices() {
    let harness = Harness::new();
    for device in ["phone-a", "phone-b"] {
        assert_ok!(
            harness
                .registry
                .handle_packet(device, capabilities().to_packet().unwrap(), None)
                .await
        );
    }
    assert_eq!(harness.registry.session_count(), 2);

    harness.registry.shutdown().await;
    assert_eq!(harness.registry.session_count(), 0);
}
