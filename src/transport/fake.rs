// In-memory transport and signaling doubles for tests.
//
// `FakeTransport` hands out `FakeSession`s that record every negotiation
// call.  Offers are rendered as `fake-offer tracks=[...]` listing the relay
// tracks attached at that moment, so tests can see what a peer was offered.
// Any SDP or candidate starting with "invalid" is rejected as malformed.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use super::{
    InboundTrack, MediaKind, MediaTransport, RelaySink, RelayTrackSpec, SessionEvent,
    SessionEvents, TransportError, TransportSession, TransportState,
};
use crate::activity::InMemoryActivityLog;
use crate::auth::{AuthError, CredentialStore};
use crate::events::EventBus;
use crate::registry::InMemoryRegistry;
use crate::relay::RelayConfig;
use crate::session::PeerSession;
use crate::sfu::{JoinRequest, Sfu};
use crate::signaling::{Envelope, SignalError, SignalEvent, SignalSink};

// ─── Transport ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeTransport {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    parked_events: Mutex<HashMap<String, mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recent media session created for `peer_id`.
    pub fn session(&self, peer_id: &str) -> Option<Arc<FakeSession>> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|s| s.peer_id == peer_id)
            .cloned()
    }

    /// Event queue of a session opened with `open_session`.
    pub fn take_events(&self, peer_id: &str) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.parked_events.lock().remove(peer_id)
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn create_session(
        &self,
        peer_id: &str,
        events: SessionEvents,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let session = Arc::new(FakeSession {
            peer_id: peer_id.to_string(),
            events,
            relay_tracks: Mutex::new(BTreeMap::new()),
            accepted_offers: Mutex::new(Vec::new()),
            applied_answers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

pub struct FakeSession {
    peer_id: String,
    events: SessionEvents,
    relay_tracks: Mutex<BTreeMap<String, Arc<RecordingSink>>>,
    accepted_offers: Mutex<Vec<String>>,
    applied_answers: Mutex<Vec<String>>,
    candidates: Mutex<Vec<String>>,
    fail_writes: AtomicBool,
    closes: AtomicUsize,
}

impl FakeSession {
    /// A track whose packets the test pushes by hand.
    pub fn feed_track(&self, track_id: &str, kind: MediaKind) -> TrackFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        TrackFeed {
            tx,
            track: Arc::new(FakeTrack {
                id: track_id.to_string(),
                kind,
                rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// Like `feed_track`, and also report the track to the session's loop as
    /// if the remote peer had started sending it.
    pub fn publish_track(&self, track_id: &str, kind: MediaKind) -> TrackFeed {
        let feed = self.feed_track(track_id, kind);
        let _ = self.events.send(SessionEvent::Track(feed.track()));
        feed
    }

    pub fn set_state(&self, state: TransportState) {
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    /// Relay sinks created from now on fail every write.
    pub fn fail_relay_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn sink(&self, track_id: &str) -> Option<Arc<RecordingSink>> {
        self.relay_tracks.lock().get(track_id).cloned()
    }

    pub fn relay_track_ids(&self) -> Vec<String> {
        self.relay_tracks.lock().keys().cloned().collect()
    }

    pub fn accepted_offers(&self) -> Vec<String> {
        self.accepted_offers.lock().clone()
    }

    pub fn applied_answers(&self) -> Vec<String> {
        self.applied_answers.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn describe(&self, kind: &str) -> String {
        let ids: Vec<String> = self.relay_tracks.lock().keys().cloned().collect();
        format!("fake-{kind} tracks=[{}]", ids.join(","))
    }
}

fn reject_invalid(sdp: &str) -> Result<(), TransportError> {
    if sdp.starts_with("invalid") {
        return Err(TransportError::InvalidDescription(sdp.to_string()));
    }
    Ok(())
}

#[async_trait]
impl TransportSession for FakeSession {
    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        reject_invalid(&sdp)?;
        self.accepted_offers.lock().push(sdp);
        Ok(self.describe("answer"))
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        Ok(self.describe("offer"))
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), TransportError> {
        reject_invalid(&sdp)?;
        self.applied_answers.lock().push(sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<(), TransportError> {
        if candidate.starts_with("invalid") {
            return Err(TransportError::InvalidCandidate(candidate));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_relay_track(
        &self,
        spec: RelayTrackSpec,
    ) -> Result<Arc<dyn RelaySink>, TransportError> {
        let sink = Arc::new(RecordingSink {
            written: Mutex::new(Vec::new()),
            fail: self.fail_writes.load(Ordering::SeqCst),
        });
        self.relay_tracks
            .lock()
            .insert(spec.track_id, Arc::clone(&sink));
        Ok(sink)
    }

    async fn remove_relay_track(&self, track_id: &str) -> Result<(), TransportError> {
        self.relay_tracks.lock().remove(track_id);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Tracks ─────────────────────────────────────────────────────────────────

pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

#[async_trait]
impl InboundTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability::default()
    }

    async fn read(&self) -> Result<Packet, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::TrackEnded)
    }
}

/// Test-side handle that feeds packets into a `FakeTrack`.
pub struct TrackFeed {
    tx: mpsc::UnboundedSender<Packet>,
    track: Arc<FakeTrack>,
}

impl TrackFeed {
    pub fn track(&self) -> Arc<dyn InboundTrack> {
        Arc::clone(&self.track) as Arc<dyn InboundTrack>
    }

    /// Push a packet identified by its sequence number.
    pub fn send(&self, sequence_number: u16) {
        let packet = Packet {
            header: Header {
                sequence_number,
                ..Default::default()
            },
            payload: Bytes::from_static(b"media"),
        };
        let _ = self.tx.send(packet);
    }

    /// End the track; the next read fails.
    pub fn end(self) {
        drop(self.tx);
    }
}

pub struct RecordingSink {
    written: Mutex<Vec<u16>>,
    fail: bool,
}

impl RecordingSink {
    /// Sequence numbers written so far.
    pub fn written(&self) -> Vec<u16> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl RelaySink for RecordingSink {
    async fn write(&self, packet: &Packet) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Write("forced failure".into()));
        }
        self.written.lock().push(packet.header.sequence_number);
        Ok(())
    }
}

// ─── Signaling ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct OutboxState {
    sent: Vec<String>,
    closed: bool,
}

/// Everything the server wrote to one peer.
#[derive(Clone, Default)]
pub struct Outbox(Arc<Mutex<OutboxState>>);

impl Outbox {
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.0
            .lock()
            .sent
            .iter()
            .filter_map(|text| Envelope::decode(text).ok())
            .collect()
    }

    /// `(generation, sdp)` of every server offer, in order.
    pub fn offers(&self) -> Vec<(u64, String)> {
        self.envelopes()
            .into_iter()
            .filter(|e| e.event == SignalEvent::Offer)
            .map(|e| (e.generation.unwrap_or_default(), e.data))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().closed
    }
}

pub struct RecordingSignalSink(Outbox);

impl RecordingSignalSink {
    pub fn new() -> (Self, Outbox) {
        let outbox = Outbox::default();
        (Self(outbox.clone()), outbox)
    }
}

#[async_trait]
impl SignalSink for RecordingSignalSink {
    async fn send_text(&mut self, text: String) -> Result<(), SignalError> {
        let mut state = (self.0).0.lock();
        if state.closed {
            return Err(SignalError::Closed);
        }
        state.sent.push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SignalError> {
        (self.0).0.lock().closed = true;
        Ok(())
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

/// Accepts every user; the password "wrong" is the only bad one.
pub struct AllowAll;

#[async_trait]
impl CredentialStore for AllowAll {
    async fn create_user(&self, _: &str, _: &str) -> Result<(), AuthError> {
        Ok(())
    }

    async fn validate_user(&self, _: &str, password: &str) -> Result<bool, AuthError> {
        Ok(password != "wrong")
    }
}

pub fn test_sfu() -> (Arc<Sfu>, Arc<FakeTransport>) {
    let transport = FakeTransport::new();
    let sfu = Sfu::new(
        Arc::new(InMemoryRegistry::new(100)),
        transport.clone(),
        Arc::new(AllowAll),
        Arc::new(InMemoryActivityLog::new()),
        EventBus::new(),
        RelayConfig::default(),
    );
    (Arc::new(sfu), transport)
}

/// Open a session outside any room.  Its event queue is parked on the
/// transport (see `FakeTransport::take_events`).
pub async fn open_session(
    transport: &Arc<FakeTransport>,
    peer_id: &str,
    room_id: &str,
) -> (Arc<PeerSession>, Outbox) {
    let (sink, outbox) = RecordingSignalSink::new();
    let (session, events) = PeerSession::open(peer_id, room_id, transport.as_ref(), Box::new(sink))
        .await
        .unwrap();
    transport
        .parked_events
        .lock()
        .insert(peer_id.to_string(), events);
    (session, outbox)
}

/// A joined peer whose signaling channel the test drives.
pub struct FakeClient {
    pub session: Arc<PeerSession>,
    pub outbox: Outbox,
    inbound: mpsc::UnboundedSender<Result<String, SignalError>>,
    _task: JoinHandle<()>,
}

impl FakeClient {
    pub fn send(&self, text: &str) {
        let _ = self.inbound.send(Ok(text.to_string()));
    }

    pub fn offer(&self, sdp: &str) {
        self.send(&serde_json::json!({ "event": "offer", "data": sdp }).to_string());
    }

    pub fn answer(&self, generation: u64, sdp: &str) {
        self.send(
            &serde_json::json!({ "event": "answer", "data": sdp, "generation": generation })
                .to_string(),
        );
    }

    /// Close the signaling channel from the peer's side.
    pub fn hang_up(self) {
        drop(self.inbound);
    }
}

/// Authorize, join and start serving `username` in `room_id`.
pub async fn connect(sfu: &Arc<Sfu>, room_id: &str, username: &str) -> FakeClient {
    let request = JoinRequest {
        room: Some(room_id.to_string()),
        username: Some(username.to_string()),
        password: Some("secret".to_string()),
    };
    let admission = sfu.authorize(&request).await.unwrap();
    let room = Arc::clone(&admission.room);

    let (sink, outbox) = RecordingSignalSink::new();
    let (session, events) = sfu.join(admission, Box::new(sink)).await.unwrap();

    let (inbound, rx) = mpsc::unbounded_channel();
    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });

    let sfu = Arc::clone(sfu);
    let served = Arc::clone(&session);
    let task = tokio::spawn(async move { sfu.serve(room, served, events, frames).await });

    FakeClient {
        session,
        outbox,
        inbound,
        _task: task,
    }
}

/// Poll `cond` until it holds; panics after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_until_async<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
