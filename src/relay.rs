use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::broadcaster::topology_changed;
use crate::events::{EventBus, MeetEvent};
use crate::room::{BindingId, Room, TrackKey, Unbound};
use crate::session::PeerSession;
use crate::transport::{InboundTrack, MediaKind, RelaySink, RelayTrackSpec, TransportError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-subscriber buffering.  A subscriber that falls further behind than
/// its buffer loses the oldest packets.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub video_buffer: usize,
    pub audio_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            video_buffer: 300,
            audio_buffer: 100,
        }
    }
}

impl RelayConfig {
    fn capacity(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Video => self.video_buffer,
            MediaKind::Audio => self.audio_buffer,
        }
    }
}

// ---------------------------------------------------------------------------
// PublishedTrack
// ---------------------------------------------------------------------------

/// An inbound track from the host, fanned out through a broadcast channel so
/// every subscriber reads an independent copy.
pub struct PublishedTrack {
    pub key: TrackKey,
    pub kind: MediaKind,
    pub codec: RTCRtpCodecCapability,
    tx: broadcast::Sender<Packet>,
    /// Child of the publishing session's scope.
    cancel: CancellationToken,
}

impl PublishedTrack {
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.tx.subscribe()
    }

    /// End the source reader and every relay fed by this track.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn detached(key: TrackKey, kind: MediaKind) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            key,
            kind,
            codec: RTCRtpCodecCapability::default(),
            tx,
            cancel: CancellationToken::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// RelayHandle
// ---------------------------------------------------------------------------

/// A subscriber's view of one running relay task.
pub struct RelayHandle {
    binding: BindingId,
    outbound_track_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// The task has exited and released its binding.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn binding(&self) -> BindingId {
        self.binding
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Relay {
    config: RelayConfig,
    bus: EventBus,
}

impl Relay {
    pub fn new(config: RelayConfig, bus: EventBus) -> Self {
        Self { config, bus }
    }

    /// Accept an inbound track from `session`.  Tracks from members that do
    /// not hold the publisher role are ignored.
    pub fn publish(
        &self,
        room: &Arc<Room>,
        session: &Arc<PeerSession>,
        inbound: Arc<dyn InboundTrack>,
    ) -> Option<Arc<PublishedTrack>> {
        if session.is_cancelled() {
            return None;
        }
        let kind = inbound.kind();
        let (tx, _) = broadcast::channel(self.config.capacity(kind));
        let track = Arc::new(PublishedTrack {
            key: TrackKey::new(session.peer_id(), inbound.id()),
            kind,
            codec: inbound.codec(),
            tx,
            cancel: session.scope(),
        });

        if !room.publish(Arc::clone(&track)) {
            debug!(
                room_id = %room.id(),
                peer_id = %session.peer_id(),
                track = %track.key,
                "ignoring track from non-publisher"
            );
            track.stop();
            return None;
        }

        info!(room_id = %room.id(), track = %track.key, kind = kind.as_str(), "track published");
        self.bus.emit(MeetEvent::track_published(
            room.id(),
            &track.key,
            kind,
        ));

        tokio::spawn(run_source(
            Arc::clone(room),
            Arc::clone(&track),
            inbound,
            self.bus.clone(),
        ));
        topology_changed(room, "track published");
        Some(track)
    }

    /// Start relaying `track` to `subscriber`.  Returns `Ok(None)` when the
    /// room no longer wants this binding.
    pub async fn attach(
        &self,
        room: &Arc<Room>,
        subscriber: &Arc<PeerSession>,
        track: &Arc<PublishedTrack>,
    ) -> Result<Option<RelayHandle>, TransportError> {
        let Some(binding) = room.bind(&track.key, subscriber) else {
            return Ok(None);
        };
        let rx = track.subscribe();

        let spec = RelayTrackSpec {
            track_id: track.key.to_string(),
            stream_id: track.key.publisher.clone(),
            codec: track.codec.clone(),
        };
        let outbound_track_id = spec.track_id.clone();
        let sink = match subscriber.transport().add_relay_track(spec).await {
            Ok(sink) => sink,
            Err(e) => {
                self.release(room, &track.key, subscriber.peer_id(), binding);
                return Err(e);
            }
        };

        let cancel = subscriber.scope();
        let task = tokio::spawn(run_fanout(
            FanoutTask {
                room: Arc::clone(room),
                key: track.key.clone(),
                subscriber: subscriber.peer_id().to_string(),
                binding,
                relay: self.clone(),
            },
            rx,
            sink,
            cancel.clone(),
            track.cancel.clone(),
        ));

        debug!(room_id = %room.id(), track = %track.key, subscriber = %subscriber.peer_id(), binding, "relay attached");
        Ok(Some(RelayHandle {
            binding,
            outbound_track_id,
            cancel,
            task,
        }))
    }

    /// Stop a relay and remove its outbound track from the subscriber.
    pub async fn detach(
        &self,
        room: &Arc<Room>,
        subscriber: &Arc<PeerSession>,
        key: &TrackKey,
        handle: RelayHandle,
    ) {
        handle.cancel();
        self.release(room, key, subscriber.peer_id(), handle.binding);
        if let Err(e) = subscriber
            .transport()
            .remove_relay_track(&handle.outbound_track_id)
            .await
        {
            warn!(subscriber = %subscriber.peer_id(), track = %key, "remove relay track failed: {e}");
        }
    }

    /// Drop a binding if it is still ours, reporting when the track lost its
    /// last subscriber.
    fn release(&self, room: &Room, key: &TrackKey, subscriber: &str, binding: BindingId) {
        if let Unbound::Removed { last } = room.unbind(key, subscriber, binding) {
            debug!(room_id = %room.id(), track = %key, subscriber, last, "binding removed");
            self.bus
                .emit(MeetEvent::relay_stopped(room.id(), key, subscriber, last));
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Read the publisher's track until it ends and push every packet into the
/// broadcast channel.  Sending never waits on subscribers.
async fn run_source(
    room: Arc<Room>,
    track: Arc<PublishedTrack>,
    inbound: Arc<dyn InboundTrack>,
    bus: EventBus,
) {
    loop {
        tokio::select! {
            _ = track.cancel.cancelled() => break,
            result = inbound.read() => match result {
                Ok(packet) => {
                    let _ = track.tx.send(packet);
                }
                Err(e) => {
                    debug!(track = %track.key, "source ended: {e}");
                    break;
                }
            }
        }
    }

    track.stop();
    if room.unpublish(&track) {
        info!(room_id = %room.id(), track = %track.key, "track unpublished");
        bus.emit(MeetEvent::track_unpublished(room.id(), &track.key, track.kind));
        topology_changed(&room, "track ended");
    }
}

struct FanoutTask {
    room: Arc<Room>,
    key: TrackKey,
    subscriber: String,
    binding: BindingId,
    relay: Relay,
}

/// Forward packets to one subscriber.  Exits on its own cancellation, the
/// source ending, or a write failure, and always releases its binding.  A
/// failed relay stays down until the subscriber's next topology change.
async fn run_fanout(
    task: FanoutTask,
    mut rx: broadcast::Receiver<Packet>,
    sink: Arc<dyn RelaySink>,
    cancel: CancellationToken,
    source: CancellationToken,
) {
    let label = format!("{} -> {}", task.key, task.subscriber);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{label} relay cancelled");
                break;
            }
            _ = source.cancelled() => {
                debug!("{label} source stopped");
                break;
            }
            result = rx.recv() => {
                match result {
                    Ok(packet) => {
                        if let Err(e) = sink.write(&packet).await {
                            warn!("{label} write error: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("{label} subscriber lagged, dropped {n} packets");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("{label} source channel closed");
                        break;
                    }
                }
            }
        }
    }

    task.relay
        .release(&task.room, &task.key, &task.subscriber, task.binding);
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
