//! Transports connected through process memory.
//!
//! Every transport created by the same [`LoopbackNetwork`] can reach every other one.
//! The session descriptions carry the id of the transport that produced them, which is
//! how the answering side finds its peer. A pair is connected once both descriptions
//! are applied and at least one remote candidate has been accepted; from then on every
//! outgoing track is copied into a matching remote track on the other side.
//!
//! Disabled tracks are sent as silence or black frames, and an idle video slot sends an
//! empty frame, the same way a browser peer would render them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use huddle::error::Error;
use huddle::media::{AudioChunk, MediaTrack, TrackKind, TrackSource, VideoFrame};
use huddle::signaling::{IceCandidate, SdpType, SessionDescription};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    ConnectionState, NewTransport, PeerTransport, SenderId, SenderInfo, SignalingState,
    TransportConfig, TransportEvent, TransportEventStream, TransportFactory,
};

const ID_ATTRIBUTE: &str = "a=loopback-id:";

#[derive(Default)]
struct NetworkInner {
    endpoints: RwLock<HashMap<String, Weak<LoopbackTransport>>>,
    created: Mutex<Vec<Weak<LoopbackTransport>>>,
    pending_failures: Mutex<u32>,
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` connection attempts report ICE failure instead of connecting
    pub fn fail_next_connections(&self, count: u32) {
        *self.inner.pending_failures.lock() = count;
    }

    /// Transports that are still alive, oldest first
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.inner
            .created
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn endpoint(&self, id: &str) -> Option<Arc<LoopbackTransport>> {
        self.inner.endpoints.read().get(id).and_then(Weak::upgrade)
    }

    fn take_failure(&self) -> bool {
        let mut pending = self.inner.pending_failures.lock();
        if *pending > 0 {
            *pending -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(&self, config: &TransportConfig) -> Result<NewTransport, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(LoopbackTransport {
            id: uuid::Uuid::new_v4().simple().to_string(),
            network: self.clone(),
            receive_only: config.receive_only,
            reflexive: !config.ice_servers.is_empty(),
            events: Mutex::new(Some(tx)),
            state: Mutex::new(State::default()),
        });
        self.inner
            .endpoints
            .write()
            .insert(transport.id.clone(), Arc::downgrade(&transport));
        self.inner.created.lock().push(Arc::downgrade(&transport));
        log::trace!("loopback transport {} created", transport.id);

        Ok(NewTransport {
            transport,
            events: TransportEventStream(UnboundedReceiverStream::new(rx).boxed()),
        })
    }
}

/// Aborts the copy task once the slot or the transport goes away
struct Forwarder(JoinHandle<()>);

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct LoopSender {
    id: SenderId,
    kind: TrackKind,
    track: watch::Sender<Option<Arc<MediaTrack>>>,
    _forwarder: Option<Forwarder>,
}

struct State {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer_id: Option<String>,
    senders: Vec<LoopSender>,
    /// Tracks received from the peer, keyed by the peer's sender id
    inbound: HashMap<SenderId, Arc<MediaTrack>>,
    /// Tracks on the peer side this transport feeds
    fed: Vec<Arc<MediaTrack>>,
    applied: Vec<IceCandidate>,
    gathered: bool,
    candidates_gathered: u32,
    attached: bool,
    closed: bool,
    offers_created: usize,
    answers_created: usize,
    ice_restarts: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            local: None,
            remote: None,
            peer_id: None,
            senders: vec![],
            inbound: HashMap::new(),
            fed: vec![],
            applied: vec![],
            gathered: false,
            candidates_gathered: 0,
            attached: false,
            closed: false,
            offers_created: 0,
            answers_created: 0,
            ice_restarts: 0,
        }
    }
}

pub struct LoopbackTransport {
    id: String,
    network: LoopbackNetwork,
    receive_only: bool,
    reflexive: bool,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    state: Mutex<State>,
}

impl LoopbackTransport {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the transport on the other end, once known
    pub fn peer_id(&self) -> Option<String> {
        self.state.lock().peer_id.clone()
    }

    /// Remote candidates accepted so far, in the order they were applied
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().answers_created
    }

    pub fn ice_restarts(&self) -> usize {
        self.state.lock().ice_restarts
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn ensure_open(state: &State) -> Result<(), Error> {
        if state.closed {
            return Err(Error::Transport("transport is closed".into()));
        }
        Ok(())
    }

    fn render(&self, kind: SdpType, state: &State) -> SessionDescription {
        let version = state.offers_created + state.answers_created;
        let mut sdp = format!(
            "v=0\r\no=- 0 {version} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{ID_ATTRIBUTE}{}\r\n",
            self.id
        );
        for sender in &state.senders {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=mid:{}\r\na=sendrecv\r\n",
                sender.kind, sender.id
            ));
        }
        SessionDescription { kind, sdp }
    }

    fn gather(&self) {
        let candidates = {
            let mut state = self.state.lock();
            let mut rng = rand::thread_rng();
            let mut out = vec![];
            let port: u16 = rng.gen_range(49152..65535);
            let foundation = state.candidates_gathered;
            out.push(IceCandidate {
                candidate: format!(
                    "candidate:{foundation} 1 udp 2130706431 127.0.0.1 {port} typ host"
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: Some(self.id[..8].to_string()),
            });
            if self.reflexive {
                out.push(IceCandidate {
                    candidate: format!(
                        "candidate:{} 1 udp 1686052607 203.0.113.{} {port} typ srflx raddr 127.0.0.1 rport {port}",
                        foundation + 1,
                        rng.gen_range(1..255u8)
                    ),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: Some(self.id[..8].to_string()),
                });
            }
            state.gathered = true;
            state.candidates_gathered += out.len() as u32;
            out
        };
        for candidate in candidates {
            self.emit(TransportEvent::LocalCandidate(candidate));
        }
    }

    fn set_connection(&self, connection: ConnectionState) {
        {
            let mut state = self.state.lock();
            if state.connection == connection {
                return;
            }
            state.connection = connection;
        }
        self.emit(TransportEvent::ConnectionStateChanged(connection));
    }

    fn try_connect(&self) {
        let peer_id = {
            let state = self.state.lock();
            let ready = !state.closed
                && !state.attached
                && state.local.is_some()
                && state.remote.is_some()
                && !state.applied.is_empty();
            match (ready, state.peer_id.clone()) {
                (true, Some(peer_id)) => peer_id,
                _ => return,
            }
        };
        let Some(peer) = self.network.endpoint(&peer_id) else {
            self.set_connection(ConnectionState::Failed);
            return;
        };

        if self.network.take_failure() {
            log::debug!("loopback transport {} failed to connect", self.id);
            self.set_connection(ConnectionState::Failed);
            self.emit(TransportEvent::IceFailed);
            return;
        }

        let pending = {
            let mut state = self.state.lock();
            if state.attached {
                return;
            }
            state.attached = true;
            state
                .senders
                .iter()
                .map(|s| (s.id.clone(), s.kind))
                .collect::<Vec<_>>()
        };
        self.set_connection(ConnectionState::Connected);
        for (sender_id, kind) in pending {
            self.attach(&peer, &sender_id, kind);
        }
    }

    /// Starts copying `sender_id` into a new track on `peer`
    fn attach(&self, peer: &LoopbackTransport, sender_id: &str, kind: TrackKind) {
        let Some(sink) = peer.accept_inbound(&self.id, sender_id, kind) else {
            return;
        };
        let mut state = self.state.lock();
        let Some(sender) = state.senders.iter_mut().find(|s| s.id == sender_id) else {
            return;
        };
        let handle = tokio::spawn(forward(kind, sender.track.subscribe(), sink.clone()));
        sender._forwarder = Some(Forwarder(handle));
        state.fed.push(sink);
    }

    fn accept_inbound(
        &self,
        stream_id: &str,
        sender_id: &str,
        kind: TrackKind,
    ) -> Option<Arc<MediaTrack>> {
        let track = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            state
                .inbound
                .entry(sender_id.to_string())
                .or_insert_with(|| {
                    MediaTrack::new(kind, TrackSource::Remote, format!("{kind} from {stream_id}"))
                })
                .clone()
        };
        self.emit(TransportEvent::RemoteTrack {
            stream_id: stream_id.to_string(),
            track: track.clone(),
        });
        Some(track)
    }

    fn drop_inbound(&self, sender_id: &str) {
        if let Some(track) = self.state.lock().inbound.remove(sender_id) {
            track.stop();
        }
    }

    fn peer(&self) -> Option<Arc<LoopbackTransport>> {
        let peer_id = self.state.lock().peer_id.clone()?;
        self.network.endpoint(&peer_id)
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.offers_created += 1;
        Ok(self.render(SdpType::Offer, &state))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::Transport(format!(
                "cannot create an answer in state {}",
                state.signaling
            )));
        }
        state.answers_created += 1;
        Ok(self.render(SdpType::Answer, &state))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error> {
        let gather = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            state.signaling = match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (kind, current) => {
                    return Err(Error::Transport(format!(
                        "cannot apply local {kind} in state {current}"
                    )))
                }
            };
            state.local = Some(description);
            !state.gathered
        };
        if gather {
            self.set_connection(ConnectionState::Connecting);
            self.gather();
        }
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error> {
        let peer_id = description
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix(ID_ATTRIBUTE))
            .map(str::to_string)
            .ok_or_else(|| Error::Transport("not a loopback session description".into()))?;
        if self.network.endpoint(&peer_id).is_none() {
            return Err(Error::Transport(format!("unknown loopback peer {peer_id}")));
        }
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            state.signaling = match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (kind, current) => {
                    return Err(Error::Transport(format!(
                        "cannot apply remote {kind} in state {current}"
                    )))
                }
            };
            state.remote = Some(description);
            state.peer_id = Some(peer_id);
        }
        self.try_connect();
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.remote.is_none() {
                return Err(Error::Transport(
                    "remote description must be set before adding candidates".into(),
                ));
            }
            state.applied.push(candidate);
        }
        self.try_connect();
        Ok(())
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId, Error> {
        if self.receive_only {
            return Err(Error::Transport("transport is receive only".into()));
        }
        let (id, kind, attached) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if let Some(sender) = state
                .senders
                .iter()
                .find(|s| s.track.borrow().as_ref().map(|t| t.id()) == Some(track.id()))
            {
                return Ok(sender.id.clone());
            }
            let id = uuid::Uuid::new_v4().simple().to_string();
            let kind = track.kind();
            let (tx, _) = watch::channel(Some(track));
            state.senders.push(LoopSender {
                id: id.clone(),
                kind,
                track: tx,
                _forwarder: None,
            });
            (id, kind, state.attached)
        };
        if attached {
            if let Some(peer) = self.peer() {
                self.attach(&peer, &id, kind);
            }
        }
        Ok(id)
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|s| SenderInfo {
                id: s.id.clone(),
                kind: s.kind,
                track_id: s.track.borrow().as_ref().map(|t| t.id().to_string()),
            })
            .collect()
    }

    async fn replace_track(
        &self,
        sender: &SenderId,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), Error> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        let slot = state
            .senders
            .iter()
            .find(|s| &s.id == sender)
            .ok_or_else(|| Error::Transport(format!("no sender {sender}")))?;
        if let Some(track) = track.as_ref() {
            if track.kind() != slot.kind {
                return Err(Error::Transport(format!(
                    "cannot send {} on a {} sender",
                    track.kind(),
                    slot.kind
                )));
            }
        }
        slot.track.send_replace(track);
        Ok(())
    }

    async fn remove_track(&self, sender: &SenderId) -> Result<(), Error> {
        let removed = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            let index = state
                .senders
                .iter()
                .position(|s| &s.id == sender)
                .ok_or_else(|| Error::Transport(format!("no sender {sender}")))?;
            state.senders.remove(index)
        };
        drop(removed);
        if let Some(peer) = self.peer() {
            peer.drop_inbound(sender);
        }
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            state.ice_restarts += 1;
        }
        log::debug!("restarting ice on loopback transport {}", self.id);
        self.set_connection(ConnectionState::Connecting);
        self.gather();
        self.try_connect();
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        // handlers first, so nothing fires while the rest is released
        self.events.lock().take();
        let (senders, inbound, fed) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            (
                std::mem::take(&mut state.senders),
                std::mem::take(&mut state.inbound),
                std::mem::take(&mut state.fed),
            )
        };
        drop(senders);
        inbound.values().for_each(|track| track.stop());
        fed.iter().for_each(|track| track.stop());
        self.network.inner.endpoints.write().remove(&self.id);
        log::trace!("loopback transport {} closed", self.id);
        Ok(())
    }
}

/// Copies whatever track the sender slot currently holds into `sink`
async fn forward(
    kind: TrackKind,
    mut slot: watch::Receiver<Option<Arc<MediaTrack>>>,
    sink: Arc<MediaTrack>,
) {
    loop {
        let current = slot.borrow_and_update().clone();
        let open = match current {
            Some(track) => copy_track(&track, &sink, &mut slot).await,
            None => {
                if kind == TrackKind::Video {
                    sink.push_frame(VideoFrame::new(0, 0, Bytes::new()));
                }
                slot.changed().await.is_ok()
            }
        };
        if !open {
            break;
        }
    }
}

/// Returns once the slot switches tracks, `false` if the slot is gone
async fn copy_track(
    track: &Arc<MediaTrack>,
    sink: &MediaTrack,
    slot: &mut watch::Receiver<Option<Arc<MediaTrack>>>,
) -> bool {
    let mut samples = track.subscribe_samples();
    let mut frames = track.subscribe_frames();
    let mut packets = track.subscribe_packets();

    // whatever was produced before this task subscribed
    if let Some(chunk) = samples.borrow_and_update().clone() {
        forward_chunk(track, sink, chunk);
    }
    if let Some(frame) = frames.borrow_and_update().clone() {
        forward_frame(track, sink, frame);
    }

    loop {
        tokio::select! {
            changed = slot.changed() => return changed.is_ok(),
            Ok(()) = samples.changed() => {
                let chunk = samples.borrow_and_update().clone();
                if let Some(chunk) = chunk {
                    forward_chunk(track, sink, chunk);
                }
            }
            Ok(()) = frames.changed() => {
                let frame = frames.borrow_and_update().clone();
                if let Some(frame) = frame {
                    forward_frame(track, sink, frame);
                }
            }
            packet = packets.recv() => match packet {
                Ok(packet) if track.is_enabled() => sink.push_packet(packet),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return slot.changed().await.is_ok(),
            }
        }
    }
}

fn forward_chunk(track: &MediaTrack, sink: &MediaTrack, chunk: AudioChunk) {
    if track.is_enabled() {
        sink.push_samples(chunk);
    } else {
        sink.push_samples(AudioChunk::silence(chunk.sample_rate, chunk.samples.len()));
    }
}

fn forward_frame(track: &MediaTrack, sink: &MediaTrack, frame: VideoFrame) {
    if track.is_enabled() {
        sink.push_frame(frame);
    } else {
        sink.push_frame(VideoFrame::solid(frame.width, frame.height, [0, 0, 0, 255]));
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use huddle::media::{AudioChunk, MediaTrack, TrackKind, TrackSource, VideoFrame};

    use crate::transport::{
        ConnectionState, NewTransport, PeerTransport, SignalingState, TransportConfig,
        TransportEvent, TransportEventStream, TransportFactory,
    };

    use super::LoopbackNetwork;

    async fn next_candidate(events: &mut TransportEventStream) -> anyhow::Result<huddle::signaling::IceCandidate> {
        loop {
            match events.next().await {
                Some(TransportEvent::LocalCandidate(c)) => return Ok(c),
                Some(_) => continue,
                None => anyhow::bail!("event stream ended"),
            }
        }
    }

    async fn next_track(events: &mut TransportEventStream) -> anyhow::Result<Arc<MediaTrack>> {
        loop {
            match events.next().await {
                Some(TransportEvent::RemoteTrack { track, .. }) => return Ok(track),
                Some(_) => continue,
                None => anyhow::bail!("event stream ended"),
            }
        }
    }

    #[tokio::test]
    async fn offer_answer_connects_and_carries_media() -> anyhow::Result<()> {
        let network = LoopbackNetwork::new();
        let config = TransportConfig::default();
        let NewTransport {
            transport: a,
            events: mut a_events,
        } = network.create(&config).await?;
        let NewTransport {
            transport: b,
            events: mut b_events,
        } = network.create(&config).await?;

        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        a.add_track(mic.clone()).await?;

        let offer = a.create_offer().await?;
        a.set_local_description(offer.clone()).await?;
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);
        b.set_remote_description(offer).await?;
        let answer = b.create_answer().await?;
        b.set_local_description(answer.clone()).await?;
        a.set_remote_description(answer).await?;
        assert_eq!(a.signaling_state(), SignalingState::Stable);

        b.add_ice_candidate(next_candidate(&mut a_events).await?).await?;
        a.add_ice_candidate(next_candidate(&mut b_events).await?).await?;
        assert_eq!(a.connection_state(), ConnectionState::Connected);

        let remote = next_track(&mut b_events).await?;
        assert_eq!(remote.kind(), TrackKind::Audio);
        let mut samples = remote.subscribe_samples();

        mic.push_samples(AudioChunk::new(48000, vec![0.5; 8]));
        tokio::time::timeout(Duration::from_secs(1), samples.changed()).await??;
        assert_eq!(
            samples.borrow().as_ref().map(|c| c.samples[0]),
            Some(0.5)
        );

        mic.set_enabled(false);
        mic.push_samples(AudioChunk::new(48000, vec![0.5; 8]));
        tokio::time::timeout(Duration::from_secs(1), samples.changed()).await??;
        assert_eq!(
            samples.borrow().as_ref().map(|c| c.samples[0]),
            Some(0.0)
        );
        Ok(())
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description() -> anyhow::Result<()> {
        let network = LoopbackNetwork::new();
        let NewTransport { transport, .. } = network.create(&TransportConfig::default()).await?;
        let result = transport
            .add_ice_candidate(huddle::signaling::IceCandidate::new("candidate:0"))
            .await;
        assert!(result.is_err());
        assert!(transport.create_answer().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn replacing_video_reuses_the_sender() -> anyhow::Result<()> {
        let network = LoopbackNetwork::new();
        let NewTransport { transport, .. } = network.create(&TransportConfig::default()).await?;
        let camera = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        let screen = MediaTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let sender = transport.add_track(camera.clone()).await?;
        transport.add_track(mic.clone()).await?;

        transport.replace_track(&sender, Some(screen.clone())).await?;
        assert!(transport.replace_track(&sender, Some(mic.clone())).await.is_err());
        let senders = transport.senders().await;
        assert_eq!(senders.len(), 2);
        assert_eq!(senders[0].track_id.as_deref(), Some(screen.id()));
        assert_eq!(senders[1].track_id.as_deref(), Some(mic.id()));

        transport.replace_track(&sender, None).await?;
        assert_eq!(transport.senders().await[0].track_id, None);
        Ok(())
    }

    #[tokio::test]
    async fn close_is_idempotent_and_silences_events() -> anyhow::Result<()> {
        let network = LoopbackNetwork::new();
        let NewTransport {
            transport,
            mut events,
        } = network.create(&TransportConfig::default()).await?;
        transport.close().await?;
        transport.close().await?;
        assert_eq!(transport.signaling_state(), SignalingState::Closed);
        assert!(events.next().await.is_none());
        assert!(transport.create_offer().await.is_err());
        assert!(network.transports()[0].is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_video_arrives_black() -> anyhow::Result<()> {
        let network = LoopbackNetwork::new();
        let config = TransportConfig::default();
        let NewTransport {
            transport: a,
            events: mut a_events,
        } = network.create(&config).await?;
        let NewTransport {
            transport: b,
            events: mut b_events,
        } = network.create(&config).await?;
        let camera = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        a.add_track(camera.clone()).await?;

        let offer = a.create_offer().await?;
        a.set_local_description(offer.clone()).await?;
        b.set_remote_description(offer).await?;
        let answer = b.create_answer().await?;
        b.set_local_description(answer.clone()).await?;
        a.set_remote_description(answer).await?;
        b.add_ice_candidate(next_candidate(&mut a_events).await?).await?;
        a.add_ice_candidate(next_candidate(&mut b_events).await?).await?;

        let remote = next_track(&mut b_events).await?;
        let mut frames = remote.subscribe_frames();
        camera.set_enabled(false);
        camera.push_frame(VideoFrame::solid(2, 2, [200, 10, 10, 255]));
        tokio::time::timeout(Duration::from_secs(1), frames.changed()).await??;
        let frame = frames.borrow().clone().expect("a frame");
        assert_eq!(&frame.data[..4], &[0, 0, 0, 255]);
        Ok(())
    }
}
