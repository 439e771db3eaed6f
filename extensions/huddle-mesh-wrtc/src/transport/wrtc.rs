//! [`PeerTransport`] on top of [webrtc-rs](https://github.com/webrtc-rs/webrtc).
//!
//! Media crosses this transport as RTP. Each outgoing [`MediaTrack`] gets a
//! `TrackLocalStaticRTP`; a pump task writes whatever the track publishes with
//! [`MediaTrack::push_packet`] into it. Incoming tracks are read the same way in
//! reverse: every RTP packet read from a `TrackRemote` is published on a new
//! remote [`MediaTrack`]. Turning samples into RTP and back is the producer's job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use huddle::error::Error;
use huddle::media::{MediaTrack, TrackKind, TrackSource};
use huddle::signaling::{IceCandidate, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::sdp::extmap::AUDIO_LEVEL_URI;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectionState, NewTransport, PeerTransport, SenderId, SenderInfo, SignalingState,
    TransportConfig, TransportEvent, TransportEventStream, TransportFactory,
};

fn transport_error(e: impl std::fmt::Display) -> Error {
    Error::Transport(e.to_string())
}

fn codec(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_owned(),
            rtcp_feedback: vec![],
        },
    }
}

fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();

    media.register_header_extension(
        RTCRtpHeaderExtensionCapability {
            uri: AUDIO_LEVEL_URI.into(),
        },
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverDirection::Sendrecv),
    )?;

    media.register_codec(
        RTCRtpCodecParameters {
            capability: codec(TrackKind::Audio),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media.register_codec(
        RTCRtpCodecParameters {
            capability: codec(TrackKind::Video),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    // NACKs, RTCP reports and the rest of the default pipeline
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

pub struct WebRtcFactory {
    api: Arc<webrtc::api::API>,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            api: Arc::new(create_api()?),
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self, config: &TransportConfig) -> Result<NewTransport, Error> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(transport_error)?,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(WebRtcTransport {
            stream_id: uuid::Uuid::new_v4().to_string(),
            connection,
            receive_only: config.receive_only,
            senders: Mutex::new(vec![]),
            readers: Arc::new(Mutex::new(vec![])),
            ice_restart: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        transport.register_handlers(tx);

        Ok(NewTransport {
            transport,
            events: TransportEventStream(UnboundedReceiverStream::new(rx).boxed()),
        })
    }
}

/// Aborts the wrapped task on drop
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct WrtcSender {
    id: SenderId,
    kind: TrackKind,
    rtp_sender: Arc<RTCRtpSender>,
    slot: watch::Sender<Option<Arc<MediaTrack>>>,
    _pump: TaskGuard,
    _rtcp: TaskGuard,
}

pub struct WebRtcTransport {
    /// Id under which remote tracks of this connection are grouped
    stream_id: String,
    connection: Arc<RTCPeerConnection>,
    receive_only: bool,
    senders: Mutex<Vec<WrtcSender>>,
    readers: Arc<Mutex<Vec<TaskGuard>>>,
    ice_restart: AtomicBool,
    closed: AtomicBool,
}

impl WebRtcTransport {
    fn register_handlers(&self, tx: mpsc::UnboundedSender<TransportEvent>) {
        let ch = tx.clone();
        self.connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                log::debug!("peer connection state has changed: {state}");
                let state = match state {
                    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                        ConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                if let Err(e) = ch.send(TransportEvent::ConnectionStateChanged(state)) {
                    log::error!("failed to send connection state event: {e}");
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        let ch = tx.clone();
        self.connection
            .on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
                if let Some(candidate) = c {
                    match candidate.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            };
                            if let Err(e) = ch.send(TransportEvent::LocalCandidate(candidate)) {
                                log::error!("failed to send local candidate: {e}");
                            }
                        }
                        Err(e) => log::error!("failed to serialize ice candidate: {e}"),
                    }
                }
                Box::pin(futures::future::ready(()))
            }));

        let ch = tx.clone();
        self.connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                log::debug!("ICE connection state has changed: {state}");
                if matches!(state, RTCIceConnectionState::Failed) {
                    let _ = ch.send(TransportEvent::IceFailed);
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        let ch = tx;
        let readers = self.readers.clone();
        let stream_id = self.stream_id.clone();
        self.connection.on_track(Box::new(
            move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
                if let Some(track) = track {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    let media = MediaTrack::new(kind, TrackSource::Remote, format!("remote {kind}"));
                    let handle = tokio::spawn(read_remote(track, media.clone()));
                    readers.lock().push(TaskGuard(handle));
                    if let Err(e) = ch.send(TransportEvent::RemoteTrack {
                        stream_id: stream_id.clone(),
                        track: media,
                    }) {
                        log::error!("failed to send remote track event: {e}");
                    }
                }
                Box::pin(futures::future::ready(()))
            },
        ));
    }

    /// Replaces every handler with one that does nothing
    fn unregister_handlers(&self) {
        self.connection
            .on_peer_connection_state_change(Box::new(|_| Box::pin(futures::future::ready(()))));
        self.connection
            .on_ice_candidate(Box::new(|_| Box::pin(futures::future::ready(()))));
        self.connection
            .on_ice_connection_state_change(Box::new(|_| Box::pin(futures::future::ready(()))));
        self.connection
            .on_track(Box::new(|_, _| Box::pin(futures::future::ready(()))));
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("transport is closed".into()));
        }
        Ok(())
    }
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, Error> {
    let value = serde_json::to_value(description)?;
    Ok(serde_json::from_value(value)?)
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, Error> {
    let value = serde_json::to_value(description)?;
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        self.ensure_open()?;
        let options = self
            .ice_restart
            .swap(false, Ordering::SeqCst)
            .then_some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            });
        let offer = self
            .connection
            .create_offer(options)
            .await
            .map_err(transport_error)?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        self.ensure_open()?;
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(transport_error)?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        self.connection
            .set_local_description(to_rtc(&description)?)
            .await
            .map_err(transport_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        self.connection
            .set_remote_description(to_rtc(&description)?)
            .await
            .map_err(transport_error)
    }

    async fn has_remote_description(&self) -> bool {
        self.connection.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        match self.connection.connection_state() {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        self.ensure_open()?;
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(transport_error)
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId, Error> {
        self.ensure_open()?;
        if self.receive_only {
            return Err(Error::Transport("transport is receive only".into()));
        }
        let kind = track.kind();
        let local = Arc::new(TrackLocalStaticRTP::new(
            codec(kind),
            track.id().to_string(),
            self.stream_id.clone(),
        ));
        let rtp_sender = self
            .connection
            .add_track(local.clone())
            .await
            .map_err(transport_error)?;

        // Incoming RTCP has to be read for the interceptors (NACK etc.) to run
        let sender2 = rtp_sender.clone();
        let rtcp = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender2.read(&mut rtcp_buf).await {}
            log::debug!("terminating rtcp reader");
        });

        let (slot, rx) = watch::channel(Some(track));
        let pump = tokio::spawn(pump(rx, local));
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.senders.lock().push(WrtcSender {
            id: id.clone(),
            kind,
            rtp_sender,
            slot,
            _pump: TaskGuard(pump),
            _rtcp: TaskGuard(rtcp),
        });
        Ok(id)
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        self.senders
            .lock()
            .iter()
            .map(|s| SenderInfo {
                id: s.id.clone(),
                kind: s.kind,
                track_id: s.slot.borrow().as_ref().map(|t| t.id().to_string()),
            })
            .collect()
    }

    async fn replace_track(
        &self,
        sender: &SenderId,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let senders = self.senders.lock();
        let entry = senders
            .iter()
            .find(|s| &s.id == sender)
            .ok_or_else(|| Error::Transport(format!("no sender {sender}")))?;
        if matches!(track.as_ref(), Some(t) if t.kind() != entry.kind) {
            return Err(Error::Transport(format!(
                "cannot send a different kind on a {} sender",
                entry.kind
            )));
        }
        entry.slot.send_replace(track);
        Ok(())
    }

    async fn remove_track(&self, sender: &SenderId) -> Result<(), Error> {
        self.ensure_open()?;
        let removed = {
            let mut senders = self.senders.lock();
            let index = senders
                .iter()
                .position(|s| &s.id == sender)
                .ok_or_else(|| Error::Transport(format!("no sender {sender}")))?;
            senders.remove(index)
        };
        self.connection
            .remove_track(&removed.rtp_sender)
            .await
            .map_err(transport_error)
    }

    async fn restart_ice(&self) -> Result<(), Error> {
        self.ensure_open()?;
        // applied by the next offer this side creates
        self.ice_restart.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.unregister_handlers();
        self.senders.lock().clear();
        self.readers.lock().clear();
        if let Err(e) = self.connection.close().await {
            log::error!("failed to close peer connection: {e}");
            return Err(transport_error(e));
        }
        Ok(())
    }
}

/// Writes the packets of whatever track the slot holds into `local`
async fn pump(mut slot: watch::Receiver<Option<Arc<MediaTrack>>>, local: Arc<TrackLocalStaticRTP>) {
    let mut log_write_error_once = false;
    loop {
        let current = slot.borrow_and_update().clone();
        let Some(track) = current else {
            if slot.changed().await.is_err() {
                break;
            }
            continue;
        };
        let mut packets = track.subscribe_packets();
        loop {
            tokio::select! {
                changed = slot.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                packet = packets.recv() => match packet {
                    Ok(packet) => {
                        if !track.is_enabled() {
                            continue;
                        }
                        if let Err(e) = local.write(&packet).await {
                            if !log_write_error_once {
                                log_write_error_once = true;
                                log::error!("failed to write rtp packet: {e}");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("rtp pump lagged by {n} packets");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if slot.changed().await.is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }
}

async fn read_remote(track: Arc<TrackRemote>, media: Arc<MediaTrack>) {
    let mut b = vec![0u8; 1500];
    loop {
        match track.read(&mut b).await {
            Ok((size, _)) => media.push_packet(Bytes::copy_from_slice(&b[..size])),
            Err(e) => {
                log::debug!("remote track ended: {e}");
                break;
            }
        }
    }
    media.stop();
}

#[cfg(test)]
mod test {
    use huddle::media::{MediaTrack, TrackKind, TrackSource};
    use huddle::signaling::SdpType;

    use crate::transport::{NewTransport, SignalingState, TransportConfig, TransportFactory};

    use super::WebRtcFactory;

    #[tokio::test]
    async fn offer_describes_local_tracks() -> anyhow::Result<()> {
        let factory = WebRtcFactory::new()?;
        let NewTransport { transport, .. } = factory.create(&TransportConfig::default()).await?;
        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let camera = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        transport.add_track(mic).await?;
        let video = transport.add_track(camera).await?;

        let offer = transport.create_offer().await?;
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.to_lowercase().contains("opus"));
        assert_eq!(transport.signaling_state(), SignalingState::Stable);

        transport.replace_track(&video, None).await?;
        assert_eq!(transport.senders().await[1].track_id, None);

        transport.close().await?;
        transport.close().await?;
        assert!(transport.create_offer().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn receive_only_refuses_tracks() -> anyhow::Result<()> {
        let factory = WebRtcFactory::new()?;
        let config = TransportConfig {
            receive_only: true,
            ..Default::default()
        };
        let NewTransport { transport, .. } = factory.create(&config).await?;
        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        assert!(transport.add_track(mic).await.is_err());
        transport.close().await?;
        Ok(())
    }
}
