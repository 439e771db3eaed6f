//! The peer-to-peer media primitive the rest of the crate negotiates over.
//!
//! A [`PeerTransport`] is one negotiation object: it produces and consumes session
//! descriptions, accepts trickled candidates and carries tracks in both directions.
//! Everything it wants to tell its owner arrives on the [`TransportEventStream`]
//! returned next to it by [`TransportFactory::create`].
//!
//! Two implementations ship with the crate: [`wrtc`] on top of webrtc-rs, and
//! [`loopback`], which connects transports living in the same process.

pub mod loopback;
pub mod wrtc;

use std::sync::Arc;

use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use huddle::error::Error;
use huddle::media::{MediaTrack, TrackKind};
use huddle::signaling::{IceCandidate, SessionDescription};

use crate::config::IceServer;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    /// Refuse outgoing tracks. Used for viewers.
    pub receive_only: bool,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    #[display(fmt = "stable")]
    Stable,
    #[display(fmt = "have-local-offer")]
    HaveLocalOffer,
    #[display(fmt = "have-remote-offer")]
    HaveRemoteOffer,
    #[display(fmt = "closed")]
    Closed,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    #[display(fmt = "new")]
    New,
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "disconnected")]
    Disconnected,
    #[display(fmt = "failed")]
    Failed,
    #[display(fmt = "closed")]
    Closed,
}

pub type SenderId = String;

/// An outgoing slot. The slot outlives the track it carries: replacing the
/// track keeps the negotiated slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub id: SenderId,
    pub kind: TrackKind,
    pub track_id: Option<String>,
}

#[derive(Clone, Display)]
pub enum TransportEvent {
    /// A local candidate was gathered and should be sent to the other side
    #[display(fmt = "LocalCandidate")]
    LocalCandidate(IceCandidate),
    /// The other side added a track
    #[display(fmt = "RemoteTrack")]
    RemoteTrack {
        stream_id: String,
        track: Arc<MediaTrack>,
    },
    #[display(fmt = "ConnectionStateChanged({})", _0)]
    ConnectionStateChanged(ConnectionState),
    #[display(fmt = "IceFailed")]
    IceFailed,
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

pub struct TransportEventStream(pub BoxStream<'static, TransportEvent>);

impl core::ops::Deref for TransportEventStream {
    type Target = BoxStream<'static, TransportEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for TransportEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, Error>;

    async fn create_answer(&self) -> Result<SessionDescription, Error>;

    /// Applying a local description starts candidate gathering
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    /// Fails if no remote description has been applied yet
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error>;

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId, Error>;

    async fn senders(&self) -> Vec<SenderInfo>;

    /// Swaps the track carried by `sender` without renegotiating. `None` leaves the slot idle.
    async fn replace_track(
        &self,
        sender: &SenderId,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), Error>;

    async fn remove_track(&self, sender: &SenderId) -> Result<(), Error>;

    async fn restart_ice(&self) -> Result<(), Error>;

    /// Unregisters every handler, then releases the connection. Calling it again does nothing.
    async fn close(&self) -> Result<(), Error>;
}

pub struct NewTransport {
    pub transport: Arc<dyn PeerTransport>,
    pub events: TransportEventStream,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, config: &TransportConfig) -> Result<NewTransport, Error>;
}
