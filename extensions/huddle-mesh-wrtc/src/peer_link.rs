//! One negotiated connection between the local participant and one remote participant.
//!
//! The link owns a single driver task. The task exclusively owns the candidate buffer
//! and every subscription the link holds: the signaling record, the remote side's
//! candidate list and the transport's events. Closing the link aborts and joins that
//! task, which drops the subscriptions, and only then closes the transport.
//!
//! Negotiation rules, applied on every record snapshot:
//!
//! - a remote offer is applied once, while no remote description is set, and answered
//! - a remote answer is applied while the local side is not stable
//! - the initiator writes an offer while the record holds none
//!
//! Remote candidates arriving before the remote description are buffered and flushed
//! in arrival order right after it is applied.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use huddle::error::Error;
use huddle::media::{MediaStream, MediaTrack, TrackKind};
use huddle::signaling::{
    is_initiator, CandidateSide, CandidateStream, IceCandidate, SessionKey, SignalMessage,
    SignalingRecord, SignalingRecordStream, SignalingStore,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::remote_streams::RemoteStreams;
use crate::transport::{
    NewTransport, PeerTransport, SignalingState, TransportConfig, TransportEvent,
    TransportEventStream, TransportFactory,
};

/// What every link of one call shares
#[derive(Clone)]
pub struct LinkContext {
    pub local_id: String,
    pub call_id: String,
    pub store: Arc<dyn SignalingStore>,
    pub factory: Arc<dyn TransportFactory>,
    pub transport_config: TransportConfig,
    pub remote_streams: RemoteStreams,
    /// Receives the remote id of a link whose signaling record was deleted under it
    pub resets: mpsc::UnboundedSender<String>,
}

pub struct PeerLink {
    remote_id: String,
    key: SessionKey,
    transport: Arc<dyn PeerTransport>,
    driver: Option<JoinHandle<()>>,
}

impl PeerLink {
    /// Creates the transport, attaches every local track and starts negotiating
    pub async fn open(
        ctx: &LinkContext,
        remote_id: &str,
        local_stream: Option<&MediaStream>,
    ) -> Result<Self, Error> {
        let NewTransport { transport, events } =
            ctx.factory.create(&ctx.transport_config).await?;

        match Self::start(ctx, remote_id, local_stream, &transport, events).await {
            Ok(link) => Ok(link),
            Err(e) => {
                if let Err(e) = transport.close().await {
                    log::warn!("failed to close transport for {remote_id}: {e}");
                }
                Err(e)
            }
        }
    }

    async fn start(
        ctx: &LinkContext,
        remote_id: &str,
        local_stream: Option<&MediaStream>,
        transport: &Arc<dyn PeerTransport>,
        events: TransportEventStream,
    ) -> Result<Self, Error> {
        if let Some(stream) = local_stream {
            for track in stream.tracks() {
                transport.add_track(track.clone()).await?;
            }
        }

        let key = SessionKey::new(&ctx.call_id, &ctx.local_id, remote_id);
        let side = CandidateSide::of(&ctx.local_id, remote_id);
        let records = ctx.store.subscribe(&key).await?;
        let candidates = ctx.store.subscribe_candidates(&key, side.opposite()).await?;

        let driver = LinkDriver {
            local_id: ctx.local_id.clone(),
            remote_id: remote_id.to_string(),
            key: key.clone(),
            side,
            initiator: is_initiator(&ctx.local_id, remote_id),
            store: ctx.store.clone(),
            transport: transport.clone(),
            remote_streams: ctx.remote_streams.clone(),
            resets: ctx.resets.clone(),
            offer_sent: false,
            seen_record: false,
            pending: VecDeque::new(),
        };
        let handle = tokio::spawn(driver.run(records, candidates, events));
        log::debug!("link to {remote_id} created on {key}");

        Ok(Self {
            remote_id: remote_id.to_string(),
            key,
            transport: transport.clone(),
            driver: Some(handle),
        })
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Puts `track` on the outgoing video sender, or takes video off it when `None`.
    /// Adds a sender when there is none yet. Never touches audio.
    pub async fn swap_video(&self, track: Option<Arc<MediaTrack>>) -> Result<(), Error> {
        let senders = self.transport.senders().await;
        match senders.iter().find(|s| s.kind == TrackKind::Video) {
            Some(sender) => self.transport.replace_track(&sender.id, track).await,
            None => match track {
                Some(track) => self.transport.add_track(track).await.map(|_| ()),
                None => Ok(()),
            },
        }
    }

    /// Stops the driver, which releases every subscription, then closes the
    /// transport. Safe to call more than once.
    pub async fn close(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        driver.abort();
        let _ = driver.await;
        if let Err(e) = self.transport.close().await {
            log::warn!("failed to close transport for {}: {e}", self.remote_id);
        }
        log::debug!("link to {} torn down", self.remote_id);
    }

    pub fn is_closed(&self) -> bool {
        self.driver.is_none()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

struct LinkDriver {
    local_id: String,
    remote_id: String,
    key: SessionKey,
    side: CandidateSide,
    initiator: bool,
    store: Arc<dyn SignalingStore>,
    transport: Arc<dyn PeerTransport>,
    remote_streams: RemoteStreams,
    resets: mpsc::UnboundedSender<String>,
    offer_sent: bool,
    seen_record: bool,
    pending: VecDeque<IceCandidate>,
}

impl LinkDriver {
    async fn run(
        mut self,
        mut records: SignalingRecordStream,
        mut candidates: CandidateStream,
        mut events: TransportEventStream,
    ) {
        loop {
            tokio::select! {
                record = records.next() => match record {
                    Some(record) => {
                        if !self.on_record(record).await {
                            break;
                        }
                    }
                    None => {
                        log::warn!("signaling record feed for {} closed", self.key);
                        break;
                    }
                },
                candidate = candidates.next() => match candidate {
                    Some(candidate) => self.on_remote_candidate(candidate).await,
                    None => {
                        log::warn!("candidate feed for {} closed", self.key);
                        break;
                    }
                },
                event = events.next() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => break,
                }
            }
        }
    }

    /// Returns `false` once the link can no longer make progress
    async fn on_record(&mut self, record: Option<SignalingRecord>) -> bool {
        let Some(record) = record else {
            if self.seen_record {
                // the other side tore its session down, start over with a fresh link
                log::debug!("signaling record {} was deleted", self.key);
                let _ = self.resets.send(self.remote_id.clone());
                return false;
            }
            if self.initiator && !self.offer_sent {
                self.send_offer().await;
            }
            return true;
        };
        self.seen_record = true;

        if let Some(offer) = record.remote_offer(&self.local_id) {
            if !self.transport.has_remote_description().await {
                if let Err(e) = self.answer(offer.clone()).await {
                    log::error!("failed to answer offer on {}: {e}", self.key);
                }
            }
        }

        if let Some(answer) = record.remote_answer(&self.local_id) {
            if self.transport.signaling_state() != SignalingState::Stable {
                match self.transport.set_remote_description(answer.sdp.clone()).await {
                    Ok(()) => self.flush().await,
                    Err(e) => log::error!("failed to apply answer on {}: {e}", self.key),
                }
            }
        }

        if self.initiator && record.offer.is_none() && !self.offer_sent {
            self.send_offer().await;
        }
        true
    }

    async fn answer(&mut self, offer: SignalMessage) -> Result<(), Error> {
        self.transport.set_remote_description(offer.sdp).await?;
        self.flush().await;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.store
            .upsert_answer(
                &self.key,
                SignalMessage {
                    from: self.local_id.clone(),
                    sdp: answer,
                },
            )
            .await?;
        log::debug!("answer written to {}", self.key);
        Ok(())
    }

    async fn send_offer(&mut self) {
        self.offer_sent = true;
        let result = async {
            let offer = self.transport.create_offer().await?;
            self.transport.set_local_description(offer.clone()).await?;
            self.store
                .upsert_offer(
                    &self.key,
                    SignalMessage {
                        from: self.local_id.clone(),
                        sdp: offer,
                    },
                )
                .await
        }
        .await;
        match result {
            Ok(()) => log::debug!("offer written to {}", self.key),
            Err(e) => log::error!("failed to send offer on {}: {e}", self.key),
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.transport.has_remote_description().await {
            self.apply_candidate(candidate).await;
        } else {
            self.pending.push_back(candidate);
        }
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        log::debug!(
            "flushing {} buffered candidates on {}",
            self.pending.len(),
            self.key
        );
        while let Some(candidate) = self.pending.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            log::warn!("failed to add ice candidate on {}: {e}", self.key);
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .store
                    .append_candidate(&self.key, self.side, candidate)
                    .await
                {
                    log::warn!("failed to publish local candidate on {}: {e}", self.key);
                }
            }
            TransportEvent::RemoteTrack { stream_id, track } => {
                log::debug!("{} track received from {}", track.kind(), self.remote_id);
                self.remote_streams
                    .publish_track(&self.remote_id, &stream_id, track);
            }
            TransportEvent::ConnectionStateChanged(state) => {
                log::debug!("connection to {} is {state}", self.remote_id);
            }
            TransportEvent::IceFailed => {
                log::warn!("ice failed for {}", self.remote_id);
            }
        }
    }
}
