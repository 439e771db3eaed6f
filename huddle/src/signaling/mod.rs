//! Offer/answer relay between the two sides of a participant pair.
//!
//! Both sides of a pair compute the same [`SessionKey`] and the same initiator
//! without talking to each other: the lower id writes the offer and appends to
//! the `Peer1` candidate list, the higher id writes the answer and appends to `Peer2`.

pub mod screen;

use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Returns true when `local` is responsible for writing the offer to `remote`.
pub fn is_initiator(local: &str, remote: &str) -> bool {
    local < remote
}

/// Identifies the signaling record of one participant pair within one call
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[display(fmt = "{}/{}", call_id, pair)]
pub struct SessionKey {
    call_id: String,
    pair: String,
}

impl SessionKey {
    pub fn new(call_id: impl Into<String>, a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            call_id: call_id.into(),
            pair: format!("{low}-{high}"),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// The two ids joined in sorted order
    pub fn pair(&self) -> &str {
        &self.pair
    }
}

/// Which of the two append-only candidate lists of a record a side writes to
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateSide {
    /// Written by the lower of the two ids
    #[display(fmt = "peer1Candidates")]
    #[serde(rename = "peer1Candidates")]
    Peer1,
    /// Written by the higher of the two ids
    #[display(fmt = "peer2Candidates")]
    #[serde(rename = "peer2Candidates")]
    Peer2,
}

impl CandidateSide {
    /// The list `local` appends its own candidates to
    pub fn of(local: &str, remote: &str) -> Self {
        if is_initiator(local, remote) {
            CandidateSide::Peer1
        } else {
            CandidateSide::Peer2
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            CandidateSide::Peer1 => CandidateSide::Peer2,
            CandidateSide::Peer2 => CandidateSide::Peer1,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "pranswer")]
    Pranswer,
    #[display(fmt = "answer")]
    Answer,
    #[display(fmt = "rollback")]
    Rollback,
}

/// Negotiated media/transport parameters proposed or accepted by one side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One connectivity candidate, in the shape the browser produces with `toJSON()`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: String,
    pub sdp: SessionDescription,
}

/// Shared relay structure for one participant pair
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SignalMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SignalMessage>,
}

impl SignalingRecord {
    /// The offer, unless `local` wrote it
    pub fn remote_offer(&self, local: &str) -> Option<&SignalMessage> {
        self.offer.as_ref().filter(|offer| offer.from != local)
    }

    /// The answer, unless `local` wrote it
    pub fn remote_answer(&self, local: &str) -> Option<&SignalMessage> {
        self.answer.as_ref().filter(|answer| answer.from != local)
    }
}

/// Snapshots of one record, starting with the current one. `None` means there is no record.
pub struct SignalingRecordStream(pub BoxStream<'static, Option<SignalingRecord>>);

impl core::ops::Deref for SignalingRecordStream {
    type Target = BoxStream<'static, Option<SignalingRecord>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for SignalingRecordStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Every candidate of one side, existing ones first, each exactly once and in append order
pub struct CandidateStream(pub BoxStream<'static, IceCandidate>);

impl core::ops::Deref for CandidateStream {
    type Target = BoxStream<'static, IceCandidate>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for CandidateStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Relay store contract. Dropping a returned stream unsubscribes it.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Creates the record if needed and replaces its offer
    async fn upsert_offer(&self, key: &SessionKey, offer: SignalMessage) -> Result<(), Error>;

    /// Creates the record if needed and replaces its answer
    async fn upsert_answer(&self, key: &SessionKey, answer: SignalMessage) -> Result<(), Error>;

    async fn append_candidate(
        &self,
        key: &SessionKey,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), Error>;

    async fn read_session(&self, key: &SessionKey) -> Result<Option<SignalingRecord>, Error>;

    /// Candidates of `side` appended after the first `since` ones
    async fn list_candidates(
        &self,
        key: &SessionKey,
        side: CandidateSide,
        since: usize,
    ) -> Result<Vec<IceCandidate>, Error>;

    async fn subscribe(&self, key: &SessionKey) -> Result<SignalingRecordStream, Error>;

    async fn subscribe_candidates(
        &self,
        key: &SessionKey,
        side: CandidateSide,
    ) -> Result<CandidateStream, Error>;

    /// Removes the record and both candidate lists
    async fn delete_session(&self, key: &SessionKey) -> Result<(), Error>;

    /// Removes every record of the call
    async fn delete_call_sessions(&self, call_id: &str) -> Result<(), Error>;
}
