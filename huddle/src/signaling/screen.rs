//! Relay for watching someone's screen outside of a call.
//!
//! The sharer ("caller") publishes an offer and its candidates; each viewer
//! ("callee") answers and appends to the callee list.

use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::{CandidateStream, IceCandidate, SessionDescription};
use crate::error::Error;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenSessionStatus {
    #[display(fmt = "active")]
    Active,
    #[display(fmt = "ended")]
    Ended,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScreenRole {
    #[display(fmt = "callerCandidates")]
    #[serde(rename = "callerCandidates")]
    Caller,
    #[display(fmt = "calleeCandidates")]
    #[serde(rename = "calleeCandidates")]
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenSession {
    pub id: String,
    pub sharer_id: String,
    pub status: ScreenSessionStatus,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
}

impl ScreenSession {
    pub fn is_active(&self) -> bool {
        self.status == ScreenSessionStatus::Active
    }
}

pub struct ScreenSessionStream(pub BoxStream<'static, Option<ScreenSession>>);

impl core::ops::Deref for ScreenSessionStream {
    type Target = BoxStream<'static, Option<ScreenSession>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for ScreenSessionStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[async_trait]
pub trait ScreenSessionStore: Send + Sync {
    async fn read_screen_session(&self, session_id: &str) -> Result<Option<ScreenSession>, Error>;

    async fn write_viewer_answer(
        &self,
        session_id: &str,
        answer: SessionDescription,
    ) -> Result<(), Error>;

    async fn append_screen_candidate(
        &self,
        session_id: &str,
        role: ScreenRole,
        candidate: IceCandidate,
    ) -> Result<(), Error>;

    async fn subscribe_screen_candidates(
        &self,
        session_id: &str,
        role: ScreenRole,
    ) -> Result<CandidateStream, Error>;

    async fn subscribe_screen_session(&self, session_id: &str) -> Result<ScreenSessionStream, Error>;
}
