//! The shared call record and the directory that owns it.
//!
//! Every participant's client reads and mutates the same [`CallSession`] through a
//! [`CallDirectory`]. Clients never edit the record directly; they call the directory
//! actions and observe the result through [`CallDirectory::subscribe`].

mod event;
mod status;

pub use event::{CallEvent, CallEventStream, IncomingCallEvent, IncomingCallEventStream, LeaveReason};
pub use status::CallStatus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::upload::RecordingRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    #[display(fmt = "join")]
    Join,
    #[display(fmt = "leave")]
    Leave,
}

/// Arguments of [`CallDirectory::create`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCall {
    pub participants: Vec<Participant>,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub created_by: Participant,
    #[serde(default)]
    pub chat_id: Option<String>,
}

/// One call instance, as stored by the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub status: CallStatus,
    pub participant_ids: Vec<String>,
    pub participants: Vec<Participant>,
    pub active_participant_ids: Vec<String>,
    pub created_by: Participant,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Whole seconds between `answered_at` and `ended_at`
    #[serde(default)]
    pub duration: Option<u64>,
    pub is_recording: bool,
    #[serde(default)]
    pub recording_url: Option<String>,
    pub is_screen_sharing: bool,
    #[serde(default)]
    pub screen_sharing_user_id: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    /// Builds a fresh pending call. The creator is always part of the roster and
    /// is the only active participant.
    pub fn new(id: impl Into<String>, create: CreateCall, now: DateTime<Utc>) -> Result<Self, Error> {
        let CreateCall {
            participants,
            call_type,
            created_by,
            chat_id,
        } = create;

        let mut roster: Vec<Participant> = Vec::with_capacity(participants.len() + 1);
        if !participants.iter().any(|p| p.id == created_by.id) {
            roster.push(created_by.clone());
        }
        for participant in participants {
            if roster.iter().all(|p| p.id != participant.id) {
                roster.push(participant);
            }
        }

        if roster.len() < 2 {
            return Err(Error::EmptyRoster);
        }

        Ok(Self {
            id: id.into(),
            call_type,
            status: CallStatus::Pending,
            participant_ids: roster.iter().map(|p| p.id.clone()).collect(),
            participants: roster,
            active_participant_ids: vec![created_by.id.clone()],
            created_by,
            started_at: now,
            answered_at: None,
            ended_at: None,
            duration: None,
            is_recording: false,
            recording_url: None,
            is_screen_sharing: false,
            screen_sharing_user_id: None,
            chat_id,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|id| id == user_id)
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.active_participant_ids.iter().any(|id| id == user_id)
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.created_by.id == user_id
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == user_id)
    }

    /// Everyone on the roster except `local`
    pub fn remote_participants<'a>(
        &'a self,
        local: &'a str,
    ) -> impl Iterator<Item = &'a Participant> + 'a {
        self.participants.iter().filter(move |p| p.id != local)
    }

    pub fn roster_is_consistent(&self) -> bool {
        self.active_participant_ids
            .iter()
            .all(|id| self.is_participant(id))
    }

    /// Moves the call to `to`, stamping `answered_at`, `ended_at` and `duration`
    /// along the way. Returns whether anything changed.
    pub fn apply_status(&mut self, to: CallStatus, now: DateTime<Utc>) -> Result<bool, Error> {
        if !self.status.can_transition_to(to) {
            tracing::warn!(call_id = %self.id, from = %self.status, to = %to, "rejected status change");
            return Err(Error::InvalidStatusTransition {
                from: self.status,
                to,
            });
        }
        if self.status == to {
            return Ok(false);
        }

        match to {
            CallStatus::Answered => self.answered_at = Some(now),
            CallStatus::Ended => {
                self.ended_at = Some(now);
                self.duration = self
                    .answered_at
                    .map(|answered| (now - answered).num_seconds().max(0) as u64);
            }
            _ => {}
        }

        self.status = to;
        self.updated_at = now;
        Ok(true)
    }

    pub fn join(&mut self, user_id: &str, now: DateTime<Utc>) -> Result<bool, Error> {
        if !self.is_participant(user_id) {
            return Err(Error::NotAParticipant);
        }
        if self.status.is_terminal() {
            tracing::debug!(call_id = %self.id, status = %self.status, "join refused");
            return Err(Error::CallAlreadyEnded);
        }
        if self.is_active(user_id) {
            return Ok(false);
        }
        self.active_participant_ids.push(user_id.to_string());
        self.updated_at = now;
        Ok(true)
    }

    pub fn leave(&mut self, user_id: &str, now: DateTime<Utc>) -> bool {
        let before = self.active_participant_ids.len();
        self.active_participant_ids.retain(|id| id != user_id);
        let changed = before != self.active_participant_ids.len();
        if changed {
            self.updated_at = now;
        }
        changed
    }

    pub fn add_participant(&mut self, participant: Participant, now: DateTime<Utc>) -> Result<(), Error> {
        if self.status.is_terminal() {
            return Err(Error::CallAlreadyEnded);
        }
        if self.is_participant(&participant.id) {
            return Err(Error::ParticipantAlreadyInCall);
        }
        self.participant_ids.push(participant.id.clone());
        self.participants.push(participant);
        self.updated_at = now;
        Ok(())
    }

    /// Drops `user_id` from the roster and from the active set. A removed sharer
    /// also clears the screen share flag.
    pub fn remove_participant(&mut self, user_id: &str, now: DateTime<Utc>) -> Result<(), Error> {
        if !self.is_participant(user_id) {
            return Err(Error::NotAParticipant);
        }
        self.participant_ids.retain(|id| id != user_id);
        self.participants.retain(|p| p.id != user_id);
        self.active_participant_ids.retain(|id| id != user_id);
        if self.screen_sharing_user_id.as_deref() == Some(user_id) {
            self.set_screen_sharer(None, now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Last writer wins. There is no check for an existing sharer here.
    pub fn set_screen_sharer(&mut self, user_id: Option<String>, now: DateTime<Utc>) {
        self.is_screen_sharing = user_id.is_some();
        self.screen_sharing_user_id = user_id;
        self.updated_at = now;
    }

    pub fn someone_else_sharing(&self, local: &str) -> bool {
        matches!(self.screen_sharing_user_id.as_deref(), Some(id) if id != local)
    }

    pub fn set_recording(&mut self, is_recording: bool, now: DateTime<Utc>) {
        self.is_recording = is_recording;
        self.updated_at = now;
    }
}

/// Every change of one call record, starting with the current one. `None` means the
/// record no longer exists.
pub struct CallSnapshotStream(pub BoxStream<'static, Option<CallSession>>);

impl core::ops::Deref for CallSnapshotStream {
    type Target = BoxStream<'static, Option<CallSession>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for CallSnapshotStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Call actions shared by every participant's client
#[async_trait]
pub trait CallDirectory: Send + Sync {
    /// Creates a pending call with the creator as the only active participant
    async fn create(&self, call: CreateCall) -> Result<CallSession, Error>;

    /// Validates the edge and stamps `answered_at`/`ended_at`/`duration`
    async fn update_status(&self, call_id: &str, status: CallStatus) -> Result<CallSession, Error>;

    async fn update_active_participants(
        &self,
        call_id: &str,
        user_id: &str,
        name: &str,
        action: ParticipantAction,
    ) -> Result<CallSession, Error>;

    async fn update_screen_share_status(
        &self,
        call_id: &str,
        user_id: Option<&str>,
    ) -> Result<CallSession, Error>;

    async fn update_recording_status(
        &self,
        call_id: &str,
        is_recording: bool,
    ) -> Result<CallSession, Error>;

    /// Persists the recording and stores its url on the call, clearing `is_recording`
    async fn save_recording(&self, recording: RecordingRecord) -> Result<CallSession, Error>;

    /// Only the host may add participants
    async fn add_participant(
        &self,
        call_id: &str,
        participant: Participant,
        requester_id: &str,
    ) -> Result<CallSession, Error>;

    /// Only the host may remove participants, and never themselves
    async fn remove_participant(
        &self,
        call_id: &str,
        participant_id: &str,
        requester_id: &str,
    ) -> Result<CallSession, Error>;

    async fn get_by_id(&self, call_id: &str) -> Result<Option<CallSession>, Error>;

    /// The newest pending call `user_id` was invited to by someone else
    async fn incoming_call(&self, user_id: &str) -> Result<Option<CallSession>, Error>;

    async fn subscribe(&self, call_id: &str) -> Result<CallSnapshotStream, Error>;
}
