use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::{CallSession, CallStatus};

/// Why the local participant is no longer in the call
#[derive(Debug, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// The local participant left, the call may go on without them
    #[display(fmt = "left")]
    Left,
    /// The local participant ended the call for everyone
    #[display(fmt = "ended for everyone")]
    EndedForAll,
    /// The call reached a terminal status
    #[display(fmt = "call {}", _0)]
    CallFinished(CallStatus),
    /// The call record no longer exists
    #[display(fmt = "call deleted")]
    CallDeleted,
    #[display(fmt = "removed by host")]
    RemovedByHost,
    /// Local capture could not be opened
    #[display(fmt = "media error")]
    MediaError,
}

/// Drives the UI of one call
#[derive(Debug, Display, Clone, PartialEq)]
pub enum CallEvent {
    /// Local media is up and the local participant is in the active set
    #[display(fmt = "joined {}", call_id)]
    Joined { call_id: String },
    #[display(fmt = "status changed to {}", status)]
    StatusChanged { status: CallStatus },
    #[display(fmt = "roster changed")]
    RosterChanged {
        participant_ids: Vec<String>,
        active_participant_ids: Vec<String>,
    },
    /// The screen share control should be disabled while `blocked` is set
    #[display(fmt = "screen share changed")]
    ScreenShareChanged {
        sharer_id: Option<String>,
        blocked: bool,
    },
    /// The local screen capture ended and sharing was stopped
    #[display(fmt = "screen share ended")]
    ScreenShareEnded,
    #[display(fmt = "recording started")]
    RecordingStarted,
    #[display(fmt = "recording saved to {}", url)]
    RecordingSaved { url: String },
    #[display(fmt = "recording failed: {}", message)]
    RecordingFailed { message: String },
    #[display(fmt = "active speaker changed")]
    ActiveSpeakerChanged { participant_id: Option<String> },
    /// More participants than the mesh supports. `skipped` are not linked.
    #[display(fmt = "mesh limit of {} exceeded", limit)]
    MeshLimitExceeded { limit: usize, skipped: Vec<String> },
    #[display(fmt = "{}", message)]
    MediaError { message: String },
    #[display(fmt = "{}", message)]
    RemovedByHost { message: String },
    /// Always the last event of a call
    #[display(fmt = "left: {}", reason)]
    Left { reason: LeaveReason },
}

impl CallEvent {
    pub fn removed_by_host() -> Self {
        CallEvent::RemovedByHost {
            message: "You have been removed from the call by the host.".into(),
        }
    }

    pub fn media_error() -> Self {
        CallEvent::MediaError {
            message: "Could not access camera or microphone. Please check permissions.".into(),
        }
    }
}

pub struct CallEventStream(pub BoxStream<'static, CallEvent>);

impl core::ops::Deref for CallEventStream {
    type Target = BoxStream<'static, CallEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for CallEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Changes of the newest call waiting for the local user to answer
#[derive(Debug, Display, Clone, PartialEq)]
pub enum IncomingCallEvent {
    #[display(fmt = "ringing {}", "_0.id")]
    Ringing(CallSession),
    #[display(fmt = "cleared")]
    Cleared,
}

pub struct IncomingCallEventStream(pub BoxStream<'static, IncomingCallEvent>);

impl core::ops::Deref for IncomingCallEventStream {
    type Target = BoxStream<'static, IncomingCallEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for IncomingCallEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
