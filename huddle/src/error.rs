/// Errors shared by every huddle extension
use thiserror::Error;

use crate::call::CallStatus;

#[derive(Error, Debug)]
pub enum Error {
    //Call Errors
    #[error("Call not found")]
    CallNotFound,
    #[error("Call is not in progress")]
    CallNotInProgress,
    #[error("Call has already ended")]
    CallAlreadyEnded,
    #[error("User is not a participant of this call")]
    NotAParticipant,
    #[error("Only the host of the call can do this")]
    NotCallHost,
    #[error("User is already a participant of this call")]
    ParticipantAlreadyInCall,
    #[error("Call status cannot change from {from} to {to}")]
    InvalidStatusTransition { from: CallStatus, to: CallStatus },
    #[error("Call must include at least one participant besides the host")]
    EmptyRoster,

    //Signaling Errors
    #[error("Signaling session not found")]
    SignalingSessionNotFound,
    #[error("FailedToSendSignal: {_0}")]
    FailedToSendSignal(String),

    //Media Errors
    #[error("Could not access camera or microphone: {_0}")]
    MediaAcquisition(String),
    #[error("Local stream is not available")]
    LocalStreamUnavailable,
    #[error("Screen is already being shared by {user_id}")]
    ScreenShareInProgress { user_id: String },
    #[error("Screen is not being shared")]
    ScreenShareNotActive,
    #[error("Transport error: {_0}")]
    Transport(String),

    //Recording Errors
    #[error("Call is already being recorded")]
    RecordingInProgress,
    #[error("Call is not being recorded")]
    RecordingNotActive,
    #[error("Could not authorize upload: {_0}")]
    UploadAuthorization(String),
    #[error("Upload failed: {_0}")]
    Upload(String),
    #[error("Encoding error: {_0}")]
    Encoding(String),

    //Screen viewer Errors
    #[error("No screen share offer found. User may not be sharing their screen.")]
    ScreenOfferMissing,
    #[error("Screen sharing session has ended.")]
    ScreenSessionEnded,
    #[error("Connection timeout. Please try again.")]
    ConnectionTimeout,
    #[error("Connection failed after multiple attempts.")]
    RetriesExhausted,

    //Misc
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    OtherWithContext(String),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error("Functionality is not yet implemented")]
    Unimplemented,
    #[error("An unknown error has occurred")]
    Other,
}

impl Error {
    pub fn permission_denied(device: &str) -> Self {
        Error::MediaAcquisition(format!("permission to use the {device} was denied"))
    }

    pub fn device_missing(device: &str) -> Self {
        Error::MediaAcquisition(format!("no {device} is available"))
    }

    /// Errors that the caller should surface to the user as opposed to logging.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::MediaAcquisition(_)
                | Error::LocalStreamUnavailable
                | Error::ScreenShareInProgress { .. }
                | Error::UploadAuthorization(_)
                | Error::Upload(_)
                | Error::ScreenOfferMissing
                | Error::ScreenSessionEnded
                | Error::ConnectionTimeout
                | Error::RetriesExhausted
        )
    }
}
