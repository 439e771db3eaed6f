use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::CallSession;
use crate::error::Error;

/// Short-lived credentials for one direct upload to the media host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAuthorization {
    pub signature: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file: Bytes,
    pub mime_type: String,
    pub folder: String,
    pub signature: String,
    pub timestamp: i64,
}

impl UploadRequest {
    pub fn new(
        file: Bytes,
        mime_type: impl Into<String>,
        folder: impl Into<String>,
        authorization: UploadAuthorization,
    ) -> Self {
        Self {
            file,
            mime_type: mime_type.into(),
            folder: folder.into(),
            signature: authorization.signature,
            timestamp: authorization.timestamp,
        }
    }
}

#[async_trait]
pub trait UploadAuthority: Send + Sync {
    async fn get_upload_authorization(&self) -> Result<UploadAuthorization, Error>;
}

#[async_trait]
pub trait MediaHost: Send + Sync {
    /// Uploads the file and returns its durable url
    async fn upload(&self, request: UploadRequest) -> Result<String, Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingParticipant {
    pub id: String,
    pub name: String,
}

/// A finished composite recording of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRecord {
    pub call_id: String,
    pub recording_url: String,
    pub participants: Vec<RecordingParticipant>,
    pub participant_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl RecordingRecord {
    pub fn for_call(call: &CallSession, recording_url: impl Into<String>) -> Self {
        let participants = call
            .participants
            .iter()
            .map(|p| RecordingParticipant {
                id: p.id.clone(),
                name: p.name.clone(),
            })
            .collect::<Vec<_>>();
        Self {
            call_id: call.id.clone(),
            recording_url: recording_url.into(),
            participant_ids: participants.iter().map(|p| p.id.clone()).collect(),
            participants,
            created_at: Utc::now(),
        }
    }
}
