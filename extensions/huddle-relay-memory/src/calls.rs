use async_trait::async_trait;
use chrono::Utc;
use huddle::call::{
    CallDirectory, CallSession, CallSnapshotStream, CallStatus, CreateCall, Participant,
    ParticipantAction,
};
use huddle::error::Error;
use huddle::upload::RecordingRecord;

use crate::feed::Feed;
use crate::MemoryRelay;

impl MemoryRelay {
    fn call_feed(&self, call_id: &str) -> Result<Feed<Option<CallSession>>, Error> {
        self.inner
            .calls
            .read()
            .get(call_id)
            .cloned()
            .ok_or(Error::CallNotFound)
    }

    /// Applies `f` to an existing call and publishes the result to every subscriber
    fn mutate_call(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut CallSession) -> Result<(), Error>,
    ) -> Result<CallSession, Error> {
        self.call_feed(call_id)?.try_modify(|slot| match slot {
            Some(call) => {
                f(call)?;
                Ok(call.clone())
            }
            None => Err(Error::CallNotFound),
        })
    }

    /// Removes the call record. Subscribers observe `None`.
    pub fn delete_call(&self, call_id: &str) -> Result<(), Error> {
        self.call_feed(call_id)?.publish(None);
        Ok(())
    }

    pub fn recordings(&self) -> Vec<RecordingRecord> {
        self.inner.recordings.read().clone()
    }
}

#[async_trait]
impl CallDirectory for MemoryRelay {
    async fn create(&self, call: CreateCall) -> Result<CallSession, Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = CallSession::new(id.clone(), call, Utc::now())?;
        self.inner
            .calls
            .write()
            .insert(id, Feed::new(Some(session.clone())));
        log::debug!("call {} created by {}", session.id, session.created_by.id);
        Ok(session)
    }

    async fn update_status(&self, call_id: &str, status: CallStatus) -> Result<CallSession, Error> {
        self.mutate_call(call_id, |call| {
            call.apply_status(status, Utc::now())?;
            Ok(())
        })
    }

    async fn update_active_participants(
        &self,
        call_id: &str,
        user_id: &str,
        name: &str,
        action: ParticipantAction,
    ) -> Result<CallSession, Error> {
        log::debug!("{name} ({user_id}) {action} call {call_id}");
        self.mutate_call(call_id, |call| {
            match action {
                ParticipantAction::Join => {
                    call.join(user_id, Utc::now())?;
                }
                ParticipantAction::Leave => {
                    call.leave(user_id, Utc::now());
                }
            }
            Ok(())
        })
    }

    async fn update_screen_share_status(
        &self,
        call_id: &str,
        user_id: Option<&str>,
    ) -> Result<CallSession, Error> {
        self.mutate_call(call_id, |call| {
            call.set_screen_sharer(user_id.map(str::to_string), Utc::now());
            Ok(())
        })
    }

    async fn update_recording_status(
        &self,
        call_id: &str,
        is_recording: bool,
    ) -> Result<CallSession, Error> {
        self.mutate_call(call_id, |call| {
            call.set_recording(is_recording, Utc::now());
            Ok(())
        })
    }

    async fn save_recording(&self, recording: RecordingRecord) -> Result<CallSession, Error> {
        let url = recording.recording_url.clone();
        let call = self.mutate_call(&recording.call_id, |call| {
            call.recording_url = Some(url);
            call.set_recording(false, Utc::now());
            Ok(())
        })?;
        self.inner.recordings.write().push(recording);
        Ok(call)
    }

    async fn add_participant(
        &self,
        call_id: &str,
        participant: Participant,
        requester_id: &str,
    ) -> Result<CallSession, Error> {
        self.mutate_call(call_id, |call| {
            if !call.is_host(requester_id) {
                return Err(Error::NotCallHost);
            }
            call.add_participant(participant, Utc::now())
        })
    }

    async fn remove_participant(
        &self,
        call_id: &str,
        participant_id: &str,
        requester_id: &str,
    ) -> Result<CallSession, Error> {
        self.mutate_call(call_id, |call| {
            if !call.is_host(requester_id) {
                return Err(Error::NotCallHost);
            }
            if participant_id == requester_id {
                return Err(Error::OtherWithContext(
                    "the host cannot remove themselves".into(),
                ));
            }
            call.remove_participant(participant_id, Utc::now())
        })
    }

    async fn get_by_id(&self, call_id: &str) -> Result<Option<CallSession>, Error> {
        Ok(self
            .inner
            .calls
            .read()
            .get(call_id)
            .and_then(|feed| feed.get()))
    }

    async fn incoming_call(&self, user_id: &str) -> Result<Option<CallSession>, Error> {
        Ok(self
            .inner
            .calls
            .read()
            .values()
            .filter_map(|feed| feed.get())
            .filter(|call| {
                call.status == CallStatus::Pending
                    && call.is_participant(user_id)
                    && !call.is_host(user_id)
            })
            .max_by_key(|call| call.created_at))
    }

    async fn subscribe(&self, call_id: &str) -> Result<CallSnapshotStream, Error> {
        Ok(CallSnapshotStream(self.call_feed(call_id)?.subscribe()))
    }
}

#[cfg(test)]
mod test {
    use futures::StreamExt;
    use huddle::call::{
        CallDirectory, CallStatus, CallType, CreateCall, Participant, ParticipantAction,
    };
    use huddle::error::Error;
    use huddle::upload::RecordingRecord;

    use crate::MemoryRelay;

    fn create(host: &str, others: &[&str]) -> CreateCall {
        CreateCall {
            participants: others.iter().map(|id| Participant::new(*id, *id)).collect(),
            call_type: CallType::Video,
            created_by: Participant::new(host, host),
            chat_id: Some("chat".into()),
        }
    }

    #[tokio::test]
    async fn last_leave_leaves_no_active_participants() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let call = relay.create(create("a", &["b"])).await?;
        relay
            .update_active_participants(&call.id, "b", "b", ParticipantAction::Join)
            .await?;
        relay.update_status(&call.id, CallStatus::Answered).await?;

        let call = relay
            .update_active_participants(&call.id, "a", "a", ParticipantAction::Leave)
            .await?;
        assert_eq!(call.active_participant_ids, vec!["b"]);
        let call = relay
            .update_active_participants(&call.id, "b", "b", ParticipantAction::Leave)
            .await?;
        assert!(call.active_participant_ids.is_empty());

        let call = relay.update_status(&call.id, CallStatus::Ended).await?;
        assert!(call.duration.is_some());
        assert!(call.ended_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn invalid_status_edge_is_rejected() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let call = relay.create(create("a", &["b"])).await?;
        relay.update_status(&call.id, CallStatus::Missed).await?;
        let result = relay.update_status(&call.id, CallStatus::Answered).await;
        assert!(matches!(result, Err(Error::InvalidStatusTransition { .. })));
        let stored = relay.get_by_id(&call.id).await?.expect("call exists");
        assert_eq!(stored.status, CallStatus::Missed);
        Ok(())
    }

    #[tokio::test]
    async fn incoming_returns_newest_pending_invite() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let older = relay.create(create("a", &["c"])).await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = relay.create(create("b", &["c"])).await?;
        let own = relay.create(create("c", &["a"])).await?;

        let incoming = relay.incoming_call("c").await?.expect("an invite");
        assert_eq!(incoming.id, newer.id);
        assert_ne!(incoming.id, own.id);

        relay.update_status(&newer.id, CallStatus::Declined).await?;
        let incoming = relay.incoming_call("c").await?.expect("an invite");
        assert_eq!(incoming.id, older.id);
        Ok(())
    }

    #[tokio::test]
    async fn only_the_host_manages_the_roster() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let call = relay.create(create("a", &["b"])).await?;
        let result = relay
            .add_participant(&call.id, Participant::new("c", "c"), "b")
            .await;
        assert!(matches!(result, Err(Error::NotCallHost)));

        let call = relay
            .add_participant(&call.id, Participant::new("c", "c"), "a")
            .await?;
        assert!(call.is_participant("c"));

        relay
            .update_active_participants(&call.id, "c", "c", ParticipantAction::Join)
            .await?;
        let call = relay.remove_participant(&call.id, "c", "a").await?;
        assert!(!call.is_participant("c"));
        assert!(!call.is_active("c"));
        assert!(call.roster_is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn subscribers_see_every_change_then_deletion() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let call = relay.create(create("a", &["b"])).await?;
        let mut snapshots = relay.subscribe(&call.id).await?;
        relay.update_recording_status(&call.id, true).await?;
        relay.update_recording_status(&call.id, false).await?;
        relay.delete_call(&call.id)?;

        let flags = vec![
            snapshots.next().await.flatten().map(|c| c.is_recording),
            snapshots.next().await.flatten().map(|c| c.is_recording),
            snapshots.next().await.flatten().map(|c| c.is_recording),
        ];
        assert_eq!(flags, vec![Some(false), Some(true), Some(false)]);
        assert_eq!(snapshots.next().await, Some(None));
        Ok(())
    }

    #[tokio::test]
    async fn saving_a_recording_clears_the_flag() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let call = relay.create(create("a", &["b"])).await?;
        let call = relay.update_recording_status(&call.id, true).await?;
        let saved = relay
            .save_recording(RecordingRecord::for_call(&call, "memory://x"))
            .await?;
        assert!(!saved.is_recording);
        assert_eq!(saved.recording_url.as_deref(), Some("memory://x"));
        assert_eq!(relay.recordings().len(), 1);
        Ok(())
    }
}
