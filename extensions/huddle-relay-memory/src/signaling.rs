use async_trait::async_trait;
use huddle::error::Error;
use huddle::signaling::screen::{
    ScreenRole, ScreenSession, ScreenSessionStatus, ScreenSessionStore, ScreenSessionStream,
};
use huddle::signaling::{
    CandidateSide, CandidateStream, IceCandidate, SessionDescription, SessionKey, SignalMessage,
    SignalingRecord, SignalingRecordStream, SignalingStore,
};

use crate::feed::{AppendLog, Feed};
use crate::MemoryRelay;

#[derive(Clone, Default)]
pub(crate) struct SessionSlot {
    record: Feed<Option<SignalingRecord>>,
    peer1: AppendLog<IceCandidate>,
    peer2: AppendLog<IceCandidate>,
    writes: Feed<usize>,
}

impl SessionSlot {
    fn candidates(&self, side: CandidateSide) -> &AppendLog<IceCandidate> {
        match side {
            CandidateSide::Peer1 => &self.peer1,
            CandidateSide::Peer2 => &self.peer2,
        }
    }

    fn clear(&self) {
        self.record.publish(None);
        self.peer1.clear();
        self.peer2.clear();
    }

    fn is_watched(&self) -> bool {
        self.record.subscriber_count() + self.peer1.subscriber_count() + self.peer2.subscriber_count()
            > 0
    }
}

#[derive(Clone, Default)]
pub(crate) struct ScreenSlot {
    session: Feed<Option<ScreenSession>>,
    caller: AppendLog<IceCandidate>,
    callee: AppendLog<IceCandidate>,
}

impl ScreenSlot {
    fn candidates(&self, role: ScreenRole) -> &AppendLog<IceCandidate> {
        match role {
            ScreenRole::Caller => &self.caller,
            ScreenRole::Callee => &self.callee,
        }
    }
}

impl MemoryRelay {
    /// Slot for writes and subscriptions, created on first use
    pub(crate) fn session_slot(&self, key: &SessionKey) -> SessionSlot {
        if let Some(slot) = self.inner.sessions.read().get(key) {
            return slot.clone();
        }
        self.inner
            .sessions
            .write()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, key: &SessionKey) -> Option<SessionSlot> {
        self.inner.sessions.read().get(key).cloned()
    }

    /// Clears the slots matching `filter`. A cleared slot stays while someone is
    /// subscribed to it so they see the pair renegotiate under the same key.
    fn clear_slots(&self, filter: impl Fn(&SessionKey) -> bool) {
        self.inner.sessions.write().retain(|key, slot| {
            if !filter(key) {
                return true;
            }
            slot.clear();
            slot.is_watched()
        });
    }

    /// Number of pair slots held, cleared ones included
    pub fn session_slot_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    fn screen_slot(&self, session_id: &str) -> Option<ScreenSlot> {
        self.inner.screens.read().get(session_id).cloned()
    }

    /// Number of offer and answer writes made to the record of `key`
    pub fn signal_writes(&self, key: &SessionKey) -> usize {
        self.existing_slot(key).map_or(0, |slot| slot.writes.get())
    }

    /// Number of candidates currently stored on `side` of `key`
    pub fn candidate_count(&self, key: &SessionKey, side: CandidateSide) -> usize {
        self.existing_slot(key)
            .map_or(0, |slot| slot.candidates(side).len())
    }

    /// Starts a screen share session for `sharer_id` and returns its id
    pub fn publish_screen_session(&self, sharer_id: &str, offer: SessionDescription) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let slot = ScreenSlot::default();
        slot.session.publish(Some(ScreenSession {
            id: id.clone(),
            sharer_id: sharer_id.to_string(),
            status: ScreenSessionStatus::Active,
            offer: Some(offer),
            answer: None,
        }));
        self.inner.screens.write().insert(id.clone(), slot);
        id
    }

    pub fn end_screen_session(&self, session_id: &str) -> Result<(), Error> {
        let slot = self
            .screen_slot(session_id)
            .ok_or(Error::SignalingSessionNotFound)?;
        slot.session.try_modify(|session| match session {
            Some(session) => {
                session.status = ScreenSessionStatus::Ended;
                Ok(())
            }
            None => Err(Error::SignalingSessionNotFound),
        })
    }

    pub fn append_sharer_candidate(
        &self,
        session_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), Error> {
        let slot = self
            .screen_slot(session_id)
            .ok_or(Error::SignalingSessionNotFound)?;
        slot.caller.append(candidate);
        Ok(())
    }

    pub fn screen_candidates(&self, session_id: &str, role: ScreenRole) -> Vec<IceCandidate> {
        self.screen_slot(session_id)
            .map(|slot| slot.candidates(role).since(0))
            .unwrap_or_default()
    }
}

#[async_trait]
impl SignalingStore for MemoryRelay {
    async fn upsert_offer(&self, key: &SessionKey, offer: SignalMessage) -> Result<(), Error> {
        let slot = self.session_slot(key);
        slot.record.try_modify(|record| -> Result<(), Error> {
            record.get_or_insert_with(SignalingRecord::default).offer = Some(offer);
            Ok(())
        })?;
        slot.writes.try_modify(|n| -> Result<(), Error> {
            *n += 1;
            Ok(())
        })?;
        log::trace!("offer written to {key}");
        Ok(())
    }

    async fn upsert_answer(&self, key: &SessionKey, answer: SignalMessage) -> Result<(), Error> {
        let slot = self.session_slot(key);
        slot.record.try_modify(|record| -> Result<(), Error> {
            record.get_or_insert_with(SignalingRecord::default).answer = Some(answer);
            Ok(())
        })?;
        slot.writes.try_modify(|n| -> Result<(), Error> {
            *n += 1;
            Ok(())
        })?;
        log::trace!("answer written to {key}");
        Ok(())
    }

    async fn append_candidate(
        &self,
        key: &SessionKey,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), Error> {
        self.session_slot(key).candidates(side).append(candidate);
        Ok(())
    }

    async fn read_session(&self, key: &SessionKey) -> Result<Option<SignalingRecord>, Error> {
        Ok(self.existing_slot(key).and_then(|slot| slot.record.get()))
    }

    async fn list_candidates(
        &self,
        key: &SessionKey,
        side: CandidateSide,
        since: usize,
    ) -> Result<Vec<IceCandidate>, Error> {
        Ok(self
            .existing_slot(key)
            .map(|slot| slot.candidates(side).since(since))
            .unwrap_or_default())
    }

    async fn subscribe(&self, key: &SessionKey) -> Result<SignalingRecordStream, Error> {
        Ok(SignalingRecordStream(self.session_slot(key).record.subscribe()))
    }

    async fn subscribe_candidates(
        &self,
        key: &SessionKey,
        side: CandidateSide,
    ) -> Result<CandidateStream, Error> {
        Ok(CandidateStream(
            self.session_slot(key).candidates(side).subscribe(),
        ))
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<(), Error> {
        self.clear_slots(|k| k == key);
        Ok(())
    }

    async fn delete_call_sessions(&self, call_id: &str) -> Result<(), Error> {
        self.clear_slots(|key| key.call_id() == call_id);
        Ok(())
    }
}

#[async_trait]
impl ScreenSessionStore for MemoryRelay {
    async fn read_screen_session(&self, session_id: &str) -> Result<Option<ScreenSession>, Error> {
        Ok(self.screen_slot(session_id).and_then(|slot| slot.session.get()))
    }

    async fn write_viewer_answer(
        &self,
        session_id: &str,
        answer: SessionDescription,
    ) -> Result<(), Error> {
        let slot = self
            .screen_slot(session_id)
            .ok_or(Error::SignalingSessionNotFound)?;
        slot.session.try_modify(|session| match session {
            Some(session) => {
                session.answer = Some(answer);
                Ok(())
            }
            None => Err(Error::SignalingSessionNotFound),
        })
    }

    async fn append_screen_candidate(
        &self,
        session_id: &str,
        role: ScreenRole,
        candidate: IceCandidate,
    ) -> Result<(), Error> {
        let slot = self
            .screen_slot(session_id)
            .ok_or(Error::SignalingSessionNotFound)?;
        slot.candidates(role).append(candidate);
        Ok(())
    }

    async fn subscribe_screen_candidates(
        &self,
        session_id: &str,
        role: ScreenRole,
    ) -> Result<CandidateStream, Error> {
        let slot = self
            .screen_slot(session_id)
            .ok_or(Error::SignalingSessionNotFound)?;
        Ok(CandidateStream(slot.candidates(role).subscribe()))
    }

    async fn subscribe_screen_session(&self, session_id: &str) -> Result<ScreenSessionStream, Error> {
        let slot = self
            .screen_slot(session_id)
            .ok_or(Error::SignalingSessionNotFound)?;
        Ok(ScreenSessionStream(slot.session.subscribe()))
    }
}

#[cfg(test)]
mod test {
    use futures::StreamExt;
    use huddle::signaling::{
        CandidateSide, IceCandidate, SessionDescription, SessionKey, SignalMessage,
        SignalingStore,
    };

    use crate::MemoryRelay;

    fn offer(from: &str) -> SignalMessage {
        SignalMessage {
            from: from.into(),
            sdp: SessionDescription::offer("v=0"),
        }
    }

    #[tokio::test]
    async fn offer_and_answer_merge_into_one_record() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let key = SessionKey::new("call", "a", "b");
        assert!(relay.read_session(&key).await?.is_none());

        relay.upsert_offer(&key, offer("a")).await?;
        relay
            .upsert_answer(
                &key,
                SignalMessage {
                    from: "b".into(),
                    sdp: SessionDescription::answer("v=0"),
                },
            )
            .await?;

        let record = relay.read_session(&key).await?.expect("record exists");
        assert_eq!(record.offer.map(|o| o.from).as_deref(), Some("a"));
        assert_eq!(record.answer.map(|a| a.from).as_deref(), Some("b"));
        assert_eq!(relay.signal_writes(&key), 2);
        Ok(())
    }

    #[tokio::test]
    async fn subscription_starts_with_current_record() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let key = SessionKey::new("call", "a", "b");
        relay.upsert_offer(&key, offer("a")).await?;

        let mut records = relay.subscribe(&key).await?;
        let first = records.next().await.flatten().expect("current record");
        assert!(first.offer.is_some());

        relay.delete_session(&key).await?;
        assert_eq!(records.next().await, Some(None));
        Ok(())
    }

    #[tokio::test]
    async fn candidate_sides_are_independent() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let key = SessionKey::new("call", "a", "b");
        relay
            .append_candidate(&key, CandidateSide::Peer1, IceCandidate::new("c1"))
            .await?;
        let mut peer1 = relay.subscribe_candidates(&key, CandidateSide::Peer1).await?;
        relay
            .append_candidate(&key, CandidateSide::Peer2, IceCandidate::new("x"))
            .await?;
        relay
            .append_candidate(&key, CandidateSide::Peer1, IceCandidate::new("c2"))
            .await?;

        assert_eq!(peer1.next().await.map(|c| c.candidate).as_deref(), Some("c1"));
        assert_eq!(peer1.next().await.map(|c| c.candidate).as_deref(), Some("c2"));
        assert_eq!(
            relay
                .list_candidates(&key, CandidateSide::Peer2, 0)
                .await?
                .len(),
            1
        );
        assert_eq!(
            relay
                .list_candidates(&key, CandidateSide::Peer1, 1)
                .await?
                .len(),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn deleting_a_call_clears_only_its_pairs() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let ours = SessionKey::new("call", "a", "b");
        let theirs = SessionKey::new("other", "a", "b");
        relay.upsert_offer(&ours, offer("a")).await?;
        relay.upsert_offer(&theirs, offer("a")).await?;
        relay
            .append_candidate(&ours, CandidateSide::Peer1, IceCandidate::new("c1"))
            .await?;

        relay.delete_call_sessions("call").await?;
        assert!(relay.read_session(&ours).await?.is_none());
        assert_eq!(relay.candidate_count(&ours, CandidateSide::Peer1), 0);
        assert!(relay.read_session(&theirs).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn reads_do_not_create_slots() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let key = SessionKey::new("call", "a", "b");
        assert!(relay.read_session(&key).await?.is_none());
        assert!(relay
            .list_candidates(&key, CandidateSide::Peer1, 0)
            .await?
            .is_empty());
        assert_eq!(relay.signal_writes(&key), 0);
        assert_eq!(relay.candidate_count(&key, CandidateSide::Peer2), 0);
        assert_eq!(relay.session_slot_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn deleted_slots_are_dropped_unless_watched() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let watched = SessionKey::new("call", "a", "b");
        let idle = SessionKey::new("call", "a", "c");
        relay.upsert_offer(&watched, offer("a")).await?;
        relay.upsert_offer(&idle, offer("a")).await?;
        let mut records = relay.subscribe(&watched).await?;
        assert!(records.next().await.flatten().is_some());

        relay.delete_call_sessions("call").await?;
        assert_eq!(relay.session_slot_count(), 1);
        assert_eq!(records.next().await, Some(None));

        relay.upsert_offer(&watched, offer("b")).await?;
        let renewed = records.next().await.flatten().expect("renegotiated record");
        assert_eq!(renewed.offer.map(|o| o.from).as_deref(), Some("b"));

        drop(records);
        relay.delete_session(&watched).await?;
        assert_eq!(relay.session_slot_count(), 0);
        Ok(())
    }
}
