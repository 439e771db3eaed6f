use std::sync::Arc;

use huddle::call::{
    CallDirectory, CallSession, CallStatus, IncomingCallEvent, IncomingCallEventStream,
    Participant,
};
use huddle::error::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{Config, IncomingConfig};
use crate::synchronizer::{CallController, CallServices};

/// Polls the directory for the newest call waiting for `user_id` to pick up.
///
/// A new call id emits [`IncomingCallEvent::Ringing`], and the call going away
/// (answered, declined, missed or deleted) emits [`IncomingCallEvent::Cleared`].
/// Polling stops on [`IncomingCallWatcher::cancel`] or when the watcher is dropped.
pub struct IncomingCallWatcher {
    user_id: String,
    directory: Arc<dyn CallDirectory>,
    current: watch::Receiver<Option<CallSession>>,
    events: broadcast::Sender<IncomingCallEvent>,
    task: Option<JoinHandle<()>>,
}

impl IncomingCallWatcher {
    pub fn spawn(user_id: &str, directory: Arc<dyn CallDirectory>, config: &IncomingConfig) -> Self {
        let (current_tx, current) = watch::channel(None);
        let (events, _) = broadcast::channel(64);
        let task = tokio::spawn(poll(
            user_id.to_string(),
            directory.clone(),
            config.clone(),
            current_tx,
            events.clone(),
        ));
        Self {
            user_id: user_id.to_string(),
            directory,
            current,
            events,
            task: Some(task),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The call currently ringing, if any
    pub fn current(&self) -> Option<CallSession> {
        self.current.borrow().clone()
    }

    pub fn subscribe_current(&self) -> watch::Receiver<Option<CallSession>> {
        self.current.clone()
    }

    pub fn subscribe(&self) -> IncomingCallEventStream {
        let mut rx = self.events.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        IncomingCallEventStream(Box::pin(stream))
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Answers `call_id` and joins it as `local`
    pub async fn accept(
        &self,
        call_id: &str,
        local: Participant,
        services: CallServices,
        config: Config,
    ) -> Result<CallController, Error> {
        self.directory
            .update_status(call_id, CallStatus::Answered)
            .await?;
        let controller = CallController::new(call_id, local, services, config);
        controller.join().await?;
        Ok(controller)
    }

    pub async fn decline(&self, call_id: &str) -> Result<CallSession, Error> {
        self.directory
            .update_status(call_id, CallStatus::Declined)
            .await
    }
}

impl Drop for IncomingCallWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn poll(
    user_id: String,
    directory: Arc<dyn CallDirectory>,
    config: IncomingConfig,
    current: watch::Sender<Option<CallSession>>,
    events: broadcast::Sender<IncomingCallEvent>,
) {
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let found = match directory.incoming_call(&user_id).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("failed to check incoming calls for {user_id}: {e}");
                continue;
            }
        };

        let previous = current.borrow().as_ref().map(|c| c.id.clone());
        let event = match (&previous, &found) {
            (Some(old), Some(new)) if *old == new.id => None,
            (_, Some(new)) => Some(IncomingCallEvent::Ringing(new.clone())),
            (Some(_), None) => Some(IncomingCallEvent::Cleared),
            (None, None) => None,
        };
        current.send_replace(found);
        if let Some(event) = event {
            log::debug!("incoming call for {user_id}: {event}");
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use huddle::call::{CallDirectory, CallStatus, CallType, CreateCall, IncomingCallEvent, Participant};
    use huddle_relay_memory::MemoryRelay;

    use crate::config::IncomingConfig;

    use super::IncomingCallWatcher;

    fn fast() -> IncomingConfig {
        IncomingConfig {
            poll_interval_ms: 10,
        }
    }

    #[tokio::test]
    async fn rings_then_clears_after_decline() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let watcher = IncomingCallWatcher::spawn("b", Arc::new(relay.clone()), &fast());
        let mut events = watcher.subscribe();

        let call = relay
            .create(CreateCall {
                participants: vec![Participant::new("b", "Bea")],
                call_type: CallType::Audio,
                created_by: Participant::new("a", "Ada"),
                chat_id: None,
            })
            .await?;

        let ringing = tokio::time::timeout(Duration::from_secs(1), events.next()).await?;
        assert_eq!(ringing, Some(IncomingCallEvent::Ringing(call.clone())));
        assert_eq!(watcher.current().map(|c| c.id), Some(call.id.clone()));

        let declined = watcher.decline(&call.id).await?;
        assert_eq!(declined.status, CallStatus::Declined);
        let cleared = tokio::time::timeout(Duration::from_secs(1), events.next()).await?;
        assert_eq!(cleared, Some(IncomingCallEvent::Cleared));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_stops_polling() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let mut watcher = IncomingCallWatcher::spawn("b", Arc::new(relay.clone()), &fast());
        assert!(watcher.is_running());
        watcher.cancel();
        tokio::task::yield_now().await;
        assert!(!watcher.is_running());

        relay
            .create(CreateCall {
                participants: vec![Participant::new("b", "Bea")],
                call_type: CallType::Audio,
                created_by: Participant::new("a", "Ada"),
                chat_id: None,
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watcher.current().is_none());
        Ok(())
    }
}
