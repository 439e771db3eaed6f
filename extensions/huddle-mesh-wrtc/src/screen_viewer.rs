//! Watching someone's screen outside of a call.
//!
//! The sharer publishes a screen session holding an offer. A [`ScreenViewer`] answers
//! it over a receive-only transport, trickles candidates through the session store
//! and exposes the received stream. Lost connections are retried with a capped
//! exponential backoff. The viewer stops for good once the session is no longer active.

use std::sync::Arc;

use derive_more::Display;
use futures::StreamExt;
use huddle::error::Error;
use huddle::media::MediaStream;
use huddle::signaling::screen::{ScreenRole, ScreenSession, ScreenSessionStore, ScreenSessionStream};
use huddle::signaling::{SdpType, SessionDescription};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{Config, ViewerConfig};
use crate::transport::{
    ConnectionState, NewTransport, PeerTransport, TransportConfig, TransportEvent,
    TransportEventStream, TransportFactory,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    /// `attempt` counts retries since the last successful connection
    #[display(fmt = "connecting (attempt {})", attempt)]
    Connecting { attempt: u32 },
    #[display(fmt = "connected")]
    Connected,
    /// The sharer stopped sharing
    #[display(fmt = "ended")]
    Ended,
    /// The viewer was closed locally
    #[display(fmt = "closed")]
    Closed,
    #[display(fmt = "timed out")]
    TimedOut,
    #[display(fmt = "retries exhausted")]
    RetriesExhausted,
    #[display(fmt = "failed")]
    Failed,
}

impl ViewerState {
    pub fn is_final(&self) -> bool {
        !matches!(self, ViewerState::Connecting { .. } | ViewerState::Connected)
    }

    fn into_error(self) -> Error {
        match self {
            ViewerState::Ended => Error::ScreenSessionEnded,
            ViewerState::TimedOut => Error::ConnectionTimeout,
            ViewerState::RetriesExhausted => Error::RetriesExhausted,
            ViewerState::Closed => Error::OtherWithContext("screen viewer was closed".into()),
            _ => Error::Transport("could not connect to the screen share".into()),
        }
    }
}

pub struct ScreenViewer {
    session_id: String,
    state: watch::Receiver<ViewerState>,
    stream: watch::Receiver<Option<MediaStream>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ScreenViewer {
    /// Resolves once the screen share is connected. Fails right away when the
    /// session has no offer or is no longer active.
    pub async fn connect(
        session_id: &str,
        store: Arc<dyn ScreenSessionStore>,
        factory: Arc<dyn TransportFactory>,
        config: &Config,
    ) -> Result<Self, Error> {
        offer_of(store.read_screen_session(session_id).await?)?;

        let (state_tx, mut state) = watch::channel(ViewerState::Connecting { attempt: 0 });
        let (stream_tx, stream) = watch::channel(None);
        let (stop, stopped) = oneshot::channel();

        let driver = ViewerDriver {
            session_id: session_id.to_string(),
            store,
            factory,
            transport_config: config.viewer_transport(),
            config: config.viewer.clone(),
            state: state_tx,
            stream: stream_tx,
        };
        let task = tokio::spawn(driver.run(stopped));

        let reached = state
            .wait_for(|s| !matches!(s, ViewerState::Connecting { .. }))
            .await
            .map(|s| *s)
            .unwrap_or(ViewerState::Failed);

        let viewer = Self {
            session_id: session_id.to_string(),
            state,
            stream,
            stop: Some(stop),
            task: Some(task),
        };
        match reached {
            ViewerState::Connected => Ok(viewer),
            other => Err(other.into_error()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ViewerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ViewerState> {
        self.state.clone()
    }

    /// The sharer's screen, once its tracks arrived
    pub fn stream(&self) -> Option<MediaStream> {
        self.stream.borrow().clone()
    }

    pub fn subscribe_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.stream.clone()
    }

    /// Closes the transport and stops following the session
    pub async fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ScreenViewer {
    fn drop(&mut self) {
        // the driver closes its transport when the stop channel goes away
        self.stop.take();
    }
}

fn offer_of(session: Option<ScreenSession>) -> Result<SessionDescription, Error> {
    let session = session.ok_or(Error::ScreenOfferMissing)?;
    if !session.is_active() {
        return Err(Error::ScreenSessionEnded);
    }
    session
        .offer
        .filter(|offer| offer.kind == SdpType::Offer)
        .ok_or(Error::ScreenOfferMissing)
}

enum Outcome {
    Closed,
    SessionEnded,
    TimedOut,
    /// The connection dropped or never came up
    Lost { was_connected: bool },
    Failed(Error),
}

struct ViewerDriver {
    session_id: String,
    store: Arc<dyn ScreenSessionStore>,
    factory: Arc<dyn TransportFactory>,
    transport_config: TransportConfig,
    config: ViewerConfig,
    state: watch::Sender<ViewerState>,
    stream: watch::Sender<Option<MediaStream>>,
}

impl ViewerDriver {
    async fn run(self, mut stop: oneshot::Receiver<()>) {
        let mut session = match self.store.subscribe_screen_session(&self.session_id).await {
            Ok(session) => session,
            Err(e) => {
                log::error!("cannot follow screen session {}: {e}", self.session_id);
                self.state.send_replace(ViewerState::Failed);
                return;
            }
        };

        let mut attempt = 0;
        let last = loop {
            self.state.send_replace(ViewerState::Connecting { attempt });
            match self.attempt(&mut session, &mut stop).await {
                Outcome::Closed => break ViewerState::Closed,
                Outcome::SessionEnded => break ViewerState::Ended,
                Outcome::TimedOut => break ViewerState::TimedOut,
                Outcome::Failed(e) => {
                    log::error!("screen viewer for {} failed: {e}", self.session_id);
                    break match e {
                        Error::ScreenSessionEnded => ViewerState::Ended,
                        _ => ViewerState::Failed,
                    };
                }
                Outcome::Lost { was_connected } => {
                    if was_connected {
                        attempt = 0;
                    }
                    if attempt >= self.config.max_retries {
                        break ViewerState::RetriesExhausted;
                    }
                    let delay = self.config.backoff(attempt);
                    attempt += 1;
                    log::info!(
                        "screen share {} lost, retry {attempt} in {}ms",
                        self.session_id,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = &mut stop => break ViewerState::Closed,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };
        log::debug!("screen viewer for {} finished: {last}", self.session_id);
        self.state.send_replace(last);
    }

    /// One transport, from answering the offer until it is closed
    async fn attempt(
        &self,
        session: &mut ScreenSessionStream,
        stop: &mut oneshot::Receiver<()>,
    ) -> Outcome {
        let offer = match self.store.read_screen_session(&self.session_id).await {
            Ok(current) => match offer_of(current) {
                Ok(offer) => offer,
                Err(e) => return Outcome::Failed(e),
            },
            Err(e) => return Outcome::Failed(e),
        };
        let NewTransport {
            transport,
            mut events,
        } = match self.factory.create(&self.transport_config).await {
            Ok(created) => created,
            Err(e) => return Outcome::Failed(e),
        };

        let outcome = self
            .watch(transport.as_ref(), &mut events, offer, session, stop)
            .await;

        if let Err(e) = transport.close().await {
            log::warn!("failed to close screen transport: {e}");
        }
        self.stream.send_replace(None);
        outcome
    }

    async fn watch(
        &self,
        transport: &dyn PeerTransport,
        events: &mut TransportEventStream,
        offer: SessionDescription,
        session: &mut ScreenSessionStream,
        stop: &mut oneshot::Receiver<()>,
    ) -> Outcome {
        let mut caller = match self
            .store
            .subscribe_screen_candidates(&self.session_id, ScreenRole::Caller)
            .await
        {
            Ok(stream) => stream,
            Err(e) => return Outcome::Failed(e),
        };
        if let Err(e) = self.answer(transport, offer).await {
            log::warn!("failed to answer screen share {}: {e}", self.session_id);
            return Outcome::Lost {
                was_connected: false,
            };
        }

        let deadline = tokio::time::sleep(self.config.connect_timeout());
        tokio::pin!(deadline);
        let mut connected = false;
        let mut candidates_open = true;

        loop {
            tokio::select! {
                _ = &mut *stop => return Outcome::Closed,
                _ = &mut deadline, if !connected => return Outcome::TimedOut,
                snapshot = session.next() => match snapshot {
                    Some(Some(current)) if current.is_active() => {}
                    _ => return Outcome::SessionEnded,
                },
                candidate = caller.next(), if candidates_open => match candidate {
                    Some(candidate) => {
                        if let Err(e) = transport.add_ice_candidate(candidate).await {
                            log::warn!("failed to apply sharer candidate: {e}");
                        }
                    }
                    None => candidates_open = false,
                },
                event = events.next() => {
                    let Some(event) = event else {
                        return Outcome::Lost { was_connected: connected };
                    };
                    match event {
                        TransportEvent::LocalCandidate(candidate) => {
                            if let Err(e) = self
                                .store
                                .append_screen_candidate(&self.session_id, ScreenRole::Callee, candidate)
                                .await
                            {
                                log::warn!("failed to send viewer candidate: {e}");
                            }
                        }
                        TransportEvent::RemoteTrack { stream_id, track } => {
                            self.stream.send_modify(|current| {
                                if current.as_ref().map(|s| s.id()) != Some(stream_id.as_str()) {
                                    *current = Some(MediaStream::new(stream_id.as_str()));
                                }
                                if let Some(stream) = current.as_mut() {
                                    stream.add_track(track);
                                }
                            });
                        }
                        TransportEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                            log::info!("watching screen share {}", self.session_id);
                            connected = true;
                            self.state.send_replace(ViewerState::Connected);
                        }
                        TransportEvent::ConnectionStateChanged(
                            state @ (ConnectionState::Failed | ConnectionState::Disconnected),
                        ) => {
                            log::warn!("screen share {} connection {state}", self.session_id);
                            return Outcome::Lost { was_connected: connected };
                        }
                        TransportEvent::ConnectionStateChanged(_) => {}
                        TransportEvent::IceFailed => {
                            if let Err(e) = transport.restart_ice().await {
                                log::warn!("failed to restart ice: {e}");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn answer(&self, transport: &dyn PeerTransport, offer: SessionDescription) -> Result<(), Error> {
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.store
            .write_viewer_answer(&self.session_id, answer)
            .await
    }
}
