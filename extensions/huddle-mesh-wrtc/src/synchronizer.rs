//! Keeps the local side of one call in line with the shared call record.
//!
//! [`CallController`] is a handle to an actor task. The actor owns the local media,
//! the peer links and the recorder, and is the only thing that reacts to call
//! snapshots. Every snapshot is checked, in order, for:
//!
//! - the record being deleted, or the local participant being dropped from the roster
//! - status, roster, recording and screen share changes, reported as [`CallEvent`]s
//! - a terminal status, which ends the local session
//! - the first `Answered` status, which opens local media if that has not happened yet
//!
//! and then the links are reconciled against the roster. Ending the local session
//! happens exactly once, whatever triggers it, and `Left` is the last event sent.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::StreamExt;
use huddle::call::{
    CallDirectory, CallEvent, CallEventStream, CallSession, CallSnapshotStream, CallStatus,
    CallType, LeaveReason, Participant, ParticipantAction,
};
use huddle::error::Error;
use huddle::media::{MediaDevices, MediaStream, MediaTrack};
use huddle::signaling::{SessionKey, SignalingStore};
use huddle::upload::{MediaHost, UploadAuthority};
use tokio::sync::{
    broadcast,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch, Notify,
};

use crate::active_speaker::ActiveSpeakerDetector;
use crate::config::{Config, MediaAcquisition};
use crate::link_manager::LinkManager;
use crate::media::LocalMedia;
use crate::notify_wrapper::NotifyWrapper;
use crate::recorder::{self, CompositeRecorder};
use crate::remote_streams::RemoteStreams;
use crate::transport::TransportFactory;

/// Everything outside the process a call talks to
#[derive(Clone)]
pub struct CallServices {
    pub directory: Arc<dyn CallDirectory>,
    pub signaling: Arc<dyn SignalingStore>,
    pub uploads: Arc<dyn UploadAuthority>,
    pub host: Arc<dyn MediaHost>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaState {
    pub audio_on: bool,
    pub camera_on: bool,
    pub screen_sharing: bool,
    pub recording: bool,
    /// Starting a screen share would be refused
    pub screen_share_blocked: bool,
}

enum Cmd {
    Join {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    Leave {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    EndCall {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    ToggleAudio {
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    ToggleVideo {
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    StartScreenShare {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    StopScreenShare {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    StartRecording {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    StopRecording {
        rsp: oneshot::Sender<Result<String, Error>>,
    },
    AddParticipant {
        participant: Participant,
        rsp: oneshot::Sender<Result<CallSession, Error>>,
    },
    RemoveParticipant {
        participant_id: String,
        rsp: oneshot::Sender<Result<CallSession, Error>>,
    },
    GetCall {
        rsp: oneshot::Sender<Option<CallSession>>,
    },
    GetMediaState {
        rsp: oneshot::Sender<MediaState>,
    },
}

#[derive(Clone)]
pub struct CallController {
    call_id: String,
    local_id: String,
    ch: UnboundedSender<Cmd>,
    notify: Arc<NotifyWrapper>,
    events: broadcast::Sender<CallEvent>,
    remote_streams: RemoteStreams,
    local_stream: watch::Receiver<Option<MediaStream>>,
    speaker: watch::Receiver<Option<String>>,
}

impl CallController {
    /// Starts an idle controller for `call_id`. Nothing happens until [`CallController::join`].
    pub fn new(
        call_id: &str,
        local: Participant,
        services: CallServices,
        config: Config,
    ) -> Self {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let (notify, notified) = NotifyWrapper::new();

        let links = LinkManager::new(
            &local.id,
            call_id,
            services.signaling.clone(),
            services.transports.clone(),
            config.transport(),
            config.max_mesh_size,
        );
        let media = LocalMedia::new(services.devices.clone());
        let detector =
            ActiveSpeakerDetector::spawn(links.remote_streams().subscribe(), config.speaker.clone());

        let controller = Self {
            call_id: call_id.to_string(),
            local_id: local.id.clone(),
            ch: tx,
            notify: Arc::new(notify),
            events: events.clone(),
            remote_streams: links.remote_streams().clone(),
            local_stream: media.subscribe(),
            speaker: detector.subscribe(),
        };

        let actor = Actor {
            call_id: call_id.to_string(),
            speaker: detector.subscribe(),
            local,
            config,
            services,
            events,
            media,
            links,
            detector,
            snapshots: None,
            call: None,
            recorder: None,
            skipped: vec![],
            ending: false,
        };
        tokio::spawn(actor.run(cmd_rx, notified));
        controller
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Events from now on. Subscribe before joining to see every event.
    pub fn subscribe(&self) -> CallEventStream {
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
        CallEventStream(Box::pin(stream))
    }

    /// Whether the local session is still running
    pub fn is_running(&self) -> bool {
        !self.ch.is_closed()
    }

    pub fn remote_streams(&self) -> &RemoteStreams {
        &self.remote_streams
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local_stream.borrow().clone()
    }

    pub fn subscribe_local_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.local_stream.clone()
    }

    pub fn active_speaker(&self) -> Option<String> {
        self.speaker.borrow().clone()
    }

    /// Opens local media, enters the active set and starts following the call.
    /// A call that is still pending is answered when joined by anyone but its creator.
    pub async fn join(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::Join { rsp: tx })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)?
    }

    /// Leaves the call. The call ends when nobody is left in it.
    /// Does nothing once the local session is over.
    pub async fn leave(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        if self.ch.send(Cmd::Leave { rsp: tx }).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Ends the call for every participant. Does nothing once the local session is over.
    pub async fn end_call(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        if self.ch.send(Cmd::EndCall { rsp: tx }).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Returns whether the microphone is now on
    pub async fn toggle_audio(&self) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::ToggleAudio { rsp: tx })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)?
    }

    /// Returns whether the camera is now on
    pub async fn toggle_video(&self) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::ToggleVideo { rsp: tx })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)?
    }

    pub async fn start_screen_share(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::StartScreenShare { rsp: tx })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)?
    }

    pub async fn stop_screen_share(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::StopScreenShare { rsp: tx })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)?
    }

    pub async fn start_recording(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::StartRecording { rsp: tx })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)?
    }

    /// Stops recording and uploads the result. Returns the url stored on the call.
    pub async fn stop_recording(&self) -> Result<String, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::StopRecording { rsp: tx })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)?
    }

    /// Host only
    pub async fn add_participant(&self, participant: Participant) -> Result<CallSession, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::AddParticipant {
                participant,
                rsp: tx,
            })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)?
    }

    /// Host only
    pub async fn remove_participant(&self, participant_id: &str) -> Result<CallSession, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::RemoveParticipant {
                participant_id: participant_id.to_string(),
                rsp: tx,
            })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)?
    }

    /// The last call snapshot seen
    pub async fn call(&self) -> Option<CallSession> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::GetCall { rsp: tx }).ok()?;
        rx.await.ok()?
    }

    pub async fn media_state(&self) -> Result<MediaState, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::GetMediaState { rsp: tx })
            .map_err(|_| Error::CallNotInProgress)?;
        rx.await.map_err(|_| Error::CallNotInProgress)
    }
}

/// How the directory hears about the local session ending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Leave the active set, ending the call if it is now empty
    Leave,
    /// Leave the active set and end the call
    EndForAll,
    /// Tell the directory nothing
    Silent,
}

struct Actor {
    call_id: String,
    local: Participant,
    config: Config,
    services: CallServices,
    events: broadcast::Sender<CallEvent>,
    media: LocalMedia,
    links: LinkManager,
    detector: ActiveSpeakerDetector,
    speaker: watch::Receiver<Option<String>>,
    snapshots: Option<CallSnapshotStream>,
    call: Option<CallSession>,
    recorder: Option<CompositeRecorder>,
    skipped: Vec<String>,
    ending: bool,
}

async fn next_snapshot(snapshots: &mut Option<CallSnapshotStream>) -> Option<Option<CallSession>> {
    match snapshots {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

async fn track_ended(track: Option<Arc<MediaTrack>>) {
    match track {
        Some(track) => track.ended().await,
        None => futures::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, mut cmd_rx: UnboundedReceiver<Cmd>, notify: Arc<Notify>) {
        loop {
            let screen = self.media.screen_track();
            tokio::select! {
                _ = notify.notified() => {
                    log::debug!("call controller for {} dropped", self.call_id);
                    self.teardown(Exit::Leave, LeaveReason::Left).await;
                }
                opt = cmd_rx.recv() => {
                    let cmd = match opt {
                        Some(r) => r,
                        None => {
                            log::debug!("call controller cmd_rx channel is closed. quitting");
                            self.teardown(Exit::Leave, LeaveReason::Left).await;
                            break;
                        }
                    };
                    self.handle_cmd(cmd).await;
                }
                snapshot = next_snapshot(&mut self.snapshots) => {
                    match snapshot {
                        Some(snapshot) => self.on_snapshot(snapshot).await,
                        None => {
                            log::warn!("call feed for {} closed", self.call_id);
                            self.teardown(Exit::Silent, LeaveReason::CallDeleted).await;
                        }
                    }
                }
                _ = track_ended(screen) => {
                    log::info!("screen capture ended");
                    if let Err(e) = self.stop_screen_share().await {
                        log::warn!("failed to stop screen share: {e}");
                    }
                    self.emit(CallEvent::ScreenShareEnded);
                }
                remote_id = self.links.next_reset() => {
                    let local = self.media.stream();
                    if let Err(e) = self.links.restart(&remote_id, local.as_ref()).await {
                        log::error!("failed to restart link to {remote_id}: {e}");
                    }
                }
                changed = self.speaker.changed() => {
                    if changed.is_ok() {
                        let participant_id = self.speaker.borrow_and_update().clone();
                        self.emit(CallEvent::ActiveSpeakerChanged { participant_id });
                    }
                }
            }

            if self.ending {
                break;
            }
        }
        self.detector.stop();
        log::debug!("call controller for {} stopped", self.call_id);
    }

    fn emit(&self, event: CallEvent) {
        log::debug!("call {}: {event}", self.call_id);
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Join { rsp } => {
                let result = self.join().await;
                let _ = rsp.send(result);
            }
            Cmd::Leave { rsp } => {
                self.teardown(Exit::Leave, LeaveReason::Left).await;
                let _ = rsp.send(Ok(()));
            }
            Cmd::EndCall { rsp } => {
                self.teardown(Exit::EndForAll, LeaveReason::EndedForAll).await;
                let _ = rsp.send(Ok(()));
            }
            Cmd::ToggleAudio { rsp } => {
                let _ = rsp.send(self.media.toggle_audio());
            }
            Cmd::ToggleVideo { rsp } => {
                let _ = rsp.send(self.media.toggle_video());
            }
            Cmd::StartScreenShare { rsp } => {
                let result = self.start_screen_share().await;
                let _ = rsp.send(result);
            }
            Cmd::StopScreenShare { rsp } => {
                let result = self.stop_screen_share().await;
                let _ = rsp.send(result);
            }
            Cmd::StartRecording { rsp } => {
                let result = self.start_recording().await;
                let _ = rsp.send(result);
            }
            Cmd::StopRecording { rsp } => {
                let result = self.stop_recording().await;
                let _ = rsp.send(result);
            }
            Cmd::AddParticipant { participant, rsp } => {
                let result = self
                    .services
                    .directory
                    .add_participant(&self.call_id, participant, &self.local.id)
                    .await;
                let _ = rsp.send(result);
            }
            Cmd::RemoveParticipant {
                participant_id,
                rsp,
            } => {
                let result = self
                    .services
                    .directory
                    .remove_participant(&self.call_id, &participant_id, &self.local.id)
                    .await;
                let _ = rsp.send(result);
            }
            Cmd::GetCall { rsp } => {
                let _ = rsp.send(self.call.clone());
            }
            Cmd::GetMediaState { rsp } => {
                let _ = rsp.send(MediaState {
                    audio_on: self.media.audio_on(),
                    camera_on: self.media.camera_on(),
                    screen_sharing: self.media.is_sharing(),
                    recording: self.recorder.is_some(),
                    screen_share_blocked: self
                        .call
                        .as_ref()
                        .map_or(false, |c| c.someone_else_sharing(&self.local.id)),
                });
            }
        }
    }

    async fn join(&mut self) -> Result<(), Error> {
        if self.snapshots.is_some() {
            return Ok(());
        }
        let directory = self.services.directory.clone();
        let call = directory
            .get_by_id(&self.call_id)
            .await?
            .ok_or(Error::CallNotFound)?;
        if !call.is_participant(&self.local.id) {
            return Err(Error::NotAParticipant);
        }
        if call.status.is_terminal() {
            return Err(Error::CallAlreadyEnded);
        }

        let acquire_now = self.config.media_acquisition == MediaAcquisition::OnJoin
            || call.status == CallStatus::Answered;
        if acquire_now {
            if let Err(e) = self.media.acquire(call.call_type == CallType::Video).await {
                log::error!("failed to open local media for {}: {e}", self.call_id);
                self.emit(CallEvent::media_error());
                self.emit(CallEvent::Left {
                    reason: LeaveReason::MediaError,
                });
                self.ending = true;
                return Err(e);
            }
        }

        let subscribed = async {
            directory
                .update_active_participants(
                    &self.call_id,
                    &self.local.id,
                    &self.local.name,
                    ParticipantAction::Join,
                )
                .await?;
            directory.subscribe(&self.call_id).await
        }
        .await;
        let snapshots = match subscribed {
            Ok(snapshots) => snapshots,
            Err(e) => {
                self.media.stop_all();
                return Err(e);
            }
        };

        if call.status == CallStatus::Pending && !call.is_host(&self.local.id) {
            if let Err(e) = directory
                .update_status(&self.call_id, CallStatus::Answered)
                .await
            {
                log::warn!("failed to answer call {}: {e}", self.call_id);
            }
        }

        self.snapshots = Some(snapshots);
        self.emit(CallEvent::Joined {
            call_id: self.call_id.clone(),
        });
        log::info!("joined call {}", self.call_id);
        Ok(())
    }

    async fn on_snapshot(&mut self, snapshot: Option<CallSession>) {
        let Some(call) = snapshot else {
            log::info!("call {} was deleted", self.call_id);
            self.teardown(Exit::Silent, LeaveReason::CallDeleted).await;
            return;
        };

        if !call.is_participant(&self.local.id) {
            self.emit(CallEvent::removed_by_host());
            self.teardown(Exit::Silent, LeaveReason::RemovedByHost).await;
            return;
        }

        let previous = self.call.replace(call.clone());
        let previous_status = previous.as_ref().map(|c| c.status);

        if previous_status != Some(call.status) {
            self.emit(CallEvent::StatusChanged {
                status: call.status,
            });
        }

        let roster_changed = previous.as_ref().map_or(true, |p| {
            p.participant_ids != call.participant_ids
                || p.active_participant_ids != call.active_participant_ids
        });
        if roster_changed {
            self.emit(CallEvent::RosterChanged {
                participant_ids: call.participant_ids.clone(),
                active_participant_ids: call.active_participant_ids.clone(),
            });
        }

        let was_recording = previous.as_ref().map_or(false, |p| p.is_recording);
        if call.is_recording && !was_recording {
            self.emit(CallEvent::RecordingStarted);
        }

        let previous_sharer = previous.as_ref().and_then(|p| p.screen_sharing_user_id.clone());
        if previous.is_none() || previous_sharer != call.screen_sharing_user_id {
            self.emit(CallEvent::ScreenShareChanged {
                sharer_id: call.screen_sharing_user_id.clone(),
                blocked: call.someone_else_sharing(&self.local.id),
            });
        }

        if call.status.is_terminal() {
            log::info!("call {} is {}", self.call_id, call.status);
            self.teardown(Exit::Leave, LeaveReason::CallFinished(call.status))
                .await;
            return;
        }

        let answered_now =
            call.status == CallStatus::Answered && previous_status != Some(CallStatus::Answered);
        if answered_now && !self.media.is_acquired() {
            if let Err(e) = self.media.acquire(call.call_type == CallType::Video).await {
                log::error!("failed to open local media for {}: {e}", self.call_id);
                self.emit(CallEvent::media_error());
                self.teardown(Exit::Leave, LeaveReason::MediaError).await;
                return;
            }
        }

        if !self.media.is_acquired() {
            return;
        }
        let local = self.media.stream();
        let report = self
            .links
            .reconcile(&call.participant_ids, local.as_ref())
            .await;
        if report.skipped != self.skipped {
            self.skipped = report.skipped.clone();
            if !report.skipped.is_empty() {
                self.emit(CallEvent::MeshLimitExceeded {
                    limit: self.config.max_mesh_size,
                    skipped: report.skipped,
                });
            }
        }
    }

    async fn start_screen_share(&mut self) -> Result<(), Error> {
        if let Some(sharer) = self
            .call
            .as_ref()
            .filter(|c| c.someone_else_sharing(&self.local.id))
            .and_then(|c| c.screen_sharing_user_id.clone())
        {
            return Err(Error::ScreenShareInProgress { user_id: sharer });
        }
        if self.media.is_sharing() {
            return Ok(());
        }
        self.media.start_screen_share(&self.links).await?;
        if let Err(e) = self
            .services
            .directory
            .update_screen_share_status(&self.call_id, Some(&self.local.id))
            .await
        {
            log::warn!("failed to publish screen share for {}: {e}", self.call_id);
        }
        Ok(())
    }

    async fn stop_screen_share(&mut self) -> Result<(), Error> {
        self.media.stop_screen_share(&self.links).await?;
        if let Err(e) = self
            .services
            .directory
            .update_screen_share_status(&self.call_id, None)
            .await
        {
            log::warn!("failed to clear screen share for {}: {e}", self.call_id);
        }
        Ok(())
    }

    async fn start_recording(&mut self) -> Result<(), Error> {
        if self.recorder.is_some() {
            return Err(Error::RecordingInProgress);
        }
        if self.call.is_none() {
            return Err(Error::CallNotInProgress);
        }
        let recorder = CompositeRecorder::start(
            &self.local.id,
            &self.config.recorder,
            self.media.subscribe(),
            self.links.remote_streams().subscribe(),
        )?;
        self.services
            .directory
            .update_recording_status(&self.call_id, true)
            .await?;
        self.recorder = Some(recorder);
        log::info!("recording call {}", self.call_id);
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<String, Error> {
        let recorder = self.recorder.take().ok_or(Error::RecordingNotActive)?;
        let result = async {
            let recording = recorder.stop().await?;
            let call = match self.call.clone() {
                Some(call) => call,
                None => self
                    .services
                    .directory
                    .get_by_id(&self.call_id)
                    .await?
                    .ok_or(Error::CallNotFound)?,
            };
            let saved = recorder::publish(
                recording,
                &call,
                self.services.uploads.as_ref(),
                self.services.host.as_ref(),
                self.services.directory.as_ref(),
                &self.config.recorder.folder,
            )
            .await?;
            saved
                .recording_url
                .ok_or_else(|| Error::OtherWithContext("recording url was not stored".into()))
        }
        .await;

        match &result {
            Ok(url) => self.emit(CallEvent::RecordingSaved { url: url.clone() }),
            Err(e) => {
                log::error!("failed to save recording of {}: {e}", self.call_id);
                if let Err(e) = self
                    .services
                    .directory
                    .update_recording_status(&self.call_id, false)
                    .await
                {
                    log::warn!("failed to clear recording flag: {e}");
                }
                self.emit(CallEvent::RecordingFailed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    /// Ends the local session. Only the first call does anything.
    async fn teardown(&mut self, exit: Exit, reason: LeaveReason) {
        if self.ending {
            return;
        }
        self.ending = true;
        log::info!("leaving call {} ({reason})", self.call_id);

        if self.recorder.is_some() {
            let _ = self.stop_recording().await;
        }

        let mut remotes = self.links.linked().into_iter().collect::<BTreeSet<_>>();
        if let Some(call) = &self.call {
            remotes.extend(call.participant_ids.iter().cloned());
        }
        remotes.remove(&self.local.id);

        let was_sharing = self.media.is_sharing();
        self.snapshots = None;
        self.links.teardown_all().await;
        self.media.stop_all();

        for remote in &remotes {
            let key = SessionKey::new(&self.call_id, &self.local.id, remote);
            if let Err(e) = self.services.signaling.delete_session(&key).await {
                log::warn!("failed to delete signaling session {key}: {e}");
            }
        }

        if exit != Exit::Silent {
            self.leave_directory(exit, was_sharing).await;
        }

        self.emit(CallEvent::Left { reason });
    }

    async fn leave_directory(&mut self, exit: Exit, was_sharing: bool) {
        let directory = &self.services.directory;
        let sharing_flag = self
            .call
            .as_ref()
            .and_then(|c| c.screen_sharing_user_id.as_deref())
            == Some(self.local.id.as_str());
        if was_sharing || sharing_flag {
            if let Err(e) = directory
                .update_screen_share_status(&self.call_id, None)
                .await
            {
                log::warn!("failed to clear screen share for {}: {e}", self.call_id);
            }
        }

        let after_leave = match directory
            .update_active_participants(
                &self.call_id,
                &self.local.id,
                &self.local.name,
                ParticipantAction::Leave,
            )
            .await
        {
            Ok(call) => Some(call),
            Err(e) => {
                log::warn!("failed to leave call {}: {e}", self.call_id);
                None
            }
        };

        let end = match exit {
            Exit::EndForAll => true,
            Exit::Leave => after_leave.map_or(false, |call| {
                call.active_participant_ids.is_empty() && !call.status.is_terminal()
            }),
            Exit::Silent => false,
        };
        if end {
            if let Err(e) = directory
                .update_status(&self.call_id, CallStatus::Ended)
                .await
            {
                log::warn!("failed to end call {}: {e}", self.call_id);
            }
        }
    }
}
