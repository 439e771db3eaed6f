//! Local capture owned by one call.
//!
//! [`LocalMedia`] is the only place local tracks are stopped. Peer links hold clones
//! of the tracks and never stop them. At most one of camera and screen is the
//! outgoing video at any time, and none of the operations here touch audio senders.

use std::sync::Arc;

use huddle::error::Error;
use huddle::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
use tokio::sync::watch;

use crate::link_manager::LinkManager;

struct ScreenShare {
    track: Arc<MediaTrack>,
    /// Camera that was outgoing when sharing started, kept alive for restoring
    camera: Option<Arc<MediaTrack>>,
}

pub struct LocalMedia {
    devices: Arc<dyn MediaDevices>,
    stream: watch::Sender<Option<MediaStream>>,
    audio_on: bool,
    camera_on: bool,
    screen: Option<ScreenShare>,
}

impl LocalMedia {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        let (stream, _) = watch::channel(None);
        Self {
            devices,
            stream,
            audio_on: false,
            camera_on: false,
            screen: None,
        }
    }

    pub fn stream(&self) -> Option<MediaStream> {
        self.stream.borrow().clone()
    }

    /// The local stream as currently rendered, including swaps
    pub fn subscribe(&self) -> watch::Receiver<Option<MediaStream>> {
        self.stream.subscribe()
    }

    pub fn is_acquired(&self) -> bool {
        self.stream.borrow().is_some()
    }

    pub fn audio_on(&self) -> bool {
        self.audio_on
    }

    pub fn camera_on(&self) -> bool {
        self.camera_on
    }

    pub fn is_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn screen_track(&self) -> Option<Arc<MediaTrack>> {
        self.screen.as_ref().map(|s| s.track.clone())
    }

    /// Opens the microphone, and the camera when `video` is set. Returns the
    /// existing stream when already acquired.
    pub async fn acquire(&mut self, video: bool) -> Result<MediaStream, Error> {
        if let Some(stream) = self.stream() {
            return Ok(stream);
        }
        let stream = self
            .devices
            .get_user_media(MediaConstraints::for_call(video))
            .await?;
        self.audio_on = stream.has_audio();
        self.camera_on = video && stream.video_tracks().next().is_some();
        self.stream.send_replace(Some(stream.clone()));
        log::debug!(
            "local media acquired with {} tracks",
            stream.tracks().len()
        );
        Ok(stream)
    }

    /// Flips the enabled flag of the microphone. Nothing is renegotiated.
    pub fn toggle_audio(&mut self) -> Result<bool, Error> {
        let stream = self.stream().ok_or(Error::LocalStreamUnavailable)?;
        let enabled = !self.audio_on;
        stream.audio_tracks().for_each(|t| t.set_enabled(enabled));
        self.audio_on = enabled;
        Ok(enabled)
    }

    /// Flips the enabled flag of the camera, including a camera parked behind a
    /// screen share. Nothing is renegotiated.
    pub fn toggle_video(&mut self) -> Result<bool, Error> {
        let stream = self.stream().ok_or(Error::LocalStreamUnavailable)?;
        let mut cameras = stream
            .video_tracks()
            .filter(|t| self.screen_track().map_or(true, |s| s.id() != t.id()))
            .cloned()
            .collect::<Vec<_>>();
        if let Some(camera) = self.screen.as_ref().and_then(|s| s.camera.clone()) {
            cameras.push(camera);
        }
        if cameras.is_empty() {
            return Err(Error::device_missing("camera"));
        }
        let enabled = !self.camera_on;
        cameras.iter().for_each(|t| t.set_enabled(enabled));
        self.camera_on = enabled;
        Ok(enabled)
    }

    /// Puts `track` on every link's video sender and in the local stream. The
    /// previous local video track is stopped.
    pub async fn replace_video_track(
        &mut self,
        links: &LinkManager,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), Error> {
        self.swap_video(links, track, true).await
    }

    async fn swap_video(
        &mut self,
        links: &LinkManager,
        track: Option<Arc<MediaTrack>>,
        stop_previous: bool,
    ) -> Result<(), Error> {
        if self.stream.borrow().is_none() {
            return Err(Error::LocalStreamUnavailable);
        }
        if let Some(track) = &track {
            if track.kind() != TrackKind::Video {
                return Err(Error::OtherWithContext(format!(
                    "{} track cannot replace video",
                    track.kind()
                )));
            }
        }

        links.replace_video(track.clone()).await;

        self.stream.send_modify(|stream| {
            let Some(stream) = stream else {
                return;
            };
            let previous = stream.video_tracks().cloned().collect::<Vec<_>>();
            for old in previous {
                if track.as_ref().map_or(false, |t| t.id() == old.id()) {
                    continue;
                }
                stream.remove_track(old.id());
                if stop_previous {
                    old.stop();
                }
            }
            if let Some(track) = track {
                stream.add_track(track);
            }
        });
        Ok(())
    }

    /// Captures the screen and sends it instead of the camera. Returns the screen
    /// track so the caller can watch for it ending. A failed capture changes nothing.
    pub async fn start_screen_share(&mut self, links: &LinkManager) -> Result<Arc<MediaTrack>, Error> {
        if let Some(screen) = &self.screen {
            return Ok(screen.track.clone());
        }
        if self.stream.borrow().is_none() {
            return Err(Error::LocalStreamUnavailable);
        }

        let display = self.devices.get_display_media().await?;
        let Some(track) = display.video_tracks().next().cloned() else {
            display.tracks().iter().for_each(|t| t.stop());
            return Err(Error::device_missing("screen"));
        };
        // only the picture is shared
        display
            .audio_tracks()
            .for_each(|t| t.stop());

        let camera = if self.camera_on {
            self.stream()
                .and_then(|s| s.video_tracks().next().cloned())
        } else {
            None
        };

        self.swap_video(links, Some(track.clone()), camera.is_none())
            .await?;
        self.screen = Some(ScreenShare {
            track: track.clone(),
            camera,
        });
        log::info!("screen share started");
        Ok(track)
    }

    /// Sends the remembered camera again, or no video at all when the camera was off
    pub async fn stop_screen_share(&mut self, links: &LinkManager) -> Result<(), Error> {
        let screen = self.screen.take().ok_or(Error::ScreenShareNotActive)?;
        match screen.camera.filter(|c| c.is_live()) {
            Some(camera) => {
                // toggles made during the share landed on the parked camera
                self.camera_on = camera.is_enabled();
                self.swap_video(links, Some(camera), true).await?;
            }
            None => {
                self.swap_video(links, None, true).await?;
                self.camera_on = false;
            }
        }
        // the screen track may have been dropped from the stream already
        screen.track.stop();
        log::info!("screen share stopped");
        Ok(())
    }

    /// Stops every local track, including a parked camera. Safe to call more than once.
    pub fn stop_all(&mut self) {
        if let Some(screen) = self.screen.take() {
            screen.track.stop();
            if let Some(camera) = screen.camera {
                camera.stop();
            }
        }
        if let Some(stream) = self.stream.send_replace(None) {
            stream.tracks().iter().for_each(|t| t.stop());
        }
        self.audio_on = false;
        self.camera_on = false;
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use huddle::error::Error;
    use huddle::media::TrackSource;
    use huddle_relay_memory::MemoryRelay;

    use crate::link_manager::LinkManager;
    use crate::media::synthetic::SyntheticDevices;
    use crate::transport::loopback::LoopbackNetwork;
    use crate::transport::{PeerTransport, TransportConfig};

    use super::LocalMedia;

    fn links(network: &LoopbackNetwork) -> LinkManager {
        LinkManager::new(
            "a",
            "call",
            Arc::new(MemoryRelay::new()),
            Arc::new(network.clone()),
            TransportConfig::default(),
            8,
        )
    }

    #[tokio::test]
    async fn toggles_flip_enabled_flags_in_place() -> anyhow::Result<()> {
        let mut media = LocalMedia::new(Arc::new(SyntheticDevices::new()));
        assert!(matches!(media.toggle_audio(), Err(Error::LocalStreamUnavailable)));

        let stream = media.acquire(true).await?;
        assert!(media.audio_on() && media.camera_on());
        assert!(!media.toggle_audio()?);
        assert!(stream.audio_tracks().all(|t| !t.is_enabled() && t.is_live()));
        assert!(!media.toggle_video()?);
        assert!(media.toggle_video()?);
        assert!(stream.video_tracks().all(|t| t.is_enabled()));

        let again = media.acquire(true).await?;
        assert_eq!(again.id(), stream.id());
        media.stop_all();
        assert!(stream.tracks().iter().all(|t| !t.is_live()));
        Ok(())
    }

    #[tokio::test]
    async fn screen_share_parks_and_restores_the_camera() -> anyhow::Result<()> {
        let network = LoopbackNetwork::new();
        let mut links = links(&network);
        let mut media = LocalMedia::new(Arc::new(SyntheticDevices::new()));
        let stream = media.acquire(true).await?;
        links.reconcile(&["a".into(), "b".into()], Some(&stream)).await;
        let transport = network.transports().pop().expect("transport");
        let camera = stream.video_tracks().next().cloned().expect("camera");
        let mic = stream.audio_tracks().next().cloned().expect("mic");

        let screen = media.start_screen_share(&links).await?;
        assert_eq!(screen.source(), TrackSource::Screen);
        assert!(camera.is_live());
        let local = media.stream().expect("stream");
        assert_eq!(local.video_tracks().map(|t| t.id().to_string()).collect::<Vec<_>>(), vec![screen.id().to_string()]);
        let senders = transport.senders().await;
        assert_eq!(senders.len(), 2);
        assert!(senders.iter().any(|s| s.track_id.as_deref() == Some(screen.id())));
        assert!(senders.iter().any(|s| s.track_id.as_deref() == Some(mic.id())));

        media.stop_screen_share(&links).await?;
        assert!(!screen.is_live());
        assert!(mic.is_live());
        assert!(media.camera_on());
        let senders = transport.senders().await;
        assert!(senders.iter().any(|s| s.track_id.as_deref() == Some(camera.id())));
        assert!(matches!(
            media.stop_screen_share(&links).await,
            Err(Error::ScreenShareNotActive)
        ));

        links.teardown_all().await;
        media.stop_all();
        Ok(())
    }

    #[tokio::test]
    async fn sharing_with_the_camera_off_ends_without_video() -> anyhow::Result<()> {
        let network = LoopbackNetwork::new();
        let links = links(&network);
        let mut media = LocalMedia::new(Arc::new(SyntheticDevices::new()));
        let stream = media.acquire(true).await?;
        let camera = stream.video_tracks().next().cloned().expect("camera");
        media.toggle_video()?;

        media.start_screen_share(&links).await?;
        assert!(!camera.is_live());
        media.stop_screen_share(&links).await?;
        assert!(!media.camera_on());
        assert_eq!(media.stream().map(|s| s.video_tracks().count()), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn camera_toggled_off_during_a_share_stays_off() -> anyhow::Result<()> {
        let network = LoopbackNetwork::new();
        let links = links(&network);
        let mut media = LocalMedia::new(Arc::new(SyntheticDevices::new()));
        let stream = media.acquire(true).await?;
        let camera = stream.video_tracks().next().cloned().expect("camera");

        media.start_screen_share(&links).await?;
        assert!(!media.toggle_video()?);
        media.stop_screen_share(&links).await?;
        assert!(!camera.is_enabled());
        assert!(!media.camera_on());

        assert!(media.toggle_video()?);
        assert!(camera.is_enabled());
        assert!(media.camera_on());
        Ok(())
    }

    #[tokio::test]
    async fn refused_screen_capture_keeps_the_camera() -> anyhow::Result<()> {
        let network = LoopbackNetwork::new();
        let links = links(&network);
        let devices = SyntheticDevices::new();
        devices.deny_display_media(true);
        let mut media = LocalMedia::new(Arc::new(devices));
        let stream = media.acquire(true).await?;

        assert!(media.start_screen_share(&links).await.is_err());
        assert!(!media.is_sharing());
        assert_eq!(media.stream(), Some(stream));
        Ok(())
    }
}
