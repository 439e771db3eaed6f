//! Capture devices that generate their own media.
//!
//! Microphones produce a configurable audio pattern in 20 ms chunks, cameras and
//! screens produce solid frames. The generators run until their track is stopped.
//! Only decoded media is produced; nothing is pushed to the packet feed.

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use huddle::error::Error;
use huddle::media::{
    AudioChunk, MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind, TrackSource,
    VideoFrame,
};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CHUNK_MS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioPattern {
    Silence,
    Tone { frequency: f32, amplitude: f32 },
    Noise { amplitude: f32 },
}

impl Default for AudioPattern {
    fn default() -> Self {
        AudioPattern::Tone {
            frequency: 440.0,
            amplitude: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    sample_rate: u32,
    pattern: AudioPattern,
    camera_color: [u8; 4],
    screen_color: [u8; 4],
    width: u32,
    height: u32,
    fps: u32,
    deny_user_media: bool,
    deny_display_media: bool,
    no_camera: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            pattern: AudioPattern::default(),
            camera_color: [40, 120, 200, 255],
            screen_color: [230, 230, 230, 255],
            width: 320,
            height: 240,
            fps: 15,
            deny_user_media: false,
            deny_display_media: false,
            no_camera: false,
        }
    }
}

/// Generated microphone, camera and screen
#[derive(Clone, Default)]
pub struct SyntheticDevices {
    settings: Arc<RwLock<Settings>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_audio(self, pattern: AudioPattern) -> Self {
        self.set_audio(pattern);
        self
    }

    pub fn with_camera_color(self, rgba: [u8; 4]) -> Self {
        self.settings.write().camera_color = rgba;
        self
    }

    pub fn with_frame_size(self, width: u32, height: u32) -> Self {
        {
            let mut settings = self.settings.write();
            settings.width = width;
            settings.height = height;
        }
        self
    }

    /// Changes what every microphone produced by these devices sounds like from now on
    pub fn set_audio(&self, pattern: AudioPattern) {
        self.settings.write().pattern = pattern;
    }

    /// Makes `get_user_media` fail as if permission was refused
    pub fn deny_user_media(&self, deny: bool) {
        self.settings.write().deny_user_media = deny;
    }

    pub fn deny_display_media(&self, deny: bool) {
        self.settings.write().deny_display_media = deny;
    }

    /// Makes video requests fail as if no camera was attached
    pub fn remove_camera(&self, missing: bool) {
        self.settings.write().no_camera = missing;
    }

    fn spawn_microphone(&self) -> Arc<MediaTrack> {
        let track = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "Synthetic Microphone");
        let settings = self.settings.clone();
        let producer = track.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut ticker = tokio::time::interval(Duration::from_millis(CHUNK_MS));
            let mut phase = 0f32;
            loop {
                tokio::select! {
                    _ = producer.ended() => break,
                    _ = ticker.tick() => {}
                }
                let (rate, pattern) = {
                    let settings = settings.read();
                    (settings.sample_rate, settings.pattern)
                };
                let len = (rate as u64 * CHUNK_MS / 1000) as usize;
                let samples = match pattern {
                    AudioPattern::Silence => vec![0.0; len],
                    AudioPattern::Tone {
                        frequency,
                        amplitude,
                    } => {
                        let step = 2.0 * PI * frequency / rate as f32;
                        (0..len)
                            .map(|_| {
                                phase = (phase + step) % (2.0 * PI);
                                amplitude * phase.sin()
                            })
                            .collect()
                    }
                    AudioPattern::Noise { amplitude } => (0..len)
                        .map(|_| amplitude * rng.gen_range(-1.0f32..=1.0))
                        .collect(),
                };
                producer.push_samples(AudioChunk::new(rate, samples));
            }
        });
        track
    }

    fn spawn_video(&self, source: TrackSource, label: &str) -> Arc<MediaTrack> {
        let track = MediaTrack::new(TrackKind::Video, source, label);
        let (frame, fps) = {
            let settings = self.settings.read();
            let color = match source {
                TrackSource::Screen => settings.screen_color,
                _ => settings.camera_color,
            };
            (
                VideoFrame::solid(settings.width, settings.height, color),
                settings.fps.max(1),
            )
        };
        let producer = track.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(1000 / fps as u64));
            loop {
                tokio::select! {
                    _ = producer.ended() => break,
                    _ = ticker.tick() => producer.push_frame(frame.clone()),
                }
            }
        });
        track
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, Error> {
        {
            let settings = self.settings.read();
            if settings.deny_user_media {
                return Err(Error::permission_denied("camera and microphone"));
            }
            if constraints.video && settings.no_camera {
                return Err(Error::device_missing("camera"));
            }
        }

        let mut stream = MediaStream::new(uuid::Uuid::new_v4().to_string());
        if constraints.audio {
            stream.add_track(self.spawn_microphone());
        }
        if constraints.video {
            stream.add_track(self.spawn_video(TrackSource::Camera, "Synthetic Camera"));
        }
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<MediaStream, Error> {
        if self.settings.read().deny_display_media {
            return Err(Error::permission_denied("screen"));
        }
        Ok(MediaStream::with_tracks(
            uuid::Uuid::new_v4().to_string(),
            vec![self.spawn_video(TrackSource::Screen, "Synthetic Screen")],
        ))
    }
}

#[cfg(test)]
mod test {
    use huddle::error::Error;
    use huddle::media::{MediaConstraints, MediaDevices, TrackSource};

    use super::{AudioPattern, SyntheticDevices};

    #[tokio::test]
    async fn audio_calls_never_open_the_camera() -> anyhow::Result<()> {
        let devices = SyntheticDevices::new();
        let stream = devices
            .get_user_media(MediaConstraints::for_call(false))
            .await?;
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(stream.video_tracks().count(), 0);
        stream.tracks().iter().for_each(|t| t.stop());
        Ok(())
    }

    #[tokio::test]
    async fn microphone_produces_the_configured_pattern() -> anyhow::Result<()> {
        let devices = SyntheticDevices::new().with_audio(AudioPattern::Noise { amplitude: 0.5 });
        let stream = devices.get_user_media(MediaConstraints::for_call(true)).await?;
        let mic = stream.audio_tracks().next().cloned().expect("microphone");
        let mut samples = mic.subscribe_samples();
        samples.changed().await?;
        let chunk = samples.borrow().clone().expect("chunk");
        assert_eq!(chunk.samples.len(), 960);
        assert!(chunk.samples.iter().any(|s| s.abs() > 0.01));
        assert!(chunk.samples.iter().all(|s| s.abs() <= 0.5));

        let cam = stream.video_tracks().next().cloned().expect("camera");
        assert_eq!(cam.source(), TrackSource::Camera);
        let mut frames = cam.subscribe_frames();
        frames.changed().await?;
        assert!(cam.latest_frame().is_some());

        stream.tracks().iter().for_each(|t| t.stop());
        Ok(())
    }

    #[tokio::test]
    async fn refused_permissions_fail_acquisition() {
        let devices = SyntheticDevices::new();
        devices.deny_user_media(true);
        assert!(matches!(
            devices.get_user_media(MediaConstraints::for_call(true)).await,
            Err(Error::MediaAcquisition(_))
        ));
        devices.deny_user_media(false);
        devices.remove_camera(true);
        assert!(devices
            .get_user_media(MediaConstraints::for_call(false))
            .await
            .is_ok());
        assert!(devices
            .get_user_media(MediaConstraints::for_call(true))
            .await
            .is_err());
        devices.deny_display_media(true);
        assert!(devices.get_display_media().await.is_err());
    }
}
