//! Handles to live media.
//!
//! A [`MediaTrack`] is shared (`Arc`) between whoever produces it and any number of
//! consumers. Producers push decoded audio chunks, decoded video frames and encoded
//! packets into it; consumers only ever read. Only the owner of a track should call
//! [`MediaTrack::stop`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::error::Error;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    #[display(fmt = "microphone")]
    Microphone,
    #[display(fmt = "camera")]
    Camera,
    #[display(fmt = "screen")]
    Screen,
    /// Received from a peer
    #[display(fmt = "remote")]
    Remote,
    /// Produced locally out of other tracks
    #[display(fmt = "composite")]
    Composite,
}

/// A block of mono PCM samples in `-1.0..=1.0`
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub samples: Arc<[f32]>,
}

impl AudioChunk {
    pub fn new(sample_rate: u32, samples: impl Into<Arc<[f32]>>) -> Self {
        Self {
            sample_rate,
            samples: samples.into(),
        }
    }

    pub fn silence(sample_rate: u32, len: usize) -> Self {
        Self::new(sample_rate, vec![0.0; len])
    }
}

/// One decoded RGBA8 picture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
        }
    }

    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect::<Vec<u8>>();
        Self::new(width, height, data)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    live: watch::Sender<bool>,
    samples: watch::Sender<Option<AudioChunk>>,
    frames: watch::Sender<Option<VideoFrame>>,
    packets: broadcast::Sender<Bytes>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Arc<Self> {
        Self::with_id(Uuid::new_v4().to_string(), kind, source, label)
    }

    pub fn with_id(
        id: impl Into<String>,
        kind: TrackKind,
        source: TrackSource,
        label: impl Into<String>,
    ) -> Arc<Self> {
        let (live, _) = watch::channel(true);
        let (samples, _) = watch::channel(None);
        let (frames, _) = watch::channel(None);
        let (packets, _) = broadcast::channel(256);
        Arc::new(Self {
            id: id.into(),
            kind,
            source,
            label: label.into(),
            enabled: AtomicBool::new(true),
            live,
            samples,
            frames,
            packets,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Disabled tracks stay negotiated and keep flowing, as silence or black frames.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Ends the track for good. Calling it again does nothing.
    pub fn stop(&self) {
        self.live.send_if_modified(|live| std::mem::replace(live, false));
    }

    /// Resolves once the track has ended, immediately if it already has.
    pub async fn ended(&self) {
        let mut rx = self.live.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn push_samples(&self, chunk: AudioChunk) {
        if self.is_live() {
            self.samples.send_replace(Some(chunk));
        }
    }

    pub fn subscribe_samples(&self) -> watch::Receiver<Option<AudioChunk>> {
        self.samples.subscribe()
    }

    pub fn push_frame(&self, frame: VideoFrame) {
        if self.is_live() {
            self.frames.send_replace(Some(frame));
        }
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<VideoFrame>> {
        self.frames.subscribe()
    }

    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.frames.borrow().clone()
    }

    /// Encoded packets for the wire. Dropped when nobody is listening.
    pub fn push_packet(&self, packet: Bytes) {
        if self.is_live() {
            let _ = self.packets.send(packet);
        }
    }

    pub fn subscribe_packets(&self) -> broadcast::Receiver<Bytes> {
        self.packets.subscribe()
    }
}

/// An ordered group of tracks that belong together
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.tracks.len() == other.tracks.len()
            && self
                .tracks
                .iter()
                .zip(other.tracks.iter())
                .all(|(a, b)| a.id() == b.id())
    }
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: vec![],
        }
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn add_track(&mut self, track: Arc<MediaTrack>) {
        if self.tracks.iter().all(|t| t.id() != track.id()) {
            self.tracks.push(track);
        }
    }

    pub fn remove_track(&mut self, track_id: &str) -> Option<Arc<MediaTrack>> {
        let index = self.tracks.iter().position(|t| t.id() == track_id)?;
        Some(self.tracks.remove(index))
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn has_audio(&self) -> bool {
        self.audio_tracks().next().is_some()
    }

    /// A stream stays active while any of its tracks is live
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl MediaConstraints {
    pub fn for_call(video: bool) -> Self {
        Self {
            audio: true,
            video,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Local capture devices. Both calls may fail when permission is denied or the device is missing.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, Error>;

    async fn get_display_media(&self) -> Result<MediaStream, Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn stopped_track_resolves_ended_and_ignores_frames() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        track.push_frame(VideoFrame::solid(2, 2, [255, 0, 0, 255]));
        assert!(track.latest_frame().is_some());

        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        track.stop();
        track.stop();
        waiter.await.expect("ended task");

        let mut frames = track.subscribe_frames();
        frames.borrow_and_update();
        track.push_frame(VideoFrame::solid(4, 4, [0, 0, 0, 255]));
        assert!(!frames.has_changed().unwrap_or(true));
        assert!(!track.is_live());
    }

    #[test]
    fn stream_is_active_while_any_track_lives() {
        let audio = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let video = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        let mut stream = MediaStream::with_tracks("s", vec![audio.clone(), video.clone()]);
        stream.add_track(audio.clone());
        assert_eq!(stream.tracks().len(), 2);
        assert!(stream.has_audio());

        audio.stop();
        assert!(stream.is_active());
        video.stop();
        assert!(!stream.is_active());

        assert!(stream.remove_track(video.id()).is_some());
        assert_eq!(stream.video_tracks().count(), 0);
    }

    #[test]
    fn solid_frame_has_rgba_layout() {
        let frame = VideoFrame::solid(3, 2, [1, 2, 3, 4]);
        assert_eq!(frame.data.len(), 24);
        assert_eq!(&frame.data[4..8], &[1, 2, 3, 4]);
        assert!(!frame.is_empty());
        assert!(VideoFrame::new(0, 10, Vec::new()).is_empty());
    }
}
