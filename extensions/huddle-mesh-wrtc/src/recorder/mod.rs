//! Composite recording of a call.
//!
//! While running, the recorder paints every visible video (local first, mirrored,
//! then remotes by id) into a grid on a fixed canvas at a fixed frame rate, mixes
//! the local and remote audio present at start into one signal, and hands both to
//! a [`RecordingEncoder`]. The canvas and the mix are also exposed as tracks.
//! Stopping finalizes the file, which [`publish`] uploads and stores on the call.

mod compositor;
mod encoder;
mod layout;
mod mixer;

pub use compositor::{collect_tiles, Compositor, Tile};
pub use encoder::{read_segments, CborSegmentEncoder, RecordingEncoder, Segment};
pub use layout::{dimensions, fit, grid, Cell};
pub use mixer::AudioMixer;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use huddle::call::{CallDirectory, CallSession};
use huddle::error::Error;
use huddle::media::{MediaStream, MediaTrack, TrackKind, TrackSource, VideoFrame};
use huddle::upload::{MediaHost, RecordingRecord, UploadAuthority, UploadRequest};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::RecorderConfig;

/// A finished recording, held in memory until it is published or dropped
#[derive(Debug, Clone)]
pub struct Recording {
    pub data: Bytes,
    pub mime_type: String,
    pub duration: Duration,
    pub frames: usize,
}

pub struct CompositeRecorder {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<Recording, Error>>>,
    video: Arc<MediaTrack>,
    audio: Arc<MediaTrack>,
}

impl CompositeRecorder {
    /// Starts recording into a [`CborSegmentEncoder`]. The result is not playable
    /// media; use [`CompositeRecorder::start_with`] for a container format.
    pub fn start(
        local_id: &str,
        config: &RecorderConfig,
        local: watch::Receiver<Option<MediaStream>>,
        remotes: watch::Receiver<BTreeMap<String, MediaStream>>,
    ) -> Result<Self, Error> {
        let encoder = CborSegmentEncoder::new(
            config.width,
            config.height,
            config.fps,
            config.sample_rate,
            config.jpeg_quality,
        )?;
        Ok(Self::start_with(
            local_id,
            config,
            local,
            remotes,
            Box::new(encoder),
        ))
    }

    pub fn start_with(
        local_id: &str,
        config: &RecorderConfig,
        local: watch::Receiver<Option<MediaStream>>,
        remotes: watch::Receiver<BTreeMap<String, MediaStream>>,
        encoder: Box<dyn RecordingEncoder>,
    ) -> Self {
        let video = MediaTrack::new(TrackKind::Video, TrackSource::Composite, "Recording Canvas");
        let audio = MediaTrack::new(TrackKind::Audio, TrackSource::Composite, "Recording Mix");

        let sources = local
            .borrow()
            .iter()
            .flat_map(|s| s.audio_tracks().cloned().collect::<Vec<_>>())
            .chain(
                remotes
                    .borrow()
                    .values()
                    .flat_map(|s| s.audio_tracks().cloned().collect::<Vec<_>>()),
            )
            .collect::<Vec<_>>();
        log::debug!("recording started with {} audio sources", sources.len());
        let mixer = AudioMixer::new(config.sample_rate, sources);

        let (stop, stopped) = oneshot::channel();
        let pipeline = Pipeline {
            local_id: local_id.to_string(),
            config: config.clone(),
            local,
            remotes,
            compositor: Compositor::new(config.width, config.height),
            mixer,
            encoder,
            video: video.clone(),
            audio: audio.clone(),
        };
        let task = tokio::spawn(pipeline.run(stopped));

        Self {
            stop: Some(stop),
            task: Some(task),
            video,
            audio,
        }
    }

    /// The canvas as a video track
    pub fn video_track(&self) -> Arc<MediaTrack> {
        self.video.clone()
    }

    /// The mix as an audio track
    pub fn audio_track(&self) -> Arc<MediaTrack> {
        self.audio.clone()
    }

    /// Stops painting and mixing and finalizes the file
    pub async fn stop(mut self) -> Result<Recording, Error> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let task = self.task.take().ok_or(Error::RecordingNotActive)?;
        let result = task
            .await
            .map_err(|e| Error::OtherWithContext(format!("recorder task failed: {e}")))?;
        self.video.stop();
        self.audio.stop();
        result
    }
}

impl Drop for CompositeRecorder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.video.stop();
        self.audio.stop();
    }
}

struct Pipeline {
    local_id: String,
    config: RecorderConfig,
    local: watch::Receiver<Option<MediaStream>>,
    remotes: watch::Receiver<BTreeMap<String, MediaStream>>,
    compositor: Compositor,
    mixer: AudioMixer,
    encoder: Box<dyn RecordingEncoder>,
    video: Arc<MediaTrack>,
    audio: Arc<MediaTrack>,
}

impl Pipeline {
    async fn run(mut self, mut stopped: oneshot::Receiver<()>) -> Result<Recording, Error> {
        let mut ticker = tokio::time::interval(self.config.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let started = Instant::now();
        let mut frames = 0;
        let mut samples_written = 0u64;

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {}
            }
            let at = started.elapsed();

            let tiles = collect_tiles(
                &self.local_id,
                self.local.borrow().as_ref(),
                &self.remotes.borrow(),
            );
            self.compositor.compose(&tiles);
            let canvas = self.compositor.canvas();
            self.video.push_frame(VideoFrame::new(
                canvas.width(),
                canvas.height(),
                canvas.as_raw().clone(),
            ));
            match self.encoder.write_frame(at, canvas) {
                Ok(()) => frames += 1,
                Err(e) => log::warn!("dropping recording frame: {e}"),
            }

            // mix exactly as much audio as time has passed
            self.mixer.poll();
            let due = (at.as_secs_f64() * self.mixer.sample_rate() as f64) as u64;
            let len = due.saturating_sub(samples_written) as usize;
            if len > 0 {
                let chunk = self.mixer.mix(len);
                samples_written += len as u64;
                self.audio.push_samples(chunk.clone());
                if let Err(e) = self.encoder.write_audio(at, &chunk) {
                    log::warn!("dropping recording audio: {e}");
                }
            }
        }

        let duration = started.elapsed();
        let mime_type = self.encoder.mime_type().to_string();
        let data = self.encoder.finish()?;
        log::debug!(
            "recording finished: {frames} frames, {} bytes",
            data.len()
        );
        Ok(Recording {
            data,
            mime_type,
            duration,
            frames,
        })
    }
}

/// Uploads `recording` into `folder` and stores its url on `call`.
/// On failure nothing is stored and the recording is dropped.
pub async fn publish(
    recording: Recording,
    call: &CallSession,
    authority: &dyn UploadAuthority,
    host: &dyn MediaHost,
    directory: &dyn CallDirectory,
    folder: &str,
) -> Result<CallSession, Error> {
    let authorization = authority.get_upload_authorization().await?;
    let request = UploadRequest::new(recording.data, recording.mime_type, folder, authorization);
    let url = host.upload(request).await?;
    log::info!("recording of {} uploaded to {url}", call.id);
    directory
        .save_recording(RecordingRecord::for_call(call, url))
        .await
}
