#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use futures::StreamExt;
use huddle::call::{CallDirectory, CallEvent, CallEventStream, CallType, CreateCall, Participant};
use huddle::media::{MediaStream, TrackKind};
use huddle_mesh_wrtc::config::Config;
use huddle_mesh_wrtc::media::synthetic::SyntheticDevices;
use huddle_mesh_wrtc::transport::loopback::LoopbackNetwork;
use huddle_mesh_wrtc::{CallController, CallServices};
use huddle_relay_memory::MemoryRelay;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn participant(id: &str) -> Participant {
    let name = match id {
        "a" => "Ada",
        "b" => "Bea",
        "c" => "Cy",
        "d" => "Dee",
        other => other,
    };
    Participant::new(id, name)
}

/// One relay and one loopback network shared by every participant
pub struct Harness {
    pub relay: MemoryRelay,
    pub network: LoopbackNetwork,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::minimal())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
            config,
        }
    }

    pub fn services(&self, devices: SyntheticDevices) -> CallServices {
        CallServices {
            directory: Arc::new(self.relay.clone()),
            signaling: Arc::new(self.relay.clone()),
            uploads: Arc::new(self.relay.clone()),
            host: Arc::new(self.relay.clone()),
            devices: Arc::new(devices),
            transports: Arc::new(self.network.clone()),
        }
    }

    /// Creates a call hosted by `host` with `others` invited
    pub async fn create_call(
        &self,
        host: &str,
        others: &[&str],
        call_type: CallType,
    ) -> anyhow::Result<String> {
        let call = self
            .relay
            .create(CreateCall {
                participants: others.iter().map(|id| participant(id)).collect(),
                call_type,
                created_by: participant(host),
                chat_id: None,
            })
            .await?;
        Ok(call.id)
    }

    pub fn controller(&self, call_id: &str, id: &str, devices: SyntheticDevices) -> CallController {
        CallController::new(call_id, participant(id), self.services(devices), self.config.clone())
    }

    /// A controller that already joined, with its event stream subscribed before joining
    pub async fn joined(
        &self,
        call_id: &str,
        id: &str,
        devices: SyntheticDevices,
    ) -> anyhow::Result<(CallController, CallEventStream)> {
        let controller = self.controller(call_id, id, devices);
        let events = controller.subscribe();
        controller.join().await?;
        Ok((controller, events))
    }
}

/// Skips events until one matches
pub async fn next_matching(
    events: &mut CallEventStream,
    matches: impl Fn(&CallEvent) -> bool,
) -> anyhow::Result<CallEvent> {
    let found = tokio::time::timeout(TIMEOUT, async {
        while let Some(event) = events.next().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await?;
    match found {
        Some(event) => Ok(event),
        None => bail!("event stream closed"),
    }
}

/// Polls `check` until it holds
pub async fn eventually<F, Fut>(mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

/// Waits until `controller` receives audio and video from `remote_id`
pub async fn wait_for_media(controller: &CallController, remote_id: &str, video: bool) -> anyhow::Result<MediaStream> {
    let mut streams = controller.remote_streams().subscribe();
    let stream = tokio::time::timeout(TIMEOUT, streams.wait_for(|map| {
        map.get(remote_id).map_or(false, |s| {
            s.has_audio() && (!video || s.video_tracks().count() > 0)
        })
    }))
    .await??
    .get(remote_id)
    .cloned();
    match stream {
        Some(stream) => Ok(stream),
        None => bail!("no stream from {remote_id}"),
    }
}

/// Waits for a frame of `rgba` on the first video track of `stream`
pub async fn wait_for_color(stream: &MediaStream, rgba: [u8; 4]) -> anyhow::Result<()> {
    let Some(track) = stream.video_tracks().next().cloned() else {
        bail!("stream has no video");
    };
    assert_eq!(track.kind(), TrackKind::Video);
    let mut frames = track.subscribe_frames();
    tokio::time::timeout(
        TIMEOUT,
        frames.wait_for(|frame| {
            frame
                .as_ref()
                .map_or(false, |f| !f.is_empty() && f.data.get(..4) == Some(&rgba[..]))
        }),
    )
    .await??;
    Ok(())
}

/// Waits for a non-silent chunk on the first audio track of `stream`
pub async fn wait_for_sound(stream: &MediaStream) -> anyhow::Result<()> {
    let Some(track) = stream.audio_tracks().next().cloned() else {
        bail!("stream has no audio");
    };
    let mut samples = track.subscribe_samples();
    tokio::time::timeout(
        TIMEOUT,
        samples.wait_for(|chunk| {
            chunk
                .as_ref()
                .map_or(false, |c| c.samples.iter().any(|s| s.abs() > 0.01))
        }),
    )
    .await??;
    Ok(())
}
