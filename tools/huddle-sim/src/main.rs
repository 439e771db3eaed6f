use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use futures::StreamExt;
use huddle::call::{CallDirectory, CallType, CreateCall, Participant};
use huddle_mesh_wrtc::config::Config;
use huddle_mesh_wrtc::media::synthetic::{AudioPattern, SyntheticDevices};
use huddle_mesh_wrtc::transport::loopback::LoopbackNetwork;
use huddle_mesh_wrtc::{CallController, CallServices};
use huddle_relay_memory::MemoryRelay;
use tracing_subscriber::EnvFilter;

const NAMES: [&str; 8] = ["Ada", "Bea", "Cy", "Dee", "Eli", "Fay", "Gus", "Hal"];

const COLORS: [[u8; 4]; 8] = [
    [200, 40, 40, 255],
    [40, 200, 40, 255],
    [40, 40, 200, 255],
    [200, 200, 40, 255],
    [200, 40, 200, 255],
    [40, 200, 200, 255],
    [120, 120, 120, 255],
    [250, 140, 0, 255],
];

/// Runs a mesh call between synthetic participants in one process
#[derive(Debug, Parser)]
#[clap(name = "huddle-sim")]
struct Opt {
    /// Number of participants, the first one hosts
    #[clap(default_value_t = 3)]
    participants: usize,

    /// Seconds to keep the call up
    #[clap(long, default_value_t = 5)]
    duration: u64,

    /// Start a video call instead of an audio call
    #[clap(long)]
    video: bool,

    /// Record the call from the host and upload it to the memory relay
    #[clap(long)]
    record: bool,

    /// Let the second participant share their screen halfway through
    #[clap(long)]
    share: bool,

    /// End the call for everyone instead of letting participants leave one by one
    #[clap(long)]
    end_for_all: bool,

    /// Path to a json call configuration
    #[clap(long)]
    config: Option<PathBuf>,
}

struct Member {
    participant: Participant,
    controller: CallController,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opt = Opt::parse();
    if opt.participants < 2 || opt.participants > NAMES.len() {
        bail!("participants must be between 2 and {}", NAMES.len());
    }

    let config = match &opt.config {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            Config::from_json(&json)?
        }
        None => Config::minimal(),
    };

    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let people = NAMES
        .iter()
        .take(opt.participants)
        .map(|name| Participant::new(name.to_lowercase(), *name))
        .collect::<Vec<_>>();

    let call = relay
        .create(CreateCall {
            participants: people[1..].to_vec(),
            call_type: if opt.video {
                CallType::Video
            } else {
                CallType::Audio
            },
            created_by: people[0].clone(),
            chat_id: None,
        })
        .await?;
    tracing::info!("created {} call {}", call.call_type, call.id);

    let mut members = vec![];
    for (index, participant) in people.iter().enumerate() {
        // one talker keeps the active speaker stable
        let audio = if index == 1 {
            AudioPattern::Noise { amplitude: 0.5 }
        } else {
            AudioPattern::Silence
        };
        let devices = SyntheticDevices::new()
            .with_audio(audio)
            .with_camera_color(COLORS[index % COLORS.len()]);
        let services = CallServices {
            directory: Arc::new(relay.clone()),
            signaling: Arc::new(relay.clone()),
            uploads: Arc::new(relay.clone()),
            host: Arc::new(relay.clone()),
            devices: Arc::new(devices),
            transports: Arc::new(network.clone()),
        };
        let controller =
            CallController::new(&call.id, participant.clone(), services, config.clone());
        spawn_printer(participant.name.clone(), &controller);
        controller.join().await?;
        members.push(Member {
            participant: participant.clone(),
            controller,
        });
    }

    let host = &members[0].controller;
    while host.is_running() && host.call().await.is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if opt.record {
        host.start_recording().await?;
    }

    let half = Duration::from_secs(opt.duration) / 2;
    if wait_or_interrupt(half).await? {
        if opt.share {
            members[1].controller.start_screen_share().await?;
        }
        wait_or_interrupt(half).await?;
    }

    for member in &members {
        let state = member.controller.media_state().await?;
        tracing::info!(
            "{}: {} remote streams, speaker {:?}, audio {}, camera {}, sharing {}",
            member.participant.name,
            member.controller.remote_streams().len(),
            member.controller.active_speaker(),
            state.audio_on,
            state.camera_on,
            state.screen_sharing,
        );
    }

    if opt.record {
        match members[0].controller.stop_recording().await {
            Ok(url) => {
                let size = relay.uploaded(&url).map_or(0, |data| data.len());
                tracing::info!("recording saved to {url} ({size} bytes)");
            }
            Err(e) => tracing::error!("recording failed: {e}"),
        }
    }

    if opt.end_for_all {
        members[0].controller.end_call().await?;
    } else {
        for member in members.iter().rev() {
            member.controller.leave().await?;
        }
    }

    // let the last snapshots reach the printers
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Some(ended) = relay.get_by_id(&call.id).await? {
        tracing::info!(
            "call {} finished as {} after {}s",
            ended.id,
            ended.status,
            ended.duration.unwrap_or_default()
        );
    }
    Ok(())
}

fn spawn_printer(name: String, controller: &CallController) {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            tracing::info!("[{name}] {event}");
        }
    });
}

/// Sleeps for `duration`. Returns `false` when interrupted with ctrl-c.
async fn wait_or_interrupt(duration: Duration) -> anyhow::Result<bool> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(true),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupted");
            Ok(false)
        }
    }
}
