mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use huddle::error::Error;
use huddle::media::{MediaTrack, TrackKind, TrackSource, VideoFrame};
use huddle::signaling::screen::{ScreenRole, ScreenSessionStore};
use huddle_mesh_wrtc::config::Config;
use huddle_mesh_wrtc::transport::{
    NewTransport, PeerTransport, TransportConfig, TransportEvent, TransportFactory,
};
use huddle_mesh_wrtc::{ScreenViewer, ViewerState};
use tokio::test as async_test;

use common::{wait_for_color, Harness, TIMEOUT};

const SCREEN: [u8; 4] = [10, 20, 30, 255];

/// The sharing side of a screen session, driven by hand
struct Sharer {
    session_id: String,
    transport: Arc<dyn PeerTransport>,
    _screen: Arc<MediaTrack>,
}

impl Sharer {
    async fn publish(harness: &Harness, with_candidates: bool) -> anyhow::Result<Self> {
        let NewTransport {
            transport,
            mut events,
        } = harness.network.create(&TransportConfig::default()).await?;
        let screen = MediaTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        screen.push_frame(VideoFrame::solid(32, 18, SCREEN));
        transport.add_track(screen.clone()).await?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;

        let session_id = harness.relay.publish_screen_session("a", offer);
        while let Some(Some(event)) = events.next().now_or_never() {
            if let TransportEvent::LocalCandidate(candidate) = event {
                if with_candidates {
                    harness.relay.append_sharer_candidate(&session_id, candidate)?;
                }
            }
        }
        Ok(Self {
            session_id,
            transport,
            _screen: screen,
        })
    }

    /// Applies what the viewer wrote back
    async fn accept_viewer(&self, harness: &Harness) -> anyhow::Result<()> {
        let session = harness
            .relay
            .read_screen_session(&self.session_id)
            .await?
            .expect("session");
        self.transport
            .set_remote_description(session.answer.expect("viewer answer"))
            .await?;
        for candidate in harness
            .relay
            .screen_candidates(&self.session_id, ScreenRole::Callee)
        {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

fn quick() -> Config {
    let mut config = Config::minimal();
    config.viewer.backoff_base_ms = 10;
    config.viewer.backoff_max_ms = 20;
    config.viewer.connect_timeout_ms = 2000;
    config
}

async fn connect(harness: &Harness, session_id: &str) -> Result<ScreenViewer, Error> {
    ScreenViewer::connect(
        session_id,
        Arc::new(harness.relay.clone()),
        Arc::new(harness.network.clone()),
        &harness.config,
    )
    .await
}

#[async_test]
async fn viewer_watches_until_the_share_ends() -> anyhow::Result<()> {
    let harness = Harness::with_config(quick());
    let sharer = Sharer::publish(&harness, true).await?;

    let viewer = connect(&harness, &sharer.session_id).await?;
    assert_eq!(viewer.state(), ViewerState::Connected);
    assert!(!harness
        .relay
        .screen_candidates(&sharer.session_id, ScreenRole::Callee)
        .is_empty());

    sharer.accept_viewer(&harness).await?;
    let mut streams = viewer.subscribe_stream();
    let stream = tokio::time::timeout(TIMEOUT, streams.wait_for(|s| s.is_some()))
        .await??
        .clone()
        .expect("stream");
    wait_for_color(&stream, SCREEN).await?;

    harness.relay.end_screen_session(&sharer.session_id)?;
    let mut state = viewer.subscribe_state();
    tokio::time::timeout(TIMEOUT, state.wait_for(|s| *s == ViewerState::Ended)).await??;
    assert!(viewer.stream().is_none());
    assert!(viewer.state().is_final());
    Ok(())
}

#[async_test]
async fn viewer_retries_a_failed_connection() -> anyhow::Result<()> {
    let harness = Harness::with_config(quick());
    let sharer = Sharer::publish(&harness, true).await?;
    harness.network.fail_next_connections(1);

    let mut viewer = connect(&harness, &sharer.session_id).await?;
    assert_eq!(viewer.state(), ViewerState::Connected);

    viewer.close().await;
    assert_eq!(viewer.state(), ViewerState::Closed);
    Ok(())
}

#[async_test]
async fn viewer_gives_up_after_the_retry_limit() -> anyhow::Result<()> {
    let harness = Harness::with_config(quick());
    let sharer = Sharer::publish(&harness, true).await?;
    harness.network.fail_next_connections(100);

    let result = connect(&harness, &sharer.session_id).await;
    assert!(matches!(result, Err(Error::RetriesExhausted)));
    Ok(())
}

#[async_test]
async fn viewer_times_out_without_candidates() -> anyhow::Result<()> {
    let mut config = quick();
    config.viewer.connect_timeout_ms = 100;
    let harness = Harness::with_config(config);
    let sharer = Sharer::publish(&harness, false).await?;

    let started = tokio::time::Instant::now();
    let result = connect(&harness, &sharer.session_id).await;
    assert!(matches!(result, Err(Error::ConnectionTimeout)));
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}
