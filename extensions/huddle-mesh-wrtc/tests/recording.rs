mod common;

use std::time::Duration;

use huddle::call::{CallDirectory, CallEvent, CallType};
use huddle::error::Error;
use huddle_mesh_wrtc::config::{Config, RecorderConfig};
use huddle_mesh_wrtc::media::synthetic::SyntheticDevices;
use tokio::test as async_test;

use common::{next_matching, wait_for_media, Harness};

fn small_recordings() -> Config {
    let mut config = Config::minimal();
    config.recorder = RecorderConfig {
        width: 160,
        height: 90,
        fps: 10,
        sample_rate: 8000,
        ..Default::default()
    };
    config
}

#[async_test]
async fn recording_is_uploaded_and_linked_to_the_call() -> anyhow::Result<()> {
    let harness = Harness::with_config(small_recordings());
    let call_id = harness.create_call("a", &["b"], CallType::Video).await?;
    let (a, mut a_events) = harness.joined(&call_id, "a", SyntheticDevices::new()).await?;
    let (b, mut b_events) = harness.joined(&call_id, "b", SyntheticDevices::new()).await?;
    wait_for_media(&a, "b", true).await?;

    a.start_recording().await?;
    assert!(matches!(a.start_recording().await, Err(Error::RecordingInProgress)));
    next_matching(&mut b_events, |e| matches!(e, CallEvent::RecordingStarted)).await?;
    assert!(a.media_state().await?.recording);
    assert!(!b.media_state().await?.recording);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let url = a.stop_recording().await?;
    assert_eq!(
        next_matching(&mut a_events, |e| matches!(e, CallEvent::RecordingSaved { .. })).await?,
        CallEvent::RecordingSaved { url: url.clone() }
    );
    assert!(harness.relay.uploaded(&url).map_or(false, |data| !data.is_empty()));

    let recordings = harness.relay.recordings();
    assert_eq!(recordings.len(), 1);
    assert_eq!(recordings[0].call_id, call_id);
    assert_eq!(recordings[0].recording_url, url);
    assert_eq!(recordings[0].participant_ids.len(), 2);

    let call = harness.relay.get_by_id(&call_id).await?.expect("call");
    assert_eq!(call.recording_url.as_deref(), Some(url.as_str()));
    assert!(!call.is_recording);
    assert!(matches!(a.stop_recording().await, Err(Error::RecordingNotActive)));
    Ok(())
}

#[async_test]
async fn failed_upload_clears_the_recording_flag() -> anyhow::Result<()> {
    let harness = Harness::with_config(small_recordings());
    let call_id = harness.create_call("a", &["b"], CallType::Audio).await?;
    let (a, mut a_events) = harness.joined(&call_id, "a", SyntheticDevices::new()).await?;
    let (_b, _b_events) = harness.joined(&call_id, "b", SyntheticDevices::new()).await?;
    wait_for_media(&a, "b", false).await?;

    a.start_recording().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.relay.fail_uploads(true);

    assert!(matches!(a.stop_recording().await, Err(Error::Upload(_))));
    next_matching(&mut a_events, |e| matches!(e, CallEvent::RecordingFailed { .. })).await?;
    let call = harness.relay.get_by_id(&call_id).await?.expect("call");
    assert!(!call.is_recording);
    assert!(call.recording_url.is_none());
    assert!(harness.relay.recordings().is_empty());
    assert_eq!(harness.relay.upload_count(), 0);
    Ok(())
}

#[async_test]
async fn leaving_saves_a_running_recording() -> anyhow::Result<()> {
    let harness = Harness::with_config(small_recordings());
    let call_id = harness.create_call("a", &["b"], CallType::Audio).await?;
    let (a, mut a_events) = harness.joined(&call_id, "a", SyntheticDevices::new()).await?;
    next_matching(&mut a_events, |e| matches!(e, CallEvent::StatusChanged { .. })).await?;

    a.start_recording().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    a.leave().await?;

    next_matching(&mut a_events, |e| matches!(e, CallEvent::RecordingSaved { .. })).await?;
    next_matching(&mut a_events, |e| matches!(e, CallEvent::Left { .. })).await?;
    assert_eq!(harness.relay.recordings().len(), 1);
    Ok(())
}
