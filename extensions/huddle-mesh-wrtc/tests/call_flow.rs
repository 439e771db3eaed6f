mod common;

use std::time::Duration;

use futures::StreamExt;
use huddle::call::{CallDirectory, CallEvent, CallStatus, CallType, LeaveReason};
use huddle::signaling::{SessionKey, SignalingStore};
use huddle_mesh_wrtc::config::MediaAcquisition;
use huddle_mesh_wrtc::media::synthetic::SyntheticDevices;
use tokio::test as async_test;

use common::{eventually, next_matching, wait_for_color, wait_for_media, wait_for_sound, Harness};

const CAMERA_A: [u8; 4] = [200, 40, 40, 255];
const CAMERA_B: [u8; 4] = [40, 200, 40, 255];

#[async_test]
async fn two_participants_exchange_media() -> anyhow::Result<()> {
    let harness = Harness::new();
    let call_id = harness.create_call("a", &["b"], CallType::Video).await?;

    let (a, mut a_events) = harness
        .joined(&call_id, "a", SyntheticDevices::new().with_camera_color(CAMERA_A))
        .await?;
    next_matching(&mut a_events, |e| matches!(e, CallEvent::Joined { .. })).await?;
    let pending = harness.relay.get_by_id(&call_id).await?.expect("call");
    assert_eq!(pending.status, CallStatus::Pending);

    let (b, _b_events) = harness
        .joined(&call_id, "b", SyntheticDevices::new().with_camera_color(CAMERA_B))
        .await?;
    next_matching(&mut a_events, |e| {
        matches!(e, CallEvent::StatusChanged { status: CallStatus::Answered })
    })
    .await?;

    let from_b = wait_for_media(&a, "b", true).await?;
    let from_a = wait_for_media(&b, "a", true).await?;
    wait_for_color(&from_b, CAMERA_B).await?;
    wait_for_color(&from_a, CAMERA_A).await?;
    wait_for_sound(&from_a).await?;

    let call = harness.relay.get_by_id(&call_id).await?.expect("call");
    assert!(call.answered_at.is_some());
    assert_eq!(call.active_participant_ids.len(), 2);

    // exactly one offer and one answer for the pair
    let key = SessionKey::new(&call_id, "a", "b");
    assert_eq!(harness.relay.signal_writes(&key), 2);

    b.leave().await?;
    next_matching(&mut a_events, |e| match e {
        CallEvent::RosterChanged {
            active_participant_ids,
            ..
        } => active_participant_ids == &vec!["a".to_string()],
        _ => false,
    })
    .await?;
    assert_eq!(
        harness.relay.get_by_id(&call_id).await?.map(|c| c.status),
        Some(CallStatus::Answered)
    );

    a.leave().await?;
    next_matching(&mut a_events, |e| {
        matches!(e, CallEvent::Left { reason: LeaveReason::Left })
    })
    .await?;
    let ended = harness.relay.get_by_id(&call_id).await?.expect("call");
    assert_eq!(ended.status, CallStatus::Ended);
    assert!(ended.duration.is_some());
    Ok(())
}

#[async_test]
async fn muting_is_local_only() -> anyhow::Result<()> {
    let harness = Harness::new();
    let call_id = harness.create_call("a", &["b"], CallType::Video).await?;
    let (a, _a_events) = harness.joined(&call_id, "a", SyntheticDevices::new()).await?;
    let (b, _b_events) = harness.joined(&call_id, "b", SyntheticDevices::new()).await?;
    let from_a = wait_for_media(&b, "a", true).await?;
    wait_for_sound(&from_a).await?;

    assert!(!a.toggle_audio().await?);
    let local = a.local_stream().expect("local stream");
    assert!(local.audio_tracks().all(|t| !t.is_enabled()));

    // the remote track keeps its flag and goes quiet
    let remote_audio = from_a.audio_tracks().next().cloned().expect("audio");
    assert!(remote_audio.is_enabled());
    let mut samples = remote_audio.subscribe_samples();
    samples.borrow_and_update();
    let mut quiet = false;
    for _ in 0..10 {
        samples.changed().await?;
        if samples
            .borrow_and_update()
            .as_ref()
            .map_or(false, |c| c.samples.iter().all(|s| *s == 0.0))
        {
            quiet = true;
            break;
        }
    }
    assert!(quiet);
    assert!(b.media_state().await?.audio_on);

    assert!(a.toggle_audio().await?);
    wait_for_sound(&from_a).await?;
    Ok(())
}

#[async_test]
async fn leaving_removes_only_own_pair_sessions() -> anyhow::Result<()> {
    let harness = Harness::new();
    let call_id = harness.create_call("a", &["b", "c"], CallType::Audio).await?;
    let (a, _a_events) = harness.joined(&call_id, "a", SyntheticDevices::new()).await?;
    let (b, _b_events) = harness.joined(&call_id, "b", SyntheticDevices::new()).await?;
    let (c, _c_events) = harness.joined(&call_id, "c", SyntheticDevices::new()).await?;
    wait_for_media(&a, "b", false).await?;
    wait_for_media(&a, "c", false).await?;
    wait_for_media(&b, "c", false).await?;

    c.leave().await?;
    let relay = harness.relay.clone();
    let cid = call_id.clone();
    eventually(move || {
        let relay = relay.clone();
        let cid = cid.clone();
        async move {
            relay
                .read_session(&SessionKey::new(&cid, "a", "c"))
                .await
                .map_or(false, |r| r.map_or(true, |r| r.offer.is_none() || r.answer.is_none()))
        }
    })
    .await?;
    let untouched = harness
        .relay
        .read_session(&SessionKey::new(&call_id, "a", "b"))
        .await?
        .expect("a-b record");
    assert!(untouched.offer.is_some() && untouched.answer.is_some());

    // a and b keep talking
    let from_b = wait_for_media(&a, "b", false).await?;
    wait_for_sound(&from_b).await?;
    let call = harness.relay.get_by_id(&call_id).await?.expect("call");
    assert_eq!(call.status, CallStatus::Answered);
    assert!(!call.is_active("c"));
    assert!(b.is_running());
    Ok(())
}

#[async_test]
async fn leaving_twice_tears_down_once() -> anyhow::Result<()> {
    let harness = Harness::new();
    let call_id = harness.create_call("a", &["b"], CallType::Audio).await?;
    let (a, mut a_events) = harness.joined(&call_id, "a", SyntheticDevices::new()).await?;
    let (b, _b_events) = harness.joined(&call_id, "b", SyntheticDevices::new()).await?;
    wait_for_media(&a, "b", false).await?;

    let (first, second) = tokio::join!(a.leave(), a.leave());
    first?;
    second?;
    a.end_call().await?;

    let mut lefts = 0;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), a_events.next()).await
    {
        if matches!(event, CallEvent::Left { .. }) {
            lefts += 1;
        }
    }
    assert_eq!(lefts, 1);
    assert!(!a.is_running());
    assert!(a.local_stream().is_none());

    // leaving did not end the call for b
    let call = harness.relay.get_by_id(&call_id).await?.expect("call");
    assert_eq!(call.status, CallStatus::Answered);
    assert!(b.is_running());
    Ok(())
}

#[async_test]
async fn ending_for_all_closes_every_session() -> anyhow::Result<()> {
    let harness = Harness::new();
    let call_id = harness.create_call("a", &["b"], CallType::Audio).await?;
    let (a, _a_events) = harness.joined(&call_id, "a", SyntheticDevices::new()).await?;
    let (b, mut b_events) = harness.joined(&call_id, "b", SyntheticDevices::new()).await?;
    wait_for_media(&b, "a", false).await?;

    a.end_call().await?;
    next_matching(&mut b_events, |e| {
        matches!(
            e,
            CallEvent::Left {
                reason: LeaveReason::CallFinished(CallStatus::Ended)
            }
        )
    })
    .await?;
    eventually(|| async { !b.is_running() }).await?;
    assert!(b.local_stream().is_none());
    Ok(())
}

#[async_test]
async fn media_waits_for_the_answer_when_configured() -> anyhow::Result<()> {
    let mut config = huddle_mesh_wrtc::config::Config::minimal();
    config.media_acquisition = MediaAcquisition::OnAnswer;
    let harness = Harness::with_config(config);
    let call_id = harness.create_call("a", &["b"], CallType::Video).await?;

    let (a, mut a_events) = harness.joined(&call_id, "a", SyntheticDevices::new()).await?;
    assert!(a.local_stream().is_none());

    let (b, _b_events) = harness.joined(&call_id, "b", SyntheticDevices::new()).await?;
    next_matching(&mut a_events, |e| {
        matches!(e, CallEvent::StatusChanged { status: CallStatus::Answered })
    })
    .await?;
    eventually(|| async { a.local_stream().is_some() }).await?;
    wait_for_media(&a, "b", true).await?;
    wait_for_media(&b, "a", true).await?;
    Ok(())
}
