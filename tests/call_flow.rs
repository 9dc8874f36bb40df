mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{call, call_with, drive_until, settle, ScriptedFactory};
use nabha_lib::events::CallEvent;
use nabha_lib::peer::state::{ConnectionStatus, Role};
use nabha_lib::peer::types::{IceCandidate, PeerState, SessionDescription, TransportEvent};
use nabha_lib::signaling::{SignalBody, SignalChannel, SignalMessage};
use nabha_lib::{CallState, Error, TrackKind};
use tokio::sync::broadcast;

fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

const IDLE: Duration = Duration::from_millis(30);

/// Connect both sides and let every trickled candidate land
async fn connect(c: &mut common::Call) {
    c.patient.join().unwrap();
    c.doctor.start_call().await.unwrap();
    drive_until(&mut c.doctor, &mut c.patient, both_connected).await;
    for _ in 0..2 {
        settle(&mut c.doctor, IDLE).await;
        settle(&mut c.patient, IDLE).await;
    }
}

fn both_connected(a: &common::TestNegotiator, b: &common::TestNegotiator) -> bool {
    a.state() == CallState::Connected && b.state() == CallState::Connected
}

#[tokio::test]
async fn offer_answer_reaches_connected() {
    let mut c = call();
    let mut doctor_events = c.doctor.events();
    let doctor_status = c.doctor.status();

    c.patient.join().unwrap();
    c.doctor.start_call().await.unwrap();
    assert_eq!(c.doctor.state(), CallState::AwaitingAnswer);

    drive_until(&mut c.doctor, &mut c.patient, both_connected).await;

    assert_eq!(c.doctor.role(), Some(Role::Initiator));
    assert_eq!(c.patient.role(), Some(Role::Responder));

    let doctor_log = c.doctor_factory.log();
    let patient_log = c.patient_factory.log();
    assert!(matches!(
        doctor_log.remote_description,
        Some(SessionDescription { ref sdp, .. }) if sdp.contains("scripted answer")
    ));
    assert!(patient_log
        .remote_description
        .as_ref()
        .is_some_and(|d| d.sdp.contains("scripted offer")));
    assert_eq!(doctor_log.attached_tracks, 2);
    assert_eq!(patient_log.attached_tracks, 2);

    let status = doctor_status.borrow().clone();
    assert_eq!(status.connection, ConnectionStatus::Connected);
    assert!(status.audio_enabled && status.video_enabled);
    assert!(drain(&mut doctor_events).contains(&CallEvent::Connected));
}

#[tokio::test]
async fn each_signal_is_applied_once_when_clears_fail() {
    let mut c = call();
    c.channel.set_fail_clears(true);

    c.patient.join().unwrap();
    c.doctor.start_call().await.unwrap();
    drive_until(&mut c.doctor, &mut c.patient, both_connected).await;

    // keep poking: consumed messages are still in the channel
    for _ in 0..3 {
        c.channel.poke(&c.session.id);
        settle(&mut c.doctor, IDLE).await;
        settle(&mut c.patient, IDLE).await;
    }

    assert!(!c.channel.pending(&c.session.id).is_empty());
    assert_eq!(c.patient_factory.log().set_remote_calls, 1);
    assert_eq!(c.doctor_factory.log().set_remote_calls, 1);
    assert_eq!(c.patient_factory.log().applied_candidates.len(), 1);
    assert_eq!(c.doctor_factory.log().applied_candidates.len(), 1);
}

#[tokio::test]
async fn early_candidates_are_buffered_then_applied() {
    let mut c = call();
    c.patient.join().unwrap();

    let early = IceCandidate::host("candidate:early 1 udp 2130706431 10.0.0.9 40000 typ host");
    c.channel
        .send(
            &c.session.id,
            &SignalMessage::new("doctor-1", "patient-1", SignalBody::IceCandidate(early.clone())),
        )
        .await
        .unwrap();

    settle(&mut c.patient, Duration::from_millis(50)).await;
    assert_eq!(c.patient.buffered_candidates(), 1);
    assert_eq!(c.patient_factory.created(), 0);

    c.doctor.start_call().await.unwrap();
    drive_until(&mut c.doctor, &mut c.patient, both_connected).await;
    settle(&mut c.doctor, IDLE).await;
    settle(&mut c.patient, IDLE).await;

    let applied = c.patient_factory.log().applied_candidates;
    assert_eq!(applied.first(), Some(&early));
    assert_eq!(applied.len(), 2);
    assert_eq!(c.patient.buffered_candidates(), 0);
}

#[tokio::test]
async fn end_call_from_idle_closes() {
    let mut c = call();
    let summary = c.doctor.end_call().await;

    assert_eq!(c.doctor.state(), CallState::Closed);
    assert!(!summary.was_connected);
    assert_eq!(summary.connected_for, Duration::ZERO);
    assert_eq!(c.doctor_devices.live_tracks(), 0);
}

#[tokio::test]
async fn end_call_while_awaiting_answer_releases_everything() {
    let mut c = call();
    c.doctor.start_call().await.unwrap();
    assert_eq!(c.doctor_devices.live_tracks(), 2);
    assert!(c.doctor.is_subscribed());

    c.doctor.end_call().await;

    assert_eq!(c.doctor.state(), CallState::Closed);
    assert_eq!(c.doctor_devices.live_tracks(), 0);
    assert!(c.doctor_factory.log().closed);
    assert!(!c.doctor.is_subscribed());
    assert!(c.doctor.local_stream().is_none());
}

#[tokio::test]
async fn end_call_when_connected_is_idempotent() {
    let mut c = call();
    let mut events = c.patient.events();
    connect(&mut c).await;

    let first = c.patient.end_call().await;
    let second = c.patient.end_call().await;

    assert!(first.was_connected);
    assert_eq!(first, second);
    assert_eq!(c.patient.state(), CallState::Closed);
    assert_eq!(c.patient_devices.live_tracks(), 0);
    assert_eq!(
        drain(&mut events)
            .iter()
            .filter(|e| **e == CallEvent::Disconnected)
            .count(),
        1
    );
}

#[tokio::test]
async fn media_failure_aborts_before_signaling() {
    let mut c = call();
    c.doctor_devices.deny_permission();

    let err = c.doctor.start_call().await.unwrap_err();

    assert!(matches!(err, Error::MediaAccessDenied(_)));
    assert_eq!(c.doctor.state(), CallState::Closed);
    assert_eq!(c.channel.total_sent(), 0);
    assert_eq!(c.doctor_factory.created(), 0);
    assert!(c.doctor.status().borrow().last_error.is_some());
}

#[tokio::test]
async fn malformed_offer_tears_the_call_down() {
    let mut c = call();
    c.patient.join().unwrap();
    c.channel
        .send(
            &c.session.id,
            &SignalMessage::new(
                "doctor-1",
                "patient-1",
                SignalBody::Offer(SessionDescription::offer("not an sdp")),
            ),
        )
        .await
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), c.patient.pump())
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, Error::NegotiationFailed(_)));
    assert_eq!(c.patient.state(), CallState::Closed);
    assert_eq!(c.patient_devices.live_tracks(), 0);
    assert!(c.patient_factory.log().closed);
}

#[tokio::test]
async fn offer_in_answer_slot_is_rejected() {
    let mut c = call();
    c.doctor.start_call().await.unwrap();

    let bogus = SignalMessage::new(
        "patient-1",
        "doctor-1",
        SignalBody::Answer(SessionDescription::offer("v=0\r\n")),
    );
    let err = c.doctor.handle_incoming(bogus).await.unwrap_err();

    assert!(matches!(err, Error::NegotiationFailed(_)));
    assert_eq!(c.doctor.state(), CallState::Closed);
}

#[tokio::test]
async fn unexpected_answer_is_ignored() {
    let mut c = call();
    let stray = SignalMessage::new(
        "patient-1",
        "doctor-1",
        SignalBody::Answer(SessionDescription::answer("v=0\r\n")),
    );

    c.doctor.handle_incoming(stray).await.unwrap();
    assert_eq!(c.doctor.state(), CallState::Idle);
}

#[tokio::test]
async fn failed_transport_is_terminal() {
    let mut c = call();
    connect(&mut c).await;

    assert!(c.doctor_factory.inject(TransportEvent::StateChanged(PeerState::Failed)));
    let err = c.doctor.pump().await.unwrap_err();
    assert!(matches!(err, Error::ConnectivityLost(_)));
    assert_eq!(c.doctor.state(), CallState::Closed);

    // nothing can bring it back
    c.doctor_factory
        .inject(TransportEvent::StateChanged(PeerState::Connected));
    assert!(c.doctor.pump().await.is_err());
    assert_eq!(c.doctor.state(), CallState::Closed);
    assert_eq!(c.doctor_devices.live_tracks(), 0);
}

#[tokio::test]
async fn disconnect_without_recovery_fails_after_grace() {
    let mut c = call();
    let mut events = c.doctor.events();
    connect(&mut c).await;
    drain(&mut events);

    c.doctor_factory
        .inject(TransportEvent::StateChanged(PeerState::Disconnected));
    c.doctor.pump().await.unwrap();
    assert_eq!(c.doctor.state(), CallState::Disconnected);
    assert_eq!(
        drain(&mut events),
        vec![CallEvent::ConnectionProblem, CallEvent::ConnectionRecovering]
    );

    // grace period is 100ms in the test config
    let err = tokio::time::timeout(Duration::from_secs(2), c.doctor.pump())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::ConnectivityLost(_)));
    assert_eq!(c.doctor.state(), CallState::Closed);
    assert!(matches!(
        drain(&mut events).as_slice(),
        [CallEvent::ConnectionFailed { .. }]
    ));
}

#[tokio::test]
async fn recovery_inside_grace_keeps_the_call() {
    let mut c = call();
    let mut events = c.doctor.events();
    connect(&mut c).await;
    drain(&mut events);

    c.doctor_factory
        .inject(TransportEvent::StateChanged(PeerState::Disconnected));
    c.doctor_factory
        .inject(TransportEvent::StateChanged(PeerState::Connected));
    c.doctor.pump().await.unwrap();
    c.doctor.pump().await.unwrap();

    assert_eq!(c.doctor.state(), CallState::Connected);
    assert!(drain(&mut events).contains(&CallEvent::ConnectionRecovered));

    // the grace timer is gone
    settle(&mut c.doctor, Duration::from_millis(250)).await;
    assert_eq!(c.doctor.state(), CallState::Connected);
}

#[tokio::test]
async fn first_connect_after_a_blip_is_not_a_recovery() {
    let mut c = call_with(
        ScriptedFactory::new("doctor").manual_connect(),
        ScriptedFactory::new("patient").manual_connect(),
    );
    let mut events = c.doctor.events();
    c.patient.join().unwrap();
    c.doctor.start_call().await.unwrap();
    drive_until(&mut c.doctor, &mut c.patient, |a, _| {
        a.state() == CallState::Connecting
    })
    .await;
    drain(&mut events);

    c.doctor_factory
        .inject(TransportEvent::StateChanged(PeerState::Disconnected));
    c.doctor.pump_until(CallState::Disconnected).await.unwrap();
    c.doctor_factory
        .inject(TransportEvent::StateChanged(PeerState::Connected));
    c.doctor.pump_until(CallState::Connected).await.unwrap();

    let seen = drain(&mut events);
    assert!(seen.contains(&CallEvent::Connected));
    assert!(!seen.contains(&CallEvent::ConnectionRecovered));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let summary = c.doctor.end_call().await;
    assert!(summary.was_connected);
    assert!(summary.connected_for >= Duration::from_millis(20));
}

#[tokio::test]
async fn toggle_track_follows_call_state() {
    let mut c = call();
    assert!(matches!(
        c.doctor.toggle_track(TrackKind::Video),
        Err(Error::InvalidState(_))
    ));

    c.doctor.start_call().await.unwrap();
    let status = c.doctor.status();
    assert!(!c.doctor.toggle_track(TrackKind::Video).unwrap());
    assert!(!status.borrow().video_enabled);
    assert!(status.borrow().audio_enabled);
    assert!(c.doctor.toggle_track(TrackKind::Video).unwrap());
    assert!(status.borrow().video_enabled);

    c.doctor.end_call().await;
    assert!(matches!(
        c.doctor.toggle_track(TrackKind::Audio),
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn unreachable_channel_aborts_after_retries() {
    let mut c = call();
    c.channel.set_available(false);

    // join itself only subscribes; the offer write is what fails
    let err = c.doctor.start_call().await.unwrap_err();

    assert!(matches!(err, Error::ChannelWrite(_)));
    assert_eq!(c.doctor.state(), CallState::Closed);
    assert_eq!(c.doctor_devices.live_tracks(), 0);
    assert!(c.doctor_factory.log().closed);
}

#[tokio::test]
async fn start_call_twice_is_rejected() {
    let mut c = call();
    c.doctor.start_call().await.unwrap();
    assert!(matches!(
        c.doctor.start_call().await,
        Err(Error::InvalidState(_))
    ));
    assert_eq!(c.doctor.state(), CallState::AwaitingAnswer);
}

#[tokio::test]
async fn remote_hangup_closes_without_failure() {
    let mut c = call_with(
        ScriptedFactory::new("doctor"),
        ScriptedFactory::new("patient").manual_connect(),
    );
    c.patient.join().unwrap();
    c.doctor.start_call().await.unwrap();
    drive_until(&mut c.doctor, &mut c.patient, |_, p| {
        p.state() == CallState::Connecting
    })
    .await;
    settle(&mut c.patient, IDLE).await;

    c.patient_factory
        .inject(TransportEvent::StateChanged(PeerState::Closed));
    c.patient.pump().await.unwrap();
    assert_eq!(c.patient.state(), CallState::Closed);
    assert!(c.patient.status().borrow().last_error.is_none());
}

/// Full webrtc-rs loopback over host candidates. Needs working UDP on the
/// test machine.
#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn webrtc_loopback_call_connects() {
    use nabha_lib::peer::RtcTransportFactory;
    use nabha_lib::{MemorySignalChannel, Negotiator, NegotiatorConfig, Session, SyntheticDevices};

    let session = Session::generate("doctor-rtc", "patient-rtc").unwrap();
    let channel = Arc::new(MemorySignalChannel::new());
    let factory = RtcTransportFactory::with_servers(Vec::new());

    let mut doctor = Negotiator::new(
        session.clone(),
        "doctor-rtc",
        Arc::clone(&channel),
        factory.clone(),
        SyntheticDevices::new(),
        NegotiatorConfig::default(),
    )
    .unwrap();
    let mut patient = Negotiator::new(
        session.clone(),
        "patient-rtc",
        channel,
        factory,
        SyntheticDevices::new(),
        NegotiatorConfig::default(),
    )
    .unwrap();

    patient.join().unwrap();
    doctor.start_call().await.unwrap();

    let doctor_task = tokio::spawn(async move {
        doctor.pump_until(CallState::Connected).await?;
        Ok::<_, Error>(doctor)
    });
    let patient_task = tokio::spawn(async move {
        patient.pump_until(CallState::Connected).await?;
        Ok::<_, Error>(patient)
    });

    let (doctor, patient) = tokio::time::timeout(Duration::from_secs(20), async {
        (doctor_task.await, patient_task.await)
    })
    .await
    .expect("loopback call did not connect in time");

    let mut doctor = doctor.unwrap().unwrap();
    let mut patient = patient.unwrap().unwrap();
    assert!(doctor.end_call().await.was_connected);
    assert!(patient.end_call().await.was_connected);
}
