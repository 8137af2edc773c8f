use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::error::Error;
use crate::protocol::{ChannelKind, Envelope};
use crate::registry::{PeerEntry, PeerId, RegistryError, Role};
use crate::transport::mock::MockLink;
use crate::transport::{ConnectionState, ForwardError, PeerEvent};

fn quiet_config() -> SessionConfig {
    SessionConfig::default().ready_fallback(None)
}

/// Register a connected car with every channel open
async fn car(session: &SessionHandle, clock_offset: i64) -> (Arc<MockLink>, u64) {
    let link = MockLink::connected();
    let entry = PeerEntry::new(PeerId::from("car"), Role::Producer, link.clone())
        .with_clock_offset(clock_offset);
    let session_id = session.add(entry).await.unwrap();
    for channel in ChannelKind::ALL {
        session.channel_opened("car", channel).await.unwrap();
    }
    (link, session_id)
}

/// Register a connected client with every channel open
async fn client(session: &SessionHandle, id: &str) -> (Arc<MockLink>, u64) {
    let link = MockLink::connected();
    let entry = PeerEntry::new(PeerId::from(id), Role::Client, link.clone());
    let session_id = session.add(entry).await.unwrap();
    for channel in ChannelKind::ALL {
        session.channel_opened(id, channel).await.unwrap();
    }
    (link, session_id)
}

fn attach(
    session: &SessionHandle,
    id: &str,
    session_id: u64,
    role: Role,
) -> (mpsc::Sender<PeerEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let task = session.attach(PeerId::from(id), session_id, role, rx);
    (tx, task)
}

fn message(channel: ChannelKind, data: impl Into<Bytes>) -> PeerEvent {
    PeerEvent::MessageReceived {
        label: channel.label().to_string(),
        data: data.into(),
    }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_take_over_notifies_everyone() {
    let session = SessionHandle::spawn(quiet_config());
    let (car, _) = car(&session, 0).await;
    let (a, _) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;

    assert_ok!(session.take_over("A").await);

    let expected = Envelope::controller_state("A");
    assert_eq!(a.envelopes(), vec![expected.clone()]);
    assert_eq!(b.envelopes(), vec![expected.clone()]);
    assert_eq!(car.envelopes(), vec![expected]);
    assert_eq!(
        session.active_controller().await.unwrap(),
        Some(PeerId::from("A"))
    );
    assert_eq!(session.stats().control_grants, 1);
}

#[tokio::test]
async fn test_take_over_while_controlled_is_rejected() {
    let session = SessionHandle::spawn(quiet_config());
    let (a, _) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;

    assert_ok!(session.take_over("A").await);
    a.clear();
    b.clear();

    let err = session.take_over("B").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Arbitration(ArbitrationError::AlreadyControlled(ref holder)) if holder.as_str() == "A"
    ));

    // Only the requester hears about it
    assert!(a.envelopes().is_empty());
    let reply = b.envelopes();
    assert_eq!(reply.len(), 1);
    assert!(matches!(reply[0], Envelope::Error { .. }));
    assert_eq!(
        session.active_controller().await.unwrap(),
        Some(PeerId::from("A"))
    );
}

#[tokio::test]
async fn test_take_over_again_by_holder_is_granted() {
    let session = SessionHandle::spawn(quiet_config());
    let (a, _) = client(&session, "A").await;

    assert_ok!(session.take_over("A").await);
    assert_ok!(session.take_over("A").await);

    assert_eq!(
        a.envelopes(),
        vec![Envelope::controller_state("A"), Envelope::controller_state("A")]
    );
}

#[tokio::test]
async fn test_take_over_from_disconnected_holder() {
    let session = SessionHandle::spawn(quiet_config());
    let (a, _) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;

    assert_ok!(session.take_over("A").await);

    // Transport dropped without the event reaching us yet
    a.set_state(ConnectionState::Disconnected);
    assert_ok!(session.take_over("B").await);

    assert_eq!(b.envelopes().last(), Some(&Envelope::controller_state("B")));
}

#[tokio::test]
async fn test_take_over_requires_connected_client() {
    let session = SessionHandle::spawn(quiet_config());
    let (car_link, _) = car(&session, 0).await;
    let (a, _) = client(&session, "A").await;
    a.set_state(ConnectionState::Connecting);

    let err = session.take_over("A").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Arbitration(ArbitrationError::NotConnected(_))
    ));

    let err = session.take_over("car").await.unwrap_err();
    assert!(matches!(err, Error::Arbitration(ArbitrationError::NotAClient(_))));
    assert!(matches!(car_link.envelopes()[0], Envelope::Error { .. }));

    let err = session.take_over("ghost").await.unwrap_err();
    assert!(matches!(err, Error::Arbitration(ArbitrationError::UnknownPeer(_))));

    assert_eq!(session.active_controller().await.unwrap(), None);
}

#[tokio::test]
async fn test_release() {
    let session = SessionHandle::spawn(quiet_config());
    let (a, _) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;

    assert_ok!(session.take_over("A").await);
    b.clear();

    let err = session.release("B").await.unwrap_err();
    assert!(matches!(err, Error::Arbitration(ArbitrationError::NotController)));
    assert!(matches!(b.envelopes()[0], Envelope::Error { .. }));
    b.clear();

    assert_ok!(session.release("A").await);
    assert_eq!(a.envelopes().last(), Some(&Envelope::controller_state("")));
    assert_eq!(b.envelopes(), vec![Envelope::controller_state("")]);
    assert_eq!(session.active_controller().await.unwrap(), None);

    // Nothing left to release
    assert_err!(session.release("A").await);
    assert_eq!(session.stats().control_releases, 1);
}

#[tokio::test]
async fn test_concurrent_take_over_grants_exactly_one() {
    let session = SessionHandle::spawn(quiet_config());
    let (a, _) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;

    let (ra, rb) = tokio::join!(session.take_over("A"), session.take_over("B"));
    assert!(ra.is_ok() ^ rb.is_ok());

    let (winner, loser) = if ra.is_ok() { ("A", &b) } else { ("B", &a) };
    assert_eq!(
        session.active_controller().await.unwrap(),
        Some(PeerId::from(winner))
    );

    let loser_envelopes = loser.envelopes();
    assert_eq!(loser_envelopes[0], Envelope::controller_state(winner));
    assert!(matches!(loser_envelopes[1], Envelope::Error { .. }));
}

#[tokio::test]
async fn test_producer_connect_and_departure() {
    let session = SessionHandle::spawn(quiet_config());
    let (car_link, _) = car(&session, -12).await;
    let (a, _) = client(&session, "A").await;

    session
        .state_changed("car", ConnectionState::Connected)
        .await
        .unwrap();
    session
        .state_changed("car", ConnectionState::Failed)
        .await
        .unwrap();

    assert!(session.get("car").await.unwrap().is_none());
    assert_eq!(
        a.envelopes(),
        vec![
            Envelope::producer_state(true, -12),
            Envelope::producer_state(false, -12),
        ]
    );
    // The car is not told about itself
    assert!(car_link.envelopes().is_empty());
    eventually(|| car_link.is_closed()).await;
}

#[tokio::test]
async fn test_controller_departure_releases_control() {
    let session = SessionHandle::spawn(quiet_config());
    let (car_link, _) = car(&session, 0).await;
    let (a, _) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;

    assert_ok!(session.take_over("A").await);
    car_link.clear();
    b.clear();

    session
        .state_changed("A", ConnectionState::Disconnected)
        .await
        .unwrap();

    assert_eq!(session.active_controller().await.unwrap(), None);
    assert_eq!(b.envelopes(), vec![Envelope::controller_state("")]);
    assert_eq!(car_link.envelopes(), vec![Envelope::controller_state("")]);
    eventually(|| a.is_closed()).await;

    // Anyone may take over now
    assert_ok!(session.take_over("B").await);
}

#[tokio::test]
async fn test_departure_is_idempotent() {
    let session = SessionHandle::spawn(quiet_config());
    let (a, _) = client(&session, "A").await;

    assert!(session.remove("A").await.unwrap());
    assert!(!session.remove("A").await.unwrap());
    assert!(!session.remove("ghost").await.unwrap());

    // Late terminal event for an already removed peer
    session
        .state_changed("A", ConnectionState::Closed)
        .await
        .unwrap();
    assert!(session.snapshot().await.unwrap().is_empty());
    eventually(|| a.is_closed()).await;
}

#[tokio::test]
async fn test_duplicate_registration() {
    let session = SessionHandle::spawn(quiet_config());
    car(&session, 0).await;
    client(&session, "A").await;

    let second_car = PeerEntry::new(PeerId::from("car"), Role::Producer, MockLink::connected());
    let err = session.add(second_car).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Registry(RegistryError::DuplicateProducer(_))
    ));

    let second_a = PeerEntry::new(PeerId::from("A"), Role::Client, MockLink::connected());
    let err = session.add(second_a).await.unwrap_err();
    assert!(matches!(err, Error::Registry(RegistryError::DuplicatePeer(_))));

    assert_eq!(session.snapshot().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_broadcast_isolates_failing_peers() {
    let session =
        SessionHandle::spawn(quiet_config().send_timeout(Duration::from_millis(50)));
    let (a, _) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;
    let (c, _) = client(&session, "C").await;
    a.fail_sends(true);
    b.stall_sends(true);

    let report = session
        .broadcast(Envelope::controller_state(""))
        .await
        .unwrap();

    assert_eq!(report.delivered, vec![PeerId::from("C")]);
    assert_eq!(report.attempted(), 3);
    assert!(matches!(
        report.failure_for("A"),
        Some(ForwardError::Transport(_))
    ));
    assert_eq!(report.failure_for("B"), Some(&ForwardError::Timeout));
    assert_eq!(c.envelopes(), vec![Envelope::controller_state("")]);
    assert_eq!(session.stats().delivery_failures, 2);
}

#[tokio::test]
async fn test_unicast() {
    let session = SessionHandle::spawn(quiet_config());
    let (a, _) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;

    assert_ok!(session.unicast("A", Envelope::error("oops")).await);
    assert_eq!(a.envelopes(), vec![Envelope::error("oops")]);
    assert!(b.envelopes().is_empty());

    let err = session
        .unicast("ghost", Envelope::error("oops"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Registry(RegistryError::NotFound(_))));
}

#[tokio::test]
async fn test_send_before_meta_channel_opens() {
    let session = SessionHandle::spawn(quiet_config());
    let link = MockLink::connected();
    session
        .add(PeerEntry::new(PeerId::from("A"), Role::Client, link.clone()))
        .await
        .unwrap();

    let err = session
        .unicast("A", Envelope::controller_state(""))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Forward(ForwardError::ChannelNotOpen(ChannelKind::Meta))
    ));
    assert!(link.envelopes().is_empty());
}

#[tokio::test]
async fn test_ready_reports_current_state() {
    let session = SessionHandle::spawn(quiet_config());
    let (a, _) = client(&session, "A").await;

    // No car yet
    session.ready("A").await.unwrap();
    session.snapshot().await.unwrap();
    assert_eq!(a.envelopes(), vec![Envelope::producer_state(false, 0)]);
    a.clear();

    car(&session, 7).await;
    assert_ok!(session.take_over("A").await);
    a.clear();

    session.ready("A").await.unwrap();
    session.snapshot().await.unwrap();
    assert_eq!(
        a.envelopes(),
        vec![
            Envelope::producer_state(true, 7),
            Envelope::controller_state("A"),
        ]
    );
}

#[tokio::test]
async fn test_ready_fallback_after_client_connects() {
    let config = SessionConfig::default().ready_fallback(Some(Duration::from_millis(20)));
    let session = SessionHandle::spawn(config);
    car(&session, 3).await;
    let (a, _) = client(&session, "A").await;

    session
        .state_changed("A", ConnectionState::Connected)
        .await
        .unwrap();

    eventually(|| a.envelopes() == vec![Envelope::producer_state(true, 3)]).await;
}

#[tokio::test]
async fn test_ready_fallback_without_car_sends_nothing() {
    let config = SessionConfig::default().ready_fallback(Some(Duration::from_millis(10)));
    let session = SessionHandle::spawn(config);
    let (a, _) = client(&session, "A").await;

    session
        .state_changed("A", ConnectionState::Connected)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(a.envelopes().is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_every_session() {
    let session = SessionHandle::spawn(quiet_config());
    let (car_link, _) = car(&session, 0).await;
    let (a, _) = client(&session, "A").await;
    assert_ok!(session.take_over("A").await);
    a.clear();

    assert_eq!(session.shutdown().await.unwrap(), 2);
    assert!(car_link.is_closed());
    assert!(a.is_closed());
    // No departure notifications during teardown
    assert!(a.envelopes().is_empty());

    assert!(matches!(
        session.snapshot().await,
        Err(Error::SessionClosed)
    ));
}

#[tokio::test]
async fn test_zero_command_buffer_is_usable() {
    let config = SessionConfig {
        command_buffer: 0,
        ..quiet_config()
    };
    let session = SessionHandle::spawn(config);

    client(&session, "A").await;
    assert_eq!(session.snapshot().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_router_relays_frames_to_clients() {
    let session = SessionHandle::spawn(quiet_config());
    let (_, car_session) = car(&session, 0).await;
    let (a, _) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;

    let (events, _task) = attach(&session, "car", car_session, Role::Producer);
    events
        .send(message(ChannelKind::Frame, &b"\x00\x01frame"[..]))
        .await
        .unwrap();

    eventually(|| !a.sent_on(ChannelKind::Frame).is_empty()).await;
    eventually(|| !b.sent_on(ChannelKind::Frame).is_empty()).await;
    assert_eq!(a.sent_on(ChannelKind::Frame), vec![Bytes::from_static(b"\x00\x01frame")]);
    assert!(a.envelopes().is_empty());

    let stats = session.stats();
    assert_eq!(stats.frames_relayed, 1);
    assert_eq!(stats.frame_bytes_relayed, 14);
}

#[tokio::test]
async fn test_router_forwards_control_to_car() {
    let session = SessionHandle::spawn(quiet_config());
    let (car_link, _) = car(&session, 0).await;
    let (_, a_session) = client(&session, "A").await;

    let (events, _task) = attach(&session, "A", a_session, Role::Client);
    events
        .send(message(ChannelKind::Control, &b"steer:0.5"[..]))
        .await
        .unwrap();

    eventually(|| !car_link.sent_on(ChannelKind::Control).is_empty()).await;
    assert_eq!(
        car_link.sent_on(ChannelKind::Control),
        vec![Bytes::from_static(b"steer:0.5")]
    );
    eventually(|| session.stats().control_forwarded == 1).await;
}

#[tokio::test]
async fn test_router_control_requires_grant_when_configured() {
    let session = SessionHandle::spawn(quiet_config().require_control_grant(true));
    let (car_link, _) = car(&session, 0).await;
    let (_, a_session) = client(&session, "A").await;
    let (_, b_session) = client(&session, "B").await;
    assert_ok!(session.take_over("A").await);

    let (b_events, _b_task) = attach(&session, "B", b_session, Role::Client);
    let (a_events, _a_task) = attach(&session, "A", a_session, Role::Client);

    b_events
        .send(message(ChannelKind::Control, &b"from-b"[..]))
        .await
        .unwrap();
    // Let B's router finish before A sends
    tokio::time::sleep(Duration::from_millis(20)).await;
    a_events
        .send(message(ChannelKind::Control, &b"from-a"[..]))
        .await
        .unwrap();

    eventually(|| !car_link.sent_on(ChannelKind::Control).is_empty()).await;
    assert_eq!(
        car_link.sent_on(ChannelKind::Control),
        vec![Bytes::from_static(b"from-a")]
    );
}

#[tokio::test]
async fn test_router_control_without_car_notifies_clients() {
    let session = SessionHandle::spawn(quiet_config());
    let (a, a_session) = client(&session, "A").await;
    let (b, _) = client(&session, "B").await;

    let (events, _task) = attach(&session, "A", a_session, Role::Client);
    events
        .send(message(ChannelKind::Control, &b"brake"[..]))
        .await
        .unwrap();

    eventually(|| !a.envelopes().is_empty()).await;
    assert_eq!(a.envelopes(), vec![Envelope::producer_state(false, 0)]);
    eventually(|| b.envelopes() == vec![Envelope::producer_state(false, 0)]).await;
}

#[tokio::test]
async fn test_router_reports_failed_control_forward() {
    let session = SessionHandle::spawn(quiet_config());
    let (car_link, _) = car(&session, 0).await;
    let (a, a_session) = client(&session, "A").await;
    car_link.fail_sends(true);

    let (events, _task) = attach(&session, "A", a_session, Role::Client);
    events
        .send(message(ChannelKind::Control, &b"throttle"[..]))
        .await
        .unwrap();

    eventually(|| !a.envelopes().is_empty()).await;
    assert!(matches!(a.envelopes()[0], Envelope::Error { .. }));
    assert_eq!(session.stats().delivery_failures, 1);
    assert_eq!(session.stats().control_forwarded, 0);
}

#[tokio::test]
async fn test_router_meta_requests() {
    let session = SessionHandle::spawn(quiet_config());
    let (car_link, _) = car(&session, 0).await;
    let (a, a_session) = client(&session, "A").await;

    let (events, _task) = attach(&session, "A", a_session, Role::Client);
    events
        .send(message(
            ChannelKind::Meta,
            &br#"{"type":"controlRequest","kind":"takeOver"}"#[..],
        ))
        .await
        .unwrap();

    eventually(|| car_link.envelopes() == vec![Envelope::controller_state("A")]).await;

    events
        .send(message(ChannelKind::Meta, &b"not json"[..]))
        .await
        .unwrap();
    eventually(|| a.envelopes().len() == 2).await;
    assert!(matches!(a.envelopes()[1], Envelope::Error { .. }));

    events
        .send(message(
            ChannelKind::Meta,
            &br#"{"type":"controlRequest","kind":"release"}"#[..],
        ))
        .await
        .unwrap();
    eventually(|| car_link.envelopes().last() == Some(&Envelope::controller_state(""))).await;
}

#[tokio::test]
async fn test_router_drives_lifecycle() {
    let session = SessionHandle::spawn(quiet_config());
    let (_, car_session) = car(&session, 0).await;
    let (a, _) = client(&session, "A").await;

    let (events, task) = attach(&session, "car", car_session, Role::Producer);
    events
        .send(PeerEvent::StateChanged(ConnectionState::Connected))
        .await
        .unwrap();
    events
        .send(PeerEvent::StateChanged(ConnectionState::Closed))
        .await
        .unwrap();

    // Router stops on a terminal state
    task.await.unwrap();
    assert!(session.get("car").await.unwrap().is_none());
    assert_eq!(
        a.envelopes(),
        vec![
            Envelope::producer_state(true, 0),
            Envelope::producer_state(false, 0),
        ]
    );
}

#[tokio::test]
async fn test_router_ignores_replaced_session() {
    let session = SessionHandle::spawn(quiet_config());
    let (_, first) = client(&session, "A").await;
    let (stale_events, stale_task) = attach(&session, "A", first, Role::Client);

    assert!(session.remove("A").await.unwrap());
    let (_, second) = client(&session, "A").await;
    assert_ne!(first, second);

    stale_events
        .send(PeerEvent::StateChanged(ConnectionState::Failed))
        .await
        .unwrap();
    stale_task.await.unwrap();

    let a = session.get("A").await.unwrap().unwrap();
    assert_eq!(a.session_id, second);
}

#[tokio::test]
async fn test_router_stream_end_removes_peer() {
    let session = SessionHandle::spawn(quiet_config());
    let (_, a_session) = client(&session, "A").await;

    let (events, task) = attach(&session, "A", a_session, Role::Client);
    drop(events);
    task.await.unwrap();

    assert!(session.get("A").await.unwrap().is_none());
}

#[tokio::test]
async fn test_channel_opened_through_router() {
    let session = SessionHandle::spawn(quiet_config());
    let link = MockLink::connected();
    let a_session = session
        .add(PeerEntry::new(PeerId::from("A"), Role::Client, link))
        .await
        .unwrap();

    let (events, _task) = attach(&session, "A", a_session, Role::Client);
    events
        .send(PeerEvent::ChannelOpened("meta".into()))
        .await
        .unwrap();
    events
        .send(PeerEvent::ChannelOpened("telemetry".into()))
        .await
        .unwrap();

    let mut open = false;
    for _ in 0..100 {
        let view = session.get("A").await.unwrap().unwrap();
        if view.channels.is_open(ChannelKind::Meta) {
            open = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(open);
}
