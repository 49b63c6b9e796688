use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use smb_core::error::{SMBError, SMBErrorKind};
use smb_core::SMBResult;
use smb_lease::client::{SMBBreakPolicy, SMBClientConfig, SMBClientConfigBuilder, SMBClientSession, SMBLeaseBreakState};
use smb_lease::protocol::body::create::{SMBCreateRequest, SMBCreateResponse};
use smb_lease::protocol::body::create::file_id::SMBFileId;
use smb_lease::protocol::body::create::lease_context::{SMBLeaseContext, SMBLeaseVersion};
use smb_lease::protocol::body::create::oplock::SMBOplockLevel;
use smb_lease::protocol::body::lease_break::{SMBLeaseBreakAcknowledgement, SMBLeaseBreakNotification, SMBLeaseBreakResponse};
use smb_lease::protocol::lease::{SMBLeaseFlags, SMBLeaseKey, SMBLeaseState};
use smb_lease::transport::{SMBLeaseTransport, SMBLoopbackTransport};

const FILE_NAME: &str = "lease.txt";

type Session = Arc<SMBClientSession<SMBLoopbackTransport>>;

fn config(policy: SMBBreakPolicy) -> SMBClientConfig {
    SMBClientConfigBuilder::default()
        .break_policy(policy)
        .build()
        .unwrap()
}

fn start(policy: SMBBreakPolicy) -> (Arc<SMBLoopbackTransport>, Session) {
    let transport = Arc::new(SMBLoopbackTransport::new());
    let session = SMBClientSession::start(transport.clone(), config(policy)).unwrap();
    (transport, Arc::new(session))
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future).await.expect("timed out")
}

async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }).await
}

#[tokio::test]
async fn upgrade_on_second_open_shares_the_lease() {
    let (_transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle1 = session.open(FILE_NAME, SMBLeaseState::RW).await.unwrap();
    assert_eq!(handle1.lease_state(), SMBLeaseState::RW);

    let handle2 = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease1 = handle1.lease().unwrap();
    let lease2 = handle2.lease().unwrap();
    assert!(Arc::ptr_eq(lease1, lease2));
    assert_eq!(handle1.lease_state(), SMBLeaseState::RWH);
    assert_eq!(handle2.lease_state(), SMBLeaseState::RWH);
    assert_eq!(session.lease_table().len().await, 1);
}

#[tokio::test]
async fn upgrade_then_break_with_voluntary_handle_release() {
    let (transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let key1 = SMBLeaseKey::random();
    let key2 = SMBLeaseKey::random();

    let handle1 = session.open_with_key(FILE_NAME, key1, SMBLeaseState::RW).await.unwrap();
    let handle2 = session.open_with_key(FILE_NAME, key1, SMBLeaseState::RWH).await.unwrap();
    assert_eq!(handle2.lease_state(), SMBLeaseState::RWH);

    let lease = handle2.lease().unwrap().clone();
    lease.on_break(|offered| offered.without(SMBLeaseFlags::HANDLE_CACHING)).unwrap();
    let mut waiter = lease.break_waiter();

    let handle3 = within(session.open_with_key(FILE_NAME, key2, SMBLeaseState::RWH)).await.unwrap();
    assert_eq!(within(waiter.resolved()).await.unwrap(), SMBLeaseState::R);
    assert_eq!(handle2.lease_state(), SMBLeaseState::R);
    assert_eq!(handle1.lease_state(), SMBLeaseState::R);
    assert_eq!(handle3.lease_state(), SMBLeaseState::RH);
    assert_eq!(transport.acknowledgments(), vec![SMBLeaseBreakAcknowledgement::new(key1, SMBLeaseState::R)]);

    for handle in [&handle1, &handle2, &handle3] {
        session.close(handle).await.unwrap();
    }
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test]
async fn break_to_read_with_minimal_callback() {
    let (transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle.lease().unwrap().clone();
    lease.on_break(|offered| offered.intersection(SMBLeaseState::R)).unwrap();
    let mut waiter = lease.break_waiter();

    transport.break_lease(lease.key(), SMBLeaseState::R).await.unwrap();
    assert_eq!(within(waiter.resolved()).await.unwrap(), SMBLeaseState::R);
    assert_eq!(lease.state(), SMBLeaseState::R);
    assert_eq!(lease.status().last_ack(), Some(SMBLeaseState::R));
    assert_eq!(transport.lease_state(lease.key()), Some(SMBLeaseState::R));
}

#[tokio::test]
async fn break_without_callback_accepts_the_offer() {
    let (transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle.lease().unwrap().clone();
    let mut waiter = lease.break_waiter();

    transport.break_lease(lease.key(), SMBLeaseState::RH).await.unwrap();
    assert_eq!(within(waiter.resolved()).await.unwrap(), SMBLeaseState::RH);
    let acks = transport.acknowledgments();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].lease_state(), SMBLeaseState::RH);
}

#[tokio::test]
async fn closing_a_handle_during_a_break_still_acknowledges() {
    let (transport, session) = start(SMBBreakPolicy::Defer);
    let handle1 = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let handle2 = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle1.lease().unwrap().clone();
    let mut waiter = lease.break_waiter();

    transport.break_lease(lease.key(), SMBLeaseState::R).await.unwrap();
    assert_eq!(within(waiter.notified()).await.unwrap(), SMBLeaseState::R);
    assert!(lease.is_break_pending());

    session.close(&handle2).await.unwrap();
    let other = handle1.lease().unwrap().clone();
    let resolution = tokio::spawn(async move { other.wait_for_break_resolution().await });
    tokio::task::yield_now().await;
    lease.acknowledge(SMBLeaseState::R).await.unwrap();

    assert_eq!(within(waiter.resolved()).await.unwrap(), SMBLeaseState::R);
    assert_eq!(within(resolution).await.unwrap().unwrap(), SMBLeaseState::R);
    assert_eq!(handle1.lease_state(), SMBLeaseState::R);
    assert_eq!(transport.lease_state(lease.key()), Some(SMBLeaseState::R));
}

#[tokio::test]
async fn deferred_break_is_answered_by_a_late_callback() {
    let (transport, session) = start(SMBBreakPolicy::Defer);
    let key1 = SMBLeaseKey::random();
    let key2 = SMBLeaseKey::random();
    let handle1 = session.open_with_key(FILE_NAME, key1, SMBLeaseState::RW).await.unwrap();
    let handle2 = session.open_with_key(FILE_NAME, key1, SMBLeaseState::RWH).await.unwrap();
    let lease = handle1.lease().unwrap().clone();
    let mut waiter = lease.break_waiter();

    let opener = session.clone();
    let handle3 = tokio::spawn(async move {
        opener.open_with_key(FILE_NAME, key2, SMBLeaseState::RWH).await
    });

    assert_eq!(within(waiter.notified()).await.unwrap(), SMBLeaseState::RH);
    session.close(&handle2).await.unwrap();
    lease.on_break(|offered| offered).unwrap();

    let handle3 = within(handle3).await.unwrap().unwrap();
    assert_eq!(handle3.lease_state(), SMBLeaseState::RH);
    assert_eq!(within(waiter.resolved()).await.unwrap(), SMBLeaseState::RH);
    assert_eq!(handle1.lease_state(), SMBLeaseState::RH);

    session.close(&handle1).await.unwrap();
    session.close(&handle3).await.unwrap();
}

#[tokio::test]
async fn acknowledging_twice_is_rejected() {
    let (transport, session) = start(SMBBreakPolicy::Defer);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle.lease().unwrap().clone();
    let mut waiter = lease.break_waiter();

    transport.break_lease(lease.key(), SMBLeaseState::RH).await.unwrap();
    within(waiter.notified()).await.unwrap();
    lease.acknowledge(SMBLeaseState::RH).await.unwrap();

    let err = lease.acknowledge(SMBLeaseState::RH).await.unwrap_err();
    assert_eq!(err.kind(), SMBErrorKind::Usage);
    assert_eq!(lease.state(), SMBLeaseState::RH);
    assert_eq!(transport.acknowledgments().len(), 1);
}

#[tokio::test]
async fn acknowledgment_must_stay_within_the_offer() {
    let (transport, session) = start(SMBBreakPolicy::Defer);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle.lease().unwrap().clone();
    let mut waiter = lease.break_waiter();

    transport.break_lease(lease.key(), SMBLeaseState::R).await.unwrap();
    within(waiter.notified()).await.unwrap();
    let err = lease.acknowledge(SMBLeaseState::RH).await.unwrap_err();
    assert_eq!(err.kind(), SMBErrorKind::Usage);
    assert!(lease.is_break_pending());
    assert!(transport.acknowledgments().is_empty());
}

#[tokio::test]
async fn newer_break_supersedes_a_pending_one() {
    let (transport, session) = start(SMBBreakPolicy::Defer);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle.lease().unwrap().clone();
    let mut first = lease.break_waiter();
    let mut status = lease.subscribe();

    transport.break_lease(lease.key(), SMBLeaseState::RH).await.unwrap();
    assert_eq!(within(first.notified()).await.unwrap(), SMBLeaseState::RH);
    transport.break_lease(lease.key(), SMBLeaseState::R).await.unwrap();
    within(status.wait_for(|status| status.breaks_received() >= 2)).await.unwrap();

    match lease.break_state() {
        SMBLeaseBreakState::BreakPending { old_state, new_state, sequence } => {
            assert_eq!(old_state, SMBLeaseState::RWH);
            assert_eq!(new_state, SMBLeaseState::R);
            assert_eq!(sequence, 2);
        }
        state => panic!("expected a pending break, got {:?}", state),
    }
    assert!(lease.acknowledge(SMBLeaseState::RH).await.is_err());
    lease.acknowledge(SMBLeaseState::R).await.unwrap();

    assert_eq!(within(first.resolved()).await.unwrap(), SMBLeaseState::R);
    assert_eq!(lease.status().resolved_sequence(), 2);
}

#[tokio::test]
async fn failed_acknowledgment_leaves_the_break_pending() {
    let (transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle.lease().unwrap().clone();
    let mut waiter = lease.break_waiter();

    transport.fail_next_acks(1);
    transport.break_lease(lease.key(), SMBLeaseState::R).await.unwrap();
    let err = within(waiter.resolved()).await.unwrap_err();
    assert_eq!(err.kind(), SMBErrorKind::Transport);
    match &err {
        SMBError::BreakFailed(failure) => assert_eq!(failure.sequence(), 1),
        other => panic!("expected a break failure, got {:?}", other),
    }
    assert!(lease.is_break_pending());
    assert!(lease.status().failure().is_some());
    assert_eq!(lease.state(), SMBLeaseState::RWH);

    lease.acknowledge(SMBLeaseState::R).await.unwrap();
    assert_eq!(lease.state(), SMBLeaseState::R);
    assert!(lease.status().failure().is_none());
    assert_eq!(transport.lease_state(lease.key()), Some(SMBLeaseState::R));
}

#[tokio::test]
async fn break_without_ack_required_resolves_immediately() {
    let (transport, session) = start(SMBBreakPolicy::Defer);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle.lease().unwrap().clone();
    let mut waiter = lease.break_waiter();

    transport.break_lease_without_ack(lease.key(), SMBLeaseState::RH).await.unwrap();
    assert_eq!(within(waiter.resolved()).await.unwrap(), SMBLeaseState::RH);
    assert!(!lease.is_break_pending());
    assert!(transport.acknowledgments().is_empty());
}

#[tokio::test]
async fn invalid_break_state_is_not_acknowledged() {
    let (transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle.lease().unwrap().clone();
    let mut waiter = lease.break_waiter();

    let notification = SMBLeaseBreakNotification::from_raw(lease.key(), 0x7, 0x4, true, 9);
    transport.inject_notification(notification).await.unwrap();
    let err = within(waiter.notified()).await.unwrap_err();
    assert_eq!(err.kind(), SMBErrorKind::Protocol);
    assert_eq!(lease.break_state(), SMBLeaseBreakState::Granted(SMBLeaseState::RWH));
    assert!(transport.acknowledgments().is_empty());
}

#[tokio::test]
async fn break_for_a_retired_lease_is_still_acknowledged() {
    let (transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let key = handle.lease().unwrap().key();
    session.close(&handle).await.unwrap();
    within(async {
        while session.lease(key).await.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }).await;

    let notification = SMBLeaseBreakNotification::new(key, SMBLeaseState::RWH, SMBLeaseState::R, true, 4);
    transport.inject_notification(notification).await.unwrap();
    let expected = SMBLeaseBreakAcknowledgement::new(key, SMBLeaseState::R);
    eventually(|| transport.acknowledgments().contains(&expected)).await;
}

#[tokio::test]
async fn second_callback_is_rejected() {
    let (_transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    let lease = handle.lease().unwrap();
    lease.on_break(|offered| offered).unwrap();
    let err = lease.on_break(|_| SMBLeaseState::NONE).unwrap_err();
    assert_eq!(err.kind(), SMBErrorKind::Usage);
}

#[tokio::test]
async fn closing_twice_is_rejected() {
    let (transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle = session.open(FILE_NAME, SMBLeaseState::RW).await.unwrap();
    session.close(&handle).await.unwrap();
    assert!(handle.is_closed());
    let err = session.close(&handle).await.unwrap_err();
    assert_eq!(err.kind(), SMBErrorKind::Usage);
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_opens_create_one_lease() {
    let (_transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let key = SMBLeaseKey::random();
    let opens = (0..8)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.open_with_key(FILE_NAME, key, SMBLeaseState::RWH).await })
        })
        .collect::<Vec<_>>();

    let mut handles = Vec::new();
    for open in opens {
        handles.push(within(open).await.unwrap().unwrap());
    }
    let first = handles[0].lease().unwrap();
    for handle in &handles {
        assert!(Arc::ptr_eq(first, handle.lease().unwrap()));
        assert_eq!(handle.lease_state(), SMBLeaseState::RWH);
    }
    assert_eq!(session.lease_table().len().await, 1);
    assert_eq!(session.lease_table().handle_count(key).await, 8);
}

#[tokio::test]
async fn open_without_a_lease() {
    let (transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle = session.open(FILE_NAME, SMBLeaseState::NONE).await.unwrap();
    assert!(handle.lease().is_none());
    assert_eq!(handle.lease_state(), SMBLeaseState::NONE);
    assert_eq!(handle.oplock_level(), SMBOplockLevel::None);
    assert!(session.lease_table().is_empty().await);
    session.close(&handle).await.unwrap();
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test]
async fn shutdown_stops_break_delivery() {
    let (transport, session) = start(SMBBreakPolicy::AcceptOffered);
    let handle = session.open(FILE_NAME, SMBLeaseState::RWH).await.unwrap();
    session.shutdown().await;
    let err = transport.break_lease(handle.lease().unwrap().key(), SMBLeaseState::R).await.unwrap_err();
    assert_eq!(err.kind(), SMBErrorKind::Transport);
}

/// Answers every create with the next scripted lease context.
#[derive(Debug, Default)]
struct ScriptedTransport {
    grants: Mutex<VecDeque<SMBLeaseContext>>,
    closed: Mutex<Vec<SMBFileId>>,
}

impl ScriptedTransport {
    fn new(grants: Vec<SMBLeaseContext>) -> Self {
        Self {
            grants: Mutex::new(grants.into()),
            closed: Mutex::new(Vec::new()),
        }
    }
}

impl SMBLeaseTransport for ScriptedTransport {
    async fn send_create(&self, _request: SMBCreateRequest) -> SMBResult<SMBCreateResponse> {
        let grant = self.grants.lock().unwrap().pop_front();
        Ok(SMBCreateResponse::new(SMBFileId::new(7, 7), SMBOplockLevel::Lease, grant))
    }

    async fn send_close(&self, file_id: SMBFileId) -> SMBResult<()> {
        self.closed.lock().unwrap().push(file_id);
        Ok(())
    }

    async fn send_lease_ack(&self, ack: SMBLeaseBreakAcknowledgement) -> SMBResult<SMBLeaseBreakResponse> {
        Ok(SMBLeaseBreakResponse::new(ack.lease_key(), ack.lease_state()))
    }

    fn subscribe_breaks(&self, _sink: tokio::sync::mpsc::Sender<SMBLeaseBreakNotification>) -> SMBResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn invalid_granted_state_fails_the_open() {
    let key = SMBLeaseKey::random();
    let transport = Arc::new(ScriptedTransport::new(vec![
        SMBLeaseContext::response(SMBLeaseVersion::V2, key, 0x4, 1),
    ]));
    let session = SMBClientSession::start(transport.clone(), SMBClientConfig::default()).unwrap();

    let err = session.open_with_key(FILE_NAME, key, SMBLeaseState::RWH).await.unwrap_err();
    assert_eq!(err.kind(), SMBErrorKind::Protocol);
    assert_eq!(*transport.closed.lock().unwrap(), vec![SMBFileId::new(7, 7)]);
    assert!(session.lease(key).await.is_none());
}

#[tokio::test]
async fn grant_with_an_older_epoch_is_ignored() {
    let key = SMBLeaseKey::random();
    let transport = Arc::new(ScriptedTransport::new(vec![
        SMBLeaseContext::response(SMBLeaseVersion::V2, key, SMBLeaseState::RWH.bits(), 5),
        SMBLeaseContext::response(SMBLeaseVersion::V2, key, SMBLeaseState::R.bits(), 3),
    ]));
    let session = SMBClientSession::start(transport, SMBClientConfig::default()).unwrap();

    let first = session.open_with_key(FILE_NAME, key, SMBLeaseState::RWH).await.unwrap();
    let second = session.open_with_key(FILE_NAME, key, SMBLeaseState::R).await.unwrap();
    assert_eq!(second.lease_state(), SMBLeaseState::RWH);
    assert_eq!(first.lease().unwrap().status().epoch(), Some(5));
}

#[tokio::test]
async fn lease_key_mismatch_is_a_protocol_violation() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        SMBLeaseContext::response(SMBLeaseVersion::V1, SMBLeaseKey::new([9; 16]), SMBLeaseState::R.bits(), 0),
    ]));
    let session = SMBClientSession::start(transport, SMBClientConfig::default()).unwrap();
    let err = session.open_with_key(FILE_NAME, SMBLeaseKey::new([1; 16]), SMBLeaseState::R).await.unwrap_err();
    assert_eq!(err.kind(), SMBErrorKind::Protocol);
}
