use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

use smb_core::{SMBFromBytes, SMBResult, SMBToBytes};
use smb_core::error::SMBError;
use smb_core::logging::{debug, warn};
use smb_core::nt_status::NTStatus;

use crate::protocol::body::create::{SMBCreateRequest, SMBCreateResponse};
use crate::protocol::body::create::file_id::SMBFileId;
use crate::protocol::body::create::lease_context::{SMBLeaseContext, SMBLeaseVersion};
use crate::protocol::body::create::oplock::SMBOplockLevel;
use crate::protocol::body::lease_break::{SMBLeaseBreakAcknowledgement, SMBLeaseBreakNotification, SMBLeaseBreakResponse};
use crate::protocol::lease::{SMBLeaseFlags, SMBLeaseKey, SMBLeaseState};
use crate::transport::SMBLeaseTransport;

const DEFAULT_BREAK_TIMEOUT: Duration = Duration::from_secs(35);

/// An in-process server that speaks just enough of the leasing protocol to drive
/// the client engine in tests and demos.
///
/// Write caching is exclusive to one lease key per file: an open with another key
/// breaks the holder's write caching and waits, up to the break timeout, for the
/// acknowledgment before answering. Read and handle caching are shared. Repeated
/// opens with the same key are granted the union of what was asked for.
#[derive(Debug)]
pub struct SMBLoopbackTransport {
    state: Mutex<SMBLoopbackState>,
    break_timeout: Duration,
}

#[derive(Debug, Default)]
struct SMBLoopbackState {
    next_file_id: u64,
    opens: HashMap<SMBFileId, Option<SMBLeaseKey>>,
    leases: HashMap<SMBLeaseKey, SMBLoopbackLease>,
    sink: Option<Sender<SMBLeaseBreakNotification>>,
    acknowledgments: Vec<SMBLeaseBreakAcknowledgement>,
    failing_acks: usize,
}

#[derive(Debug)]
struct SMBLoopbackLease {
    file_name: String,
    version: SMBLeaseVersion,
    state: SMBLeaseState,
    epoch: u16,
    open_count: usize,
    breaking: Option<SMBLoopbackBreak>,
}

#[derive(Debug)]
struct SMBLoopbackBreak {
    new_state: SMBLeaseState,
    waiters: Vec<oneshot::Sender<()>>,
}

impl SMBLoopbackBreak {
    fn finish(self) {
        for waiter in self.waiters {
            let _ = waiter.send(());
        }
    }
}

impl SMBLoopbackLease {
    fn new(file_name: &str, version: SMBLeaseVersion) -> Self {
        Self {
            file_name: file_name.into(),
            version,
            state: SMBLeaseState::NONE,
            epoch: 0,
            open_count: 0,
            breaking: None,
        }
    }

    fn start_break(&mut self, key: SMBLeaseKey, new_state: SMBLeaseState, ack_required: bool) -> SMBLeaseBreakNotification {
        self.epoch = self.epoch.wrapping_add(1);
        let notification = SMBLeaseBreakNotification::new(key, self.state, new_state, ack_required, self.epoch);
        if ack_required {
            match self.breaking.as_mut() {
                Some(pending) => pending.new_state = new_state,
                None => self.breaking = Some(SMBLoopbackBreak { new_state, waiters: Vec::new() }),
            }
        } else {
            self.state = new_state;
            if let Some(pending) = self.breaking.take() {
                pending.finish();
            }
        }
        notification
    }
}

impl SMBLoopbackState {
    fn allocate_file_id(&mut self, key: Option<SMBLeaseKey>) -> SMBFileId {
        self.next_file_id += 1;
        let file_id = SMBFileId::new(self.next_file_id, self.next_file_id | (1 << 32));
        self.opens.insert(file_id, key);
        file_id
    }

    /// Starts write-caching breaks on every other key holding `file_name` and
    /// returns what has to be sent plus what the caller has to wait for.
    fn break_conflicting(&mut self, file_name: &str, key: SMBLeaseKey) -> (Vec<SMBLeaseBreakNotification>, Vec<(SMBLeaseKey, oneshot::Receiver<()>)>) {
        let mut notifications = Vec::new();
        let mut waits = Vec::new();
        for (other_key, lease) in self.leases.iter_mut() {
            if *other_key == key || lease.file_name != file_name {
                continue;
            }
            let breaking_write = lease.breaking.as_ref()
                .is_some_and(|pending| !pending.new_state.can_cache_writes());
            if !lease.state.can_cache_writes() && !breaking_write {
                continue;
            }
            if lease.breaking.is_none() {
                let new_state = lease.state.without(SMBLeaseFlags::WRITE_CACHING);
                notifications.push(lease.start_break(*other_key, new_state, true));
            }
            let (tx, rx) = oneshot::channel();
            if let Some(pending) = lease.breaking.as_mut() {
                pending.waiters.push(tx);
            }
            waits.push((*other_key, rx));
        }
        (notifications, waits)
    }
}

impl Default for SMBLoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SMBLoopbackTransport {
    pub fn new() -> Self {
        Self::with_break_timeout(DEFAULT_BREAK_TIMEOUT)
    }

    /// How long a conflicting open waits for a break acknowledgment before the
    /// server downgrades the holder on its own.
    pub fn with_break_timeout(break_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SMBLoopbackState::default()),
            break_timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, SMBLoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The state the server believes `key` holds, if it knows the key.
    pub fn lease_state(&self, key: SMBLeaseKey) -> Option<SMBLeaseState> {
        self.state().leases.get(&key).map(|lease| lease.state)
    }

    pub fn is_breaking(&self, key: SMBLeaseKey) -> bool {
        self.state().leases.get(&key).is_some_and(|lease| lease.breaking.is_some())
    }

    /// Every acknowledgment that reached the server, in arrival order.
    pub fn acknowledgments(&self) -> Vec<SMBLeaseBreakAcknowledgement> {
        self.state().acknowledgments.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state().opens.len()
    }

    /// The next `count` acknowledgments fail as if the connection dropped.
    pub fn fail_next_acks(&self, count: usize) {
        self.state().failing_acks = count;
    }

    /// Server-initiated break of `key` down to `new_state`. The server expects an
    /// acknowledgment and keeps the break outstanding until one arrives.
    pub async fn break_lease(&self, key: SMBLeaseKey, new_state: SMBLeaseState) -> SMBResult<()> {
        self.start_break(key, new_state, true).await
    }

    /// Downgrades `key` and tells the client without asking for an acknowledgment.
    pub async fn break_lease_without_ack(&self, key: SMBLeaseKey, new_state: SMBLeaseState) -> SMBResult<()> {
        self.start_break(key, new_state, false).await
    }

    /// Pushes `notification` to the client without touching server state.
    pub async fn inject_notification(&self, notification: SMBLeaseBreakNotification) -> SMBResult<()> {
        let sink = self.state().sink.clone();
        Self::deliver(sink, notification).await
    }

    async fn start_break(&self, key: SMBLeaseKey, new_state: SMBLeaseState, ack_required: bool) -> SMBResult<()> {
        let (sink, notification) = {
            let mut state = self.state();
            let sink = state.sink.clone();
            let lease = state.leases.get_mut(&key)
                .ok_or(SMBError::response_error(NTStatus::ObjectNameNotFound))?;
            if !new_state.is_subset_of(lease.state) {
                return Err(SMBError::precondition_failed(format!("cannot break {} up to {}", lease.state, new_state)));
            }
            (sink, lease.start_break(key, new_state, ack_required))
        };
        Self::deliver(sink, notification).await
    }

    /// Sends a notification the way a real connection would: encoded, then decoded
    /// again on the receiving side.
    async fn deliver(sink: Option<Sender<SMBLeaseBreakNotification>>, notification: SMBLeaseBreakNotification) -> SMBResult<()> {
        let sink = sink.ok_or(SMBError::precondition_failed("no lease break subscriber"))?;
        let bytes = notification.smb_to_bytes();
        let (_, received) = SMBLeaseBreakNotification::smb_from_bytes(&bytes)?;
        debug!(key = %received.lease_key(), "loopback sending lease break");
        sink.send(received).await
            .map_err(|_| SMBError::io_error(io::Error::new(io::ErrorKind::BrokenPipe, "lease break subscriber went away")))
    }

    fn force_break(&self, key: SMBLeaseKey) {
        let mut state = self.state();
        if let Some(lease) = state.leases.get_mut(&key) {
            if let Some(pending) = lease.breaking.take() {
                warn!(key = %key, "lease break timed out, downgrading to {}", pending.new_state);
                lease.state = pending.new_state;
                pending.finish();
            }
        }
    }
}

impl SMBLeaseTransport for SMBLoopbackTransport {
    async fn send_create(&self, request: SMBCreateRequest) -> SMBResult<SMBCreateResponse> {
        let Some(context) = request.lease() else {
            let file_id = self.state().allocate_file_id(None);
            return Ok(SMBCreateResponse::new(file_id, SMBOplockLevel::None, None));
        };
        let key = context.lease_key();
        let requested = context.lease_state()
            .map_err(|_| SMBError::response_error(NTStatus::InvalidParameter))?;

        let (sink, notifications, waits) = {
            let mut state = self.state();
            let (notifications, waits) = state.break_conflicting(request.file_name(), key);
            (state.sink.clone(), notifications, waits)
        };
        for notification in notifications {
            if let Err(e) = Self::deliver(sink.clone(), notification).await {
                warn!("could not deliver lease break: {}", e);
            }
        }
        for (other_key, done) in waits {
            if tokio::time::timeout(self.break_timeout, done).await.is_err() {
                self.force_break(other_key);
            }
        }

        let mut state = self.state();
        let shared = state.leases.iter()
            .any(|(other_key, lease)| *other_key != key && lease.file_name == request.file_name() && !lease.state.is_none());
        let file_id = state.allocate_file_id(Some(key));
        let lease = state.leases.entry(key)
            .or_insert_with(|| SMBLoopbackLease::new(request.file_name(), context.version()));
        lease.open_count += 1;
        let break_in_progress = lease.breaking.is_some();
        if !break_in_progress {
            let mut granted = lease.state.union(requested);
            if shared {
                granted = granted.without(SMBLeaseFlags::WRITE_CACHING);
            }
            if granted != lease.state {
                lease.epoch = lease.epoch.wrapping_add(1);
                lease.state = granted;
            }
        }
        let mut response = SMBLeaseContext::response(lease.version, key, lease.state.bits(), lease.epoch);
        if break_in_progress {
            response = response.with_break_in_progress();
        }
        Ok(SMBCreateResponse::new(file_id, SMBOplockLevel::Lease, Some(response)))
    }

    async fn send_close(&self, file_id: SMBFileId) -> SMBResult<()> {
        let mut state = self.state();
        let key = state.opens.remove(&file_id)
            .ok_or(SMBError::response_error(NTStatus::FileClosed))?;
        let Some(key) = key else {
            return Ok(());
        };
        let released = match state.leases.get_mut(&key) {
            Some(lease) => {
                lease.open_count = lease.open_count.saturating_sub(1);
                lease.open_count == 0
            }
            None => false,
        };
        if released {
            if let Some(pending) = state.leases.remove(&key).and_then(|lease| lease.breaking) {
                pending.finish();
            }
        }
        Ok(())
    }

    async fn send_lease_ack(&self, ack: SMBLeaseBreakAcknowledgement) -> SMBResult<SMBLeaseBreakResponse> {
        let mut state = self.state();
        if state.failing_acks > 0 {
            state.failing_acks -= 1;
            return Err(SMBError::io_error(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset while acknowledging")));
        }
        state.acknowledgments.push(ack);
        let lease = state.leases.get_mut(&ack.lease_key())
            .ok_or(SMBError::response_error(NTStatus::InvalidOplockProtocol))?;
        let new_state = match lease.breaking.as_ref() {
            Some(pending) => pending.new_state,
            None => return Err(SMBError::response_error(NTStatus::InvalidOplockProtocol)),
        };
        if !ack.lease_state().is_subset_of(new_state) {
            return Err(SMBError::response_error(NTStatus::InvalidParameter));
        }
        lease.state = ack.lease_state();
        if let Some(pending) = lease.breaking.take() {
            pending.finish();
        }
        Ok(SMBLeaseBreakResponse::new(ack.lease_key(), ack.lease_state()))
    }

    fn subscribe_breaks(&self, sink: Sender<SMBLeaseBreakNotification>) -> SMBResult<()> {
        self.state().sink = Some(sink);
        Ok(())
    }
}
