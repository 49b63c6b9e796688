use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use smb_core::error::SMBError;
use smb_core::logging::{debug, info, trace, warn};
use smb_core::SMBResult;

use crate::client::config::SMBBreakPolicy;
use crate::client::lease_table::SMBLeaseTable;
use crate::protocol::body::lease_break::{SMBLeaseBreakAcknowledgement, SMBLeaseBreakNotification};
use crate::protocol::lease::{SMBLeaseKey, SMBLeaseState};
use crate::transport::SMBLeaseTransport;

/// Maps the state a server offers in a break to the state the application is
/// willing to keep. The result must be a subset of the offer.
pub type SMBBreakCallback = Box<dyn Fn(SMBLeaseState) -> SMBLeaseState + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SMBLeaseBreakState {
    Granted(SMBLeaseState),
    BreakPending {
        old_state: SMBLeaseState,
        new_state: SMBLeaseState,
        sequence: u64,
    },
}

impl SMBLeaseBreakState {
    /// The state the server last granted and that no acknowledgment has given up yet.
    pub fn granted(&self) -> SMBLeaseState {
        match self {
            Self::Granted(state) => *state,
            Self::BreakPending { old_state, .. } => *old_state,
        }
    }

    pub fn is_break_pending(&self) -> bool {
        matches!(self, Self::BreakPending { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SMBLeaseFailure {
    sequence: u64,
    error: Arc<SMBError>,
}

impl SMBLeaseFailure {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn error(&self) -> &Arc<SMBError> {
        &self.error
    }
}

/// Snapshot of everything observable about a lease. Published through a watch
/// cell every time the lease's worker changes it.
///
/// Breaks are numbered from 1 in arrival order. `resolved_sequence` is the number
/// of the latest break that ended in a granted state.
#[derive(Debug, Clone)]
pub struct SMBLeaseStatus {
    state: SMBLeaseBreakState,
    epoch: Option<u16>,
    breaks_received: u64,
    resolved_sequence: u64,
    last_offered: Option<(u64, SMBLeaseState)>,
    last_resolved: SMBLeaseState,
    last_ack: Option<SMBLeaseState>,
    ack_in_flight: Option<u64>,
    failure: Option<SMBLeaseFailure>,
}

impl SMBLeaseStatus {
    fn new() -> Self {
        Self {
            state: SMBLeaseBreakState::Granted(SMBLeaseState::NONE),
            epoch: None,
            breaks_received: 0,
            resolved_sequence: 0,
            last_offered: None,
            last_resolved: SMBLeaseState::NONE,
            last_ack: None,
            ack_in_flight: None,
            failure: None,
        }
    }

    pub fn state(&self) -> SMBLeaseBreakState {
        self.state
    }

    pub fn epoch(&self) -> Option<u16> {
        self.epoch
    }

    pub fn breaks_received(&self) -> u64 {
        self.breaks_received
    }

    pub fn resolved_sequence(&self) -> u64 {
        self.resolved_sequence
    }

    pub fn last_ack(&self) -> Option<SMBLeaseState> {
        self.last_ack
    }

    pub fn ack_in_flight(&self) -> bool {
        self.ack_in_flight.is_some()
    }

    pub fn failure(&self) -> Option<&SMBLeaseFailure> {
        self.failure.as_ref()
    }

    fn pending_sequence(&self) -> Option<u64> {
        match self.state {
            SMBLeaseBreakState::BreakPending { sequence, .. } => Some(sequence),
            SMBLeaseBreakState::Granted(_) => None,
        }
    }

    fn resolve(&mut self, sequence: u64, state: SMBLeaseState) {
        self.state = SMBLeaseBreakState::Granted(state);
        self.resolved_sequence = sequence;
        self.last_resolved = state;
        self.failure = None;
    }

    fn fail(&mut self, sequence: u64, error: SMBError) {
        self.failure = Some(SMBLeaseFailure { sequence, error: Arc::new(error) });
    }
}

enum SMBLeaseJob {
    Grant {
        state: SMBLeaseState,
        epoch: Option<u16>,
        reply: oneshot::Sender<SMBLeaseState>,
    },
    Break(SMBLeaseBreakNotification),
    Resume,
    Acknowledge {
        state: SMBLeaseState,
        reply: oneshot::Sender<SMBResult<()>>,
    },
    AckCompleted {
        sequence: u64,
        state: SMBLeaseState,
        result: SMBResult<()>,
        reply: Option<oneshot::Sender<SMBResult<()>>>,
    },
}

impl SMBLeaseJob {
    fn name(&self) -> &'static str {
        match self {
            Self::Grant { .. } => "grant",
            Self::Break(_) => "break",
            Self::Resume => "resume",
            Self::Acknowledge { .. } => "acknowledge",
            Self::AckCompleted { .. } => "ack completed",
        }
    }
}

struct SMBQueuedJob<T: SMBLeaseTransport> {
    lease: Arc<SMBLease<T>>,
    job: SMBLeaseJob,
}

/// Lease state shared by every handle opened with the same lease key.
///
/// All mutation happens on a worker task owned by the lease, fed through an
/// unbounded queue. Jobs run one at a time in the order they were queued, so the
/// break callback never runs concurrently with itself or with a grant for the same
/// key. Every queued job and every acknowledgment in flight holds a strong
/// reference, which keeps an orphaned lease alive until it has answered the server.
pub struct SMBLease<T: SMBLeaseTransport> {
    key: SMBLeaseKey,
    transport: Arc<T>,
    policy: SMBBreakPolicy,
    callback: OnceLock<SMBBreakCallback>,
    status: watch::Sender<SMBLeaseStatus>,
    jobs: mpsc::UnboundedSender<SMBQueuedJob<T>>,
    pending_jobs: AtomicUsize,
    table: Weak<SMBLeaseTable<T>>,
}

impl<T: SMBLeaseTransport> Debug for SMBLease<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SMBLease")
            .field("key", &self.key)
            .field("status", &*self.status.borrow())
            .field("has_callback", &self.callback.get().is_some())
            .finish()
    }
}

impl<T: SMBLeaseTransport> SMBLease<T> {
    /// Creates the lease and spawns its worker on the current Tokio runtime.
    pub(crate) fn new(key: SMBLeaseKey, transport: Arc<T>, policy: SMBBreakPolicy, table: Weak<SMBLeaseTable<T>>) -> Arc<Self> {
        let (jobs, queue) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SMBLeaseStatus::new());
        let lease = Arc::new(Self {
            key,
            transport,
            policy,
            callback: OnceLock::new(),
            status,
            jobs,
            pending_jobs: AtomicUsize::new(0),
            table,
        });
        tokio::spawn(Self::run(queue));
        lease
    }

    async fn run(mut queue: mpsc::UnboundedReceiver<SMBQueuedJob<T>>) {
        while let Some(SMBQueuedJob { lease, job }) = queue.recv().await {
            trace!(key = %lease.key, "lease job: {}", job.name());
            lease.process(job);
            lease.pending_jobs.fetch_sub(1, Ordering::SeqCst);
            if let Some(table) = lease.table.upgrade() {
                table.retire_if_idle(lease.key).await;
            }
        }
    }

    pub fn key(&self) -> SMBLeaseKey {
        self.key
    }

    /// The currently granted state. While a break is pending this is still the
    /// state held before the break.
    pub fn state(&self) -> SMBLeaseState {
        self.status.borrow().state.granted()
    }

    pub fn break_state(&self) -> SMBLeaseBreakState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SMBLeaseStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SMBLeaseStatus> {
        self.status.subscribe()
    }

    pub fn is_break_pending(&self) -> bool {
        self.status.borrow().state.is_break_pending()
    }

    /// Registers the break callback. Only one callback can ever be registered.
    ///
    /// A break left pending under [`SMBBreakPolicy::Defer`] is handed to the new
    /// callback right away.
    pub fn on_break<F>(self: &Arc<Self>, callback: F) -> SMBResult<()>
    where
        F: Fn(SMBLeaseState) -> SMBLeaseState + Send + Sync + 'static,
    {
        self.callback.set(Box::new(callback))
            .map_err(|_| SMBError::precondition_failed(format!("lease {} already has a break callback", self.key)))?;
        if self.is_break_pending() {
            self.enqueue(SMBLeaseJob::Resume)?;
        }
        Ok(())
    }

    /// Acknowledges the pending break with `state`, which must be a subset of the
    /// offered state. Also the way to retry after a failed acknowledgment.
    pub async fn acknowledge(self: &Arc<Self>, state: SMBLeaseState) -> SMBResult<()> {
        let (reply, response) = oneshot::channel();
        self.enqueue(SMBLeaseJob::Acknowledge { state, reply })?;
        response.await.map_err(|_| Self::worker_gone(self.key))?
    }

    /// A waiter for the pending break, or for the next one if none is pending.
    pub fn break_waiter(&self) -> SMBBreakWaiter {
        let receiver = self.status.subscribe();
        let target = {
            let status = receiver.borrow();
            match status.pending_sequence() {
                Some(sequence) => sequence,
                None => status.breaks_received + 1,
            }
        };
        SMBBreakWaiter { key: self.key, receiver, target }
    }

    pub async fn wait_for_break_resolution(&self) -> SMBResult<SMBLeaseState> {
        self.break_waiter().resolved().await
    }

    /// Applies the lease state a create response granted and returns the state the
    /// lease ends up with.
    pub(crate) async fn apply_grant(self: &Arc<Self>, state: SMBLeaseState, epoch: Option<u16>) -> SMBResult<SMBLeaseState> {
        let (reply, response) = oneshot::channel();
        self.enqueue(SMBLeaseJob::Grant { state, epoch, reply })?;
        response.await.map_err(|_| Self::worker_gone(self.key))
    }

    pub(crate) fn dispatch_break(self: &Arc<Self>, notification: SMBLeaseBreakNotification) -> SMBResult<()> {
        self.enqueue(SMBLeaseJob::Break(notification))
    }

    /// No queued work and no break left to answer.
    pub(crate) fn is_idle(&self) -> bool {
        self.pending_jobs.load(Ordering::SeqCst) == 0 && !self.is_break_pending()
    }

    fn enqueue(self: &Arc<Self>, job: SMBLeaseJob) -> SMBResult<()> {
        self.pending_jobs.fetch_add(1, Ordering::SeqCst);
        self.jobs.send(SMBQueuedJob { lease: self.clone(), job })
            .map_err(|_| {
                self.pending_jobs.fetch_sub(1, Ordering::SeqCst);
                Self::worker_gone(self.key)
            })
    }

    fn worker_gone(key: SMBLeaseKey) -> SMBError {
        SMBError::precondition_failed(format!("lease {} is no longer processing jobs", key))
    }

    fn process(self: &Arc<Self>, job: SMBLeaseJob) {
        match job {
            SMBLeaseJob::Grant { state, epoch, reply } => {
                let _ = reply.send(self.handle_grant(state, epoch));
            }
            SMBLeaseJob::Break(notification) => self.handle_break(notification),
            SMBLeaseJob::Resume => self.handle_resume(),
            SMBLeaseJob::Acknowledge { state, reply } => self.handle_acknowledge(state, reply),
            SMBLeaseJob::AckCompleted { sequence, state, result, reply } => {
                self.handle_ack_completed(sequence, state, result, reply)
            }
        }
    }

    fn handle_grant(&self, granted: SMBLeaseState, epoch: Option<u16>) -> SMBLeaseState {
        let mut applied = granted;
        let key = self.key;
        self.status.send_modify(|status| {
            if let (Some(new), Some(current)) = (epoch, status.epoch) {
                if is_older_epoch(new, current) {
                    info!(key = %key, "ignoring grant of {} with stale epoch {} (current {})", granted, new, current);
                    applied = status.state.granted();
                    return;
                }
            }
            if epoch.is_some() {
                status.epoch = epoch;
            }
            status.state = match status.state {
                SMBLeaseBreakState::Granted(_) => SMBLeaseBreakState::Granted(granted),
                SMBLeaseBreakState::BreakPending { new_state, sequence, .. } => SMBLeaseBreakState::BreakPending {
                    old_state: granted,
                    new_state,
                    sequence,
                },
            };
            debug!(key = %key, "lease granted {}", granted);
        });
        applied
    }

    fn handle_break(self: &Arc<Self>, notification: SMBLeaseBreakNotification) {
        let key = self.key;
        let offered = notification.new_lease_state();
        let answer = notification.ack_required() && offered.is_ok();
        let mut sequence = 0;
        self.status.send_modify(|status| {
            status.breaks_received += 1;
            sequence = status.breaks_received;
            if status.epoch.is_some() {
                status.epoch = Some(notification.new_epoch());
            }
            let new_state = match offered {
                Ok(state) => state,
                Err(e) => {
                    warn!(key = %key, "break {} carries an invalid lease state: {}", sequence, e);
                    status.fail(sequence, e);
                    return;
                }
            };
            status.last_offered = Some((sequence, new_state));
            if !notification.ack_required() {
                debug!(key = %key, "break {} to {} needs no acknowledgment", sequence, new_state);
                status.resolve(sequence, new_state);
                return;
            }
            let old_state = status.state.granted();
            status.state = SMBLeaseBreakState::BreakPending { old_state, new_state, sequence };
            status.ack_in_flight = None;
            status.failure = None;
            debug!(key = %key, "break {} from {} to {}", sequence, old_state, new_state);
        });
        if answer {
            self.answer_break(sequence);
        }
    }

    fn handle_resume(self: &Arc<Self>) {
        let status = self.status.borrow().clone();
        match (status.pending_sequence(), status.ack_in_flight) {
            (Some(sequence), None) => self.answer_break(sequence),
            _ => trace!(key = %self.key, "nothing to resume"),
        }
    }

    /// Decides what to acknowledge for the pending break `sequence`, through the
    /// callback or the policy.
    fn answer_break(self: &Arc<Self>, sequence: u64) {
        let SMBLeaseBreakState::BreakPending { new_state, .. } = self.status.borrow().state else {
            return;
        };
        let ack_state = match (self.callback.get(), self.policy) {
            (Some(callback), _) => callback(new_state),
            (None, SMBBreakPolicy::AcceptOffered) => new_state,
            (None, SMBBreakPolicy::Defer) => {
                debug!(key = %self.key, "deferring break {}", sequence);
                return;
            }
        };
        if !ack_state.is_subset_of(new_state) {
            let error = SMBError::precondition_failed(format!(
                "break callback for lease {} returned {}, which is not within the offered {}", self.key, ack_state, new_state
            ));
            warn!(key = %self.key, "{}", error);
            self.status.send_modify(|status| status.fail(sequence, error));
            return;
        }
        self.send_ack(sequence, ack_state, None);
    }

    fn handle_acknowledge(self: &Arc<Self>, state: SMBLeaseState, reply: oneshot::Sender<SMBResult<()>>) {
        let status = self.status.borrow().clone();
        let checked = match (status.state, status.ack_in_flight) {
            (SMBLeaseBreakState::Granted(_), _) => Err(SMBError::precondition_failed(format!(
                "lease {} has no break pending", self.key
            ))),
            (SMBLeaseBreakState::BreakPending { .. }, Some(_)) => Err(SMBError::precondition_failed(format!(
                "lease {} is already acknowledging its break", self.key
            ))),
            (SMBLeaseBreakState::BreakPending { new_state, sequence, .. }, None) => match state.is_subset_of(new_state) {
                true => Ok(sequence),
                false => Err(SMBError::precondition_failed(format!(
                    "cannot acknowledge {} when {} was offered", state, new_state
                ))),
            },
        };
        match checked {
            Ok(sequence) => {
                self.status.send_modify(|status| status.failure = None);
                self.send_ack(sequence, state, Some(reply));
            }
            Err(e) => {
                debug!(key = %self.key, "acknowledgment rejected: {}", e);
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Sends the acknowledgment off the worker. The outcome comes back as an
    /// `AckCompleted` job so a break that arrives meanwhile can supersede it.
    fn send_ack(self: &Arc<Self>, sequence: u64, state: SMBLeaseState, reply: Option<oneshot::Sender<SMBResult<()>>>) {
        self.status.send_modify(|status| status.ack_in_flight = Some(sequence));
        debug!(key = %self.key, "acknowledging break {} with {}", sequence, state);
        let lease = self.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let ack = SMBLeaseBreakAcknowledgement::new(lease.key, state);
            let result = transport.send_lease_ack(ack).await.map(|_| ());
            let job = SMBLeaseJob::AckCompleted { sequence, state, result, reply };
            if let Err(e) = lease.enqueue(job) {
                warn!(key = %lease.key, "acknowledgment result lost: {}", e);
            }
        });
    }

    fn handle_ack_completed(&self, sequence: u64, state: SMBLeaseState, result: SMBResult<()>, reply: Option<oneshot::Sender<SMBResult<()>>>) {
        let key = self.key;
        let mut outcome = Ok(());
        self.status.send_modify(|status| {
            if status.ack_in_flight == Some(sequence) {
                status.ack_in_flight = None;
            }
            if status.pending_sequence() != Some(sequence) {
                debug!(key = %key, "ignoring acknowledgment of superseded break {}", sequence);
                if let Err(e) = result {
                    outcome = Err(SMBError::break_failed(sequence, Arc::new(e)));
                }
                return;
            }
            match result {
                Ok(()) => {
                    info!(key = %key, "break {} acknowledged, lease now {}", sequence, state);
                    status.last_ack = Some(state);
                    status.resolve(sequence, state);
                }
                Err(e) => {
                    warn!(key = %key, "acknowledging break {} failed: {}", sequence, e);
                    let error = Arc::new(e);
                    status.failure = Some(SMBLeaseFailure { sequence, error: error.clone() });
                    outcome = Err(SMBError::break_failed(sequence, error));
                }
            }
        });
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }
}

/// Wrapping comparison of V2 lease epochs.
fn is_older_epoch(new: u16, current: u16) -> bool {
    (new.wrapping_sub(current) as i16) < 0
}

/// Waits on one particular break of a lease. Any number of waiters, from any
/// number of handles, can watch the same break.
#[derive(Debug, Clone)]
pub struct SMBBreakWaiter {
    key: SMBLeaseKey,
    receiver: watch::Receiver<SMBLeaseStatus>,
    target: u64,
}

impl SMBBreakWaiter {
    /// The break number this waiter is watching.
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Resolves once the break has arrived, with the state the server offered.
    pub async fn notified(&mut self) -> SMBResult<SMBLeaseState> {
        let (key, target) = (self.key, self.target);
        let status = self.receiver.wait_for(|status| status.breaks_received >= target).await
            .map_err(|_| SMBError::precondition_failed(format!("lease {} was dropped", key)))?
            .clone();
        match (status.last_offered, status.failure) {
            (Some((sequence, offered)), _) if sequence >= target => Ok(offered),
            (_, Some(failure)) => Err(SMBError::break_failed(failure.sequence, failure.error)),
            _ => Err(SMBError::precondition_failed(format!("break {} of lease {} carried no state", target, key))),
        }
    }

    /// Resolves once the break, or a later one that superseded it, has ended in a
    /// granted state. Fails if the latest attempt to get there failed.
    pub async fn resolved(&mut self) -> SMBResult<SMBLeaseState> {
        let (key, target) = (self.key, self.target);
        let status = self.receiver
            .wait_for(|status| {
                status.resolved_sequence >= target
                    || status.failure.as_ref().is_some_and(|failure| failure.sequence >= target)
            })
            .await
            .map_err(|_| SMBError::precondition_failed(format!("lease {} was dropped", key)))?
            .clone();
        if status.resolved_sequence >= target {
            return Ok(status.last_resolved);
        }
        match status.failure {
            Some(failure) => Err(SMBError::break_failed(failure.sequence, failure.error)),
            None => Ok(status.last_resolved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_compare_with_wraparound() {
        assert!(is_older_epoch(1, 2));
        assert!(!is_older_epoch(2, 2));
        assert!(!is_older_epoch(3, 2));
        assert!(!is_older_epoch(0, u16::MAX));
        assert!(is_older_epoch(u16::MAX, 0));
    }

    #[test]
    fn granted_state_survives_a_pending_break() {
        let pending = SMBLeaseBreakState::BreakPending {
            old_state: SMBLeaseState::RWH,
            new_state: SMBLeaseState::R,
            sequence: 1,
        };
        assert_eq!(pending.granted(), SMBLeaseState::RWH);
        assert!(pending.is_break_pending());
        assert_eq!(SMBLeaseBreakState::Granted(SMBLeaseState::RH).granted(), SMBLeaseState::RH);
    }

    #[test]
    fn failures_are_shared_between_observers() {
        let mut status = SMBLeaseStatus::new();
        status.fail(2, SMBError::protocol_violation("bad state"));
        let copy = status.clone();
        assert!(Arc::ptr_eq(status.failure().unwrap().error(), copy.failure().unwrap().error()));
        status.resolve(2, SMBLeaseState::R);
        assert!(status.failure().is_none());
        assert_eq!(status.resolved_sequence(), 2);
    }
}
