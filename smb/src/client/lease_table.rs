use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;

use smb_core::logging::{debug, trace, warn};

use crate::client::config::SMBBreakPolicy;
use crate::client::lease::SMBLease;
use crate::client::open::SMBHandleId;
use crate::protocol::body::lease_break::SMBLeaseBreakNotification;
use crate::protocol::lease::SMBLeaseKey;
use crate::transport::SMBLeaseTransport;

#[derive(Debug)]
struct SMBLeaseEntry<T: SMBLeaseTransport> {
    lease: Arc<SMBLease<T>>,
    handles: HashSet<SMBHandleId>,
}

#[derive(Debug)]
struct SMBLeaseEntries<T: SMBLeaseTransport> {
    leases: HashMap<SMBLeaseKey, SMBLeaseEntry<T>>,
    handles: HashMap<SMBHandleId, SMBLeaseKey>,
}

/// Where a break notification ended up.
#[derive(Debug)]
pub enum SMBDispatchOutcome {
    /// Queued on the lease's worker.
    Routed,
    /// No lease with that key; the notification is handed back.
    Unknown(SMBLeaseBreakNotification),
}

/// Session-wide registry of lease objects by key, plus the handles linked to each.
///
/// There is never more than one lease object per key in the table. Leases are
/// created on first use and, when `retire_idle` is set, dropped from the table
/// once they have no handles, no queued jobs and no break outstanding.
#[derive(Debug)]
pub struct SMBLeaseTable<T: SMBLeaseTransport> {
    transport: Arc<T>,
    policy: SMBBreakPolicy,
    retire_idle: bool,
    entries: RwLock<SMBLeaseEntries<T>>,
    self_ref: Weak<Self>,
}

impl<T: SMBLeaseTransport> SMBLeaseTable<T> {
    pub fn new(transport: Arc<T>, policy: SMBBreakPolicy, retire_idle: bool) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            transport,
            policy,
            retire_idle,
            entries: RwLock::new(SMBLeaseEntries {
                leases: HashMap::new(),
                handles: HashMap::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    pub async fn get_or_create(&self, key: SMBLeaseKey) -> Arc<SMBLease<T>> {
        let mut entries = self.entries.write().await;
        self.entry(&mut entries, key).lease.clone()
    }

    /// Links `handle` to the lease for `key`, creating the lease if needed.
    pub async fn attach(&self, handle: SMBHandleId, key: SMBLeaseKey) -> Arc<SMBLease<T>> {
        let mut entries = self.entries.write().await;
        let entry = self.entry(&mut entries, key);
        entry.handles.insert(handle);
        let lease = entry.lease.clone();
        entries.handles.insert(handle, key);
        trace!(key = %key, "attached handle {}", handle);
        lease
    }

    /// Unlinks `handle`. Returns the lease it was linked to.
    pub async fn detach(&self, handle: SMBHandleId) -> Option<Arc<SMBLease<T>>> {
        let lease = {
            let mut entries = self.entries.write().await;
            let key = entries.handles.remove(&handle)?;
            let entry = entries.leases.get_mut(&key)?;
            entry.handles.remove(&handle);
            trace!(key = %key, "detached handle {}", handle);
            entry.lease.clone()
        };
        self.retire_if_idle(lease.key()).await;
        Some(lease)
    }

    pub async fn lookup(&self, key: SMBLeaseKey) -> Option<Arc<SMBLease<T>>> {
        self.entries.read().await.leases.get(&key).map(|entry| entry.lease.clone())
    }

    /// Routes a break to its lease. Routing happens under the table lock, so a
    /// lease cannot be retired between lookup and queueing.
    pub async fn dispatch(&self, notification: SMBLeaseBreakNotification) -> SMBDispatchOutcome {
        let entries = self.entries.read().await;
        let Some(entry) = entries.leases.get(&notification.lease_key()) else {
            return SMBDispatchOutcome::Unknown(notification);
        };
        match entry.lease.dispatch_break(notification.clone()) {
            Ok(()) => SMBDispatchOutcome::Routed,
            Err(e) => {
                warn!(key = %notification.lease_key(), "could not queue lease break: {}", e);
                SMBDispatchOutcome::Unknown(notification)
            }
        }
    }

    /// Drops the lease for `key` if nothing refers to it anymore. Returns whether
    /// it was dropped.
    pub async fn retire_if_idle(&self, key: SMBLeaseKey) -> bool {
        if !self.retire_idle {
            return false;
        }
        let mut entries = self.entries.write().await;
        let idle = entries.leases.get(&key)
            .is_some_and(|entry| entry.handles.is_empty() && entry.lease.is_idle());
        if idle {
            entries.leases.remove(&key);
            debug!(key = %key, "retired idle lease");
        }
        idle
    }

    pub async fn handle_count(&self, key: SMBLeaseKey) -> usize {
        self.entries.read().await.leases.get(&key).map_or(0, |entry| entry.handles.len())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.leases.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.leases.is_empty()
    }

    fn entry<'a>(&self, entries: &'a mut SMBLeaseEntries<T>, key: SMBLeaseKey) -> &'a mut SMBLeaseEntry<T> {
        entries.leases.entry(key).or_insert_with(|| {
            debug!(key = %key, "creating lease");
            SMBLeaseEntry {
                lease: SMBLease::new(key, self.transport.clone(), self.policy, self.self_ref.clone()),
                handles: HashSet::new(),
            }
        })
    }
}
