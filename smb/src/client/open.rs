use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::client::lease::SMBLease;
use crate::protocol::body::create::file_id::SMBFileId;
use crate::protocol::body::create::oplock::SMBOplockLevel;
use crate::protocol::lease::SMBLeaseState;
use crate::transport::SMBLeaseTransport;

/// Client-assigned identity of an open, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SMBHandleId(u64);

impl SMBHandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Display for SMBHandleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The result of a successful open.
#[derive(Debug)]
pub struct SMBHandle<T: SMBLeaseTransport> {
    id: SMBHandleId,
    file_id: SMBFileId,
    file_name: String,
    oplock_level: SMBOplockLevel,
    lease: Option<Arc<SMBLease<T>>>,
    closed: AtomicBool,
}

impl<T: SMBLeaseTransport> SMBHandle<T> {
    pub(crate) fn new(id: SMBHandleId, file_id: SMBFileId, file_name: String, oplock_level: SMBOplockLevel, lease: Option<Arc<SMBLease<T>>>) -> Self {
        Self {
            id,
            file_id,
            file_name,
            oplock_level,
            lease,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SMBHandleId {
        self.id
    }

    pub fn file_id(&self) -> SMBFileId {
        self.file_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn oplock_level(&self) -> SMBOplockLevel {
        self.oplock_level
    }

    /// The lease shared with every other handle opened with the same key.
    pub fn lease(&self) -> Option<&Arc<SMBLease<T>>> {
        self.lease.as_ref()
    }

    pub fn lease_state(&self) -> SMBLeaseState {
        self.lease.as_ref()
            .map(|lease| lease.state())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the handle closed, returning whether it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_closed(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }
}
