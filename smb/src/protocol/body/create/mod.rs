use serde::{Deserialize, Serialize};

use smb_core::SMBResult;
use smb_core::error::SMBError;

use crate::protocol::body::create::file_id::SMBFileId;
use crate::protocol::body::create::lease_context::{SMBLeaseContext, SMBLeaseVersion};
use crate::protocol::body::create::oplock::SMBOplockLevel;
use crate::protocol::lease::{SMBLeaseKey, SMBLeaseState};

pub mod file_id;
pub mod lease_context;
pub mod oplock;

/// The parts of a CREATE request the lease engine cares about. Everything else
/// (access mask, disposition, share access) is filled in by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SMBCreateRequest {
    file_name: String,
    oplock_level: SMBOplockLevel,
    lease: Option<SMBLeaseContext>,
}

impl SMBCreateRequest {
    pub fn without_lease<S: Into<String>>(file_name: S) -> Self {
        Self {
            file_name: file_name.into(),
            oplock_level: SMBOplockLevel::None,
            lease: None,
        }
    }

    pub fn with_lease<S: Into<String>>(file_name: S, version: SMBLeaseVersion, key: SMBLeaseKey, state: SMBLeaseState) -> Self {
        Self {
            file_name: file_name.into(),
            oplock_level: SMBOplockLevel::Lease,
            lease: Some(SMBLeaseContext::request(version, key, state)),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn oplock_level(&self) -> SMBOplockLevel {
        self.oplock_level
    }

    pub fn lease(&self) -> Option<&SMBLeaseContext> {
        self.lease.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SMBCreateResponse {
    file_id: SMBFileId,
    oplock_level: SMBOplockLevel,
    lease: Option<SMBLeaseContext>,
}

impl SMBCreateResponse {
    pub fn new(file_id: SMBFileId, oplock_level: SMBOplockLevel, lease: Option<SMBLeaseContext>) -> Self {
        Self {
            file_id,
            oplock_level,
            lease,
        }
    }

    pub fn file_id(&self) -> SMBFileId {
        self.file_id
    }

    pub fn oplock_level(&self) -> SMBOplockLevel {
        self.oplock_level
    }

    /// The granted lease, if the server granted one. An oplock level of `Lease`
    /// without a lease context is a malformed response.
    pub fn granted_lease(&self) -> SMBResult<Option<&SMBLeaseContext>> {
        match (self.oplock_level, self.lease.as_ref()) {
            (SMBOplockLevel::Lease, Some(lease)) => Ok(Some(lease)),
            (SMBOplockLevel::Lease, None) => Err(SMBError::protocol_violation("lease oplock level without a lease context")),
            _ => Ok(None),
        }
    }
}
