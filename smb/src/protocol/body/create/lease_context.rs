use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};

use smb_core::{ensure_len, SMBByteSize, SMBFromBytes, SMBParseResult, SMBResult, SMBToBytes};
use smb_core::error::SMBError;

use crate::protocol::lease::{SMBLeaseKey, SMBLeaseState};
use crate::util::flags_helper::{impl_smb_byte_size_for_bitflag, impl_smb_from_bytes_for_bitflag, impl_smb_to_bytes_for_bitflag};

// Same tag for v1 and v2, different by data length
pub const REQUEST_LEASE_TAG: &[u8] = "RqLs".as_bytes();

const LEASE_V1_SIZE: usize = 32;
const LEASE_V2_SIZE: usize = 52;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, Serialize, Deserialize)]
pub enum SMBLeaseVersion {
    V1 = 1,
    V2 = 2,
}

impl SMBLeaseVersion {
    pub fn context_size(&self) -> usize {
        match self {
            Self::V1 => LEASE_V1_SIZE,
            Self::V2 => LEASE_V2_SIZE,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SMBLeaseContextFlags: u32 {
        const BREAK_IN_PROGRESS = 0x2;
        const PARENT_LEASE_KEY_SET = 0x4;
    }
}

impl_smb_byte_size_for_bitflag! { SMBLeaseContextFlags }
impl_smb_to_bytes_for_bitflag! { SMBLeaseContextFlags }
impl_smb_from_bytes_for_bitflag! { SMBLeaseContextFlags }

/// Payload of the `RqLs` create context, in both directions (MS-SMB2 2.2.13.2.8,
/// 2.2.13.2.10, 2.2.14.2.10 and 2.2.14.2.11).
///
/// The lease state is kept as raw bits so a server answering with an invalid
/// combination is reported by [`SMBLeaseContext::lease_state`] instead of being
/// lost at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SMBLeaseContext {
    version: SMBLeaseVersion,
    lease_key: SMBLeaseKey,
    lease_state: u32,
    lease_flags: SMBLeaseContextFlags,
    parent_lease_key: Option<SMBLeaseKey>,
    epoch: u16,
}

impl SMBLeaseContext {
    pub fn request(version: SMBLeaseVersion, lease_key: SMBLeaseKey, state: SMBLeaseState) -> Self {
        Self {
            version,
            lease_key,
            lease_state: state.bits(),
            lease_flags: SMBLeaseContextFlags::empty(),
            parent_lease_key: None,
            epoch: 0,
        }
    }

    pub fn response(version: SMBLeaseVersion, lease_key: SMBLeaseKey, lease_state: u32, epoch: u16) -> Self {
        Self {
            version,
            lease_key,
            lease_state,
            lease_flags: SMBLeaseContextFlags::empty(),
            parent_lease_key: None,
            epoch,
        }
    }

    pub fn with_parent(mut self, parent: SMBLeaseKey) -> Self {
        self.parent_lease_key = Some(parent);
        self.lease_flags |= SMBLeaseContextFlags::PARENT_LEASE_KEY_SET;
        self
    }

    pub fn with_break_in_progress(mut self) -> Self {
        self.lease_flags |= SMBLeaseContextFlags::BREAK_IN_PROGRESS;
        self
    }

    pub fn version(&self) -> SMBLeaseVersion {
        self.version
    }

    pub fn lease_key(&self) -> SMBLeaseKey {
        self.lease_key
    }

    pub fn lease_state(&self) -> SMBResult<SMBLeaseState> {
        SMBLeaseState::from_bits(self.lease_state)
    }

    pub fn raw_lease_state(&self) -> u32 {
        self.lease_state
    }

    pub fn flags(&self) -> SMBLeaseContextFlags {
        self.lease_flags
    }

    pub fn parent_lease_key(&self) -> Option<SMBLeaseKey> {
        self.parent_lease_key
    }

    /// Only V2 leases carry an epoch.
    pub fn epoch(&self) -> Option<u16> {
        match self.version {
            SMBLeaseVersion::V1 => None,
            SMBLeaseVersion::V2 => Some(self.epoch),
        }
    }

    pub fn tag(&self) -> &'static [u8] {
        REQUEST_LEASE_TAG
    }
}

impl SMBByteSize for SMBLeaseContext {
    fn smb_byte_size(&self) -> usize {
        self.version.context_size()
    }
}

impl SMBFromBytes for SMBLeaseContext {
    fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> where Self: Sized {
        ensure_len(input, LEASE_V1_SIZE)?;
        let version = if input.len() >= LEASE_V2_SIZE {
            SMBLeaseVersion::V2
        } else {
            SMBLeaseVersion::V1
        };
        let (remaining, lease_key) = SMBLeaseKey::smb_from_bytes(input)?;
        let (remaining, lease_state) = u32::smb_from_bytes(remaining)?;
        let (remaining, lease_flags) = SMBLeaseContextFlags::smb_from_bytes(remaining)?;
        // LeaseDuration is reserved
        let (remaining, _) = u64::smb_from_bytes(remaining)?;
        if version == SMBLeaseVersion::V1 {
            return Ok((remaining, Self {
                version,
                lease_key,
                lease_state,
                lease_flags,
                parent_lease_key: None,
                epoch: 0,
            }));
        }
        let (remaining, parent) = SMBLeaseKey::smb_from_bytes(remaining)?;
        let (remaining, epoch) = u16::smb_from_bytes(remaining)?;
        let (remaining, _) = u16::smb_from_bytes(remaining)?;
        let parent_lease_key = lease_flags
            .contains(SMBLeaseContextFlags::PARENT_LEASE_KEY_SET)
            .then_some(parent);
        Ok((remaining, Self {
            version,
            lease_key,
            lease_state,
            lease_flags,
            parent_lease_key,
            epoch,
        }))
    }
}

impl SMBToBytes for SMBLeaseContext {
    fn smb_to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.smb_byte_size());
        bytes.extend(self.lease_key.smb_to_bytes());
        bytes.extend(self.lease_state.smb_to_bytes());
        bytes.extend(self.lease_flags.smb_to_bytes());
        bytes.extend(0u64.smb_to_bytes());
        if self.version == SMBLeaseVersion::V2 {
            bytes.extend(self.parent_lease_key.unwrap_or(SMBLeaseKey::new([0; 16])).smb_to_bytes());
            bytes.extend(self.epoch.smb_to_bytes());
            bytes.extend(0u16.smb_to_bytes());
        }
        bytes
    }
}

impl TryFrom<&[u8]> for SMBLeaseContext {
    type Error = SMBError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::smb_from_bytes(value).map(|(_, context)| context)
    }
}
