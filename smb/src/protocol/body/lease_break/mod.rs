use serde::{Deserialize, Serialize};

use smb_core::{ensure_len, SMBByteSize, SMBFromBytes, SMBParseResult, SMBResult, SMBToBytes};
use smb_core::error::SMBError;

use crate::protocol::lease::{SMBLeaseKey, SMBLeaseState};

pub use flags::SMBLeaseBreakNotificationFlags;

mod flags;

const NOTIFICATION_STRUCTURE_SIZE: u16 = 44;
const ACKNOWLEDGEMENT_STRUCTURE_SIZE: u16 = 36;

fn parse_structure_size(input: &[u8], expected: u16) -> SMBParseResult<&[u8], ()> {
    ensure_len(input, expected as usize)?;
    let (remaining, size) = u16::smb_from_bytes(input)?;
    if size != expected {
        return Err(SMBError::parse_error(format!("StructureSize {} (expected {})", size, expected)));
    }
    Ok((remaining, ()))
}

/// Server-initiated Lease Break Notification (MS-SMB2 2.2.23.2).
///
/// Both lease states are stored as received; [`Self::current_lease_state`] and
/// [`Self::new_lease_state`] validate them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SMBLeaseBreakNotification {
    new_epoch: u16,
    flags: SMBLeaseBreakNotificationFlags,
    lease_key: SMBLeaseKey,
    current_lease_state: u32,
    new_lease_state: u32,
}

impl SMBLeaseBreakNotification {
    pub fn new(lease_key: SMBLeaseKey, current: SMBLeaseState, new: SMBLeaseState, ack_required: bool, new_epoch: u16) -> Self {
        Self::from_raw(lease_key, current.bits(), new.bits(), ack_required, new_epoch)
    }

    pub fn from_raw(lease_key: SMBLeaseKey, current: u32, new: u32, ack_required: bool, new_epoch: u16) -> Self {
        let flags = match ack_required {
            true => SMBLeaseBreakNotificationFlags::NOTIFY_BREAK_LEASE_FLAG_ACK_REQUIRED,
            false => SMBLeaseBreakNotificationFlags::empty(),
        };
        Self {
            new_epoch,
            flags,
            lease_key,
            current_lease_state: current,
            new_lease_state: new,
        }
    }

    pub fn lease_key(&self) -> SMBLeaseKey {
        self.lease_key
    }

    pub fn new_epoch(&self) -> u16 {
        self.new_epoch
    }

    pub fn ack_required(&self) -> bool {
        self.flags.contains(SMBLeaseBreakNotificationFlags::NOTIFY_BREAK_LEASE_FLAG_ACK_REQUIRED)
    }

    pub fn current_lease_state(&self) -> SMBResult<SMBLeaseState> {
        SMBLeaseState::from_bits(self.current_lease_state)
    }

    pub fn new_lease_state(&self) -> SMBResult<SMBLeaseState> {
        SMBLeaseState::from_bits(self.new_lease_state)
    }
}

impl SMBByteSize for SMBLeaseBreakNotification {
    fn smb_byte_size(&self) -> usize {
        NOTIFICATION_STRUCTURE_SIZE as usize
    }
}

impl SMBFromBytes for SMBLeaseBreakNotification {
    fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> where Self: Sized {
        let (remaining, _) = parse_structure_size(input, NOTIFICATION_STRUCTURE_SIZE)?;
        let (remaining, new_epoch) = u16::smb_from_bytes(remaining)?;
        let (remaining, flags) = SMBLeaseBreakNotificationFlags::smb_from_bytes(remaining)?;
        let (remaining, lease_key) = SMBLeaseKey::smb_from_bytes(remaining)?;
        let (remaining, current_lease_state) = u32::smb_from_bytes(remaining)?;
        let (remaining, new_lease_state) = u32::smb_from_bytes(remaining)?;
        // BreakReason, AccessMaskHint and ShareMaskHint are reserved
        let (remaining, _) = <[u8; 4]>::smb_from_bytes(remaining)?;
        let (remaining, _) = <[u8; 8]>::smb_from_bytes(remaining)?;
        Ok((remaining, Self {
            new_epoch,
            flags,
            lease_key,
            current_lease_state,
            new_lease_state,
        }))
    }
}

impl SMBToBytes for SMBLeaseBreakNotification {
    fn smb_to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.smb_byte_size());
        bytes.extend(NOTIFICATION_STRUCTURE_SIZE.smb_to_bytes());
        bytes.extend(self.new_epoch.smb_to_bytes());
        bytes.extend(self.flags.smb_to_bytes());
        bytes.extend(self.lease_key.smb_to_bytes());
        bytes.extend(self.current_lease_state.smb_to_bytes());
        bytes.extend(self.new_lease_state.smb_to_bytes());
        bytes.extend([0u8; 12]);
        bytes
    }
}

/// Lease Break Acknowledgment and Lease Break Response share one layout
/// (MS-SMB2 2.2.24.2 and 2.2.25.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SMBLeaseBreakContent {
    lease_key: SMBLeaseKey,
    lease_state: SMBLeaseState,
}

pub type SMBLeaseBreakAcknowledgement = SMBLeaseBreakContent;
pub type SMBLeaseBreakResponse = SMBLeaseBreakContent;

impl SMBLeaseBreakContent {
    pub fn new(lease_key: SMBLeaseKey, lease_state: SMBLeaseState) -> Self {
        Self { lease_key, lease_state }
    }

    pub fn lease_key(&self) -> SMBLeaseKey {
        self.lease_key
    }

    pub fn lease_state(&self) -> SMBLeaseState {
        self.lease_state
    }
}

impl SMBByteSize for SMBLeaseBreakContent {
    fn smb_byte_size(&self) -> usize {
        ACKNOWLEDGEMENT_STRUCTURE_SIZE as usize
    }
}

impl SMBFromBytes for SMBLeaseBreakContent {
    fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> where Self: Sized {
        let (remaining, _) = parse_structure_size(input, ACKNOWLEDGEMENT_STRUCTURE_SIZE)?;
        // Reserved and Flags
        let (remaining, _) = <[u8; 2]>::smb_from_bytes(remaining)?;
        let (remaining, _) = u32::smb_from_bytes(remaining)?;
        let (remaining, lease_key) = SMBLeaseKey::smb_from_bytes(remaining)?;
        let (remaining, lease_state) = SMBLeaseState::smb_from_bytes(remaining)?;
        let (remaining, _) = u64::smb_from_bytes(remaining)?;
        Ok((remaining, Self { lease_key, lease_state }))
    }
}

impl SMBToBytes for SMBLeaseBreakContent {
    fn smb_to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.smb_byte_size());
        bytes.extend(ACKNOWLEDGEMENT_STRUCTURE_SIZE.smb_to_bytes());
        bytes.extend([0u8; 6]);
        bytes.extend(self.lease_key.smb_to_bytes());
        bytes.extend(self.lease_state.smb_to_bytes());
        bytes.extend(0u64.smb_to_bytes());
        bytes
    }
}
