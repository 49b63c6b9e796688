use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};

use crate::{SMBByteSize, SMBFromBytes, SMBParseResult, SMBToBytes};
use crate::error::SMBError;

/// Status codes the lease engine reacts to, from [MS-ERREF] 2.3.1.
#[repr(u32)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TryFromPrimitive, Copy)]
pub enum NTStatus {
    StatusSuccess = 0x0,
    StatusPending = 0x00000103,
    Unsuccessful = 0xC0000001,
    InvalidParameter = 0xC000000D,
    AccessDenied = 0xC0000022,
    ObjectNameNotFound = 0xC0000034,
    SharingViolation = 0xC0000043,
    InvalidOplockProtocol = 0xC00000E3,
    NetworkNameDeleted = 0xC00000C9,
    FileClosed = 0xC0000128,
    InvalidDeviceState = 0xC0000184,
    UserSessionDeleted = 0xC0000203,
    NetworkSessionExpired = 0xC000035C,
    UnknownError = 0xFFFFFFFF,
}

impl NTStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::StatusSuccess | Self::StatusPending)
    }

    /// Statuses a server returns for a lease acknowledgment it did not expect.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::InvalidOplockProtocol | Self::InvalidDeviceState)
    }
}

impl SMBByteSize for NTStatus {
    fn smb_byte_size(&self) -> usize {
        std::mem::size_of_val(&(*self as u32))
    }
}

impl SMBFromBytes for NTStatus {
    fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> where Self: Sized {
        let (remaining, underlying) = u32::smb_from_bytes(input)?;
        let res = Self::try_from_primitive(underlying)
            .map_err(SMBError::parse_error)?;
        Ok((remaining, res))
    }
}

impl SMBToBytes for NTStatus {
    fn smb_to_bytes(&self) -> Vec<u8> {
        (*self as u32).smb_to_bytes()
    }
}
