use std::fmt::{Display, Formatter};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use smb_core::{SMBByteSize, SMBFromBytes, SMBParseResult, SMBResult, SMBToBytes};
use smb_core::error::SMBError;

bitflags! {
    /// Raw LeaseState bits as they appear on the wire (MS-SMB2 2.2.13.2.8).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SMBLeaseFlags: u32 {
        const READ_CACHING = 0x1;
        const HANDLE_CACHING = 0x2;
        const WRITE_CACHING = 0x4;
    }
}

/// A lease state that satisfies the caching dependency: write and handle caching
/// are only ever held together with read caching.
///
/// Only the five valid combinations can be represented. Raw bits coming off the
/// wire go through [`SMBLeaseState::from_bits`], which rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SMBLeaseState(SMBLeaseFlags);

impl SMBLeaseState {
    pub const NONE: Self = Self(SMBLeaseFlags::empty());
    pub const R: Self = Self(SMBLeaseFlags::READ_CACHING);
    pub const RW: Self = Self(SMBLeaseFlags::READ_CACHING.union(SMBLeaseFlags::WRITE_CACHING));
    pub const RH: Self = Self(SMBLeaseFlags::READ_CACHING.union(SMBLeaseFlags::HANDLE_CACHING));
    pub const RWH: Self = Self(SMBLeaseFlags::all());

    pub fn from_flags(flags: SMBLeaseFlags) -> SMBResult<Self> {
        let dependent = SMBLeaseFlags::WRITE_CACHING | SMBLeaseFlags::HANDLE_CACHING;
        if flags.intersects(dependent) && !flags.contains(SMBLeaseFlags::READ_CACHING) {
            return Err(SMBError::protocol_violation(format!(
                "lease state {:#x} caches writes or handles without read caching", flags.bits()
            )));
        }
        Ok(Self(flags))
    }

    pub fn from_bits(bits: u32) -> SMBResult<Self> {
        let flags = SMBLeaseFlags::from_bits(bits)
            .ok_or_else(|| SMBError::protocol_violation(format!("lease state {:#x} has unknown bits", bits)))?;
        Self::from_flags(flags)
    }

    pub fn flags(&self) -> SMBLeaseFlags {
        self.0
    }

    pub fn bits(&self) -> u32 {
        self.0.bits()
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    pub fn can_cache_reads(&self) -> bool {
        self.0.contains(SMBLeaseFlags::READ_CACHING)
    }

    pub fn can_cache_writes(&self) -> bool {
        self.0.contains(SMBLeaseFlags::WRITE_CACHING)
    }

    pub fn can_cache_handles(&self) -> bool {
        self.0.contains(SMBLeaseFlags::HANDLE_CACHING)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0.contains(other.0)
    }

    pub fn is_subset_of(&self, other: Self) -> bool {
        other.0.contains(self.0)
    }

    pub fn intersection(&self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn union(&self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Drops `flags`. Dropping read caching takes write and handle caching with it.
    pub fn without(&self, flags: SMBLeaseFlags) -> Self {
        if flags.contains(SMBLeaseFlags::READ_CACHING) {
            return Self::NONE;
        }
        Self(self.0 - flags)
    }
}

impl Default for SMBLeaseState {
    fn default() -> Self {
        Self::NONE
    }
}

impl TryFrom<u32> for SMBLeaseState {
    type Error = SMBError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_bits(value)
    }
}

impl From<SMBLeaseState> for u32 {
    fn from(value: SMBLeaseState) -> Self {
        value.bits()
    }
}

impl Display for SMBLeaseState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return write!(f, "NONE");
        }
        let mut out = String::with_capacity(3);
        if self.can_cache_reads() {
            out.push('R');
        }
        if self.can_cache_writes() {
            out.push('W');
        }
        if self.can_cache_handles() {
            out.push('H');
        }
        write!(f, "{}", out)
    }
}

impl SMBByteSize for SMBLeaseState {
    fn smb_byte_size(&self) -> usize {
        std::mem::size_of::<u32>()
    }
}

impl SMBFromBytes for SMBLeaseState {
    fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> where Self: Sized {
        let (remaining, bits) = u32::smb_from_bytes(input)?;
        Ok((remaining, Self::from_bits(bits)?))
    }
}

impl SMBToBytes for SMBLeaseState {
    fn smb_to_bytes(&self) -> Vec<u8> {
        self.bits().smb_to_bytes()
    }
}
