use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};

/// RequestedOplockLevel / OplockLevel of a create (MS-SMB2 2.2.13). Leasing is
/// requested with [`SMBOplockLevel::Lease`] plus a lease create context.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive, Serialize, Deserialize)]
pub enum SMBOplockLevel {
    None = 0x0,
    II = 0x1,
    Exclusive = 0x8,
    Batch = 0x9,
    Lease = 0xFF,
}

impl Default for SMBOplockLevel {
    fn default() -> Self {
        Self::None
    }
}
