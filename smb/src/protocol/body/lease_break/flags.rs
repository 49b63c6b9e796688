use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::util::flags_helper::{impl_smb_byte_size_for_bitflag, impl_smb_from_bytes_for_bitflag, impl_smb_to_bytes_for_bitflag};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SMBLeaseBreakNotificationFlags: u32 {
        const NOTIFY_BREAK_LEASE_FLAG_ACK_REQUIRED = 0x01;
    }
}

impl_smb_byte_size_for_bitflag! { SMBLeaseBreakNotificationFlags }
impl_smb_to_bytes_for_bitflag! { SMBLeaseBreakNotificationFlags }
impl_smb_from_bytes_for_bitflag! { SMBLeaseBreakNotificationFlags }
