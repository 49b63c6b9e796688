use std::fmt::{Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use smb_core::{SMBByteSize, SMBFromBytes, SMBParseResult, SMBToBytes};

/// Client-chosen 16 byte identifier shared by every open of a file that should be
/// cached as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SMBLeaseKey([u8; 16]);

impl SMBLeaseKey {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::thread_rng().r#gen::<u128>().to_le_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl From<[u8; 16]> for SMBLeaseKey {
    fn from(value: [u8; 16]) -> Self {
        Self(value)
    }
}

impl From<Uuid> for SMBLeaseKey {
    fn from(value: Uuid) -> Self {
        Self(value.to_bytes_le())
    }
}

impl Display for SMBLeaseKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl SMBByteSize for SMBLeaseKey {
    fn smb_byte_size(&self) -> usize {
        self.0.len()
    }
}

impl SMBFromBytes for SMBLeaseKey {
    fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> where Self: Sized {
        let (remaining, bytes) = <[u8; 16]>::smb_from_bytes(input)?;
        Ok((remaining, Self(bytes)))
    }
}

impl SMBToBytes for SMBLeaseKey {
    fn smb_to_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_keys_differ() {
        let a = SMBLeaseKey::random();
        let b = SMBLeaseKey::random();
        assert_ne!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn display_is_lowercase_hex() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xAB;
        bytes[15] = 0x01;
        assert_eq!(SMBLeaseKey::new(bytes).to_string(), "ab000000000000000000000000000001");
    }

    #[test]
    fn uuid_keys_use_wire_byte_order() {
        let uuid = Uuid::from_u128(0x00112233_4455_6677_8899_aabbccddeeff);
        let key = SMBLeaseKey::from(uuid);
        assert_eq!(key.as_bytes(), &uuid.to_bytes_le());
    }
}
