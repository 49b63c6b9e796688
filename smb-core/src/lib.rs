use uuid::Uuid;

use error::SMBError;

pub mod error;
pub mod logging;
pub mod nt_status;

pub type SMBResult<T> = Result<T, SMBError>;
pub type SMBParseResult<I, O, E = SMBError> = Result<(I, O), E>;

pub trait SMBByteSize {
    fn smb_byte_size(&self) -> usize;
}

pub trait SMBFromBytes: SMBByteSize {
    fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> where Self: Sized;
}

pub trait SMBToBytes: SMBByteSize {
    fn smb_to_bytes(&self) -> Vec<u8>;
}

/// Fails with [`SMBError::PayloadTooSmall`] when `input` cannot hold `expected` bytes.
pub fn ensure_len(input: &[u8], expected: usize) -> SMBResult<()> {
    if input.len() < expected {
        return Err(SMBError::payload_too_small(expected, input.len()));
    }
    Ok(())
}

impl SMBFromBytes for Uuid {
    fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> where Self: Sized {
        let (remaining, bytes) = <[u8; 16]>::smb_from_bytes(input)?;
        Ok((remaining, Uuid::from_bytes_le(bytes)))
    }
}

impl SMBByteSize for Uuid {
    fn smb_byte_size(&self) -> usize {
        self.as_bytes().len()
    }
}

impl SMBToBytes for Uuid {
    fn smb_to_bytes(&self) -> Vec<u8> {
        self.to_bytes_le().to_vec()
    }
}

macro_rules! impl_parse_fixed_slice {
    ($size: expr, $input: expr) => {{
        ensure_len($input, $size)?;
        let res = <[u8; $size]>::try_from(&$input[0..$size])
            .map_err(|_e| SMBError::parse_error("Invalid byte slice"))?;
        Ok((&$input[$size..], res))
    }}
}

macro_rules! impl_smb_bytes_for_slice {(
    $($N:literal)*
) => (
    $(
        impl SMBByteSize for [u8; $N] {
            fn smb_byte_size(&self) -> usize {
                $N
            }
        }

        impl SMBFromBytes for [u8; $N] {
            fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> {
                impl_parse_fixed_slice!($N, input)
            }
        }

        impl SMBToBytes for [u8; $N] {
            fn smb_to_bytes(&self) -> Vec<u8> {
                self.to_vec()
            }
        }
    )*
)}

macro_rules! impl_smb_bytes_unsigned_type {(
    $($t:ty)*
) => (
    $(
        impl SMBByteSize for $t {
            fn smb_byte_size(&self) -> usize {
                std::mem::size_of_val(self)
            }
        }

        impl SMBFromBytes for $t {
            fn smb_from_bytes(input: &[u8]) -> SMBParseResult<&[u8], Self> {
                const T_SIZE: usize = std::mem::size_of::<$t>();
                let value: SMBParseResult<&[u8], [u8; T_SIZE]> = impl_parse_fixed_slice!(T_SIZE, input);
                let (remaining, bytes) = value?;
                Ok((remaining, <$t>::from_le_bytes(bytes)))
            }
        }

        impl SMBToBytes for $t {
            fn smb_to_bytes(&self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        }
    )*
)}

impl_smb_bytes_for_slice! {
    2 4 8 16
}

impl_smb_bytes_unsigned_type! {
    u8 u16 u32 u64 u128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_values_are_little_endian() {
        assert_eq!(0x0102_u16.smb_to_bytes(), vec![0x02, 0x01]);
        let (remaining, value) = u32::smb_from_bytes(&[0x04, 0x03, 0x02, 0x01, 0xFF]).unwrap();
        assert_eq!(value, 0x0102_0304);
        assert_eq!(remaining, &[0xFF]);
    }

    #[test]
    fn short_input_reports_sizes() {
        let err = u64::smb_from_bytes(&[0; 3]).unwrap_err();
        assert!(matches!(err, SMBError::PayloadTooSmall(_)));
        assert_eq!(err.to_string(), "Expected 8 bytes, was actually 3 bytes");
    }

    #[test]
    fn fixed_slices_consume_exactly_their_length() {
        let input: Vec<u8> = (0..20).collect();
        let (remaining, key) = <[u8; 16]>::smb_from_bytes(&input).unwrap();
        assert_eq!(key[15], 15);
        assert_eq!(remaining.len(), 4);
    }
}
