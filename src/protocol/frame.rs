//! Fixed frame header shared by every message.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::OpCode;
use crate::error::{IofwdError, IofwdResult};

/// Size of [`FrameHeader`] on the wire.
pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

/// `total_size` then `opcode`, little-endian and unaligned so it can be read
/// straight out of a receive ring at any offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct FrameHeader {
    total_size: U64,
    opcode: U32,
}

impl FrameHeader {
    pub fn new(total_size: usize, opcode: OpCode) -> Self {
        Self {
            total_size: U64::new(total_size as u64),
            opcode: U32::new(opcode as u32),
        }
    }

    /// Read a header from the front of `bytes` without validating it.
    pub fn peek(bytes: &[u8]) -> IofwdResult<Self> {
        FrameHeader::read_from_prefix(bytes)
            .map(|(header, _)| header)
            .map_err(|_| {
                IofwdError::UnexpectedMessage(format!(
                    "frame header needs {} bytes, got {}",
                    FRAME_HEADER_SIZE,
                    bytes.len()
                ))
            })
    }

    pub fn total_size(&self) -> usize {
        self.total_size.get() as usize
    }

    pub fn raw_opcode(&self) -> u32 {
        self.opcode.get()
    }

    pub fn opcode(&self) -> IofwdResult<OpCode> {
        OpCode::try_from(self.raw_opcode())
    }

    /// Check that the header describes a frame of at least header size that
    /// fits in `available` bytes.
    pub fn validate(&self, available: usize) -> IofwdResult<usize> {
        let total = self.total_size();
        if total < FRAME_HEADER_SIZE {
            return Err(IofwdError::UnexpectedMessage(format!(
                "frame size {} smaller than header",
                total
            )));
        }
        if total > available {
            return Err(IofwdError::UnexpectedMessage(format!(
                "frame size {} exceeds {} received bytes",
                total, available
            )));
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(FRAME_HEADER_SIZE, 12);

        let header = FrameHeader::new(0x0102, OpCode::PutVara);
        let bytes = header.as_bytes();
        assert_eq!(&bytes[..8], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[8..], &20u32.to_le_bytes());
    }

    #[test]
    fn test_peek_and_validate() {
        let mut raw = FrameHeader::new(40, OpCode::Close).as_bytes().to_vec();
        raw.extend_from_slice(&[0u8; 4]);

        let header = FrameHeader::peek(&raw).unwrap();
        assert_eq!(header.opcode().unwrap(), OpCode::Close);
        assert_eq!(header.validate(64).unwrap(), 40);
        assert!(header.validate(39).is_err());

        assert!(FrameHeader::peek(&raw[..5]).is_err());
        assert!(FrameHeader::new(4, OpCode::Close).validate(64).is_err());
    }
}
