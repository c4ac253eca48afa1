//! Wire protocol between clients and servers.
//!
//! Every frame starts with a little-endian `total_size: u64` covering the
//! whole frame, followed by an `opcode: u32` and the opcode's fields in a
//! fixed order. Arrays travel as `[i32 count][count * element bytes]`;
//! strings are byte arrays including a terminating zero.

pub mod codec;
pub mod frame;

pub use codec::Message;
pub use frame::{FrameHeader, FRAME_HEADER_SIZE};

use serde::{Deserialize, Serialize};

use crate::error::{IofwdError, IofwdResult};

/// Attribute target meaning "the dataset itself" rather than a variable.
pub const GLOBAL_VAR_ID: i32 = -1;

/// Operation carried by a frame.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCode {
    Create = 1,
    EndDef = 2,
    Close = 3,
    DefDim = 11,
    DefVar = 12,
    PutAtt = 13,
    PutVara = 20,
    /// End of one send/drain phase.
    IoEnd = 30,
    /// End of the client's stream.
    Final = 40,
    /// Server-internal: a client's stream has been fully received.
    ReaderFinal = 41,
    /// Server-internal: a client's writes have been committed.
    WriterFinal = 42,
}

impl OpCode {
    /// Whether the opcode can appear on the wire.
    pub fn is_wire(self) -> bool {
        !matches!(self, OpCode::ReaderFinal | OpCode::WriterFinal)
    }

    /// Terminal opcodes are never merged with neighbouring frames.
    pub fn is_terminal(self) -> bool {
        matches!(self, OpCode::IoEnd | OpCode::Final)
    }
}

impl TryFrom<u32> for OpCode {
    type Error = IofwdError;

    fn try_from(v: u32) -> IofwdResult<Self> {
        match v {
            1 => Ok(OpCode::Create),
            2 => Ok(OpCode::EndDef),
            3 => Ok(OpCode::Close),
            11 => Ok(OpCode::DefDim),
            12 => Ok(OpCode::DefVar),
            13 => Ok(OpCode::PutAtt),
            20 => Ok(OpCode::PutVara),
            30 => Ok(OpCode::IoEnd),
            40 => Ok(OpCode::Final),
            41 => Ok(OpCode::ReaderFinal),
            42 => Ok(OpCode::WriterFinal),
            other => Err(IofwdError::UnexpectedMessage(format!("unknown opcode {}", other))),
        }
    }
}

/// Element type of variables and attributes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Byte = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Float = 5,
    Double = 6,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::Byte | DataType::Char => 1,
            DataType::Short => 2,
            DataType::Int | DataType::Float => 4,
            DataType::Double => 8,
        }
    }
}

impl TryFrom<i32> for DataType {
    type Error = IofwdError;

    fn try_from(v: i32) -> IofwdResult<Self> {
        match v {
            1 => Ok(DataType::Byte),
            2 => Ok(DataType::Char),
            3 => Ok(DataType::Short),
            4 => Ok(DataType::Int),
            5 => Ok(DataType::Float),
            6 => Ok(DataType::Double),
            other => Err(IofwdError::UnexpectedMessage(format!("unknown data type {}", other))),
        }
    }
}

/// Rust types that can be written as variable or attribute elements.
pub trait Element: Copy + Send + 'static {
    const DATA_TYPE: DataType;

    /// Append the little-endian encoding of `values` to `out`.
    fn extend_le(values: &[Self], out: &mut Vec<u8>);

    /// Decode little-endian elements. Trailing partial elements are ignored.
    fn from_le_slice(bytes: &[u8]) -> Vec<Self>;
}

macro_rules! impl_element {
    ($ty:ty, $data_type:expr) => {
        impl Element for $ty {
            const DATA_TYPE: DataType = $data_type;

            fn extend_le(values: &[Self], out: &mut Vec<u8>) {
                out.reserve(values.len() * std::mem::size_of::<$ty>());
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }

            fn from_le_slice(bytes: &[u8]) -> Vec<Self> {
                bytes
                    .chunks_exact(std::mem::size_of::<$ty>())
                    .map(|chunk| {
                        let mut raw = [0u8; std::mem::size_of::<$ty>()];
                        raw.copy_from_slice(chunk);
                        <$ty>::from_le_bytes(raw)
                    })
                    .collect()
            }
        }
    };
}

impl_element!(i8, DataType::Byte);
impl_element!(u8, DataType::Char);
impl_element!(i16, DataType::Short);
impl_element!(i32, DataType::Int);
impl_element!(f32, DataType::Float);
impl_element!(f64, DataType::Double);

/// Encode a slice of elements as little-endian bytes.
pub fn to_le_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::new();
    T::extend_le(values, &mut out);
    out
}

/// Largest frame a client may send.
///
/// Starts from the smallest of the message buffer and half of each ring, is
/// raised so that all clients together can keep `send_msg_min_size` bytes in
/// flight, and is finally capped so that a single frame always fits both the
/// client ring and the server's per-client receive ring.
pub fn max_message_size(
    msg_buffer_size: usize,
    server_region_size: usize,
    client_buffer_size: usize,
    send_msg_min_size: usize,
    client_amount: usize,
) -> usize {
    let mut size = msg_buffer_size
        .min(server_region_size / 2)
        .min(client_buffer_size / 2);

    let per_client_floor = send_msg_min_size / client_amount.max(1);
    size = size.max(per_client_floor);

    size.min(server_region_size.saturating_sub(1))
        .min(client_buffer_size.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(OpCode::try_from(20).unwrap(), OpCode::PutVara);
        assert_eq!(OpCode::try_from(40).unwrap(), OpCode::Final);
        assert!(matches!(
            OpCode::try_from(99),
            Err(IofwdError::UnexpectedMessage(_))
        ));
        assert!(!OpCode::ReaderFinal.is_wire());
        assert!(OpCode::IoEnd.is_terminal());
        assert!(!OpCode::PutVara.is_terminal());
    }

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::Char.size(), 1);
        assert_eq!(DataType::Short.size(), 2);
        assert_eq!(DataType::Float.size(), 4);
        assert_eq!(DataType::Double.size(), 8);
        assert!(DataType::try_from(0).is_err());
    }

    #[test]
    fn test_element_encoding() {
        let bytes = to_le_bytes(&[1.5f64, -2.0]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(f64::from_le_slice(&bytes), vec![1.5, -2.0]);

        let bytes = to_le_bytes(&[258i16]);
        assert_eq!(bytes, vec![2, 1]);
        assert_eq!(<i16 as Element>::DATA_TYPE, DataType::Short);
    }

    #[test]
    fn test_max_message_size() {
        const KIB: usize = 1024;
        const MIB: usize = 1024 * KIB;

        // Small client count: the 70 MiB floor dominates.
        assert_eq!(
            max_message_size(512 * KIB, 64 * MIB, 64 * MIB, 70 * MIB, 4),
            70 * MIB / 4
        );

        // Floor larger than the rings: capped to what one ring can hold.
        assert_eq!(
            max_message_size(512 * KIB, 8 * MIB, 8 * MIB, 70 * MIB, 4),
            8 * MIB - 1
        );

        // Many clients: floor drops below the buffer bound.
        assert_eq!(
            max_message_size(512 * KIB, 8 * MIB, 8 * MIB, 70 * MIB, 1024),
            512 * KIB
        );

        // Tiny rings in tests: half the smaller ring.
        assert_eq!(max_message_size(512 * KIB, 4 * KIB, 8 * KIB, 0, 4), 2 * KIB);
    }
}
