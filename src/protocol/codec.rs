//! Encoding and decoding of protocol messages.

use bytes::{Buf, Bytes};
use zerocopy::IntoBytes;

use super::frame::{FrameHeader, FRAME_HEADER_SIZE};
use super::{DataType, OpCode};
use crate::error::{IofwdError, IofwdResult};
use crate::ring::{array_size, str_size, Arena, RingBuffer};

const I32_SIZE: usize = 4;
const USIZE_SIZE: usize = 8;

/// One remote operation, as issued by a client.
///
/// Ids are the client's own: the server translates them through its
/// registry before touching storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Create {
        path: String,
        cmode: i32,
        file_id: i32,
    },
    DefDim {
        file_id: i32,
        name: String,
        len: usize,
        dim_id: i32,
    },
    /// `start`/`count` describe the sub-array this client will write.
    DefVar {
        file_id: i32,
        name: String,
        xtype: DataType,
        dim_ids: Vec<i32>,
        start: Vec<usize>,
        count: Vec<usize>,
        var_id: i32,
    },
    PutAtt {
        file_id: i32,
        var_id: i32,
        name: String,
        xtype: DataType,
        values: Bytes,
    },
    EndDef {
        file_id: i32,
    },
    PutVara {
        file_id: i32,
        var_id: i32,
        start: Vec<usize>,
        count: Vec<usize>,
        data_type: DataType,
        data: Bytes,
    },
    Close {
        file_id: i32,
    },
    IoEnd,
    Final,
}

impl Message {
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Create { .. } => OpCode::Create,
            Message::DefDim { .. } => OpCode::DefDim,
            Message::DefVar { .. } => OpCode::DefVar,
            Message::PutAtt { .. } => OpCode::PutAtt,
            Message::EndDef { .. } => OpCode::EndDef,
            Message::PutVara { .. } => OpCode::PutVara,
            Message::Close { .. } => OpCode::Close,
            Message::IoEnd => OpCode::IoEnd,
            Message::Final => OpCode::Final,
        }
    }

    /// Full framed size, header included.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Message::Create { path, .. } => str_size(path) + 2 * I32_SIZE,
            Message::DefDim { name, .. } => I32_SIZE + str_size(name) + USIZE_SIZE + I32_SIZE,
            Message::DefVar {
                name,
                dim_ids,
                start,
                count,
                ..
            } => {
                I32_SIZE
                    + str_size(name)
                    + I32_SIZE
                    + array_size(dim_ids.len(), I32_SIZE)
                    + array_size(start.len(), USIZE_SIZE)
                    + array_size(count.len(), USIZE_SIZE)
                    + I32_SIZE
            }
            Message::PutAtt { name, values, .. } => {
                2 * I32_SIZE + str_size(name) + I32_SIZE + array_size(values.len(), 1)
            }
            Message::EndDef { .. } | Message::Close { .. } => I32_SIZE,
            Message::PutVara {
                start, count, data, ..
            } => {
                2 * I32_SIZE
                    + array_size(start.len(), USIZE_SIZE)
                    + array_size(count.len(), USIZE_SIZE)
                    + I32_SIZE
                    + array_size(data.len(), 1)
            }
            Message::IoEnd | Message::Final => 0,
        };
        FRAME_HEADER_SIZE + body
    }

    /// Pack the framed message at the ring's free cursor.
    ///
    /// The caller must have made `encoded_len()` contiguous bytes available.
    /// A frame too large for its length prefixes is rejected before any byte
    /// is packed.
    pub fn encode<A: Arena>(&self, ring: &mut RingBuffer<A>) -> IofwdResult<()> {
        let total = self.encoded_len();
        if i32::try_from(total).is_err() {
            return Err(IofwdError::AllocationFailure {
                requested: total,
                available: i32::MAX as usize,
            });
        }
        let header = FrameHeader::new(total, self.opcode());
        ring.pack(header.as_bytes());

        match self {
            Message::Create {
                path,
                cmode,
                file_id,
            } => {
                ring.pack_str(path)?;
                ring.pack_i32(*cmode);
                ring.pack_i32(*file_id);
            }
            Message::DefDim {
                file_id,
                name,
                len,
                dim_id,
            } => {
                ring.pack_i32(*file_id);
                ring.pack_str(name)?;
                ring.pack_usize(*len);
                ring.pack_i32(*dim_id);
            }
            Message::DefVar {
                file_id,
                name,
                xtype,
                dim_ids,
                start,
                count,
                var_id,
            } => {
                ring.pack_i32(*file_id);
                ring.pack_str(name)?;
                ring.pack_i32(*xtype as i32);
                ring.pack_i32_array(dim_ids)?;
                ring.pack_usize_array(start)?;
                ring.pack_usize_array(count)?;
                ring.pack_i32(*var_id);
            }
            Message::PutAtt {
                file_id,
                var_id,
                name,
                xtype,
                values,
            } => {
                ring.pack_i32(*file_id);
                ring.pack_i32(*var_id);
                ring.pack_str(name)?;
                ring.pack_i32(*xtype as i32);
                ring.pack_array(values.len() / xtype.size(), values)?;
            }
            Message::EndDef { file_id } | Message::Close { file_id } => {
                ring.pack_i32(*file_id);
            }
            Message::PutVara {
                file_id,
                var_id,
                start,
                count,
                data_type,
                data,
            } => {
                ring.pack_i32(*file_id);
                ring.pack_i32(*var_id);
                ring.pack_usize_array(start)?;
                ring.pack_usize_array(count)?;
                ring.pack_i32(*data_type as i32);
                ring.pack_array(data.len() / data_type.size(), data)?;
            }
            Message::IoEnd | Message::Final => {}
        }
        Ok(())
    }

    /// Decode one complete frame.
    ///
    /// Variable-length fields are zero-copy slices of `frame`.
    pub fn decode(frame: Bytes) -> IofwdResult<Message> {
        let header = FrameHeader::peek(&frame)?;
        let total = header.validate(frame.len())?;
        let opcode = header.opcode()?;

        let mut fields = FieldReader {
            buf: frame.slice(FRAME_HEADER_SIZE..total),
        };

        let message = match opcode {
            OpCode::Create => Message::Create {
                path: fields.string()?,
                cmode: fields.i32()?,
                file_id: fields.i32()?,
            },
            OpCode::DefDim => Message::DefDim {
                file_id: fields.i32()?,
                name: fields.string()?,
                len: fields.usize()?,
                dim_id: fields.i32()?,
            },
            OpCode::DefVar => Message::DefVar {
                file_id: fields.i32()?,
                name: fields.string()?,
                xtype: DataType::try_from(fields.i32()?)?,
                dim_ids: fields.i32_array()?,
                start: fields.usize_array()?,
                count: fields.usize_array()?,
                var_id: fields.i32()?,
            },
            OpCode::PutAtt => {
                let file_id = fields.i32()?;
                let var_id = fields.i32()?;
                let name = fields.string()?;
                let xtype = DataType::try_from(fields.i32()?)?;
                let values = fields.array(xtype.size())?;
                Message::PutAtt {
                    file_id,
                    var_id,
                    name,
                    xtype,
                    values,
                }
            }
            OpCode::EndDef => Message::EndDef {
                file_id: fields.i32()?,
            },
            OpCode::PutVara => {
                let file_id = fields.i32()?;
                let var_id = fields.i32()?;
                let start = fields.usize_array()?;
                let count = fields.usize_array()?;
                let data_type = DataType::try_from(fields.i32()?)?;
                let data = fields.array(data_type.size())?;
                Message::PutVara {
                    file_id,
                    var_id,
                    start,
                    count,
                    data_type,
                    data,
                }
            }
            OpCode::Close => Message::Close {
                file_id: fields.i32()?,
            },
            OpCode::IoEnd => Message::IoEnd,
            OpCode::Final => Message::Final,
            OpCode::ReaderFinal | OpCode::WriterFinal => {
                return Err(IofwdError::UnexpectedMessage(format!(
                    "internal opcode {:?} on the wire",
                    opcode
                )));
            }
        };

        if fields.buf.has_remaining() {
            return Err(IofwdError::UnexpectedMessage(format!(
                "{} trailing bytes in {:?} frame",
                fields.buf.remaining(),
                opcode
            )));
        }
        Ok(message)
    }
}

/// Bounds-checked field reader over a frame body.
struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    fn need(&self, len: usize, what: &str) -> IofwdResult<()> {
        if self.buf.remaining() < len {
            return Err(IofwdError::UnexpectedMessage(format!(
                "truncated frame: {} needs {} bytes, {} left",
                what,
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn i32(&mut self) -> IofwdResult<i32> {
        self.need(I32_SIZE, "i32")?;
        Ok(self.buf.get_i32_le())
    }

    fn usize(&mut self) -> IofwdResult<usize> {
        self.need(USIZE_SIZE, "size")?;
        Ok(self.buf.get_u64_le() as usize)
    }

    fn count(&mut self) -> IofwdResult<usize> {
        let count = self.i32()?;
        usize::try_from(count).map_err(|_| {
            IofwdError::UnexpectedMessage(format!("negative array length {}", count))
        })
    }

    fn array(&mut self, elem_size: usize) -> IofwdResult<Bytes> {
        let count = self.count()?;
        let len = count.checked_mul(elem_size).ok_or_else(|| {
            IofwdError::UnexpectedMessage(format!("array of {} elements overflows", count))
        })?;
        self.need(len, "array")?;
        Ok(self.buf.split_to(len))
    }

    fn i32_array(&mut self) -> IofwdResult<Vec<i32>> {
        let raw = self.array(I32_SIZE)?;
        Ok(raw
            .chunks_exact(I32_SIZE)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn usize_array(&mut self) -> IofwdResult<Vec<usize>> {
        let mut raw = self.array(USIZE_SIZE)?;
        let mut values = Vec::with_capacity(raw.len() / USIZE_SIZE);
        while raw.has_remaining() {
            values.push(raw.get_u64_le() as usize);
        }
        Ok(values)
    }

    fn string(&mut self) -> IofwdResult<String> {
        let raw = self.array(1)?;
        match raw.split_last() {
            Some((&0, text)) => String::from_utf8(text.to_vec())
                .map_err(|e| IofwdError::UnexpectedMessage(format!("invalid string: {}", e))),
            _ => Err(IofwdError::UnexpectedMessage(
                "string without terminating zero".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::to_le_bytes;
    use prop::collection::vec;
    use proptest::prelude::*;

    fn frame_of(message: &Message) -> Bytes {
        let len = message.encoded_len();
        let mut ring = RingBuffer::with_capacity(len + 1);
        message.encode(&mut ring).unwrap();
        assert_eq!(ring.used_space(), len);
        Bytes::from(ring.unpack(len))
    }

    #[test]
    fn test_create_layout() {
        let message = Message::Create {
            path: "out.nc".to_string(),
            cmode: 0,
            file_id: 1,
        };
        let frame = frame_of(&message);

        // header + [i32 7]["out.nc\0"] + cmode + file
        assert_eq!(frame.len(), 12 + 4 + 7 + 4 + 4);
        assert_eq!(&frame[0..8], &(frame.len() as u64).to_le_bytes());
        assert_eq!(&frame[8..12], &1u32.to_le_bytes());
        assert_eq!(&frame[12..16], &7i32.to_le_bytes());
        assert_eq!(&frame[16..23], b"out.nc\0");
        assert_eq!(Message::decode(frame).unwrap(), message);
    }

    #[test]
    fn test_put_vara_decodes_data() {
        let message = Message::PutVara {
            file_id: 1,
            var_id: 2,
            start: vec![0, 4],
            count: vec![2, 4],
            data_type: DataType::Double,
            data: Bytes::from(to_le_bytes(&[1.0f64; 8])),
        };
        let frame = frame_of(&message);
        assert_eq!(frame.len(), message.encoded_len());

        match Message::decode(frame).unwrap() {
            Message::PutVara {
                start, count, data, ..
            } => {
                assert_eq!(start, vec![0, 4]);
                assert_eq!(count, vec![2, 4]);
                assert_eq!(data.len(), 64);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_def_var_and_attribute() {
        let def_var = Message::DefVar {
            file_id: 1,
            name: "temp".to_string(),
            xtype: DataType::Float,
            dim_ids: vec![1, 2],
            start: vec![0, 0],
            count: vec![2, 4],
            var_id: 1,
        };
        assert_eq!(Message::decode(frame_of(&def_var)).unwrap(), def_var);

        let att = Message::PutAtt {
            file_id: 1,
            var_id: -1,
            name: "title".to_string(),
            xtype: DataType::Char,
            values: Bytes::from_static(b"run"),
        };
        assert_eq!(Message::decode(frame_of(&att)).unwrap(), att);
    }

    #[test]
    fn test_small_messages_round_trip() {
        let messages = [
            Message::DefDim {
                file_id: 2,
                name: "time".to_string(),
                len: 0,
                dim_id: 7,
            },
            Message::EndDef { file_id: 2 },
            Message::Close { file_id: -4 },
            Message::IoEnd,
        ];
        for message in messages {
            let frame = frame_of(&message);
            assert_eq!(frame.len(), message.encoded_len());
            assert_eq!(Message::decode(frame).unwrap(), message);
        }
    }

    #[test]
    fn test_markers_are_header_only() {
        assert_eq!(Message::IoEnd.encoded_len(), FRAME_HEADER_SIZE);
        assert_eq!(Message::decode(frame_of(&Message::Final)).unwrap(), Message::Final);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut raw = FrameHeader::new(12, OpCode::IoEnd).as_bytes().to_vec();
        raw[8] = 77;
        let err = Message::decode(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, IofwdError::UnexpectedMessage(_)));

        let raw = FrameHeader::new(12, OpCode::ReaderFinal).as_bytes().to_vec();
        assert!(Message::decode(Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let message = Message::DefDim {
            file_id: 1,
            name: "lat".to_string(),
            len: 180,
            dim_id: 1,
        };
        let frame = frame_of(&message);

        // total_size larger than the bytes we hold
        assert!(Message::decode(frame.slice(..frame.len() - 1)).is_err());

        // total_size consistent but body cut short
        let mut short = frame[..frame.len() - 4].to_vec();
        short[..8].copy_from_slice(&((frame.len() - 4) as u64).to_le_bytes());
        assert!(Message::decode(Bytes::from(short)).is_err());
    }

    #[test]
    fn test_string_without_terminator_rejected() {
        let mut raw = FrameHeader::new(12 + 4 + 3 + 8, OpCode::Create).as_bytes().to_vec();
        raw.extend_from_slice(&3i32.to_le_bytes());
        raw.extend_from_slice(b"abc");
        raw.extend_from_slice(&[0u8; 8]);
        assert!(Message::decode(Bytes::from(raw)).is_err());
    }

    fn arb_data_type() -> impl Strategy<Value = DataType> {
        prop_oneof![
            Just(DataType::Byte),
            Just(DataType::Char),
            Just(DataType::Short),
            Just(DataType::Int),
            Just(DataType::Float),
            Just(DataType::Double),
        ]
    }

    fn arb_name() -> impl Strategy<Value = String> {
        "\\PC{0,16}"
    }

    prop_compose! {
        fn arb_def_var()(ndims in 0usize..4)(
            file_id in any::<i32>(),
            name in arb_name(),
            xtype in arb_data_type(),
            dim_ids in vec(any::<i32>(), ndims),
            start in vec(any::<usize>(), ndims),
            count in vec(any::<usize>(), ndims),
            var_id in any::<i32>()
        ) -> Message {
            Message::DefVar { file_id, name, xtype, dim_ids, start, count, var_id }
        }
    }

    fn arb_put_att() -> impl Strategy<Value = Message> {
        (any::<i32>(), any::<i32>(), arb_name(), arb_data_type(), 0usize..8).prop_flat_map(
            |(file_id, var_id, name, xtype, n)| {
                vec(any::<u8>(), n * xtype.size()).prop_map(move |values| Message::PutAtt {
                    file_id,
                    var_id,
                    name: name.clone(),
                    xtype,
                    values: Bytes::from(values),
                })
            },
        )
    }

    /// Data always matches `count x data_type.size()`.
    fn arb_put_vara() -> impl Strategy<Value = Message> {
        (0usize..4)
            .prop_flat_map(|ndims| {
                (
                    any::<i32>(),
                    any::<i32>(),
                    vec(0usize..1 << 40, ndims),
                    vec(0usize..4, ndims),
                    arb_data_type(),
                )
            })
            .prop_flat_map(|(file_id, var_id, start, count, data_type)| {
                let len = count.iter().product::<usize>() * data_type.size();
                vec(any::<u8>(), len).prop_map(move |data| Message::PutVara {
                    file_id,
                    var_id,
                    start: start.clone(),
                    count: count.clone(),
                    data_type,
                    data: Bytes::from(data),
                })
            })
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (arb_name(), any::<i32>(), any::<i32>()).prop_map(|(path, cmode, file_id)| {
                Message::Create {
                    path,
                    cmode,
                    file_id,
                }
            }),
            (any::<i32>(), arb_name(), any::<usize>(), any::<i32>()).prop_map(
                |(file_id, name, len, dim_id)| Message::DefDim {
                    file_id,
                    name,
                    len,
                    dim_id,
                }
            ),
            arb_def_var(),
            arb_put_att(),
            any::<i32>().prop_map(|file_id| Message::EndDef { file_id }),
            arb_put_vara(),
            any::<i32>().prop_map(|file_id| Message::Close { file_id }),
            Just(Message::IoEnd),
            Just(Message::Final),
        ]
    }

    proptest! {
        #[test]
        fn prop_every_message_round_trips(message in arb_message()) {
            let frame = frame_of(&message);
            prop_assert_eq!(frame.len(), message.encoded_len());
            prop_assert_eq!(Message::decode(frame).unwrap(), message);
        }
    }
}
