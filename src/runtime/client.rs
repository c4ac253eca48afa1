//! Client send path.
//!
//! Each call is encoded straight into the client ring. Non-terminal messages
//! that land back to back in the ring are merged into one span while the
//! previous span is still unacknowledged; end-of-phase and end-of-stream
//! flush everything and wait for the server.

use bytes::Bytes;

use crate::error::{IdKind, IofwdError, IofwdResult};
use crate::id::ClientIdRegistry;
use crate::protocol::{to_le_bytes, DataType, Element, Message, OpCode};
use crate::ring::RingBuffer;
use crate::transport::{ChannelStats, ClientChannel, MemoryRegion, Signal, Span};

/// Totals reported when a client finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientReport {
    pub rank: usize,
    pub server: usize,
    pub messages: u64,
    pub merged: u64,
    pub spans: u64,
    pub bytes: u64,
}

pub struct ClientRuntime {
    rank: usize,
    ids: ClientIdRegistry,
    ring: RingBuffer<MemoryRegion>,
    channel: ClientChannel,
    /// Packed but not yet published.
    pending: Option<Span>,
    max_message: usize,
    messages: u64,
    merged: u64,
}

impl ClientRuntime {
    pub fn new(
        rank: usize,
        channel: ClientChannel,
        ring: RingBuffer<MemoryRegion>,
        max_message: usize,
    ) -> Self {
        Self {
            rank,
            ids: ClientIdRegistry::new(),
            max_message: max_message.min(ring.max_message()),
            ring,
            channel,
            pending: None,
            messages: 0,
            merged: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn server(&self) -> usize {
        self.channel.server()
    }

    pub fn max_message(&self) -> usize {
        self.max_message
    }

    pub fn ids(&self) -> &ClientIdRegistry {
        &self.ids
    }

    /// Create a dataset and return its id.
    pub fn create(&mut self, path: &str, cmode: i32) -> IofwdResult<i32> {
        let file_id = self.ids.assign_file();
        self.send(Message::Create {
            path: path.to_string(),
            cmode,
            file_id,
        })?;
        Ok(file_id)
    }

    fn require_file(&self, file_id: i32) -> IofwdResult<()> {
        if self.ids.contains_file(file_id) {
            Ok(())
        } else {
            Err(IofwdError::unknown(IdKind::File, file_id))
        }
    }

    /// Define a dimension. Defining the same name again returns the same id.
    pub fn def_dim(&mut self, file_id: i32, name: &str, len: usize) -> IofwdResult<i32> {
        let dim_id = self.ids.assign_dim(file_id, name)?;
        self.send(Message::DefDim {
            file_id,
            name: name.to_string(),
            len,
            dim_id,
        })?;
        Ok(dim_id)
    }

    /// Define a variable over `dim_ids`. `start`/`count` describe the block
    /// this client will write.
    pub fn def_var(
        &mut self,
        file_id: i32,
        name: &str,
        xtype: DataType,
        dim_ids: &[i32],
        start: &[usize],
        count: &[usize],
    ) -> IofwdResult<i32> {
        for len in [start.len(), count.len()] {
            if len != dim_ids.len() {
                return Err(IofwdError::WrongDimensionality {
                    expected: dim_ids.len(),
                    actual: len,
                });
            }
        }
        let var_id = self.ids.assign_var(file_id, name)?;
        self.send(Message::DefVar {
            file_id,
            name: name.to_string(),
            xtype,
            dim_ids: dim_ids.to_vec(),
            start: start.to_vec(),
            count: count.to_vec(),
            var_id,
        })?;
        Ok(var_id)
    }

    /// Attach an attribute to a variable, or to the dataset with
    /// [`crate::protocol::GLOBAL_VAR_ID`].
    pub fn put_att<T: Element>(
        &mut self,
        file_id: i32,
        var_id: i32,
        name: &str,
        values: &[T],
    ) -> IofwdResult<()> {
        self.require_file(file_id)?;
        self.send(Message::PutAtt {
            file_id,
            var_id,
            name: name.to_string(),
            xtype: T::DATA_TYPE,
            values: Bytes::from(to_le_bytes(values)),
        })
    }

    /// Text attribute, stored as characters.
    pub fn put_att_text(&mut self, file_id: i32, var_id: i32, name: &str, text: &str) -> IofwdResult<()> {
        self.put_att(file_id, var_id, name, text.as_bytes())
    }

    pub fn enddef(&mut self, file_id: i32) -> IofwdResult<()> {
        self.require_file(file_id)?;
        self.send(Message::EndDef { file_id })
    }

    pub fn inq_varid(&self, file_id: i32, name: &str) -> IofwdResult<i32> {
        self.ids.inq_varid(file_id, name)
    }

    /// Write this client's block of a variable.
    pub fn put_vara<T: Element>(
        &mut self,
        file_id: i32,
        var_id: i32,
        start: &[usize],
        count: &[usize],
        data: &[T],
    ) -> IofwdResult<()> {
        self.require_file(file_id)?;
        if start.len() != count.len() {
            return Err(IofwdError::WrongDimensionality {
                expected: count.len(),
                actual: start.len(),
            });
        }
        let elements: usize = count.iter().product();
        if elements != data.len() {
            return Err(IofwdError::UnexpectedMessage(format!(
                "put_vara of {} elements into a block of {}",
                data.len(),
                elements
            )));
        }
        self.send(Message::PutVara {
            file_id,
            var_id,
            start: start.to_vec(),
            count: count.to_vec(),
            data_type: T::DATA_TYPE,
            data: Bytes::from(to_le_bytes(data)),
        })
    }

    pub fn close(&mut self, file_id: i32) -> IofwdResult<()> {
        self.require_file(file_id)?;
        self.send(Message::Close { file_id })?;
        self.ids.remove_file(file_id)
    }

    /// End the current phase. Returns once the server has taken every
    /// message of the phase.
    pub fn io_end(&mut self) -> IofwdResult<()> {
        self.send(Message::IoEnd)
    }

    /// Send the end of stream, wait for the server and close the channel.
    pub fn finalize(mut self) -> IofwdResult<ClientReport> {
        self.send(Message::Final)?;
        let server = self.channel.server();
        let ChannelStats { spans, bytes } = self.channel.finish()?;
        let report = ClientReport {
            rank: self.rank,
            server,
            messages: self.messages,
            merged: self.merged,
            spans,
            bytes,
        };
        tracing::info!(
            rank = report.rank,
            messages = report.messages,
            spans = report.spans,
            "client finished"
        );
        Ok(report)
    }

    fn send(&mut self, message: Message) -> IofwdResult<()> {
        let len = message.encoded_len();
        if len > self.max_message {
            return Err(IofwdError::AllocationFailure {
                requested: len,
                available: self.max_message,
            });
        }

        let channel = &mut self.channel;
        let pending = &mut self.pending;
        self.ring.ensure_free_space(len, || {
            if channel.in_flight() {
                return channel.wait_ack();
            }
            match pending.take() {
                Some(span) => {
                    channel.publish(span, Signal::DataReady)?;
                    channel.wait_ack()
                }
                None => Ok(None),
            }
        })?;

        let start = self.ring.free_cursor();
        message.encode(&mut self.ring)?;
        let span = Span::new(start, start + len);
        self.messages += 1;

        let opcode = message.opcode();
        tracing::trace!(rank = self.rank, ?opcode, len, "message packed");
        if opcode.is_terminal() {
            self.flush()?;
            let signal = if opcode == OpCode::Final {
                Signal::StreamEnd
            } else {
                Signal::DataReady
            };
            self.channel.publish(span, signal)?;
            self.reclaim()?;
            return Ok(());
        }

        match self.pending {
            Some(ref mut merged)
                if merged.is_followed_by(&span) && merged.len() + len <= self.max_message =>
            {
                merged.end = span.end;
                self.merged += 1;
            }
            Some(_) => {
                self.reclaim()?;
                if let Some(previous) = self.pending.replace(span) {
                    self.channel.publish(previous, Signal::DataReady)?;
                }
            }
            None => self.pending = Some(span),
        }

        if !self.channel.in_flight() {
            if let Some(span) = self.pending.take() {
                self.channel.publish(span, Signal::DataReady)?;
            }
        }
        Ok(())
    }

    /// Wait for the span in flight and release it from the ring.
    fn reclaim(&mut self) -> IofwdResult<()> {
        if let Some(cursor) = self.channel.wait_ack()? {
            self.ring.release_to(cursor);
        }
        Ok(())
    }

    /// Publish the pending span, then wait until nothing is in flight.
    fn flush(&mut self) -> IofwdResult<()> {
        self.reclaim()?;
        if let Some(span) = self.pending.take() {
            self.channel.publish(span, Signal::DataReady)?;
            self.reclaim()?;
        }
        Ok(())
    }
}
