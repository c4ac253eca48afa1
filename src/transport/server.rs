//! Consumer half of a client to server channel.

use std::collections::VecDeque;

use bytes::Bytes;
use zerocopy::IntoBytes;

use super::connection::Connection;
use super::fabric::{ControlMessage, Endpoint};
use super::handshake::{HandshakeDescriptor, Signal, DESCRIPTOR_SIZE};
use super::region::{Access, MemoryRegion, RegionHandle};
use crate::error::{IofwdError, IofwdResult};
use crate::protocol::{FrameHeader, FRAME_HEADER_SIZE};
use crate::ring::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Idle,
    Reading {
        wr_id: u64,
        offset: usize,
        descriptor: HandshakeDescriptor,
    },
}

/// What a finished read delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub frames: usize,
    pub bytes: usize,
    pub stream_end: bool,
}

/// Server state for one client: the mailbox the client publishes into, the
/// ring spans are read into, and the frames read but not yet decoded.
pub struct ClientLink {
    index: usize,
    rank: usize,
    connection: Connection,
    mailbox: MemoryRegion,
    ring: RingBuffer<MemoryRegion>,
    source: Option<RegionHandle>,
    state: ReadState,
    frames: VecDeque<(usize, usize)>,
    stream_ended: bool,
}

impl ClientLink {
    /// Register the link's regions and post the receive for the client's
    /// region handles.
    pub fn new(endpoint: &mut Endpoint, index: usize, rank: usize, ring_capacity: usize) -> Self {
        let mailbox = endpoint.register(DESCRIPTOR_SIZE, Access::LOCAL | Access::REMOTE_WRITE);
        let ring_region = endpoint.register(ring_capacity, Access::LOCAL);
        let connection = Connection::new(rank, vec![mailbox.clone(), ring_region.clone()]);
        endpoint.post_recv(rank);

        Self {
            index,
            rank,
            connection,
            mailbox,
            ring: RingBuffer::new(ring_region),
            source: None,
            state: ReadState::Idle,
            frames: VecDeque::new(),
            stream_ended: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn ring(&self) -> &RingBuffer<MemoryRegion> {
        &self.ring
    }

    pub fn is_reading(&self) -> bool {
        matches!(self.state, ReadState::Reading { .. })
    }

    /// Id of the read in flight, if any.
    pub fn read_wr_id(&self) -> Option<u64> {
        match self.state {
            ReadState::Reading { wr_id, .. } => Some(wr_id),
            ReadState::Idle => None,
        }
    }

    pub fn has_frames(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn stream_ended(&self) -> bool {
        self.stream_ended
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// The client sent its region handles: answer with the mailbox and wait
    /// for its eventual `Done`.
    pub fn on_regions(&mut self, endpoint: &mut Endpoint, handles: Vec<RegionHandle>) -> IofwdResult<()> {
        self.connection.regions_received(handles)?;
        let source = self
            .connection
            .peer_regions()
            .first()
            .copied()
            .filter(|handle| handle.access.contains(Access::REMOTE_READ))
            .ok_or_else(|| {
                IofwdError::ChannelSetupFailure(format!(
                    "client {} did not expose a readable ring",
                    self.rank
                ))
            })?;
        self.source = Some(source);

        endpoint.post_send(self.rank, ControlMessage::Regions(vec![self.mailbox.handle()]));
        self.connection.regions_sent()?;
        endpoint.post_recv(self.rank);
        Ok(())
    }

    pub fn on_done(&mut self) -> IofwdResult<()> {
        self.connection.done_received()
    }

    /// The span the client has published and that is not yet being read.
    pub fn pending_span(&self) -> IofwdResult<Option<HandshakeDescriptor>> {
        if self.is_reading() || !self.connection.is_ready() {
            return Ok(None);
        }
        let Some(source) = self.source else {
            return Ok(None);
        };

        let mut bytes = [0u8; DESCRIPTOR_SIZE];
        self.mailbox.read(0, &mut bytes);
        let descriptor = HandshakeDescriptor::read(&bytes)?;
        match descriptor.signal()? {
            Signal::Idle | Signal::PhaseEnd => Ok(None),
            Signal::DataReady | Signal::StreamEnd => {
                descriptor.validate_span(source.len)?;
                Ok(Some(descriptor))
            }
        }
    }

    /// Claim ring space for the published span and post the read. Returns
    /// false when the ring has no room until more frames are decoded.
    pub fn start_read(
        &mut self,
        endpoint: &mut Endpoint,
        descriptor: HandshakeDescriptor,
    ) -> IofwdResult<bool> {
        if self.stream_ended {
            return Err(IofwdError::ProtocolViolation(format!(
                "client {} published data after its stream end",
                self.rank
            )));
        }
        let source = self.source.ok_or_else(|| {
            IofwdError::ProtocolViolation(format!("client {} has no readable ring", self.rank))
        })?;

        let len = descriptor.span_len();
        if len > self.ring.max_message() {
            return Err(IofwdError::ProtocolViolation(format!(
                "client {} published {} bytes, receive ring holds at most {}",
                self.rank,
                len,
                self.ring.max_message()
            )));
        }
        let Some(offset) = self.ring.try_claim(len) else {
            return Ok(false);
        };

        let wr_id = endpoint.post_read(&source, descriptor.start(), self.ring.arena(), offset, len);
        self.state = ReadState::Reading {
            wr_id,
            offset,
            descriptor,
        };
        tracing::trace!(client = self.index, offset, len, "read posted");
        Ok(true)
    }

    /// Index the frames of a finished read, lower the mailbox and
    /// acknowledge. After the stream end the link also sends `Done`.
    pub fn on_read_complete(&mut self, endpoint: &mut Endpoint) -> IofwdResult<ReadOutcome> {
        let ReadState::Reading {
            offset, descriptor, ..
        } = self.state
        else {
            return Err(IofwdError::ProtocolViolation(format!(
                "read completion for client {} without a read in flight",
                self.rank
            )));
        };
        self.state = ReadState::Idle;

        let len = descriptor.span_len();
        let frames = self.index_frames(offset, len)?;
        let signal = descriptor.signal()?;

        let ack = HandshakeDescriptor::new(
            signal.acknowledgment()?,
            descriptor.start(),
            descriptor.end(),
            self.ring.free_cursor(),
            self.ring.used_cursor(),
        );
        self.mailbox.write(0, ack.as_bytes());
        endpoint.post_send(self.rank, ControlMessage::Ack(ack));

        let stream_end = signal == Signal::StreamEnd;
        if stream_end {
            self.stream_ended = true;
            self.connection.stream_end_received()?;
            self.connection.stream_end_sent()?;
            endpoint.post_send(self.rank, ControlMessage::Done);
            self.connection.done_sent()?;
            tracing::debug!(client = self.index, "stream end received");
        }

        Ok(ReadOutcome {
            frames,
            bytes: len,
            stream_end,
        })
    }

    /// Record the frames inside `[offset, offset + len)` of the ring.
    ///
    /// Framing errors here are fatal: once a length is wrong the rest of the
    /// stream cannot be delimited.
    fn index_frames(&mut self, offset: usize, len: usize) -> IofwdResult<usize> {
        let end = offset + len;
        let mut pos = offset;
        let mut count = 0;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        while pos < end {
            let remaining = end - pos;
            if remaining < FRAME_HEADER_SIZE {
                return Err(IofwdError::ProtocolViolation(format!(
                    "client {}: {} stray bytes at the end of a span",
                    self.rank, remaining
                )));
            }
            self.ring.peek_at(pos, &mut header);
            let total = FrameHeader::peek(&header)
                .and_then(|h| h.validate(remaining))
                .map_err(|e| {
                    IofwdError::ProtocolViolation(format!("client {}: {}", self.rank, e))
                })?;
            self.frames.push_back((pos, total));
            pos += total;
            count += 1;
        }
        Ok(count)
    }

    /// Take the oldest undecoded frame out of the ring.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let (offset, len) = self.frames.pop_front()?;
        Some(Bytes::from(self.ring.unpack_at(offset, len)))
    }

    pub fn teardown(&mut self, endpoint: &mut Endpoint) -> IofwdResult<()> {
        self.connection.teardown(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::transport::fabric::{CompletionKind, Fabric, PollMode};
    use crate::transport::Span;
    use crate::transport::ClientChannel;

    fn drain(endpoint: &mut Endpoint) -> Vec<CompletionKind> {
        let mut kinds = Vec::new();
        while let Some(c) = endpoint.poll(PollMode::NonBlocking) {
            c.check().unwrap();
            kinds.push(c.kind);
        }
        kinds
    }

    #[test]
    fn test_span_transfer() {
        let fabric = Fabric::new();
        let mut server = fabric.open_endpoint(1).unwrap();
        let address = server.address();
        let mut link = ClientLink::new(&mut server, 0, 0, 256);

        let client_fabric = fabric.clone();
        let client = std::thread::spawn(move || {
            let endpoint = client_fabric.open_endpoint(0).unwrap();
            let (mut channel, mut ring) = ClientChannel::connect(endpoint, &address, 256).unwrap();

            let start = ring.free_cursor();
            Message::IoEnd.encode(&mut ring).unwrap();
            Message::Close { file_id: 3 }.encode(&mut ring).unwrap();
            let span = Span::new(start, ring.free_cursor());
            channel.publish(span, Signal::DataReady).unwrap();
            let cursor = channel.wait_ack().unwrap().unwrap();
            ring.release_to(cursor);

            let start = ring.free_cursor();
            Message::Final.encode(&mut ring).unwrap();
            let span = Span::new(start, ring.free_cursor());
            channel.publish(span, Signal::StreamEnd).unwrap();
            ring.release_to(channel.wait_ack().unwrap().unwrap());
            assert!(ring.is_empty());
            channel.finish().unwrap()
        });

        let mut decoded = Vec::new();
        while !link.is_closed() {
            let Some(c) = server.poll(PollMode::Blocking) else {
                break;
            };
            c.check().unwrap();
            match c.kind {
                CompletionKind::Recv(ControlMessage::Regions(handles)) => {
                    link.on_regions(&mut server, handles).unwrap()
                }
                CompletionKind::Recv(ControlMessage::Done) => link.on_done().unwrap(),
                CompletionKind::Read => {
                    link.on_read_complete(&mut server).unwrap();
                    while let Some(frame) = link.next_frame() {
                        decoded.push(Message::decode(frame).unwrap());
                    }
                }
                _ => {}
            }
            if let Some(descriptor) = link.pending_span().unwrap() {
                assert!(link.start_read(&mut server, descriptor).unwrap());
            }
        }

        let stats = client.join().unwrap();
        assert_eq!(stats.spans, 2);
        assert_eq!(
            decoded,
            vec![Message::IoEnd, Message::Close { file_id: 3 }, Message::Final]
        );
        assert!(link.stream_ended());
        link.teardown(&mut server).unwrap();
        drain(&mut server);
    }

    #[test]
    fn test_malformed_span_is_fatal() {
        let fabric = Fabric::new();
        let mut server = fabric.open_endpoint(1).unwrap();
        let mut link = ClientLink::new(&mut server, 0, 0, 64);

        // 20 bytes of a frame that claims 30.
        let header = FrameHeader::new(30, crate::protocol::OpCode::Close);
        let offset = link.ring.try_claim(20).unwrap();
        link.ring.arena().write(offset, header.as_bytes());
        let err = link.index_frames(offset, 20).unwrap_err();
        assert!(err.is_fatal());
    }
}
