//! Producer half of a client to server channel.

use zerocopy::IntoBytes;

use super::connection::Connection;
use super::fabric::{CompletionKind, ControlMessage, Endpoint, EndpointAddress, PollMode};
use super::handshake::{HandshakeDescriptor, Signal, DESCRIPTOR_SIZE};
use super::region::{Access, MemoryRegion, RegionHandle};
use super::Span;
use crate::error::{IofwdError, IofwdResult};
use crate::ring::RingBuffer;

#[derive(Debug, Clone, Copy)]
struct Published {
    span: Span,
    signal: Signal,
}

/// Transfer counters of one channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub spans: u64,
    pub bytes: u64,
}

/// Client side of the connection to its server.
///
/// The client ring lives in a region the server may read. Publishing a span
/// writes its descriptor into the server's mailbox; the server pulls the
/// bytes and answers with an acknowledgment, after which the span may be
/// reused.
pub struct ClientChannel {
    endpoint: Endpoint,
    connection: Connection,
    server: usize,
    staging: MemoryRegion,
    mailbox: RegionHandle,
    in_flight: Option<Published>,
    stats: ChannelStats,
}

impl ClientChannel {
    /// Connect to the server at `address` and return the channel together
    /// with the ring the client packs messages into.
    pub fn connect(
        mut endpoint: Endpoint,
        address: &EndpointAddress,
        ring_capacity: usize,
    ) -> IofwdResult<(Self, RingBuffer<MemoryRegion>)> {
        let server = endpoint.connect(address)?;
        let ring_region = endpoint.register(ring_capacity, Access::LOCAL | Access::REMOTE_READ);
        let staging = endpoint.register(DESCRIPTOR_SIZE, Access::LOCAL);
        let mut connection = Connection::new(server, vec![ring_region.clone(), staging.clone()]);

        endpoint.post_recv(server);
        endpoint.post_send(server, ControlMessage::Regions(vec![ring_region.handle()]));
        connection.regions_sent()?;

        let mut channel = Self {
            endpoint,
            connection,
            server,
            staging,
            mailbox: RegionHandle {
                rank: server,
                id: 0,
                len: 0,
                access: Access::REMOTE_WRITE,
            },
            in_flight: None,
            stats: ChannelStats::default(),
        };

        match channel.next_message()? {
            ControlMessage::Regions(handles) => channel.connection.regions_received(handles)?,
            other => {
                return Err(IofwdError::ChannelSetupFailure(format!(
                    "server {} answered the region exchange with {:?}",
                    server, other
                )))
            }
        }

        let mailbox = channel
            .connection
            .peer_regions()
            .first()
            .copied()
            .filter(|handle| {
                handle.len >= DESCRIPTOR_SIZE && handle.access.contains(Access::REMOTE_WRITE)
            })
            .ok_or_else(|| {
                IofwdError::ChannelSetupFailure(format!(
                    "server {} did not expose a writable mailbox",
                    server
                ))
            })?;
        channel.mailbox = mailbox;

        tracing::info!(
            rank = channel.endpoint.rank(),
            server,
            ring_capacity,
            "client channel ready"
        );
        Ok((channel, RingBuffer::new(ring_region)))
    }

    pub fn server(&self) -> usize {
        self.server
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Whether a published span still waits for its acknowledgment.
    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Next control message from the server. Local completions are consumed
    /// along the way; a failed one ends the channel.
    fn next_message(&mut self) -> IofwdResult<ControlMessage> {
        loop {
            let completion = self.endpoint.poll(PollMode::Blocking).ok_or_else(|| {
                IofwdError::ChannelSetupFailure("completion queue closed".to_string())
            })?;
            completion.check()?;
            match completion.kind {
                CompletionKind::Recv(message) if completion.peer == self.server => return Ok(message),
                CompletionKind::Send | CompletionKind::Write | CompletionKind::Read => {}
                other => {
                    return Err(IofwdError::ProtocolViolation(format!(
                        "unexpected {:?} from rank {}",
                        other, completion.peer
                    )))
                }
            }
        }
    }

    /// Hand `span` of the client ring to the server.
    ///
    /// Only one span may be unacknowledged at a time.
    pub fn publish(&mut self, span: Span, signal: Signal) -> IofwdResult<()> {
        self.connection.require_ready()?;
        if let Some(previous) = self.in_flight {
            return Err(IofwdError::ProtocolViolation(format!(
                "span {:?} published while {:?} is unacknowledged",
                span, previous.span
            )));
        }
        if !signal.is_producer() {
            return Err(IofwdError::ProtocolViolation(format!(
                "cannot publish with {:?}",
                signal
            )));
        }

        let descriptor = HandshakeDescriptor::new(signal, span.start, span.end, span.end, span.start);
        self.staging.write(0, descriptor.as_bytes());
        self.endpoint.post_recv(self.server);
        self.endpoint.post_write_with_imm(
            &self.staging,
            0,
            &self.mailbox,
            0,
            DESCRIPTOR_SIZE,
            signal as u32,
        );
        if signal == Signal::StreamEnd {
            self.connection.stream_end_sent()?;
        }

        self.in_flight = Some(Published { span, signal });
        self.stats.spans += 1;
        self.stats.bytes += span.len() as u64;
        tracing::trace!(server = self.server, ?signal, start = span.start, end = span.end, "span published");
        Ok(())
    }

    /// Wait for the acknowledgment of the published span and return the
    /// ring cursor up to which the server has taken the data. Returns `None`
    /// when nothing is in flight.
    pub fn wait_ack(&mut self) -> IofwdResult<Option<usize>> {
        let Some(published) = self.in_flight else {
            return Ok(None);
        };

        let descriptor = match self.next_message()? {
            ControlMessage::Ack(descriptor) => descriptor,
            other => {
                return Err(IofwdError::ProtocolViolation(format!(
                    "expected acknowledgment from server {}, got {:?}",
                    self.server, other
                )))
            }
        };

        let expected = published.signal.acknowledgment()?;
        let signal = descriptor.signal()?;
        if signal != expected || descriptor.end() != published.span.end {
            return Err(IofwdError::ProtocolViolation(format!(
                "acknowledged {:?} up to {}, expected {:?} up to {}",
                signal,
                descriptor.end(),
                expected,
                published.span.end
            )));
        }
        if published.signal == Signal::StreamEnd {
            self.connection.stream_end_received()?;
        }

        self.in_flight = None;
        Ok(Some(published.span.end))
    }

    /// Exchange `Done` with the server after the stream end was acknowledged
    /// and release the channel's regions.
    pub fn finish(mut self) -> IofwdResult<ChannelStats> {
        self.endpoint.post_recv(self.server);
        self.endpoint.post_send(self.server, ControlMessage::Done);
        self.connection.done_sent()?;

        match self.next_message()? {
            ControlMessage::Done => self.connection.done_received()?,
            other => {
                return Err(IofwdError::ProtocolViolation(format!(
                    "expected done from server {}, got {:?}",
                    self.server, other
                )))
            }
        }
        self.connection.teardown(&mut self.endpoint)?;
        tracing::debug!(
            rank = self.endpoint.rank(),
            spans = self.stats.spans,
            bytes = self.stats.bytes,
            "client channel closed"
        );
        Ok(self.stats)
    }
}
