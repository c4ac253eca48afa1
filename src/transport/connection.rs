//! Per-peer connection state.
//!
//! The send and receive halves advance independently:
//!
//! ```text
//! send: Init -> RegionsSent -> Transferring -> Final -> DoneSent
//! recv: Init -> RegionsReceived -> Transferring -> Final -> DoneReceived
//! ```
//!
//! Both halves enter `Transferring` together, once regions have gone both
//! ways. Any other order is a protocol violation.

use super::fabric::Endpoint;
use super::region::{MemoryRegion, RegionHandle};
use crate::error::{IofwdError, IofwdResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Init,
    RegionsSent,
    Transferring,
    Final,
    DoneSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Init,
    RegionsReceived,
    Transferring,
    Final,
    DoneReceived,
}

#[derive(Debug)]
pub struct Connection {
    peer: usize,
    send: SendState,
    recv: RecvState,
    local_regions: Vec<MemoryRegion>,
    peer_regions: Vec<RegionHandle>,
}

impl Connection {
    pub fn new(peer: usize, local_regions: Vec<MemoryRegion>) -> Self {
        Self {
            peer,
            send: SendState::Init,
            recv: RecvState::Init,
            local_regions,
            peer_regions: Vec::new(),
        }
    }

    pub fn peer(&self) -> usize {
        self.peer
    }

    pub fn send_state(&self) -> SendState {
        self.send
    }

    pub fn recv_state(&self) -> RecvState {
        self.recv
    }

    pub fn local_regions(&self) -> &[MemoryRegion] {
        &self.local_regions
    }

    pub fn peer_regions(&self) -> &[RegionHandle] {
        &self.peer_regions
    }

    /// Handles of the local regions, as sent to the peer.
    pub fn local_handles(&self) -> Vec<RegionHandle> {
        self.local_regions.iter().map(MemoryRegion::handle).collect()
    }

    fn violation(&self, event: &str) -> IofwdError {
        IofwdError::ProtocolViolation(format!(
            "peer {}: {} in state {:?}/{:?}",
            self.peer, event, self.send, self.recv
        ))
    }

    fn promote_if_ready(&mut self) {
        if self.send == SendState::RegionsSent && self.recv == RecvState::RegionsReceived {
            self.send = SendState::Transferring;
            self.recv = RecvState::Transferring;
            tracing::debug!(peer = self.peer, "connection ready");
        }
    }

    pub fn regions_sent(&mut self) -> IofwdResult<()> {
        if self.send != SendState::Init {
            return Err(self.violation("regions sent twice"));
        }
        self.send = SendState::RegionsSent;
        self.promote_if_ready();
        Ok(())
    }

    pub fn regions_received(&mut self, handles: Vec<RegionHandle>) -> IofwdResult<()> {
        if self.recv != RecvState::Init {
            return Err(self.violation("unexpected region handles"));
        }
        if let Some(foreign) = handles.iter().find(|handle| handle.rank != self.peer) {
            return Err(IofwdError::ChannelSetupFailure(format!(
                "peer {} sent a handle owned by rank {}",
                self.peer, foreign.rank
            )));
        }
        self.peer_regions = handles;
        self.recv = RecvState::RegionsReceived;
        self.promote_if_ready();
        Ok(())
    }

    /// Both halves may move bulk data.
    pub fn is_ready(&self) -> bool {
        self.send == SendState::Transferring && self.recv == RecvState::Transferring
    }

    pub fn require_ready(&self) -> IofwdResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(self.violation("transfer before both sides exchanged regions"))
        }
    }

    /// The stream-end marker went out on the send half.
    pub fn stream_end_sent(&mut self) -> IofwdResult<()> {
        if self.send != SendState::Transferring {
            return Err(self.violation("stream end sent"));
        }
        self.send = SendState::Final;
        Ok(())
    }

    /// The stream-end marker (or its acknowledgment) arrived.
    pub fn stream_end_received(&mut self) -> IofwdResult<()> {
        if self.recv != RecvState::Transferring {
            return Err(self.violation("stream end received"));
        }
        self.recv = RecvState::Final;
        Ok(())
    }

    pub fn done_sent(&mut self) -> IofwdResult<()> {
        if self.send != SendState::Final {
            return Err(self.violation("done sent"));
        }
        self.send = SendState::DoneSent;
        Ok(())
    }

    pub fn done_received(&mut self) -> IofwdResult<()> {
        if self.recv != RecvState::Final {
            return Err(self.violation("done received"));
        }
        self.recv = RecvState::DoneReceived;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.send == SendState::DoneSent && self.recv == RecvState::DoneReceived
    }

    /// Deregister the local regions once both sides are done.
    pub fn teardown(&mut self, endpoint: &mut Endpoint) -> IofwdResult<()> {
        if !self.is_closed() {
            return Err(self.violation("teardown"));
        }
        for region in &self.local_regions {
            endpoint.deregister(region);
        }
        self.peer_regions.clear();
        tracing::debug!(peer = self.peer, "connection torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fabric::Fabric;
    use crate::transport::region::Access;

    fn handle(rank: usize) -> RegionHandle {
        RegionHandle {
            rank,
            id: 1,
            len: 8,
            access: Access::REMOTE_READ,
        }
    }

    #[test]
    fn test_ready_needs_both_directions() {
        let mut conn = Connection::new(1, Vec::new());
        conn.regions_sent().unwrap();
        assert!(!conn.is_ready());
        assert!(conn.require_ready().is_err());

        conn.regions_received(vec![handle(1)]).unwrap();
        assert!(conn.is_ready());
        assert_eq!(conn.peer_regions().len(), 1);
    }

    #[test]
    fn test_receive_first_then_send() {
        let mut conn = Connection::new(1, Vec::new());
        conn.regions_received(vec![handle(1)]).unwrap();
        assert_eq!(conn.recv_state(), RecvState::RegionsReceived);
        conn.regions_sent().unwrap();
        assert!(conn.is_ready());
    }

    #[test]
    fn test_full_lifecycle() {
        let fabric = Fabric::new();
        let mut endpoint = fabric.open_endpoint(0).unwrap();
        let region = endpoint.register(8, Access::LOCAL | Access::REMOTE_WRITE);
        let mut conn = Connection::new(1, vec![region.clone()]);

        conn.regions_sent().unwrap();
        conn.regions_received(vec![handle(1)]).unwrap();
        conn.stream_end_received().unwrap();
        conn.stream_end_sent().unwrap();
        assert!(conn.teardown(&mut endpoint).is_err());

        conn.done_sent().unwrap();
        conn.done_received().unwrap();
        assert!(conn.is_closed());
        conn.teardown(&mut endpoint).unwrap();
        assert!(!region.is_registered());
    }

    #[test]
    fn test_out_of_order_events() {
        let mut conn = Connection::new(1, Vec::new());
        assert!(matches!(
            conn.stream_end_sent(),
            Err(IofwdError::ProtocolViolation(_))
        ));
        assert!(conn.done_received().is_err());

        conn.regions_sent().unwrap();
        assert!(conn.regions_sent().is_err());
        assert!(conn.regions_received(vec![handle(5)]).is_err());
    }
}
