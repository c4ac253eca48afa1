//! In-process one-sided fabric.
//!
//! Endpoints post work requests and learn about their outcome by polling a
//! completion queue. Two-sided sends match receives posted by the peer in
//! FIFO order per peer; reads and writes go straight to a registered region of
//! the peer and never involve its CPU, except for the doorbell completion a
//! `write_with_imm` leaves in the peer's queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::handshake::HandshakeDescriptor;
use super::region::{Access, MemoryRegion, RegionHandle};
use crate::error::{IofwdError, IofwdResult};

/// Small two-sided messages used around the one-sided transfers.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Region handles a peer may access.
    Regions(Vec<RegionHandle>),
    /// A lowered mailbox value returned to the producer.
    Ack(HandshakeDescriptor),
    /// The sender is done with the connection.
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionKind {
    Send,
    Recv(ControlMessage),
    Read,
    Write,
    /// A peer wrote into one of our regions with immediate data.
    RemoteWrite { imm: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub wr_id: u64,
    pub peer: usize,
    pub kind: CompletionKind,
    pub status: CompletionStatus,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }

    /// Turn a failed completion into an error.
    pub fn check(&self) -> IofwdResult<()> {
        match &self.status {
            CompletionStatus::Success => Ok(()),
            CompletionStatus::Failed(reason) => Err(IofwdError::ChannelSetupFailure(format!(
                "work request {} to rank {} failed: {}",
                self.wr_id, self.peer, reason
            ))),
        }
    }

    fn is_local_request(&self) -> bool {
        !matches!(self.kind, CompletionKind::RemoteWrite { .. } | CompletionKind::Recv(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Blocking,
    NonBlocking,
    Timeout(Duration),
}

/// Address an endpoint announces so peers can connect to it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct EndpointAddress {
    rank: U64,
    token: U64,
}

impl EndpointAddress {
    pub fn rank(&self) -> usize {
        self.rank.get() as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> IofwdResult<Self> {
        EndpointAddress::read_from_bytes(bytes).map_err(|_| {
            IofwdError::ChannelSetupFailure(format!(
                "endpoint address of {} bytes is malformed",
                bytes.len()
            ))
        })
    }
}

#[derive(Default)]
struct Inbox {
    posted: HashMap<usize, VecDeque<u64>>,
    unmatched: HashMap<usize, VecDeque<ControlMessage>>,
}

struct EndpointSlot {
    token: u64,
    completions: Sender<Completion>,
    inbox: Mutex<Inbox>,
}

impl EndpointSlot {
    fn push(&self, completion: Completion) -> bool {
        self.completions.send(completion).is_ok()
    }
}

#[derive(Default)]
struct FabricInner {
    endpoints: Mutex<HashMap<usize, Arc<EndpointSlot>>>,
    regions: Mutex<HashMap<(usize, u64), MemoryRegion>>,
    next_token: AtomicU64,
    next_region: AtomicU64,
}

/// Shared interconnect. Clones refer to the same fabric.
#[derive(Clone, Default)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the endpoint of `rank`. Each rank may hold one endpoint at a time.
    pub fn open_endpoint(&self, rank: usize) -> IofwdResult<Endpoint> {
        let (tx, rx) = channel::unbounded();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = Arc::new(EndpointSlot {
            token,
            completions: tx,
            inbox: Mutex::new(Inbox::default()),
        });

        let mut endpoints = self.inner.endpoints.lock();
        if endpoints.contains_key(&rank) {
            return Err(IofwdError::ChannelSetupFailure(format!(
                "rank {} already has an open endpoint",
                rank
            )));
        }
        endpoints.insert(rank, slot.clone());
        drop(endpoints);

        tracing::debug!(rank, "endpoint opened");
        Ok(Endpoint {
            rank,
            fabric: self.clone(),
            slot,
            completions: rx,
            next_wr_id: 1,
            outstanding: 0,
            posted_recvs: 0,
            regions: Vec::new(),
        })
    }

    fn slot(&self, rank: usize) -> Option<Arc<EndpointSlot>> {
        self.inner.endpoints.lock().get(&rank).cloned()
    }

    fn region(&self, handle: &RegionHandle) -> Option<MemoryRegion> {
        self.inner
            .regions
            .lock()
            .get(&(handle.rank, handle.id))
            .filter(|region| region.handle() == *handle)
            .cloned()
    }
}

/// One rank's access point to the fabric. Owned by a single thread.
pub struct Endpoint {
    rank: usize,
    fabric: Fabric,
    slot: Arc<EndpointSlot>,
    completions: Receiver<Completion>,
    next_wr_id: u64,
    outstanding: usize,
    posted_recvs: usize,
    regions: Vec<u64>,
}

impl Endpoint {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn address(&self) -> EndpointAddress {
        EndpointAddress {
            rank: U64::new(self.rank as u64),
            token: U64::new(self.slot.token),
        }
    }

    /// Check that `address` names a live endpoint and return its rank.
    pub fn connect(&self, address: &EndpointAddress) -> IofwdResult<usize> {
        let peer = address.rank();
        match self.fabric.slot(peer) {
            Some(slot) if slot.token == address.token.get() => {
                tracing::debug!(rank = self.rank, peer, "connected");
                Ok(peer)
            }
            Some(_) => Err(IofwdError::ChannelSetupFailure(format!(
                "endpoint of rank {} was reopened since its address was announced",
                peer
            ))),
            None => Err(IofwdError::ChannelSetupFailure(format!(
                "rank {} has no open endpoint",
                peer
            ))),
        }
    }

    /// Initiated requests (sends, reads, writes) not yet polled.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Receives posted and not yet completed.
    pub fn posted_recvs(&self) -> usize {
        self.posted_recvs
    }

    /// Register a zeroed region of `len` bytes.
    pub fn register(&mut self, len: usize, access: Access) -> MemoryRegion {
        let id = self.fabric.inner.next_region.fetch_add(1, Ordering::Relaxed) + 1;
        let region = MemoryRegion::new(self.rank, id, len, access);
        self.fabric
            .inner
            .regions
            .lock()
            .insert((self.rank, id), region.clone());
        self.regions.push(id);
        tracing::trace!(rank = self.rank, region = id, len, ?access, "region registered");
        region
    }

    /// Revoke remote access to `region` and forget it.
    pub fn deregister(&mut self, region: &MemoryRegion) {
        region.deregister();
        self.fabric.inner.regions.lock().remove(&(self.rank, region.id()));
        self.regions.retain(|id| *id != region.id());
    }

    fn next_wr_id(&mut self) -> u64 {
        let id = self.next_wr_id;
        self.next_wr_id += 1;
        id
    }

    fn complete_local(&mut self, wr_id: u64, peer: usize, kind: CompletionKind, status: CompletionStatus) {
        self.outstanding += 1;
        if let CompletionStatus::Failed(reason) = &status {
            tracing::warn!(rank = self.rank, peer, wr_id, "{:?} failed: {}", kind, reason);
        }
        self.slot.push(Completion {
            wr_id,
            peer,
            kind,
            status,
        });
    }

    /// Send a control message to `peer`. It completes on the peer once the
    /// peer has a matching receive posted.
    pub fn post_send(&mut self, peer: usize, message: ControlMessage) -> u64 {
        let wr_id = self.next_wr_id();
        let status = match self.fabric.slot(peer) {
            Some(slot) => {
                let mut inbox = slot.inbox.lock();
                let matched = inbox.posted.get_mut(&self.rank).and_then(VecDeque::pop_front);
                match matched {
                    Some(recv_id) => {
                        let delivered = slot.push(Completion {
                            wr_id: recv_id,
                            peer: self.rank,
                            kind: CompletionKind::Recv(message),
                            status: CompletionStatus::Success,
                        });
                        if delivered {
                            CompletionStatus::Success
                        } else {
                            CompletionStatus::Failed(format!("rank {} stopped polling", peer))
                        }
                    }
                    None => {
                        inbox.unmatched.entry(self.rank).or_default().push_back(message);
                        CompletionStatus::Success
                    }
                }
            }
            None => CompletionStatus::Failed(format!("rank {} has no open endpoint", peer)),
        };
        self.complete_local(wr_id, peer, CompletionKind::Send, status);
        wr_id
    }

    /// Post a receive for the next control message from `peer`.
    pub fn post_recv(&mut self, peer: usize) -> u64 {
        let wr_id = self.next_wr_id();
        self.posted_recvs += 1;
        let mut inbox = self.slot.inbox.lock();
        let waiting = inbox.unmatched.get_mut(&peer).and_then(VecDeque::pop_front);
        match waiting {
            Some(message) => {
                drop(inbox);
                self.slot.push(Completion {
                    wr_id,
                    peer,
                    kind: CompletionKind::Recv(message),
                    status: CompletionStatus::Success,
                });
            }
            None => inbox.posted.entry(peer).or_default().push_back(wr_id),
        }
        wr_id
    }

    fn check_local(local: &MemoryRegion, offset: usize, len: usize) -> Result<(), String> {
        if !local.access().contains(Access::LOCAL) {
            return Err(format!("local region {} lacks LOCAL access", local.id()));
        }
        if !local.handle().covers(offset, len) {
            return Err(format!(
                "local range [{}, {}) outside region {} of {} bytes",
                offset,
                offset + len,
                local.id(),
                local.len()
            ));
        }
        Ok(())
    }

    /// Copy `len` bytes from the peer region at `remote_offset` into `local`.
    pub fn post_read(
        &mut self,
        remote: &RegionHandle,
        remote_offset: usize,
        local: &MemoryRegion,
        local_offset: usize,
        len: usize,
    ) -> u64 {
        let wr_id = self.next_wr_id();
        let result = Self::check_local(local, local_offset, len).and_then(|_| {
            let region = self
                .fabric
                .region(remote)
                .ok_or_else(|| format!("region {} of rank {} is unknown", remote.id, remote.rank))?;
            region.check_remote(Access::REMOTE_READ, remote_offset, len)?;
            let data = region.to_vec(remote_offset, len);
            local.write(local_offset, &data);
            Ok(())
        });
        self.complete_local(wr_id, remote.rank, CompletionKind::Read, status_of(result));
        wr_id
    }

    fn write_remote(
        &self,
        local: &MemoryRegion,
        local_offset: usize,
        remote: &RegionHandle,
        remote_offset: usize,
        len: usize,
    ) -> Result<(), String> {
        Self::check_local(local, local_offset, len)?;
        let region = self
            .fabric
            .region(remote)
            .ok_or_else(|| format!("region {} of rank {} is unknown", remote.id, remote.rank))?;
        region.check_remote(Access::REMOTE_WRITE, remote_offset, len)?;
        let data = local.to_vec(local_offset, len);
        region.write(remote_offset, &data);
        Ok(())
    }

    /// Copy `len` bytes of `local` into the peer region at `remote_offset`.
    pub fn post_write(
        &mut self,
        local: &MemoryRegion,
        local_offset: usize,
        remote: &RegionHandle,
        remote_offset: usize,
        len: usize,
    ) -> u64 {
        let wr_id = self.next_wr_id();
        let result = self.write_remote(local, local_offset, remote, remote_offset, len);
        self.complete_local(wr_id, remote.rank, CompletionKind::Write, status_of(result));
        wr_id
    }

    /// Like [`Endpoint::post_write`], and also raise a completion carrying
    /// `imm` on the peer once the data is in place.
    pub fn post_write_with_imm(
        &mut self,
        local: &MemoryRegion,
        local_offset: usize,
        remote: &RegionHandle,
        remote_offset: usize,
        len: usize,
        imm: u32,
    ) -> u64 {
        let wr_id = self.next_wr_id();
        let result = self
            .write_remote(local, local_offset, remote, remote_offset, len)
            .and_then(|_| {
                let slot = self
                    .fabric
                    .slot(remote.rank)
                    .ok_or_else(|| format!("rank {} has no open endpoint", remote.rank))?;
                let rang = slot.push(Completion {
                    wr_id: 0,
                    peer: self.rank,
                    kind: CompletionKind::RemoteWrite { imm },
                    status: CompletionStatus::Success,
                });
                if rang {
                    Ok(())
                } else {
                    Err(format!("rank {} stopped polling", remote.rank))
                }
            });
        self.complete_local(wr_id, remote.rank, CompletionKind::Write, status_of(result));
        wr_id
    }

    /// Take the next completion.
    pub fn poll(&mut self, mode: PollMode) -> Option<Completion> {
        let completion = match mode {
            PollMode::Blocking => self.completions.recv().ok(),
            PollMode::NonBlocking => match self.completions.try_recv() {
                Ok(completion) => Some(completion),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            },
            PollMode::Timeout(timeout) => match self.completions.recv_timeout(timeout) {
                Ok(completion) => Some(completion),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        }?;

        if completion.is_local_request() {
            self.outstanding = self.outstanding.saturating_sub(1);
        } else if matches!(completion.kind, CompletionKind::Recv(_)) {
            self.posted_recvs = self.posted_recvs.saturating_sub(1);
        }
        Some(completion)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let mut regions = self.fabric.inner.regions.lock();
        for id in self.regions.drain(..) {
            if let Some(region) = regions.remove(&(self.rank, id)) {
                region.deregister();
            }
        }
        drop(regions);

        let mut endpoints = self.fabric.inner.endpoints.lock();
        if endpoints
            .get(&self.rank)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot))
        {
            endpoints.remove(&self.rank);
        }
        tracing::debug!(rank = self.rank, "endpoint closed");
    }
}

fn status_of(result: Result<(), String>) -> CompletionStatus {
    match result {
        Ok(()) => CompletionStatus::Success,
        Err(reason) => CompletionStatus::Failed(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Fabric, Endpoint, Endpoint) {
        let fabric = Fabric::new();
        let a = fabric.open_endpoint(0).unwrap();
        let b = fabric.open_endpoint(1).unwrap();
        (fabric, a, b)
    }

    #[test]
    fn test_rank_opens_once() {
        let fabric = Fabric::new();
        let _a = fabric.open_endpoint(3).unwrap();
        assert!(fabric.open_endpoint(3).is_err());
    }

    #[test]
    fn test_send_before_recv_is_queued() {
        let (_fabric, mut a, mut b) = pair();

        a.post_send(1, ControlMessage::Done);
        let sent = a.poll(PollMode::NonBlocking).unwrap();
        assert!(sent.is_success());
        assert_eq!(a.outstanding(), 0);
        assert!(b.poll(PollMode::NonBlocking).is_none());

        let recv_id = b.post_recv(0);
        let received = b.poll(PollMode::NonBlocking).unwrap();
        assert_eq!(received.wr_id, recv_id);
        assert_eq!(received.peer, 0);
        assert_eq!(received.kind, CompletionKind::Recv(ControlMessage::Done));
        assert_eq!(b.posted_recvs(), 0);
    }

    #[test]
    fn test_messages_from_one_peer_stay_ordered() {
        let (_fabric, mut a, mut b) = pair();
        b.post_recv(0);
        b.post_recv(0);
        a.post_send(1, ControlMessage::Ack(HandshakeDescriptor::idle()));
        a.post_send(1, ControlMessage::Done);

        let first = b.poll(PollMode::NonBlocking).unwrap();
        let second = b.poll(PollMode::NonBlocking).unwrap();
        assert!(matches!(first.kind, CompletionKind::Recv(ControlMessage::Ack(_))));
        assert_eq!(second.kind, CompletionKind::Recv(ControlMessage::Done));
    }

    #[test]
    fn test_read_and_write() {
        let (_fabric, mut a, mut b) = pair();
        let source = b.register(16, Access::LOCAL | Access::REMOTE_READ);
        source.write(4, b"data");
        let sink = a.register(16, Access::LOCAL);

        a.post_read(&source.handle(), 4, &sink, 0, 4);
        a.poll(PollMode::NonBlocking).unwrap().check().unwrap();
        assert_eq!(sink.to_vec(0, 4), b"data");

        // The source region is not remotely writable.
        a.post_write(&sink, 0, &source.handle(), 0, 4);
        let failed = a.poll(PollMode::NonBlocking).unwrap();
        assert!(!failed.is_success());
        assert!(failed.check().is_err());
    }

    #[test]
    fn test_write_with_imm_rings_peer() {
        let (_fabric, mut a, mut b) = pair();
        let mailbox = b.register(8, Access::LOCAL | Access::REMOTE_WRITE);
        let staging = a.register(8, Access::LOCAL);
        staging.write(0, &7u64.to_le_bytes());

        a.post_write_with_imm(&staging, 0, &mailbox.handle(), 0, 8, 1);
        a.poll(PollMode::NonBlocking).unwrap().check().unwrap();

        let doorbell = b.poll(PollMode::Timeout(Duration::from_millis(10))).unwrap();
        assert_eq!(doorbell.kind, CompletionKind::RemoteWrite { imm: 1 });
        assert_eq!(mailbox.to_vec(0, 8), 7u64.to_le_bytes());
        assert_eq!(b.outstanding(), 0);
    }

    #[test]
    fn test_deregistered_region_rejects_access() {
        let (_fabric, mut a, mut b) = pair();
        let source = b.register(8, Access::LOCAL | Access::REMOTE_READ);
        let handle = source.handle();
        b.deregister(&source);

        let sink = a.register(8, Access::LOCAL);
        a.post_read(&handle, 0, &sink, 0, 8);
        assert!(!a.poll(PollMode::NonBlocking).unwrap().is_success());
    }

    #[test]
    fn test_connect_checks_address() {
        let (fabric, a, b) = pair();
        let address = b.address();
        assert_eq!(a.connect(&address).unwrap(), 1);

        let bytes = address.to_bytes();
        assert_eq!(EndpointAddress::from_bytes(&bytes).unwrap(), address);
        assert!(EndpointAddress::from_bytes(&bytes[..4]).is_err());

        drop(b);
        assert!(a.connect(&address).is_err());
        let _reopened = fabric.open_endpoint(1).unwrap();
        assert!(a.connect(&address).is_err());
    }

    #[test]
    fn test_send_to_closed_endpoint_fails() {
        let (_fabric, mut a, b) = pair();
        drop(b);
        a.post_send(1, ControlMessage::Done);
        assert!(a.poll(PollMode::NonBlocking).unwrap().check().is_err());
    }
}
