//! Process-group substrate used for bootstrap.
//!
//! Carries the few small messages needed before channels exist (endpoint
//! addresses) and the closing barrier. Bulk data never goes through here.

use std::collections::VecDeque;
use std::sync::{Arc, Barrier};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{IdKind, IofwdError, IofwdResult};

/// Tag of the server endpoint address sent to each of its clients.
pub const TAG_ENDPOINT_ADDRESS: u32 = 1;

/// Reliable, ordered point-to-point messaging among a fixed set of ranks.
pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, dest: usize, tag: u32, payload: Bytes) -> IofwdResult<()>;

    /// Receive the next message from `src` carrying `tag`. Messages from
    /// `src` with other tags stay queued for later calls.
    fn recv(&self, src: usize, tag: u32) -> IofwdResult<Bytes>;

    fn barrier(&self) -> IofwdResult<()>;
}

struct Envelope {
    tag: u32,
    payload: Bytes,
}

/// One rank of a group whose members are threads of this process.
pub struct LocalGroup {
    rank: usize,
    size: usize,
    outgoing: Vec<Sender<Envelope>>,
    incoming: Vec<Receiver<Envelope>>,
    stashed: Mutex<Vec<VecDeque<Envelope>>>,
    barrier: Arc<Barrier>,
}

impl LocalGroup {
    /// Create all `size` members. Hand one to each thread.
    pub fn spawn_world(size: usize) -> Vec<LocalGroup> {
        // links[src][dest]
        let mut senders: Vec<Vec<Option<Sender<Envelope>>>> = Vec::with_capacity(size);
        let mut receivers: Vec<Vec<Option<Receiver<Envelope>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        for src in 0..size {
            let mut row = Vec::with_capacity(size);
            for receiver_row in receivers.iter_mut() {
                let (tx, rx) = channel::unbounded();
                row.push(Some(tx));
                receiver_row[src] = Some(rx);
            }
            senders.push(row);
        }

        let barrier = Arc::new(Barrier::new(size.max(1)));
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outgoing, incoming))| LocalGroup {
                rank,
                size,
                outgoing: outgoing.into_iter().flatten().collect(),
                incoming: incoming.into_iter().flatten().collect(),
                stashed: Mutex::new((0..size).map(|_| VecDeque::new()).collect()),
                barrier: barrier.clone(),
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> IofwdResult<()> {
        if rank < self.size {
            Ok(())
        } else {
            Err(IofwdError::unknown(IdKind::Rank, rank))
        }
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, tag: u32, payload: Bytes) -> IofwdResult<()> {
        self.check_rank(dest)?;
        self.outgoing[dest]
            .send(Envelope { tag, payload })
            .map_err(|_| {
                IofwdError::ChannelSetupFailure(format!("rank {} left the group", dest))
            })
    }

    fn recv(&self, src: usize, tag: u32) -> IofwdResult<Bytes> {
        self.check_rank(src)?;
        {
            let mut stashed = self.stashed.lock();
            let queue = &mut stashed[src];
            if let Some(pos) = queue.iter().position(|e| e.tag == tag) {
                if let Some(envelope) = queue.remove(pos) {
                    return Ok(envelope.payload);
                }
            }
        }

        loop {
            let envelope = self.incoming[src].recv().map_err(|_| {
                IofwdError::ChannelSetupFailure(format!("rank {} left the group", src))
            })?;
            if envelope.tag == tag {
                return Ok(envelope.payload);
            }
            self.stashed.lock()[src].push_back(envelope);
        }
    }

    fn barrier(&self) -> IofwdResult<()> {
        self.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_to_point() {
        let mut world = LocalGroup::spawn_world(2);
        let b = world.pop().unwrap();
        let a = world.pop().unwrap();
        assert_eq!((a.rank(), b.rank(), a.size()), (0, 1, 2));

        a.send(1, 7, Bytes::from_static(b"first")).unwrap();
        a.send(1, 8, Bytes::from_static(b"other")).unwrap();
        a.send(1, 7, Bytes::from_static(b"second")).unwrap();

        assert_eq!(b.recv(0, 8).unwrap(), "other");
        assert_eq!(b.recv(0, 7).unwrap(), "first");
        assert_eq!(b.recv(0, 7).unwrap(), "second");
    }

    #[test]
    fn test_self_send_and_bad_rank() {
        let world = LocalGroup::spawn_world(1);
        let me = &world[0];
        me.send(0, 1, Bytes::from_static(b"loop")).unwrap();
        assert_eq!(me.recv(0, 1).unwrap(), "loop");
        assert!(me.send(3, 1, Bytes::new()).is_err());
        me.barrier().unwrap();
    }

    #[test]
    fn test_barrier_across_threads() {
        let handles: Vec<_> = LocalGroup::spawn_world(4)
            .into_iter()
            .map(|group| {
                std::thread::spawn(move || {
                    if group.rank() != 0 {
                        group.send(0, 2, Bytes::from(vec![group.rank() as u8])).unwrap();
                    }
                    group.barrier().unwrap();
                    if group.rank() == 0 {
                        (1..group.size())
                            .map(|src| group.recv(src, 2).unwrap()[0])
                            .sum::<u8>()
                    } else {
                        0
                    }
                })
            })
            .collect();
        let total: u8 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 6);
    }
}
