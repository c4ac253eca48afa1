//! Server receive, aggregate and commit loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aggregation::{Aggregator, AggregatorStats};
use crate::error::{IdKind, IofwdError, IofwdResult};
use crate::protocol::{Message, OpCode};
use crate::storage::StorageBackend;
use crate::transport::{
    ClientLink, Completion, CompletionKind, ControlMessage, Endpoint, EndpointAddress, PollMode,
};

/// Totals reported when a server finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerReport {
    pub rank: usize,
    pub clients: usize,
    pub reads: u64,
    pub bytes_received: u64,
    pub frames: u64,
    pub decode_errors: u64,
    pub aggregator: AggregatorStats,
    /// The loop was stopped before every client finished.
    pub interrupted: bool,
}

/// Single-threaded event loop serving every client mapped to this server.
pub struct ServerRuntime {
    endpoint: Endpoint,
    links: Vec<ClientLink>,
    by_rank: HashMap<usize, usize>,
    reads: HashMap<u64, usize>,
    aggregator: Aggregator,
    transfer_limit: usize,
    poll_interval: Duration,
    running: Option<Arc<AtomicBool>>,
    /// Client whose frame is decoded next.
    turn: usize,
    finished: Vec<bool>,
    torn_down: Vec<bool>,
    report: ServerReport,
}

impl ServerRuntime {
    /// Set up one link per client rank, in client index order.
    pub fn new(
        mut endpoint: Endpoint,
        client_ranks: &[usize],
        ring_capacity: usize,
        backend: Box<dyn StorageBackend>,
        transfer_limit: usize,
        poll_interval: Duration,
    ) -> Self {
        let links: Vec<ClientLink> = client_ranks
            .iter()
            .enumerate()
            .map(|(index, &rank)| ClientLink::new(&mut endpoint, index, rank, ring_capacity))
            .collect();
        let by_rank = client_ranks
            .iter()
            .enumerate()
            .map(|(index, &rank)| (rank, index))
            .collect();
        let clients = client_ranks.len();

        tracing::info!(
            rank = endpoint.rank(),
            clients,
            ring_capacity,
            transfer_limit,
            "server ready"
        );
        Self {
            report: ServerReport {
                rank: endpoint.rank(),
                clients,
                ..ServerReport::default()
            },
            endpoint,
            links,
            by_rank,
            reads: HashMap::new(),
            aggregator: Aggregator::new(backend, clients),
            transfer_limit: transfer_limit.max(1),
            poll_interval,
            running: None,
            turn: 0,
            finished: vec![false; clients],
            torn_down: vec![false; clients],
        }
    }

    /// Stop early once `running` is cleared.
    pub fn with_stop_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    pub fn rank(&self) -> usize {
        self.endpoint.rank()
    }

    pub fn address(&self) -> EndpointAddress {
        self.endpoint.address()
    }

    pub fn clients(&self) -> usize {
        self.links.len()
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map_or(true, |flag| flag.load(Ordering::Relaxed))
    }

    fn is_done(&self) -> bool {
        self.aggregator.is_finished()
            && self.links.iter().all(|link| !link.has_frames())
            && self.torn_down.iter().all(|&done| done)
    }

    /// Serve until every client has ended its stream and every connection
    /// is torn down.
    pub fn run(mut self) -> IofwdResult<ServerReport> {
        let started = Instant::now();
        let span = tracing::info_span!("server", rank = self.rank());
        let _enter = span.enter();

        if self.links.is_empty() {
            tracing::warn!("no clients mapped to this server");
            return Ok(self.report);
        }

        loop {
            let mut progressed = false;
            while let Some(completion) = self.endpoint.poll(PollMode::NonBlocking) {
                self.on_completion(completion)?;
                progressed = true;
            }

            progressed |= self.post_reads()?;
            progressed |= self.decode_ready()?;
            self.teardown_closed()?;

            if self.is_done() {
                break;
            }
            if !self.is_running() {
                tracing::warn!(
                    finished = self.finished.iter().filter(|&&f| f).count(),
                    clients = self.links.len(),
                    "stop requested before every client finished"
                );
                self.report.interrupted = true;
                break;
            }
            if !progressed {
                if let Some(completion) = self.endpoint.poll(PollMode::Timeout(self.poll_interval)) {
                    self.on_completion(completion)?;
                }
            }
        }

        self.report.aggregator = self.aggregator.stats();
        tracing::info!(
            reads = self.report.reads,
            bytes = self.report.bytes_received,
            frames = self.report.frames,
            writes = self.report.aggregator.collective_writes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "server finished"
        );
        Ok(self.report)
    }

    fn link_of_rank(&self, rank: usize) -> IofwdResult<usize> {
        self.by_rank
            .get(&rank)
            .copied()
            .ok_or_else(|| IofwdError::unknown(IdKind::Client, rank))
    }

    fn on_completion(&mut self, completion: Completion) -> IofwdResult<()> {
        completion.check()?;
        match completion.kind {
            CompletionKind::Recv(ControlMessage::Regions(handles)) => {
                let index = self.link_of_rank(completion.peer)?;
                self.links[index].on_regions(&mut self.endpoint, handles)?;
                tracing::debug!(client = index, rank = completion.peer, "client connected");
            }
            CompletionKind::Recv(ControlMessage::Done) => {
                let index = self.link_of_rank(completion.peer)?;
                self.links[index].on_done()?;
            }
            CompletionKind::Recv(ControlMessage::Ack(_)) => {
                return Err(IofwdError::ProtocolViolation(format!(
                    "rank {} sent an acknowledgment to a server",
                    completion.peer
                )));
            }
            CompletionKind::Read => {
                let index = self.reads.remove(&completion.wr_id).ok_or_else(|| {
                    IofwdError::ProtocolViolation(format!(
                        "completion for unknown read {}",
                        completion.wr_id
                    ))
                })?;
                let outcome = self.links[index].on_read_complete(&mut self.endpoint)?;
                self.report.bytes_received += outcome.bytes as u64;
                if outcome.stream_end && self.aggregator.stream_received(index)? {
                    tracing::debug!("every client stream received");
                }
            }
            CompletionKind::RemoteWrite { imm } => {
                tracing::trace!(rank = completion.peer, imm, "doorbell");
            }
            CompletionKind::Send | CompletionKind::Write => {}
        }
        Ok(())
    }

    /// Start reads for published spans while under the transfer limit.
    fn post_reads(&mut self) -> IofwdResult<bool> {
        let mut posted = false;
        for index in 0..self.links.len() {
            if self.endpoint.outstanding() >= self.transfer_limit {
                break;
            }
            let link = &mut self.links[index];
            let Some(descriptor) = link.pending_span()? else {
                continue;
            };
            if link.start_read(&mut self.endpoint, descriptor)? {
                if let Some(wr_id) = link.read_wr_id() {
                    self.reads.insert(wr_id, index);
                }
                self.report.reads += 1;
                posted = true;
            }
        }
        Ok(posted)
    }

    /// Decode frames in strict client rotation. Stops at the first client in
    /// turn with nothing queued.
    fn decode_ready(&mut self) -> IofwdResult<bool> {
        let clients = self.links.len();
        let mut progressed = false;
        loop {
            let Some(index) = (0..clients)
                .map(|step| (self.turn + step) % clients)
                .find(|&index| !self.finished[index])
            else {
                break;
            };
            let Some(frame) = self.links[index].next_frame() else {
                self.turn = index;
                break;
            };
            self.report.frames += 1;
            progressed = true;
            self.turn = (index + 1) % clients;

            let message = match Message::decode(frame) {
                Ok(message) => message,
                Err(e) => {
                    self.report.decode_errors += 1;
                    tracing::error!(client = index, "dropping undecodable frame: {}", e);
                    continue;
                }
            };
            let is_final = message.opcode() == OpCode::Final;
            if let Err(e) = self.aggregator.handle(index, message) {
                if e.is_fatal() {
                    return Err(e);
                }
            }
            if is_final {
                self.finished[index] = true;
                tracing::debug!(client = index, "stream decoded");
            }
        }
        Ok(progressed)
    }

    fn teardown_closed(&mut self) -> IofwdResult<()> {
        for (index, link) in self.links.iter_mut().enumerate() {
            if !self.torn_down[index] && link.is_closed() {
                link.teardown(&mut self.endpoint)?;
                self.torn_down[index] = true;
            }
        }
        Ok(())
    }
}
