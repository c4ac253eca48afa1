//! Server-side aggregation of client calls into collective backend calls.
//!
//! Every client of a server issues the same sequence of calls. A call only
//! reaches the backend once all clients have made it; until then the
//! aggregator records who contributed and, for variable writes, keeps each
//! client's sub-array so the writes can be merged into one.

pub mod merge;
pub mod request;

pub use merge::{merge_sub_arrays, SubArray};
pub use request::{CompletionBitmap, PendingIoRequest, RequestKey, RequestTable};

use bytes::Bytes;

use crate::error::{IdKind, IofwdError, IofwdResult};
use crate::id::{
    FileStatus, PendingDefinition, QueuedAttribute, ServerIdRegistry, VariableDeclaration,
};
use crate::protocol::{DataType, Message, OpCode, GLOBAL_VAR_ID};
use crate::storage::StorageBackend;

/// Counters reported when a server finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorStats {
    pub messages: u64,
    pub collective_writes: u64,
    pub bytes_written: u64,
    pub failed_messages: u64,
}

pub struct Aggregator {
    backend: Box<dyn StorageBackend>,
    registry: ServerIdRegistry,
    requests: RequestTable,
    clients: usize,
    phases: Vec<u64>,
    streams_received: bool,
    streams_finished: bool,
    stats: AggregatorStats,
}

impl Aggregator {
    pub fn new(backend: Box<dyn StorageBackend>, clients: usize) -> Self {
        Self {
            backend,
            registry: ServerIdRegistry::new(clients),
            requests: RequestTable::new(clients),
            clients,
            phases: vec![0; clients],
            streams_received: false,
            streams_finished: false,
            stats: AggregatorStats::default(),
        }
    }

    pub fn clients(&self) -> usize {
        self.clients
    }

    pub fn registry(&self) -> &ServerIdRegistry {
        &self.registry
    }

    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Completed phases of a client.
    pub fn phase(&self, client_index: usize) -> u64 {
        self.phases.get(client_index).copied().unwrap_or_default()
    }

    /// Whether every client's end-of-stream has been decoded.
    pub fn is_finished(&self) -> bool {
        self.streams_finished
    }

    /// Whether every client's end-of-stream has arrived on the transport.
    pub fn all_streams_received(&self) -> bool {
        self.streams_received
    }

    /// Record that a client's stream has been fully received. Returns true
    /// once this holds for every client.
    pub fn stream_received(&mut self, client_index: usize) -> IofwdResult<bool> {
        let key = RequestKey::stream(OpCode::WriterFinal);
        if self.requests.record_contribution(client_index, key)? {
            self.requests.remove(&key);
            self.streams_received = true;
        }
        Ok(self.streams_received)
    }

    /// Apply one decoded message from the client at `client_index`.
    ///
    /// An error affects this message only; the aggregator stays usable.
    pub fn handle(&mut self, client_index: usize, message: Message) -> IofwdResult<()> {
        self.stats.messages += 1;
        let opcode = message.opcode();
        let result = self.dispatch(client_index, message);
        if let Err(e) = &result {
            self.stats.failed_messages += 1;
            tracing::error!("client {}: {:?} failed: {}", client_index, opcode, e);
        }
        result
    }

    fn dispatch(&mut self, client_index: usize, message: Message) -> IofwdResult<()> {
        match message {
            Message::Create {
                path,
                cmode,
                file_id,
            } => self.create(client_index, &path, cmode, file_id),
            Message::DefDim {
                file_id,
                name,
                len,
                dim_id,
            } => {
                if self.registry.map_dim(file_id, dim_id, &name, len)? {
                    tracing::debug!("file {}: dimension {} ({}) len {}", file_id, name, dim_id, len);
                }
                Ok(())
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
                let decl = VariableDeclaration {
                    name,
                    xtype,
                    dim_ids,
                    start,
                    count,
                };
                self.registry.map_var(file_id, var_id, decl)?;
                Ok(())
            }
            Message::PutAtt {
                file_id,
                var_id,
                name,
                xtype,
                values,
            } => self.put_att(client_index, file_id, var_id, name, xtype, values),
            Message::EndDef { file_id } => self.end_def(client_index, file_id),
            Message::PutVara {
                file_id,
                var_id,
                start,
                count,
                data_type,
                data,
            } => self.put_vara(
                client_index,
                file_id,
                var_id,
                SubArray { start, count, data },
                data_type,
            ),
            Message::Close { file_id } => self.close(client_index, file_id),
            Message::IoEnd => {
                let phase = self
                    .phases
                    .get_mut(client_index)
                    .ok_or_else(|| IofwdError::unknown(IdKind::Client, client_index))?;
                *phase += 1;
                tracing::trace!("client {} finished phase {}", client_index, phase);
                Ok(())
            }
            Message::Final => {
                let key = RequestKey::stream(OpCode::ReaderFinal);
                if self.requests.record_contribution(client_index, key)? {
                    self.requests.remove(&key);
                    self.streams_finished = true;
                    tracing::debug!("all {} client streams decoded", self.clients);
                }
                Ok(())
            }
        }
    }

    fn create(&mut self, client_index: usize, path: &str, cmode: i32, file_id: i32) -> IofwdResult<()> {
        let key = RequestKey::file(OpCode::Create, file_id);
        let complete = self.requests.record_contribution(client_index, key)?;
        if complete {
            self.requests.remove(&key);
        }
        if !self.registry.is_file_mapped(file_id) {
            let backend_id = self.backend.create_dataset(path, cmode)?;
            self.registry.map_file(file_id, backend_id);
            tracing::info!("created dataset {} (client file {})", path, file_id);
        }
        Ok(())
    }

    fn put_att(
        &mut self,
        client_index: usize,
        file_id: i32,
        var_id: i32,
        name: String,
        xtype: DataType,
        values: Bytes,
    ) -> IofwdResult<()> {
        let key = RequestKey::variable(OpCode::PutAtt, file_id, var_id);
        if !self.requests.record_contribution(client_index, key)? {
            return Ok(());
        }
        self.requests.remove(&key);

        let file = self.registry.file(file_id)?;
        if var_id == GLOBAL_VAR_ID {
            if file.status != FileStatus::Defining {
                return Err(IofwdError::Storage(
                    crate::storage::StorageError::NotInDefineMode(file.backend_id),
                ));
            }
            let backend_file = file.backend_id;
            self.backend
                .put_attribute(backend_file, GLOBAL_VAR_ID, &name, xtype, &values)?;
        } else {
            self.registry
                .queue_attribute(file_id, var_id, QueuedAttribute { name, xtype, values })?;
        }
        Ok(())
    }

    fn end_def(&mut self, client_index: usize, file_id: i32) -> IofwdResult<()> {
        let key = RequestKey::file(OpCode::EndDef, file_id);
        if !self.requests.record_contribution(client_index, key)? {
            return Ok(());
        }
        self.requests.remove(&key);

        if self.registry.file(file_id)?.status != FileStatus::Defining {
            return Ok(());
        }
        self.define_pending(file_id)?;

        let file = self.registry.file_mut(file_id)?;
        self.backend.end_define(file.backend_id)?;
        file.status = FileStatus::Writing;
        tracing::debug!("file {} left define mode", file_id);
        Ok(())
    }

    /// Define the file's dimensions and variables in first-reference order,
    /// followed by each variable's queued attributes.
    fn define_pending(&mut self, file_id: i32) -> IofwdResult<()> {
        let backend_file = self.registry.file(file_id)?.backend_id;

        for pending in self.registry.take_pending(file_id)? {
            match pending {
                PendingDefinition::Dimension(dim_id) => {
                    let dim = self.registry.dimension(file_id, dim_id)?;
                    let backend_dim =
                        self.backend
                            .define_dimension(backend_file, &dim.name, dim.define_len())?;
                    self.registry.dimension_mut(file_id, dim_id)?.backend_id = Some(backend_dim);
                }
                PendingDefinition::Variable(var_id) => {
                    let var = self.registry.variable(file_id, var_id)?;
                    let backend_dims = var
                        .dim_ids
                        .iter()
                        .map(|d| {
                            self.registry
                                .dimension(file_id, *d)?
                                .backend_id
                                .ok_or_else(|| IofwdError::unknown(IdKind::Dimension, d))
                        })
                        .collect::<IofwdResult<Vec<i32>>>()?;
                    let backend_var = self.backend.define_variable(
                        backend_file,
                        &var.name,
                        var.xtype,
                        &backend_dims,
                    )?;

                    let var = self.registry.variable_mut(file_id, var_id)?;
                    var.backend_id = Some(backend_var);
                    for att in std::mem::take(&mut var.attributes) {
                        self.backend.put_attribute(
                            backend_file,
                            backend_var,
                            &att.name,
                            att.xtype,
                            &att.values,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn put_vara(
        &mut self,
        client_index: usize,
        file_id: i32,
        var_id: i32,
        part: SubArray,
        data_type: DataType,
    ) -> IofwdResult<()> {
        let key = RequestKey::variable(OpCode::PutVara, file_id, var_id);
        let complete = self.requests.record_contribution(client_index, key)?;
        let stored = self
            .registry
            .put_contribution(file_id, var_id, client_index, part);
        if !complete {
            return stored;
        }
        self.requests.remove(&key);
        // The writes leave the registry with the request, even if it fails.
        let parts = self.registry.take_contributions(file_id, var_id);
        stored?;
        let parts = parts?;

        let backend_file = self.registry.file(file_id)?.backend_id;
        let var = self.registry.variable(file_id, var_id)?;
        let (backend_var, ndims, xtype) = (var.backend_id, var.ndims(), var.xtype);

        let backend_var =
            backend_var.ok_or_else(|| IofwdError::unknown(IdKind::Variable, var_id))?;
        if xtype != data_type {
            return Err(IofwdError::UnexpectedMessage(format!(
                "variable {} holds {:?}, write carries {:?}",
                var_id, xtype, data_type
            )));
        }
        if let Some(bad) = parts.iter().find(|p| p.ndims() != ndims) {
            return Err(IofwdError::WrongDimensionality {
                expected: ndims,
                actual: bad.ndims(),
            });
        }

        let Some(merged) = merge_sub_arrays(parts, xtype.size())? else {
            return Ok(());
        };
        self.backend.put_sub_array(
            backend_file,
            backend_var,
            &merged.start,
            &merged.count,
            &merged.data,
        )?;
        self.stats.collective_writes += 1;
        self.stats.bytes_written += merged.data.len() as u64;
        tracing::trace!(
            "file {} var {}: wrote box {:?}+{:?}",
            file_id,
            var_id,
            merged.start,
            merged.count
        );
        Ok(())
    }

    fn close(&mut self, client_index: usize, file_id: i32) -> IofwdResult<()> {
        let key = RequestKey::file(OpCode::Close, file_id);
        if !self.requests.record_contribution(client_index, key)? {
            return Ok(());
        }
        self.requests.remove(&key);

        let file = self.registry.remove_file(file_id)?;
        self.requests.remove_file(file_id);
        self.backend.close_dataset(file.backend_id)?;
        tracing::info!("closed client file {}", file_id);
        Ok(())
    }
}
