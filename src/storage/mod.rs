//! Dataset storage backends.
//!
//! Every server holds its own backend handle. Creating a dataset that another
//! server already created attaches to it, so the servers of a session end up
//! writing one shared dataset, each contributing the blocks of its clients.
pub mod directory;
pub mod error;
pub mod header;
pub mod memory;

pub use directory::DirectoryBackend;
pub use error::{StorageError, StorageResult};
pub use header::{Attribute, DatasetHeader, Dimension, Variable};
pub use memory::{DatasetSnapshot, MemoryBackend, MemoryStore};

use std::path::PathBuf;

use crate::config::{BackendKind, StorageConfig};
use crate::protocol::DataType;

/// Where a session's servers store datasets. Each server opens its own
/// backend handle from the shared target.
#[derive(Debug, Clone)]
pub enum StorageTarget {
    Memory(MemoryStore),
    Directory(PathBuf),
}

impl StorageTarget {
    pub fn from_config(config: &StorageConfig) -> Self {
        match config.backend {
            BackendKind::Memory => StorageTarget::Memory(MemoryStore::new()),
            BackendKind::Directory => StorageTarget::Directory(config.output_dir.clone()),
        }
    }

    pub fn open(&self) -> StorageResult<Box<dyn StorageBackend>> {
        match self {
            StorageTarget::Memory(store) => Ok(Box::new(store.backend())),
            StorageTarget::Directory(root) => Ok(Box::new(DirectoryBackend::new(root.clone())?)),
        }
    }
}

/// Dataset backend with NetCDF-like define/data modes.
///
/// Ids returned by the backend are only meaningful to the handle that
/// returned them. Not `Sync`: a backend belongs to one server loop.
pub trait StorageBackend: Send {
    /// Create (or attach to) the dataset at `path`. The dataset starts in
    /// define mode.
    fn create_dataset(&mut self, path: &str, cmode: i32) -> StorageResult<i32>;

    fn define_dimension(&mut self, file_id: i32, name: &str, len: usize) -> StorageResult<i32>;

    fn define_variable(
        &mut self,
        file_id: i32,
        name: &str,
        xtype: DataType,
        dim_ids: &[i32],
    ) -> StorageResult<i32>;

    /// `var_id` may be [`crate::protocol::GLOBAL_VAR_ID`].
    fn put_attribute(
        &mut self,
        file_id: i32,
        var_id: i32,
        name: &str,
        xtype: DataType,
        values: &[u8],
    ) -> StorageResult<()>;

    /// Leave define mode. Variables become writable.
    fn end_define(&mut self, file_id: i32) -> StorageResult<()>;

    /// Write a dense row-major sub-array.
    fn put_sub_array(
        &mut self,
        file_id: i32,
        var_id: i32,
        start: &[usize],
        count: &[usize],
        data: &[u8],
    ) -> StorageResult<()>;

    fn close_dataset(&mut self, file_id: i32) -> StorageResult<()>;
}

/// Define/data mode of an open dataset handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetMode {
    Define,
    Data,
}

impl DatasetMode {
    pub(crate) fn require_define(self, file_id: i32) -> StorageResult<()> {
        match self {
            DatasetMode::Define => Ok(()),
            DatasetMode::Data => Err(StorageError::NotInDefineMode(file_id)),
        }
    }

    pub(crate) fn require_data(self, file_id: i32) -> StorageResult<()> {
        match self {
            DatasetMode::Data => Ok(()),
            DatasetMode::Define => Err(StorageError::NotInDataMode(file_id)),
        }
    }
}
