//! In-memory dataset store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::{StorageError, StorageResult};
use super::header::{DatasetHeader, Variable};
use super::{DatasetMode, StorageBackend};
use crate::aggregation::merge::copy_sub_array;
use crate::protocol::{DataType, Element};

#[derive(Debug, Default)]
struct StoredDataset {
    header: DatasetHeader,
    /// Dense bytes per variable id, sized on first write.
    data: Vec<Vec<u8>>,
    cmode: i32,
}

/// Datasets shared by every [`MemoryBackend`] created from the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    datasets: Arc<Mutex<HashMap<String, StoredDataset>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend handle writing into this store.
    pub fn backend(&self) -> MemoryBackend {
        MemoryBackend {
            store: self.clone(),
            handles: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.datasets.lock().contains_key(path)
    }

    /// Copy of a dataset's schema and contents.
    pub fn snapshot(&self, path: &str) -> Option<DatasetSnapshot> {
        let datasets = self.datasets.lock();
        let dataset = datasets.get(path)?;

        let data = (0..dataset.header.variables.len())
            .map(|var_id| {
                let size = dataset
                    .header
                    .variable_size(0, var_id as i32)
                    .unwrap_or_default();
                let mut bytes = dataset.data.get(var_id).cloned().unwrap_or_default();
                bytes.resize(size, 0);
                bytes
            })
            .collect();

        Some(DatasetSnapshot {
            header: dataset.header.clone(),
            data,
            cmode: dataset.cmode,
        })
    }
}

/// Point-in-time copy of a stored dataset.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    pub header: DatasetHeader,
    pub data: Vec<Vec<u8>>,
    pub cmode: i32,
}

impl DatasetSnapshot {
    pub fn variable(&self, name: &str) -> Option<(&Variable, &[u8])> {
        let (id, var) = self.header.variable_by_name(name)?;
        Some((var, self.data[id as usize].as_slice()))
    }

    /// Decoded values of a variable, or `None` if absent or of another type.
    pub fn values<T: Element>(&self, name: &str) -> Option<Vec<T>> {
        let (var, bytes) = self.variable(name)?;
        (var.xtype == T::DATA_TYPE).then(|| T::from_le_slice(bytes))
    }

    pub fn dimension_len(&self, name: &str) -> Option<usize> {
        self.header
            .dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.len)
    }
}

struct OpenDataset {
    path: String,
    mode: DatasetMode,
}

/// One server's handle onto a [`MemoryStore`].
pub struct MemoryBackend {
    store: MemoryStore,
    handles: HashMap<i32, OpenDataset>,
    next_id: i32,
}

impl MemoryBackend {
    fn open(&self, file_id: i32) -> StorageResult<&OpenDataset> {
        self.handles
            .get(&file_id)
            .ok_or(StorageError::UnknownDataset(file_id))
    }

    fn with_dataset<T>(
        &self,
        path: &str,
        f: impl FnOnce(&mut StoredDataset) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut datasets = self.store.datasets.lock();
        let dataset = datasets
            .get_mut(path)
            .ok_or_else(|| StorageError::Backend(format!("dataset {} vanished", path)))?;
        f(dataset)
    }
}

impl StorageBackend for MemoryBackend {
    fn create_dataset(&mut self, path: &str, cmode: i32) -> StorageResult<i32> {
        self.store
            .datasets
            .lock()
            .entry(path.to_string())
            .or_insert_with(|| StoredDataset {
                cmode,
                ..Default::default()
            });

        let file_id = self.next_id;
        self.next_id += 1;
        self.handles.insert(
            file_id,
            OpenDataset {
                path: path.to_string(),
                mode: DatasetMode::Define,
            },
        );
        tracing::debug!("memory dataset {} opened as {}", path, file_id);
        Ok(file_id)
    }

    fn define_dimension(&mut self, file_id: i32, name: &str, len: usize) -> StorageResult<i32> {
        let open = self.open(file_id)?;
        open.mode.require_define(file_id)?;
        self.with_dataset(&open.path, |d| d.header.define_dimension(name, len))
    }

    fn define_variable(
        &mut self,
        file_id: i32,
        name: &str,
        xtype: DataType,
        dim_ids: &[i32],
    ) -> StorageResult<i32> {
        let open = self.open(file_id)?;
        open.mode.require_define(file_id)?;
        self.with_dataset(&open.path, |d| {
            d.header.define_variable(file_id, name, xtype, dim_ids)
        })
    }

    fn put_attribute(
        &mut self,
        file_id: i32,
        var_id: i32,
        name: &str,
        xtype: DataType,
        values: &[u8],
    ) -> StorageResult<()> {
        let open = self.open(file_id)?;
        open.mode.require_define(file_id)?;
        self.with_dataset(&open.path, |d| {
            d.header.put_attribute(file_id, var_id, name, xtype, values)
        })
    }

    fn end_define(&mut self, file_id: i32) -> StorageResult<()> {
        let open = self
            .handles
            .get_mut(&file_id)
            .ok_or(StorageError::UnknownDataset(file_id))?;
        open.mode.require_define(file_id)?;
        open.mode = DatasetMode::Data;
        Ok(())
    }

    fn put_sub_array(
        &mut self,
        file_id: i32,
        var_id: i32,
        start: &[usize],
        count: &[usize],
        data: &[u8],
    ) -> StorageResult<()> {
        let open = self.open(file_id)?;
        open.mode.require_data(file_id)?;

        self.with_dataset(&open.path, |dataset| {
            let (shape, elem) = dataset
                .header
                .check_sub_array(file_id, var_id, start, count, data.len())?;
            let total = dataset.header.variable_size(file_id, var_id)?;

            let index = var_id as usize;
            if dataset.data.len() <= index {
                dataset.data.resize_with(index + 1, Vec::new);
            }
            let dense = &mut dataset.data[index];
            if dense.len() != total {
                dense.resize(total, 0);
            }

            let origin = vec![0usize; shape.len()];
            copy_sub_array(data, start, count, dense, &origin, &shape, elem);
            Ok(())
        })
    }

    fn close_dataset(&mut self, file_id: i32) -> StorageResult<()> {
        let open = self
            .handles
            .remove(&file_id)
            .ok_or(StorageError::UnknownDataset(file_id))?;
        tracing::debug!("memory dataset {} closed ({})", open.path, file_id);
        Ok(())
    }
}
