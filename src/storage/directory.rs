//! Directory-per-dataset backend.
//!
//! Dataset `P` lives in `<root>/P.d/`: `header.json` holds the schema and
//! each variable is a raw little-endian file `<name>.bin`, preallocated to
//! its full extent when define mode ends. Sub-array writes become one
//! positioned write per contiguous innermost run.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{StorageError, StorageResult};
use super::header::DatasetHeader;
use super::{DatasetMode, StorageBackend};
use crate::aggregation::merge::for_each_run;
use crate::protocol::DataType;

const HEADER_FILE: &str = "header.json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

struct OpenDataset {
    dir: PathBuf,
    header: DatasetHeader,
    mode: DatasetMode,
    files: HashMap<i32, File>,
}

pub struct DirectoryBackend {
    root: PathBuf,
    handles: HashMap<i32, OpenDataset>,
    next_id: i32,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            handles: HashMap::new(),
            next_id: 1,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding dataset `path` under `root`.
    pub fn dataset_dir(root: &Path, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        root.join(format!("{}.d", relative))
    }

    pub fn read_header(root: &Path, path: &str) -> StorageResult<DatasetHeader> {
        let raw = fs::read(Self::dataset_dir(root, path).join(HEADER_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Raw bytes of a variable's data file.
    pub fn read_variable(root: &Path, path: &str, name: &str) -> StorageResult<Vec<u8>> {
        Ok(fs::read(
            Self::dataset_dir(root, path).join(variable_file_name(name)),
        )?)
    }

    fn open(&mut self, file_id: i32) -> StorageResult<&mut OpenDataset> {
        self.handles
            .get_mut(&file_id)
            .ok_or(StorageError::UnknownDataset(file_id))
    }
}

fn variable_file_name(name: &str) -> String {
    format!("{}.bin", name.replace('/', "_"))
}

/// Replace `header.json` atomically: several servers may publish the same
/// schema concurrently.
fn write_header(dir: &Path, header: &DatasetHeader) -> StorageResult<()> {
    let tmp = dir.join(format!(
        ".{}.{}.{}",
        HEADER_FILE,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp, serde_json::to_vec_pretty(header)?)?;
    fs::rename(&tmp, dir.join(HEADER_FILE))?;
    Ok(())
}

impl StorageBackend for DirectoryBackend {
    fn create_dataset(&mut self, path: &str, _cmode: i32) -> StorageResult<i32> {
        let dir = Self::dataset_dir(&self.root, path);
        fs::create_dir_all(&dir)?;

        let header = match fs::read(dir.join(HEADER_FILE)) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DatasetHeader::default(),
            Err(e) => return Err(e.into()),
        };

        let file_id = self.next_id;
        self.next_id += 1;
        tracing::debug!("dataset {} opened in {}", path, dir.display());
        self.handles.insert(
            file_id,
            OpenDataset {
                dir,
                header,
                mode: DatasetMode::Define,
                files: HashMap::new(),
            },
        );
        Ok(file_id)
    }

    fn define_dimension(&mut self, file_id: i32, name: &str, len: usize) -> StorageResult<i32> {
        let open = self.open(file_id)?;
        open.mode.require_define(file_id)?;
        open.header.define_dimension(name, len)
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
        open.header.define_variable(file_id, name, xtype, dim_ids)
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
        open.header
            .put_attribute(file_id, var_id, name, xtype, values)
    }

    fn end_define(&mut self, file_id: i32) -> StorageResult<()> {
        let open = self.open(file_id)?;
        open.mode.require_define(file_id)?;
        write_header(&open.dir, &open.header)?;

        for (index, var) in open.header.variables.iter().enumerate() {
            let var_id = index as i32;
            let size = open.header.variable_size(file_id, var_id)? as u64;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(open.dir.join(variable_file_name(&var.name)))?;
            if file.metadata()?.len() < size {
                file.set_len(size)?;
            }
            open.files.insert(var_id, file);
        }

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
        let (shape, elem) = open
            .header
            .check_sub_array(file_id, var_id, start, count, data.len())?;
        let file = open
            .files
            .get(&var_id)
            .ok_or(StorageError::UnknownVariable { file_id, var_id })?;

        let origin = vec![0usize; shape.len()];
        let mut result = Ok(());
        for_each_run(start, count, &origin, &shape, |src, dst, len| {
            if result.is_err() {
                return;
            }
            let bytes = &data[src * elem..(src + len) * elem];
            result = file.write_all_at(bytes, (dst * elem) as u64);
        });
        result?;
        Ok(())
    }

    fn close_dataset(&mut self, file_id: i32) -> StorageResult<()> {
        let open = self
            .handles
            .remove(&file_id)
            .ok_or(StorageError::UnknownDataset(file_id))?;
        for file in open.files.values() {
            file.sync_data()?;
        }
        tracing::debug!("dataset in {} closed", open.dir.display());
        Ok(())
    }
}
