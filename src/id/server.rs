//! Server-side id mapping.
//!
//! Clients speak in their own ids. The server maps each client file,
//! dimension and variable to a registry entry that later receives the
//! backend id. Dimensions and variables are defined lazily: they are listed
//! per file in first-reference order and only created in the backend when
//! the file leaves define mode.

use std::collections::HashMap;

use bytes::Bytes;

use crate::aggregation::merge::{box_elements, widen, SubArray};
use crate::error::{IdKind, IofwdError, IofwdResult};
use crate::protocol::DataType;

/// Mode of a mapped dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Defining,
    Writing,
}

/// Something waiting to be defined at end-of-define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingDefinition {
    Dimension(i32),
    Variable(i32),
}

#[derive(Debug)]
pub struct FileEntry {
    pub backend_id: i32,
    pub status: FileStatus,
    pending: Vec<PendingDefinition>,
}

#[derive(Debug)]
pub struct DimensionEntry {
    pub name: String,
    pub declared_len: usize,
    /// Widest extent any mapped variable was declared with along this dimension.
    pub observed_len: usize,
    pub backend_id: Option<i32>,
}

impl DimensionEntry {
    /// Length used when defining the dimension in the backend.
    pub fn define_len(&self) -> usize {
        self.declared_len.max(self.observed_len)
    }
}

#[derive(Debug, Clone)]
pub struct QueuedAttribute {
    pub name: String,
    pub xtype: DataType,
    pub values: Bytes,
}

#[derive(Debug)]
pub struct VariableEntry {
    pub name: String,
    pub xtype: DataType,
    /// Client dimension ids.
    pub dim_ids: Vec<i32>,
    /// Box covering every client's declared sub-array; only ever widens.
    pub bounding_start: Vec<usize>,
    pub bounding_count: Vec<usize>,
    pub backend_id: Option<i32>,
    /// Attributes held back until the variable exists in the backend.
    pub attributes: Vec<QueuedAttribute>,
    /// Latest unmerged write of each client, by index within the server.
    contributions: Vec<Option<SubArray>>,
}

impl VariableEntry {
    pub fn ndims(&self) -> usize {
        self.dim_ids.len()
    }

    pub fn has_contributions(&self) -> bool {
        self.contributions.iter().any(Option::is_some)
    }
}

/// Declaration carried by a define-variable message.
#[derive(Debug, Clone)]
pub struct VariableDeclaration {
    pub name: String,
    pub xtype: DataType,
    pub dim_ids: Vec<i32>,
    pub start: Vec<usize>,
    pub count: Vec<usize>,
}

/// Client id to backend id mapping for one server.
#[derive(Debug)]
pub struct ServerIdRegistry {
    clients_per_server: usize,
    files: HashMap<i32, FileEntry>,
    dims: HashMap<(i32, i32), DimensionEntry>,
    vars: HashMap<(i32, i32), VariableEntry>,
}

impl ServerIdRegistry {
    pub fn new(clients_per_server: usize) -> Self {
        Self {
            clients_per_server,
            files: HashMap::new(),
            dims: HashMap::new(),
            vars: HashMap::new(),
        }
    }

    pub fn is_file_mapped(&self, client_file: i32) -> bool {
        self.files.contains_key(&client_file)
    }

    pub fn map_file(&mut self, client_file: i32, backend_id: i32) {
        tracing::debug!("map file {} -> {}", client_file, backend_id);
        self.files.insert(
            client_file,
            FileEntry {
                backend_id,
                status: FileStatus::Defining,
                pending: Vec::new(),
            },
        );
    }

    pub fn file(&self, client_file: i32) -> IofwdResult<&FileEntry> {
        self.files
            .get(&client_file)
            .ok_or_else(|| IofwdError::unknown(IdKind::File, client_file))
    }

    pub fn file_mut(&mut self, client_file: i32) -> IofwdResult<&mut FileEntry> {
        self.files
            .get_mut(&client_file)
            .ok_or_else(|| IofwdError::unknown(IdKind::File, client_file))
    }

    /// Record a dimension on first sight. Returns false if it was already mapped.
    pub fn map_dim(
        &mut self,
        client_file: i32,
        client_dim: i32,
        name: &str,
        len: usize,
    ) -> IofwdResult<bool> {
        self.file(client_file)?;
        if self.dims.contains_key(&(client_file, client_dim)) {
            return Ok(false);
        }
        self.file_mut(client_file)?
            .pending
            .push(PendingDefinition::Dimension(client_dim));
        self.dims.insert(
            (client_file, client_dim),
            DimensionEntry {
                name: name.to_string(),
                declared_len: len,
                observed_len: 0,
                backend_id: None,
            },
        );
        Ok(true)
    }

    pub fn dimension(&self, client_file: i32, client_dim: i32) -> IofwdResult<&DimensionEntry> {
        self.dims
            .get(&(client_file, client_dim))
            .ok_or_else(|| IofwdError::unknown(IdKind::Dimension, client_dim))
    }

    pub fn dimension_mut(
        &mut self,
        client_file: i32,
        client_dim: i32,
    ) -> IofwdResult<&mut DimensionEntry> {
        self.dims
            .get_mut(&(client_file, client_dim))
            .ok_or_else(|| IofwdError::unknown(IdKind::Dimension, client_dim))
    }

    /// Record a client's variable declaration.
    ///
    /// The first declaration creates the entry; later ones widen its bounding
    /// box. Every referenced dimension's observed length grows to the box's
    /// extent. Returns true if the entry was created.
    pub fn map_var(
        &mut self,
        client_file: i32,
        client_var: i32,
        decl: VariableDeclaration,
    ) -> IofwdResult<bool> {
        self.file(client_file)?;
        if decl.start.len() != decl.dim_ids.len() || decl.count.len() != decl.dim_ids.len() {
            return Err(IofwdError::WrongDimensionality {
                expected: decl.dim_ids.len(),
                actual: decl.start.len().max(decl.count.len()),
            });
        }
        for dim in &decl.dim_ids {
            self.dimension(client_file, *dim)?;
        }

        let created = match self.vars.get_mut(&(client_file, client_var)) {
            Some(entry) => {
                if entry.ndims() != decl.dim_ids.len() {
                    return Err(IofwdError::WrongDimensionality {
                        expected: entry.ndims(),
                        actual: decl.dim_ids.len(),
                    });
                }
                widen(
                    &mut entry.bounding_start,
                    &mut entry.bounding_count,
                    &decl.start,
                    &decl.count,
                )?;
                false
            }
            None => {
                box_elements(&decl.start, &decl.count)?;
                self.vars.insert(
                    (client_file, client_var),
                    VariableEntry {
                        name: decl.name,
                        xtype: decl.xtype,
                        dim_ids: decl.dim_ids,
                        bounding_start: decl.start,
                        bounding_count: decl.count,
                        backend_id: None,
                        attributes: Vec::new(),
                        contributions: vec![None; self.clients_per_server],
                    },
                );
                self.file_mut(client_file)?
                    .pending
                    .push(PendingDefinition::Variable(client_var));
                true
            }
        };

        let entry = self.variable(client_file, client_var)?;
        let extents: Vec<(i32, usize)> = entry
            .dim_ids
            .iter()
            .zip(&entry.bounding_count)
            .map(|(d, c)| (*d, *c))
            .collect();
        for (dim, extent) in extents {
            let dim = self.dimension_mut(client_file, dim)?;
            dim.observed_len = dim.observed_len.max(extent);
        }
        Ok(created)
    }

    pub fn variable(&self, client_file: i32, client_var: i32) -> IofwdResult<&VariableEntry> {
        self.vars
            .get(&(client_file, client_var))
            .ok_or_else(|| IofwdError::unknown(IdKind::Variable, client_var))
    }

    pub fn variable_mut(
        &mut self,
        client_file: i32,
        client_var: i32,
    ) -> IofwdResult<&mut VariableEntry> {
        self.vars
            .get_mut(&(client_file, client_var))
            .ok_or_else(|| IofwdError::unknown(IdKind::Variable, client_var))
    }

    pub fn queue_attribute(
        &mut self,
        client_file: i32,
        client_var: i32,
        attribute: QueuedAttribute,
    ) -> IofwdResult<()> {
        self.variable_mut(client_file, client_var)?
            .attributes
            .push(attribute);
        Ok(())
    }

    /// Store a client's write, replacing any earlier unmerged one.
    pub fn put_contribution(
        &mut self,
        client_file: i32,
        client_var: i32,
        client_index: usize,
        part: SubArray,
    ) -> IofwdResult<()> {
        let entry = self.variable_mut(client_file, client_var)?;
        let slot = entry
            .contributions
            .get_mut(client_index)
            .ok_or_else(|| IofwdError::unknown(IdKind::Client, client_index))?;
        *slot = Some(part);
        Ok(())
    }

    /// Remove and return every stored write for a variable.
    pub fn take_contributions(
        &mut self,
        client_file: i32,
        client_var: i32,
    ) -> IofwdResult<Vec<SubArray>> {
        let entry = self.variable_mut(client_file, client_var)?;
        Ok(entry
            .contributions
            .iter_mut()
            .filter_map(Option::take)
            .collect())
    }

    /// Drain the file's pending definitions in first-reference order.
    pub fn take_pending(&mut self, client_file: i32) -> IofwdResult<Vec<PendingDefinition>> {
        Ok(std::mem::take(&mut self.file_mut(client_file)?.pending))
    }

    /// Forget a file and everything defined in it.
    pub fn remove_file(&mut self, client_file: i32) -> IofwdResult<FileEntry> {
        let entry = self
            .files
            .remove(&client_file)
            .ok_or_else(|| IofwdError::unknown(IdKind::File, client_file))?;
        self.dims.retain(|(file, _), _| *file != client_file);
        self.vars.retain(|(file, _), _| *file != client_file);
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(start: &[usize], count: &[usize]) -> VariableDeclaration {
        VariableDeclaration {
            name: "temp".to_string(),
            xtype: DataType::Float,
            dim_ids: vec![1, 2],
            start: start.to_vec(),
            count: count.to_vec(),
        }
    }

    fn registry_with_dims() -> ServerIdRegistry {
        let mut registry = ServerIdRegistry::new(2);
        registry.map_file(1, 10);
        assert!(registry.map_dim(1, 1, "lat", 4).unwrap());
        assert!(registry.map_dim(1, 2, "lon", 4).unwrap());
        registry
    }

    #[test]
    fn test_dimension_mapped_once() {
        let mut registry = registry_with_dims();
        assert!(!registry.map_dim(1, 1, "lat", 4).unwrap());
        assert_eq!(
            registry.take_pending(1).unwrap(),
            vec![PendingDefinition::Dimension(1), PendingDefinition::Dimension(2)]
        );
        assert!(registry.map_dim(2, 1, "lat", 4).is_err());
    }

    #[test]
    fn test_variable_box_widens() {
        let mut registry = registry_with_dims();
        assert!(registry.map_var(1, 1, decl(&[0, 0], &[2, 4])).unwrap());
        assert!(!registry.map_var(1, 1, decl(&[2, 0], &[2, 4])).unwrap());

        let var = registry.variable(1, 1).unwrap();
        assert_eq!(var.bounding_start, vec![0, 0]);
        assert_eq!(var.bounding_count, vec![4, 4]);
        assert_eq!(registry.dimension(1, 1).unwrap().observed_len, 4);

        let pending = registry.take_pending(1).unwrap();
        assert_eq!(pending.last(), Some(&PendingDefinition::Variable(1)));
        assert_eq!(pending.len(), 3);
    }

    #[test]
    fn test_overflowing_declaration_rejected() {
        let mut registry = registry_with_dims();
        assert!(registry.map_var(1, 1, decl(&[usize::MAX, 0], &[1, 4])).is_err());
        assert!(registry.variable(1, 1).is_err());

        registry.map_var(1, 1, decl(&[0, 0], &[2, 4])).unwrap();
        assert!(matches!(
            registry.map_var(1, 1, decl(&[2, usize::MAX - 1], &[2, 4])),
            Err(IofwdError::UnexpectedMessage(_))
        ));
        let var = registry.variable(1, 1).unwrap();
        assert_eq!(var.bounding_start, vec![0, 0]);
        assert_eq!(var.bounding_count, vec![2, 4]);
    }

    #[test]
    fn test_define_len_prefers_wider() {
        let mut registry = ServerIdRegistry::new(1);
        registry.map_file(1, 1);
        registry.map_dim(1, 1, "x", 2).unwrap();
        registry
            .map_var(
                1,
                1,
                VariableDeclaration {
                    name: "v".into(),
                    xtype: DataType::Int,
                    dim_ids: vec![1],
                    start: vec![0],
                    count: vec![5],
                },
            )
            .unwrap();
        assert_eq!(registry.dimension(1, 1).unwrap().define_len(), 5);
    }

    #[test]
    fn test_variable_with_unknown_dimension() {
        let mut registry = registry_with_dims();
        let mut bad = decl(&[0], &[1]);
        bad.dim_ids = vec![7];
        assert!(matches!(
            registry.map_var(1, 1, bad),
            Err(IofwdError::UnknownIdentifier {
                kind: IdKind::Dimension,
                ..
            })
        ));
        assert!(matches!(
            registry.map_var(1, 1, decl(&[0], &[1, 1])),
            Err(IofwdError::WrongDimensionality { .. })
        ));
    }

    #[test]
    fn test_contributions_replace_and_drain() {
        let mut registry = registry_with_dims();
        registry.map_var(1, 1, decl(&[0, 0], &[1, 1])).unwrap();

        let part = |v: u8| SubArray {
            start: vec![0, 0],
            count: vec![1, 1],
            data: Bytes::from(vec![v; 4]),
        };
        registry.put_contribution(1, 1, 0, part(1)).unwrap();
        registry.put_contribution(1, 1, 0, part(2)).unwrap();
        registry.put_contribution(1, 1, 1, part(3)).unwrap();
        assert!(registry.put_contribution(1, 1, 2, part(4)).is_err());

        let parts = registry.take_contributions(1, 1).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].data[0], 2);
        assert!(!registry.variable(1, 1).unwrap().has_contributions());
    }

    #[test]
    fn test_remove_file_drops_children() {
        let mut registry = registry_with_dims();
        registry.map_var(1, 1, decl(&[0, 0], &[1, 1])).unwrap();
        registry.remove_file(1).unwrap();

        assert!(!registry.is_file_mapped(1));
        assert!(registry.dimension(1, 1).is_err());
        assert!(registry.variable(1, 1).is_err());
    }
}
