//! Dataset schema shared by all backends.
//!
//! Dimension and variable ids are positions in the respective lists,
//! assigned in definition order starting at 0.

use serde::{Deserialize, Serialize};

use super::error::{StorageError, StorageResult};
use crate::protocol::{DataType, GLOBAL_VAR_ID};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub xtype: DataType,
    pub values: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub xtype: DataType,
    pub dim_ids: Vec<i32>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHeader {
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl DatasetHeader {
    /// Define a dimension, or return the existing id when an identical one
    /// was already defined by another writer of the same dataset.
    pub fn define_dimension(&mut self, name: &str, len: usize) -> StorageResult<i32> {
        if let Some((id, existing)) = self
            .dimensions
            .iter()
            .enumerate()
            .find(|(_, d)| d.name == name)
        {
            if existing.len != len {
                return Err(StorageError::Backend(format!(
                    "dimension {} already defined with length {}, not {}",
                    name, existing.len, len
                )));
            }
            return Ok(id as i32);
        }

        self.dimensions.push(Dimension {
            name: name.to_string(),
            len,
        });
        Ok(self.dimensions.len() as i32 - 1)
    }

    pub fn define_variable(
        &mut self,
        file_id: i32,
        name: &str,
        xtype: DataType,
        dim_ids: &[i32],
    ) -> StorageResult<i32> {
        for dim_id in dim_ids {
            self.dimension(file_id, *dim_id)?;
        }

        if let Some((id, existing)) = self
            .variables
            .iter()
            .enumerate()
            .find(|(_, v)| v.name == name)
        {
            if existing.xtype != xtype || existing.dim_ids != dim_ids {
                return Err(StorageError::Backend(format!(
                    "variable {} already defined with a different type or shape",
                    name
                )));
            }
            return Ok(id as i32);
        }

        self.variables.push(Variable {
            name: name.to_string(),
            xtype,
            dim_ids: dim_ids.to_vec(),
            attributes: Vec::new(),
        });
        Ok(self.variables.len() as i32 - 1)
    }

    /// Set an attribute on a variable or, for [`GLOBAL_VAR_ID`], on the
    /// dataset. An attribute of the same name is replaced.
    pub fn put_attribute(
        &mut self,
        file_id: i32,
        var_id: i32,
        name: &str,
        xtype: DataType,
        values: &[u8],
    ) -> StorageResult<()> {
        let attributes = if var_id == GLOBAL_VAR_ID {
            &mut self.attributes
        } else {
            let index = self.variable_index(file_id, var_id)?;
            &mut self.variables[index].attributes
        };

        let attribute = Attribute {
            name: name.to_string(),
            xtype,
            values: values.to_vec(),
        };
        match attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => *existing = attribute,
            None => attributes.push(attribute),
        }
        Ok(())
    }

    fn dimension(&self, file_id: i32, dim_id: i32) -> StorageResult<&Dimension> {
        usize::try_from(dim_id)
            .ok()
            .and_then(|i| self.dimensions.get(i))
            .ok_or(StorageError::UnknownDimension { file_id, dim_id })
    }

    fn variable_index(&self, file_id: i32, var_id: i32) -> StorageResult<usize> {
        usize::try_from(var_id)
            .ok()
            .filter(|i| *i < self.variables.len())
            .ok_or(StorageError::UnknownVariable { file_id, var_id })
    }

    pub fn variable(&self, file_id: i32, var_id: i32) -> StorageResult<&Variable> {
        Ok(&self.variables[self.variable_index(file_id, var_id)?])
    }

    pub fn variable_by_name(&self, name: &str) -> Option<(i32, &Variable)> {
        self.variables
            .iter()
            .enumerate()
            .find(|(_, v)| v.name == name)
            .map(|(i, v)| (i as i32, v))
    }

    /// Extent of each dimension of a variable.
    pub fn shape(&self, file_id: i32, var_id: i32) -> StorageResult<Vec<usize>> {
        self.variable(file_id, var_id)?
            .dim_ids
            .iter()
            .map(|d| self.dimension(file_id, *d).map(|dim| dim.len))
            .collect()
    }

    /// Size in bytes of a variable's dense data.
    pub fn variable_size(&self, file_id: i32, var_id: i32) -> StorageResult<usize> {
        let elem = self.variable(file_id, var_id)?.xtype.size();
        byte_len(&self.shape(file_id, var_id)?, elem)
    }

    /// Validate a sub-array write and return the variable's shape and
    /// element size.
    pub fn check_sub_array(
        &self,
        file_id: i32,
        var_id: i32,
        start: &[usize],
        count: &[usize],
        data_len: usize,
    ) -> StorageResult<(Vec<usize>, usize)> {
        let shape = self.shape(file_id, var_id)?;
        let elem = self.variable(file_id, var_id)?.xtype.size();

        if start.len() != shape.len() || count.len() != shape.len() {
            return Err(StorageError::OutOfBounds(format!(
                "{}-d box for {}-d variable {}",
                start.len(),
                shape.len(),
                var_id
            )));
        }
        for (i, extent) in shape.iter().enumerate() {
            if start[i].checked_add(count[i]).map_or(true, |end| end > *extent) {
                return Err(StorageError::OutOfBounds(format!(
                    "dimension {}: {}+{} exceeds {}",
                    i, start[i], count[i], extent
                )));
            }
        }
        let expected = byte_len(count, elem)?;
        if data_len != expected {
            return Err(StorageError::OutOfBounds(format!(
                "{} data bytes for a box of {} bytes",
                data_len, expected
            )));
        }
        Ok((shape, elem))
    }
}

fn byte_len(count: &[usize], elem: usize) -> StorageResult<usize> {
    count
        .iter()
        .try_fold(elem, |acc, c| acc.checked_mul(*c))
        .ok_or_else(|| StorageError::OutOfBounds(format!("box {:?} overflows", count)))
}
