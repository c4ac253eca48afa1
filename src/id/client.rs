//! Client-side id assignment.
//!
//! Every client assigns ids independently, but because clients run the same
//! program they hand out identical ids for identical call sequences. Servers
//! rely on this to match contributions from different clients.

use std::collections::HashMap;

use crate::error::{IdKind, IofwdError, IofwdResult};

#[derive(Debug, Default)]
struct FileNames {
    dims: HashMap<String, i32>,
    vars: HashMap<String, i32>,
}

impl FileNames {
    fn assign(names: &mut HashMap<String, i32>, name: &str) -> i32 {
        let next = names.len() as i32 + 1;
        *names.entry(name.to_string()).or_insert(next)
    }
}

/// Name to id tables for the datasets a client has open.
#[derive(Debug)]
pub struct ClientIdRegistry {
    opened: i32,
    files: HashMap<i32, FileNames>,
}

impl Default for ClientIdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientIdRegistry {
    pub fn new() -> Self {
        Self {
            opened: 0,
            files: HashMap::new(),
        }
    }

    /// Allocate the id for a newly created dataset. Ids start at 1 and are
    /// never reused within a session.
    pub fn assign_file(&mut self) -> i32 {
        self.opened += 1;
        self.files.insert(self.opened, FileNames::default());
        tracing::trace!(file_id = self.opened, "assigned file id");
        self.opened
    }

    fn names_mut(&mut self, file_id: i32) -> IofwdResult<&mut FileNames> {
        self.files
            .get_mut(&file_id)
            .ok_or_else(|| IofwdError::unknown(IdKind::File, file_id))
    }

    /// Id of the dimension `name` in `file_id`, assigning the next free one
    /// on first use.
    pub fn assign_dim(&mut self, file_id: i32, name: &str) -> IofwdResult<i32> {
        let names = self.names_mut(file_id)?;
        Ok(FileNames::assign(&mut names.dims, name))
    }

    pub fn assign_var(&mut self, file_id: i32, name: &str) -> IofwdResult<i32> {
        let names = self.names_mut(file_id)?;
        Ok(FileNames::assign(&mut names.vars, name))
    }

    /// Id previously assigned to variable `name`.
    pub fn inq_varid(&self, file_id: i32, name: &str) -> IofwdResult<i32> {
        self.files
            .get(&file_id)
            .ok_or_else(|| IofwdError::unknown(IdKind::File, file_id))?
            .vars
            .get(name)
            .copied()
            .ok_or_else(|| IofwdError::unknown(IdKind::Variable, name))
    }

    pub fn contains_file(&self, file_id: i32) -> bool {
        self.files.contains_key(&file_id)
    }

    pub fn remove_file(&mut self, file_id: i32) -> IofwdResult<()> {
        self.files
            .remove(&file_id)
            .map(|_| ())
            .ok_or_else(|| IofwdError::unknown(IdKind::File, file_id))
    }
}
