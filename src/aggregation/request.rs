//! Pending collective requests and their completion bitmaps.

use std::collections::HashMap;

use crate::error::{IdKind, IofwdError, IofwdResult};
use crate::protocol::OpCode;

/// Identity of a collective request: the same call from every client of a
/// server maps to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub opcode: OpCode,
    pub file_id: i32,
    pub dim_id: i32,
    pub var_id: i32,
}

impl RequestKey {
    pub fn new(opcode: OpCode, file_id: i32, dim_id: i32, var_id: i32) -> Self {
        Self {
            opcode,
            file_id,
            dim_id,
            var_id,
        }
    }

    pub fn file(opcode: OpCode, file_id: i32) -> Self {
        Self::new(opcode, file_id, 0, 0)
    }

    pub fn variable(opcode: OpCode, file_id: i32, var_id: i32) -> Self {
        Self::new(opcode, file_id, 0, var_id)
    }

    /// Key with no file, used for per-stream bookkeeping.
    pub fn stream(opcode: OpCode) -> Self {
        Self::new(opcode, 0, 0, 0)
    }
}

/// One bit per client of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionBitmap {
    words: Vec<u64>,
    len: usize,
    set: usize,
}

impl CompletionBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            set: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Set bit `index`. Setting an already set bit changes nothing.
    /// Returns whether the bit was newly set.
    pub fn insert(&mut self, index: usize) -> bool {
        assert!(index < self.len, "bit {} out of {}", index, self.len);
        let mask = 1u64 << (index % 64);
        let word = &mut self.words[index / 64];
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.set += 1;
        true
    }

    pub fn count(&self) -> usize {
        self.set
    }

    pub fn is_full(&self) -> bool {
        self.set == self.len
    }
}

#[derive(Debug, Clone)]
pub struct PendingIoRequest {
    pub key: RequestKey,
    pub bitmap: CompletionBitmap,
}

/// Requests waiting for the rest of the server's clients.
#[derive(Debug)]
pub struct RequestTable {
    clients: usize,
    pending: HashMap<RequestKey, PendingIoRequest>,
}

impl RequestTable {
    pub fn new(clients: usize) -> Self {
        Self {
            clients,
            pending: HashMap::new(),
        }
    }

    /// Mark `client_index` as having contributed to `key`, creating the
    /// request on first contribution. Returns whether every client has now
    /// contributed.
    ///
    /// The caller performs the collective action and then calls
    /// [`RequestTable::remove`].
    pub fn record_contribution(&mut self, client_index: usize, key: RequestKey) -> IofwdResult<bool> {
        if client_index >= self.clients {
            return Err(IofwdError::unknown(IdKind::Client, client_index));
        }
        let clients = self.clients;
        let request = self.pending.entry(key).or_insert_with(|| PendingIoRequest {
            key,
            bitmap: CompletionBitmap::new(clients),
        });
        if !request.bitmap.insert(client_index) {
            tracing::warn!(
                "client {} contributed twice to {:?}",
                client_index,
                key
            );
        }
        Ok(request.bitmap.is_full())
    }

    pub fn remove(&mut self, key: &RequestKey) -> Option<PendingIoRequest> {
        self.pending.remove(key)
    }

    pub fn get(&self, key: &RequestKey) -> Option<&PendingIoRequest> {
        self.pending.get(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every request touching `file_id`.
    pub fn remove_file(&mut self, file_id: i32) {
        self.pending.retain(|key, _| key.file_id != file_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_basics() {
        let mut bitmap = CompletionBitmap::new(70);
        assert!(bitmap.insert(0));
        assert!(bitmap.insert(69));
        assert!(!bitmap.insert(69));
        assert!(bitmap.contains(69));
        assert!(!bitmap.contains(68));
        assert_eq!(bitmap.count(), 2);
        assert!(!bitmap.is_full());
    }

    #[test]
    fn test_repeated_contribution_does_not_complete() {
        let mut table = RequestTable::new(4);
        let key = RequestKey::variable(OpCode::PutVara, 1, 3);

        assert!(!table.record_contribution(2, key).unwrap());
        assert!(!table.record_contribution(2, key).unwrap());
        assert_eq!(table.get(&key).unwrap().bitmap.count(), 1);

        assert!(!table.record_contribution(0, key).unwrap());
        assert!(!table.record_contribution(3, key).unwrap());
        assert!(table.record_contribution(1, key).unwrap());

        assert!(table.remove(&key).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_keys_are_independent() {
        let mut table = RequestTable::new(2);
        let a = RequestKey::file(OpCode::EndDef, 1);
        let b = RequestKey::file(OpCode::EndDef, 2);

        table.record_contribution(0, a).unwrap();
        assert!(!table.record_contribution(1, b).unwrap());
        assert!(table.record_contribution(1, a).unwrap());
        assert_eq!(table.len(), 2);

        table.remove_file(2);
        assert!(table.get(&b).is_none());
    }

    #[test]
    fn test_client_out_of_range() {
        let mut table = RequestTable::new(2);
        assert!(table
            .record_contribution(2, RequestKey::stream(OpCode::ReaderFinal))
            .is_err());
    }
}
