//! Compressed index from owned shard rows to the output rows that read them.

use hashbrown::HashMap;
use sparsekit_shard::Key;

use crate::dispatch::OwnedRequest;

/// Output row of some worker that reads a shard row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CsrEntry {
    /// Worker owning the output row.
    pub origin: usize,
    /// Output row on that worker.
    pub row_index: usize,
}

/// One distinct owned key with every request that reads it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CsrRow<'a> {
    /// The key.
    pub key: Key,
    /// Local shard row, or `None` for a key unseen during inference.
    pub local_row: Option<usize>,
    /// Requests reading the row, in arrival order.
    pub entries: &'a [CsrEntry],
}

/// CSR index over the distinct keys of a [`DispatchPlan`](crate::DispatchPlan).
///
/// Rows appear in first-arrival order of their key. A key requested twice by
/// the same output row yields two identical entries, so that row reads the
/// shard row twice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsrIndex {
    keys: Vec<Key>,
    local_rows: Vec<Option<usize>>,
    offsets: Vec<usize>,
    entries: Vec<CsrEntry>,
}

impl CsrIndex {
    /// Number of distinct keys.
    pub fn num_rows(&self) -> usize {
        self.keys.len()
    }

    /// Number of requests covered.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// True if no request is covered.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys whose row could not be resolved.
    pub fn unresolved(&self) -> usize {
        self.local_rows.iter().filter(|r| r.is_none()).count()
    }

    /// Row `i`.
    pub fn row(&self, i: usize) -> Option<CsrRow<'_>> {
        let key = *self.keys.get(i)?;
        Some(CsrRow {
            key,
            local_row: self.local_rows[i],
            entries: &self.entries[self.offsets[i]..self.offsets[i + 1]],
        })
    }

    /// Every row in order.
    pub fn iter(&self) -> impl Iterator<Item = CsrRow<'_>> + '_ {
        (0..self.num_rows()).filter_map(move |i| self.row(i))
    }
}

/// Groups owned requests by key into a [`CsrIndex`].
pub struct IndexConverter;

impl IndexConverter {
    /// Builds the index, resolving each distinct key to its local row once.
    pub fn convert<F>(owned: &[OwnedRequest], mut resolve: F) -> CsrIndex
    where
        F: FnMut(Key) -> Option<usize>,
    {
        let mut slot_of: HashMap<Key, usize> = HashMap::new();
        let mut keys = Vec::new();
        let mut buckets: Vec<Vec<CsrEntry>> = Vec::new();

        for request in owned {
            let slot = *slot_of.entry(request.key).or_insert_with(|| {
                keys.push(request.key);
                buckets.push(Vec::new());
                keys.len() - 1
            });
            buckets[slot].push(CsrEntry {
                origin: request.origin,
                row_index: request.row_index,
            });
        }

        let local_rows = keys.iter().map(|&key| resolve(key)).collect();
        let mut offsets = Vec::with_capacity(keys.len() + 1);
        let mut entries = Vec::with_capacity(owned.len());
        offsets.push(0);
        for bucket in buckets {
            entries.extend(bucket);
            offsets.push(entries.len());
        }

        CsrIndex {
            keys,
            local_rows,
            offsets,
            entries,
        }
    }
}
