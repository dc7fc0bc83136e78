//! The in-memory bin table: key → (accumulated value, per-field distinct sets).
//!
//! Backed by [`indexmap::IndexMap`] with a [`seahash`] hasher rather than a hand-rolled
//! open-addressed table: `IndexMap` already gives us the dense, insertion-ordered storage the
//! engine needs for [`HashAggregator::drain_insertion`], plus in-place reordering for
//! [`HashAggregator::drain_sorted`], so there's nothing a bespoke probing table would buy us.

use std::hash::BuildHasherDefault;

use indexmap::IndexMap;
use seahash::SeaHasher;

use crate::buffer::{KeyBuffer, ValueBuffer};
use crate::distinct::DistinctSet;
use crate::field::FieldList;

/// A bin's accumulated state: the value buffer and one [`DistinctSet`] per distinct field.
#[derive(Debug, Clone)]
pub struct Bin {
    pub value: ValueBuffer,
    pub distincts: Vec<DistinctSet>,
}

impl Bin {
    fn new(value_width: usize, num_distinct: usize) -> Self {
        Self {
            value: ValueBuffer::zeroed(value_width),
            distincts: (0..num_distinct).map(|_| DistinctSet::new()).collect(),
        }
    }

    fn byte_size(&self, key_width: usize) -> usize {
        key_width + self.value.len() + self.distincts.iter().map(DistinctSet::byte_size).sum::<usize>()
    }
}

type Table = IndexMap<KeyBuffer, Bin, BuildHasherDefault<SeaHasher>>;

/// Per-entry overhead assumed by [`HashAggregator::memory_estimate`], approximating the
/// bookkeeping `IndexMap` keeps alongside each stored key/value pair.
const ENTRY_OVERHEAD_BYTES: usize = 48;

/// An in-memory hash table of key → bin, with a running byte estimate used to decide when to
/// spill.
pub struct HashAggregator {
    table: Table,
    key_width: usize,
    value_width: usize,
    num_distinct: usize,
    bytes_estimate: usize,
}

impl HashAggregator {
    pub fn new(key_width: usize, value_width: usize, num_distinct: usize) -> Self {
        Self {
            table: Table::default(),
            key_width,
            value_width,
            num_distinct,
            bytes_estimate: 0,
        }
    }

    /// Returns the existing bin for `key_bytes`, or creates and returns a freshly initialized
    /// one (value slots filled from `values.initialize`; distinct sets start empty).
    pub fn upsert<R>(&mut self, key_bytes: &[u8], values: &FieldList<R>) -> &mut Bin
    where
        R: crate::field::FlowRecord + 'static,
    {
        use indexmap::map::Entry;

        match self.table.entry(KeyBuffer::from_bytes(key_bytes)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut bin = Bin::new(self.value_width, self.num_distinct);
                values.initialize(bin.value.as_mut_bytes());
                self.bytes_estimate += bin.byte_size(self.key_width) + ENTRY_OVERHEAD_BYTES;
                entry.insert(bin)
            }
        }
    }

    /// Call after mutating a bin already present in the table (accumulating a value or
    /// inserting into a distinct set), so the running byte estimate stays accurate.
    pub fn note_growth(&mut self, additional_bytes: usize) {
        self.bytes_estimate += additional_bytes;
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Rough byte footprint of everything currently held in memory.
    pub fn memory_estimate(&self) -> usize {
        self.bytes_estimate
    }

    /// Drains the table, yielding `(key, bin)` pairs in ascending order under `keys.compare`.
    pub fn drain_sorted<R>(mut self, keys: &FieldList<R>) -> Vec<(KeyBuffer, Bin)>
    where
        R: crate::field::FlowRecord + 'static,
    {
        self.table.sort_by(|a, _, b, _| keys.compare(a.as_bytes(), b.as_bytes()));
        self.table.into_iter().collect()
    }

    /// Drains the table, yielding `(key, bin)` pairs in insertion order.
    pub fn drain_insertion(self) -> Vec<(KeyBuffer, Bin)> {
        self.table.into_iter().collect()
    }
}
