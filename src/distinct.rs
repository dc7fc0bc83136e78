//! Per-bin tracking of "how many unique W-byte values have been observed for this distinct
//! field in this bin".
//!
//! [`DistinctSet`] starts in small mode (an inline, unsorted array) and promotes itself to a
//! hash set once it grows past [`SMALL_MAX`] members. This mirrors the host project's
//! small-vs-heap representations for per-event metadata that is usually tiny but occasionally
//! isn't (e.g. `smallvec::SmallVec`'s own inline-to-heap promotion).

use std::collections::HashSet;
use std::hash::BuildHasherDefault;

use seahash::SeaHasher;
use smallvec::SmallVec;

/// Capacity, in members, of a [`DistinctSet`] before it promotes to hash-set mode.
pub const SMALL_MAX: usize = 16;

type Member = Box<[u8]>;
type LargeSet = HashSet<Member, BuildHasherDefault<SeaHasher>>;

/// Tracks the set of distinct values seen for one field within one bin.
#[derive(Debug, Clone)]
pub enum DistinctSet {
    Small(SmallVec<[Member; SMALL_MAX]>),
    Large(LargeSet),
}

impl DistinctSet {
    pub fn new() -> Self {
        DistinctSet::Small(SmallVec::new())
    }

    /// Inserts `value`, returning `true` if it was not already present. Promotes from small to
    /// large mode if the insert would grow the set past [`SMALL_MAX`].
    pub fn insert(&mut self, value: &[u8]) -> bool {
        match self {
            DistinctSet::Small(members) => {
                if members.iter().any(|m| m.as_ref() == value) {
                    return false;
                }
                if members.len() < SMALL_MAX {
                    members.push(value.to_vec().into_boxed_slice());
                    return true;
                }
                tracing::trace!(at = members.len(), "distinct set promoting from small to large mode");
                let mut large: LargeSet = HashSet::with_capacity_and_hasher(
                    members.len() + 1,
                    BuildHasherDefault::default(),
                );
                for member in members.drain(..) {
                    large.insert(member);
                }
                let inserted = large.insert(value.to_vec().into_boxed_slice());
                *self = DistinctSet::Large(large);
                inserted
            }
            DistinctSet::Large(members) => members.insert(value.to_vec().into_boxed_slice()),
        }
    }

    /// Number of distinct members currently tracked.
    pub fn len(&self) -> usize {
        match self {
            DistinctSet::Small(members) => members.len(),
            DistinctSet::Large(members) => members.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extracts the members into a vector sorted ascending by raw bytes.
    ///
    /// Runs persist distinct sets in sorted order so that the final merge can union two runs'
    /// sequences with a linear two-pointer pass (see [`union_sorted`]).
    pub fn into_sorted(self) -> Vec<Member> {
        let mut members: Vec<Member> = match self {
            DistinctSet::Small(members) => members.into_vec(),
            DistinctSet::Large(members) => members.into_iter().collect(),
        };
        members.sort_unstable();
        members
    }

    /// Approximate heap footprint, in bytes, of this set's members.
    pub fn byte_size(&self) -> usize {
        match self {
            DistinctSet::Small(members) => members.iter().map(|m| m.len()).sum(),
            DistinctSet::Large(members) => members.iter().map(|m| m.len() + 8).sum(),
        }
    }
}

impl Default for DistinctSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges two ascending, deduplicated sequences of raw member bytes into one ascending,
/// deduplicated sequence, in time linear in their combined length.
pub fn union_sorted(a: &[Box<[u8]>], b: &[Box<[u8]>]) -> Vec<Box<[u8]>> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}
