//! A streaming group-by / aggregation engine for flow-style records.
//!
//! The engine is built around a field-list abstraction ([`field::FieldList`]) that describes a
//! composite, fixed-width binary layout over an opaque record type `R: field::FlowRecord`, with
//! per-field extraction, comparison, and merge behavior. Two top-level aggregators build on top
//! of it:
//!
//! - [`unsorted::UnsortedEngine`] ingests records in any order, aggregating into an in-memory
//!   hash table that spills sorted runs to disk once it grows past a configured budget, then
//!   produces output by draining directly or k-way merging the spilled runs.
//! - [`presorted::PresortedEngine`] streams N already-sorted inputs through a k-way merge,
//!   holding only a single open bin in memory at a time.
//!
//! Neither aggregator inspects a record's fields directly — both only call through
//! [`field::FieldList`], so the same key/value/distinct field configuration can drive either
//! engine over the same record type.

pub mod buffer;
pub mod distinct;
pub mod error;
pub mod field;
pub mod hash_table;
pub mod merge;
pub mod presorted;
pub mod run;
pub mod temp;
pub mod unsorted;

pub use error::{AggregateError, Phase, PhaseError, Result};
pub use field::{CustomField, FieldError, FieldHandle, FieldKind, FieldList, FlowRecord};
pub use presorted::{PresortedEngine, RecordCodec};
pub use unsorted::{OutputRecord, UnsortedEngine};
