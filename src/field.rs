//! The field-list abstraction: a description of a composite binary key/value layout over
//! records, with per-field callbacks for extraction, comparison, initialization, and merging.
//!
//! A [`FieldList`] never inspects a record's concrete layout directly — it only calls back
//! into either a built-in [`FieldKind`] dispatch (which goes through the caller-implemented
//! [`FlowRecord`] trait) or a caller-supplied [`CustomField`] closure set. This mirrors how the
//! rest of the engine treats `Record` as opaque (see the crate-level docs).

use std::cmp::Ordering;

use snafu::Snafu;

/// Maximum total width, in bytes, of a key buffer produced by a single [`FieldList`].
pub const KEY_MAX: usize = 256;

/// Maximum total width, in bytes, of a value buffer produced by a single [`FieldList`].
pub const VALUE_MAX: usize = 256;

/// Errors raised while building or validating a [`FieldList`].
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum FieldError {
    #[snafu(display("field list width {width} exceeds the {limit}-byte limit"))]
    WidthExceeded { width: usize, limit: usize },

    #[snafu(display("distinct field {kind:?} also appears in the key field list"))]
    KeyDistinctOverlap { kind: FieldKind },

    #[snafu(display("an aggregator needs at least one value field or one distinct field"))]
    NoOutputFields,
}

/// Tags used to select a built-in extraction/comparison/merge default.
///
/// `Custom(id)` is the escape hatch for caller-defined fields that have no canned behavior;
/// its `id` only needs to be unique within one `FieldList` and is used for diagnostics and for
/// the key/distinct disjointness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    SrcAddrV4,
    DstAddrV4,
    SrcAddrV6,
    DstAddrV6,
    SrcPort,
    DstPort,
    Protocol,
    Packets,
    Bytes,
    Flags,
    InputInterface,
    OutputInterface,
    StartTime,
    EndTime,
    SumPackets,
    SumBytes,
    SumRecords,
    SumElapsed,
    MinStartTime,
    MaxEndTime,
    Custom(u32),
}

impl FieldKind {
    fn width(self) -> usize {
        match self {
            FieldKind::SrcAddrV4 | FieldKind::DstAddrV4 => 4,
            FieldKind::SrcAddrV6 | FieldKind::DstAddrV6 => 16,
            FieldKind::SrcPort | FieldKind::DstPort => 2,
            FieldKind::Protocol | FieldKind::Flags => 1,
            FieldKind::InputInterface | FieldKind::OutputInterface => 4,
            FieldKind::StartTime | FieldKind::EndTime => 8,
            FieldKind::Packets | FieldKind::Bytes => 8,
            FieldKind::SumPackets
            | FieldKind::SumBytes
            | FieldKind::SumRecords
            | FieldKind::SumElapsed
            | FieldKind::MinStartTime
            | FieldKind::MaxEndTime => 8,
            FieldKind::Custom(_) => 0,
        }
    }

    /// Whether this kind's default compare treats its bytes as a native-endian unsigned
    /// integer (`true`) versus a raw, opaque byte sequence such as an address (`false`).
    fn is_numeric(self) -> bool {
        !matches!(self, FieldKind::SrcAddrV4 | FieldKind::DstAddrV4 | FieldKind::SrcAddrV6 | FieldKind::DstAddrV6)
    }
}

/// A record type that can supply the values for every built-in [`FieldKind`].
///
/// Methods default to returning a zeroed value so implementors only override the accessors
/// relevant to the flow shape they represent; an engine configured only with, say, v4 address
/// and port fields never calls the v6 accessors.
pub trait FlowRecord {
    fn src_addr_v4(&self) -> [u8; 4] {
        [0; 4]
    }
    fn dst_addr_v4(&self) -> [u8; 4] {
        [0; 4]
    }
    fn src_addr_v6(&self) -> [u8; 16] {
        [0; 16]
    }
    fn dst_addr_v6(&self) -> [u8; 16] {
        [0; 16]
    }
    fn src_port(&self) -> u16 {
        0
    }
    fn dst_port(&self) -> u16 {
        0
    }
    fn protocol(&self) -> u8 {
        0
    }
    fn packets(&self) -> u64 {
        0
    }
    fn bytes(&self) -> u64 {
        0
    }
    fn tcp_flags(&self) -> u8 {
        0
    }
    fn input_interface(&self) -> u32 {
        0
    }
    fn output_interface(&self) -> u32 {
        0
    }
    fn start_time_ms(&self) -> u64 {
        0
    }
    fn end_time_ms(&self) -> u64 {
        0
    }
}

/// Per-field extract/compare/merge behavior, dispatched per-field rather than per-record.
trait FieldOps<R>: Send + Sync {
    fn extract(&self, record: &R, out: &mut [u8]);
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
    fn merge(&self, acc: &mut [u8], incoming: &[u8]);
}

struct KnownFieldOps {
    kind: FieldKind,
}

impl<R: FlowRecord> FieldOps<R> for KnownFieldOps {
    fn extract(&self, record: &R, out: &mut [u8]) {
        match self.kind {
            FieldKind::SrcAddrV4 => out.copy_from_slice(&record.src_addr_v4()),
            FieldKind::DstAddrV4 => out.copy_from_slice(&record.dst_addr_v4()),
            FieldKind::SrcAddrV6 => out.copy_from_slice(&record.src_addr_v6()),
            FieldKind::DstAddrV6 => out.copy_from_slice(&record.dst_addr_v6()),
            FieldKind::SrcPort => out.copy_from_slice(&record.src_port().to_ne_bytes()),
            FieldKind::DstPort => out.copy_from_slice(&record.dst_port().to_ne_bytes()),
            FieldKind::Protocol => out.copy_from_slice(&record.protocol().to_ne_bytes()),
            FieldKind::Flags => out.copy_from_slice(&record.tcp_flags().to_ne_bytes()),
            FieldKind::Packets => out.copy_from_slice(&record.packets().to_ne_bytes()),
            FieldKind::Bytes => out.copy_from_slice(&record.bytes().to_ne_bytes()),
            FieldKind::InputInterface => out.copy_from_slice(&record.input_interface().to_ne_bytes()),
            FieldKind::OutputInterface => out.copy_from_slice(&record.output_interface().to_ne_bytes()),
            FieldKind::StartTime => out.copy_from_slice(&record.start_time_ms().to_ne_bytes()),
            FieldKind::EndTime => out.copy_from_slice(&record.end_time_ms().to_ne_bytes()),
            FieldKind::SumPackets => out.copy_from_slice(&record.packets().to_ne_bytes()),
            FieldKind::SumBytes => out.copy_from_slice(&record.bytes().to_ne_bytes()),
            FieldKind::SumRecords => out.copy_from_slice(&1u64.to_ne_bytes()),
            FieldKind::SumElapsed => {
                let elapsed = record.end_time_ms().saturating_sub(record.start_time_ms());
                out.copy_from_slice(&elapsed.to_ne_bytes());
            }
            FieldKind::MinStartTime => out.copy_from_slice(&record.start_time_ms().to_ne_bytes()),
            FieldKind::MaxEndTime => out.copy_from_slice(&record.end_time_ms().to_ne_bytes()),
            FieldKind::Custom(_) => unreachable!("custom kinds use CustomFieldOps"),
        }
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        if self.kind.is_numeric() {
            compare_numeric(a, b)
        } else {
            a.cmp(b)
        }
    }

    fn merge(&self, acc: &mut [u8], incoming: &[u8]) {
        match self.kind {
            FieldKind::SumPackets
            | FieldKind::SumBytes
            | FieldKind::SumRecords
            | FieldKind::SumElapsed => merge_saturating_sum(acc, incoming),
            FieldKind::MinStartTime => merge_min(acc, incoming),
            FieldKind::MaxEndTime => merge_max(acc, incoming),
            _ => acc.copy_from_slice(incoming),
        }
    }
}

/// Caller-supplied extract/compare/merge closures for a field with no built-in default.
pub struct CustomField<R> {
    pub width: usize,
    pub initial: Vec<u8>,
    pub extract: Box<dyn Fn(&R, &mut [u8]) + Send + Sync>,
    pub compare: Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>,
    pub merge: Box<dyn Fn(&mut [u8], &[u8]) + Send + Sync>,
}

struct CustomFieldOps<R> {
    extract: Box<dyn Fn(&R, &mut [u8]) + Send + Sync>,
    compare: Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>,
    merge: Box<dyn Fn(&mut [u8], &[u8]) + Send + Sync>,
}

impl<R> FieldOps<R> for CustomFieldOps<R>
where
    R: Send + Sync,
{
    fn extract(&self, record: &R, out: &mut [u8]) {
        (self.extract)(record, out);
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare)(a, b)
    }

    fn merge(&self, acc: &mut [u8], incoming: &[u8]) {
        (self.merge)(acc, incoming);
    }
}

fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert_eq!(a.len(), b.len());
    read_u64(a).cmp(&read_u64(b))
}

fn merge_saturating_sum(acc: &mut [u8], incoming: &[u8]) {
    let a = read_u64(acc);
    let b = read_u64(incoming);
    write_u64(acc, a.saturating_add(b));
}

fn merge_min(acc: &mut [u8], incoming: &[u8]) {
    if read_u64(incoming) < read_u64(acc) {
        acc.copy_from_slice(incoming);
    }
}

fn merge_max(acc: &mut [u8], incoming: &[u8]) {
    if read_u64(incoming) > read_u64(acc) {
        acc.copy_from_slice(incoming);
    }
}

// A field narrower than 8 bytes is zero-extended into a `u64` before arithmetic or comparison.
// Which end gets the real bytes depends on host endianness: on little-endian, the low-order
// byte is first in memory, so the real bytes go at the low offset and the high bytes are zero;
// on big-endian it's the reverse. Getting this backwards on a big-endian host would silently
// multiply every narrower-than-8-byte numeric field by `256^(8 - width)`.

#[cfg(target_endian = "little")]
fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_ne_bytes(buf)
}

#[cfg(target_endian = "big")]
fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    u64::from_ne_bytes(buf)
}

#[cfg(target_endian = "little")]
fn write_u64(out: &mut [u8], value: u64) {
    out.copy_from_slice(&value.to_ne_bytes()[..out.len()]);
}

#[cfg(target_endian = "big")]
fn write_u64(out: &mut [u8], value: u64) {
    let bytes = value.to_ne_bytes();
    out.copy_from_slice(&bytes[8 - out.len()..]);
}

/// A handle to a field previously added to a [`FieldList`], used with
/// [`FieldList::extract_field`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHandle {
    offset: usize,
    width: usize,
}

impl FieldHandle {
    pub(crate) fn width(self) -> usize {
        self.width
    }
}

struct FieldEntry<R> {
    kind: FieldKind,
    width: usize,
    offset: usize,
    initial: Vec<u8>,
    ops: Box<dyn FieldOps<R>>,
}

/// An ordered sequence of field descriptors with a precomputed total byte width.
///
/// One `FieldList` is built for each of the engine's three roles — key fields, value fields,
/// and distinct fields — and is never mutated once an engine has started ingesting records.
pub struct FieldList<R> {
    fields: Vec<FieldEntry<R>>,
    total_width: usize,
    limit: usize,
}

impl<R: FlowRecord + 'static> FieldList<R> {
    /// Creates an empty field list whose total width must stay within `limit` bytes.
    ///
    /// Use [`FieldList::keys`] or [`FieldList::values`] rather than calling this directly.
    fn with_limit(limit: usize) -> Self {
        Self {
            fields: Vec::new(),
            total_width: 0,
            limit,
        }
    }

    /// Creates a field list sized for use as a key or distinct list ([`KEY_MAX`] bytes).
    pub fn keys() -> Self {
        Self::with_limit(KEY_MAX)
    }

    /// Creates a field list sized for use as a value list ([`VALUE_MAX`] bytes).
    pub fn values() -> Self {
        Self::with_limit(VALUE_MAX)
    }

    /// Installs a preregistered field descriptor for `kind`.
    pub fn add_known(&mut self, kind: FieldKind) -> Result<FieldHandle, FieldError> {
        let width = kind.width();
        self.push(kind, width, vec![0u8; width], Box::new(KnownFieldOps { kind }))
    }

    /// Installs a caller-supplied field descriptor.
    pub fn add_custom(&mut self, id: u32, field: CustomField<R>) -> Result<FieldHandle, FieldError> {
        let width = field.width;
        let initial = if field.initial.is_empty() {
            vec![0u8; width]
        } else {
            field.initial
        };
        self.push(
            FieldKind::Custom(id),
            width,
            initial,
            Box::new(CustomFieldOps {
                extract: field.extract,
                compare: field.compare,
                merge: field.merge,
            }),
        )
    }

    fn push(
        &mut self,
        kind: FieldKind,
        width: usize,
        initial: Vec<u8>,
        ops: Box<dyn FieldOps<R>>,
    ) -> Result<FieldHandle, FieldError> {
        let offset = self.total_width;
        let new_width = self.total_width + width;
        if new_width > self.limit {
            return Err(FieldError::WidthExceeded {
                width: new_width,
                limit: self.limit,
            });
        }
        self.fields.push(FieldEntry {
            kind,
            width,
            offset,
            initial,
            ops,
        });
        self.total_width = new_width;
        Ok(FieldHandle { offset, width })
    }

    /// Number of fields in this list.
    pub fn count(&self) -> usize {
        self.fields.len()
    }

    /// Total width, in bytes, of a buffer laid out by this field list.
    pub fn buffer_width(&self) -> usize {
        self.total_width
    }

    /// Fills every field slot in `buf` with its initial value.
    pub fn initialize(&self, buf: &mut [u8]) {
        for field in &self.fields {
            buf[field.offset..field.offset + field.width].copy_from_slice(&field.initial);
        }
    }

    /// Fills every field slot in `buf` by extracting straight from `record` (used for keys).
    pub fn extract(&self, record: &R, buf: &mut [u8]) {
        for field in &self.fields {
            field.ops.extract(record, &mut buf[field.offset..field.offset + field.width]);
        }
    }

    /// Applies `merge(slot, extract(record))` per field (used for accumulating values).
    pub fn accumulate(&self, record: &R, buf: &mut [u8]) {
        let mut scratch = [0u8; 16];
        for field in &self.fields {
            let incoming = &mut scratch[..field.width];
            field.ops.extract(record, incoming);
            field.ops.merge(&mut buf[field.offset..field.offset + field.width], incoming);
        }
    }

    /// Compares two buffers lexicographically, field by field, returning the first nonzero
    /// per-field result.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        for field in &self.fields {
            let range = field.offset..field.offset + field.width;
            let ord = field.ops.compare(&a[range.clone()], &b[range]);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Applies `merge(slot_a, slot_b)` per field.
    pub fn merge(&self, a: &mut [u8], b: &[u8]) {
        for field in &self.fields {
            let range = field.offset..field.offset + field.width;
            let incoming = &b[range.clone()];
            let mut tmp = [0u8; 16];
            tmp[..field.width].copy_from_slice(incoming);
            field.ops.merge(&mut a[range], &tmp[..field.width]);
        }
    }

    /// Copies one field's slot out of a composite buffer into `out`.
    pub fn extract_field(&self, handle: FieldHandle, buf: &[u8], out: &mut [u8]) {
        out[..handle.width].copy_from_slice(&buf[handle.offset..handle.offset + handle.width]);
    }

    /// The set of [`FieldKind`]s installed on this list, used for the key/distinct
    /// disjointness check at engine start.
    pub(crate) fn kinds(&self) -> impl Iterator<Item = FieldKind> + '_ {
        self.fields.iter().map(|f| f.kind)
    }
}

/// Checks that no [`FieldKind`] is shared between a key field list and a distinct field list.
/// Checked once at engine start, since a key field being counted as distinct too would double
/// up the same bytes in both roles for no meaningful gain.
pub(crate) fn check_key_distinct_disjoint<R: FlowRecord + 'static>(
    keys: &FieldList<R>,
    distinct: &FieldList<R>,
) -> Result<(), FieldError> {
    for dk in distinct.kinds() {
        if keys.kinds().any(|kk| kk == dk) {
            return Err(FieldError::KeyDistinctOverlap { kind: dk });
        }
    }
    Ok(())
}
