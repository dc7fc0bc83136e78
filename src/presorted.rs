//! The presorted streaming merge aggregator: given N input files that are each already sorted
//! ascending by key, produces the same aggregate as [`crate::unsorted::UnsortedEngine`] with a
//! single open bin at any time, by k-way merging the inputs and folding consecutive equal keys
//! (whether they're consecutive within one input or interleaved across several) as they're
//! encountered.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::buffer::{KeyBuffer, ValueBuffer};
use crate::distinct::DistinctSet;
use crate::error::{AggregateError, Phase, PhaseError};
use crate::field::{check_key_distinct_disjoint, FieldHandle, FieldList, FlowRecord};
use crate::merge::MergeHeap;
use crate::unsorted::OutputRecord;

/// Decodes one record at a time from an input stream.
///
/// Types that represent a record format implement this directly; engines that need a
/// nonstandard wire format instead supply a closure via
/// [`PresortedEngine::set_read_fn`].
pub trait RecordCodec: Sized {
    fn decode(reader: &mut dyn BufRead) -> io::Result<Option<Self>>;
}

type ReadFn<R> = Rc<dyn Fn(&mut dyn BufRead) -> io::Result<Option<R>>>;
type PostOpenFn = Rc<dyn Fn(&Path, &mut dyn BufRead) -> io::Result<()>>;

/// The field lists and distinct handles fixed at [`PresortedEngine::prepare_for_input`].
struct Prepared<R> {
    keys: FieldList<R>,
    values: FieldList<R>,
    distinct_fields: FieldList<R>,
    distinct_handles: Vec<FieldHandle>,
}

/// Where the engine is in its lifecycle. `process` consumes the `Ingesting` state
/// unconditionally and moves to `Done`, whether it finishes the merge, stops early on the
/// caller's request, or fails partway through: a partial merge is never resumable, so there's
/// nothing to gain by staying in `Ingesting` after a failed attempt.
enum EngineState<R> {
    Configuring,
    Ingesting(Prepared<R>),
    Done,
}

impl<R> EngineState<R> {
    fn phase(&self) -> Phase {
        match self {
            EngineState::Configuring => Phase::Configuring,
            EngineState::Ingesting(_) => Phase::Ingesting,
            EngineState::Done => Phase::Done,
        }
    }
}

/// A streaming merge aggregator over presorted inputs, holding only one aggregated bin in
/// memory at a time.
pub struct PresortedEngine<R> {
    state: EngineState<R>,
    inputs: Vec<PathBuf>,
    read_fn: Option<ReadFn<R>>,
    post_open_fn: Option<PostOpenFn>,
}

impl<R: FlowRecord + 'static> PresortedEngine<R> {
    pub fn new() -> Self {
        Self {
            state: EngineState::Configuring,
            inputs: Vec::new(),
            read_fn: None,
            post_open_fn: None,
        }
    }

    fn phase_error(&self, operation: &'static str, expected: Phase) -> AggregateError {
        PhaseError {
            operation,
            expected,
            actual: self.state.phase(),
        }
        .into()
    }

    /// Registers one presorted input file. Inputs are merged in the order they're added, but
    /// that order has no effect on output: every input must already be sorted ascending under
    /// the key field list given to [`PresortedEngine::prepare_for_input`].
    pub fn add_input(&mut self, path: PathBuf) -> Result<(), AggregateError> {
        if !matches!(self.state, EngineState::Configuring) {
            return Err(self.phase_error("add_input", Phase::Configuring));
        }
        self.inputs.push(path);
        Ok(())
    }

    /// Overrides the default [`RecordCodec::decode`] used to read each input.
    pub fn set_read_fn(&mut self, read_fn: impl Fn(&mut dyn BufRead) -> io::Result<Option<R>> + 'static) -> Result<(), AggregateError> {
        if !matches!(self.state, EngineState::Configuring) {
            return Err(self.phase_error("set_read_fn", Phase::Configuring));
        }
        self.read_fn = Some(Rc::new(read_fn));
        Ok(())
    }

    /// Registers a hook run once per input immediately after it's opened, e.g. to skip a header
    /// line before the first record is decoded.
    pub fn set_post_open_fn(&mut self, post_open_fn: impl Fn(&Path, &mut dyn BufRead) -> io::Result<()> + 'static) -> Result<(), AggregateError> {
        if !matches!(self.state, EngineState::Configuring) {
            return Err(self.phase_error("set_post_open_fn", Phase::Configuring));
        }
        self.post_open_fn = Some(Rc::new(post_open_fn));
        Ok(())
    }

    /// Installs the key, value, and distinct field lists and moves to the processing phase.
    pub fn prepare_for_input(
        &mut self,
        keys: FieldList<R>,
        values: FieldList<R>,
        distinct_fields: FieldList<R>,
        distinct_handles: Vec<FieldHandle>,
    ) -> Result<(), AggregateError> {
        if !matches!(self.state, EngineState::Configuring) {
            return Err(self.phase_error("prepare_for_input", Phase::Configuring));
        }
        check_key_distinct_disjoint(&keys, &distinct_fields)?;
        if values.count() == 0 && distinct_fields.count() == 0 {
            return Err(crate::field::FieldError::NoOutputFields.into());
        }
        self.state = EngineState::Ingesting(Prepared {
            keys,
            values,
            distinct_fields,
            distinct_handles,
        });
        Ok(())
    }

    /// Streams every aggregated bin to `output`, in ascending key order, holding only one bin's
    /// worth of accumulated state in memory at a time.
    ///
    /// `output` returning `ControlFlow::Break` stops the merge early; `process` still returns
    /// `Ok(())` in that case; an early stop is a caller decision, not a failure. An `Err` return
    /// propagates as `process`'s own error. Either way, and on any I/O failure during the merge,
    /// the engine moves to its terminal phase: `process` runs at most once.
    pub fn process(
        &mut self,
        mut output: impl FnMut(OutputRecord) -> Result<std::ops::ControlFlow<()>, AggregateError>,
    ) -> Result<(), AggregateError>
    where
        R: RecordCodec,
    {
        let prepared = match std::mem::replace(&mut self.state, EngineState::Done) {
            EngineState::Ingesting(p) => p,
            other => {
                let actual = other.phase();
                self.state = other;
                return Err(PhaseError {
                    operation: "process",
                    expected: Phase::Ingesting,
                    actual,
                }
                .into());
            }
        };

        run_merge(&prepared, &self.inputs, self.read_fn.as_ref(), self.post_open_fn.as_ref(), &mut output)
    }
}

fn run_merge<R: FlowRecord + 'static>(
    prepared: &Prepared<R>,
    inputs: &[PathBuf],
    read_fn: Option<&ReadFn<R>>,
    post_open_fn: Option<&PostOpenFn>,
    output: &mut impl FnMut(OutputRecord) -> Result<std::ops::ControlFlow<()>, AggregateError>,
) -> Result<(), AggregateError>
where
    R: RecordCodec,
{
    let keys = &prepared.keys;
    let values = &prepared.values;
    let distinct_fields = &prepared.distinct_fields;

    let decode: ReadFn<R> = read_fn.cloned().unwrap_or_else(|| Rc::new(|r| R::decode(r)));

    let mut cursors = Vec::with_capacity(inputs.len());
    for path in inputs {
        let file = File::open(path).map_err(|source| crate::run::RunError::Io { source })?;
        let mut reader = BufReader::new(file);
        if let Some(post_open) = post_open_fn {
            post_open(path, &mut reader).map_err(|source| crate::run::RunError::Io { source })?;
        }
        cursors.push(reader);
    }

    let mut fronts: Vec<Option<R>> = Vec::with_capacity(cursors.len());
    let mut heap: MergeHeap<usize> = MergeHeap::new();
    let mut key_buf = vec![0u8; keys.buffer_width()];

    for (idx, cursor) in cursors.iter_mut().enumerate() {
        let record = decode(cursor).map_err(|source| crate::run::RunError::Io { source })?;
        if let Some(record) = &record {
            keys.extract(record, &mut key_buf);
            heap.push(KeyBuffer::from_bytes(&key_buf), idx, |a, b| keys.compare(a, b));
        }
        fronts.push(record);
    }

    while let Some((bin_key, first_idx)) = heap.pop(|a, b| keys.compare(a, b)) {
        let mut value = ValueBuffer::zeroed(values.buffer_width());
        values.initialize(value.as_mut_bytes());
        let mut distincts: Vec<DistinctSet> = (0..prepared.distinct_handles.len()).map(|_| DistinctSet::new()).collect();

        fold_one(first_idx, &mut fronts, &mut value, &mut distincts, values, distinct_fields, &prepared.distinct_handles)?;
        advance(first_idx, &decode, &mut cursors, &mut fronts, &mut heap, keys, &mut key_buf)?;

        while let Some(peeked) = heap.peek_key() {
            if keys.compare(peeked, bin_key.as_bytes()) != std::cmp::Ordering::Equal {
                break;
            }
            let (_, idx) = heap.pop(|a, b| keys.compare(a, b)).ok_or(AggregateError::Internal {
                message: "merge heap pop returned nothing after a successful peek",
            })?;
            fold_one(idx, &mut fronts, &mut value, &mut distincts, values, distinct_fields, &prepared.distinct_handles)?;
            advance(idx, &decode, &mut cursors, &mut fronts, &mut heap, keys, &mut key_buf)?;
        }

        let control = output(OutputRecord {
            key: bin_key,
            value,
            distincts: distincts.into_iter().map(DistinctSet::into_sorted).collect(),
        })?;
        if control.is_break() {
            return Ok(());
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn fold_one<R: FlowRecord + 'static>(
    idx: usize,
    fronts: &mut [Option<R>],
    value: &mut ValueBuffer,
    distincts: &mut [DistinctSet],
    values: &FieldList<R>,
    distinct_fields: &FieldList<R>,
    distinct_handles: &[FieldHandle],
) -> Result<(), AggregateError> {
    let record = fronts[idx].take().ok_or(AggregateError::Internal {
        message: "merge heap entry had no corresponding front record",
    })?;
    values.accumulate(&record, value.as_mut_bytes());

    let mut distinct_scratch = vec![0u8; distinct_fields.buffer_width()];
    distinct_fields.extract(&record, &mut distinct_scratch);
    for (i, handle) in distinct_handles.iter().enumerate() {
        let width = handle.width();
        let mut member = vec![0u8; width];
        distinct_fields.extract_field(*handle, &distinct_scratch, &mut member);
        distincts[i].insert(&member);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn advance<R: FlowRecord + 'static>(
    idx: usize,
    decode: &ReadFn<R>,
    cursors: &mut [BufReader<File>],
    fronts: &mut [Option<R>],
    heap: &mut MergeHeap<usize>,
    keys: &FieldList<R>,
    key_buf: &mut [u8],
) -> Result<(), AggregateError> {
    let record = decode(&mut cursors[idx]).map_err(|source| crate::run::RunError::Io { source })?;
    if let Some(record) = &record {
        keys.extract(record, key_buf);
        heap.push(KeyBuffer::from_bytes(key_buf), idx, |a, b| keys.compare(a, b));
    }
    fronts[idx] = record;
    Ok(())
}

impl<R: FlowRecord + 'static> Default for PresortedEngine<R> {
    fn default() -> Self {
        Self::new()
    }
}
