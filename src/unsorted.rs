//! The unsorted, hash-table-driven aggregator: ingests records in arbitrary order, spilling
//! sorted runs to disk under memory pressure, and produces output by draining the in-memory
//! table directly or, if any runs were spilled, by k-way merging every run plus a final
//! in-memory run.

use std::path::PathBuf;

use crate::buffer::{KeyBuffer, ValueBuffer};
use crate::distinct::{union_sorted, DistinctSet};
use crate::error::{AggregateError, Phase, PhaseError};
use crate::field::{check_key_distinct_disjoint, FieldHandle, FieldList, FlowRecord};
use crate::hash_table::{Bin, HashAggregator};
use crate::merge::MergeHeap;
use crate::run::{RunLayout, RunReader, RunRecord, RunWriter};
use crate::temp::{SpillFile, TempManager};

/// Default in-memory budget before the table is spilled to a run file.
const DEFAULT_MEMORY_BUDGET_BYTES: usize = 1024 * 1024 * 1024;

/// One fully aggregated output row: a bin's key, accumulated value, and per-distinct-field
/// sorted member sequences.
pub struct OutputRecord {
    pub key: KeyBuffer,
    pub value: ValueBuffer,
    pub distincts: Vec<Vec<Box<[u8]>>>,
}

/// The field lists and distinct handles fixed at [`UnsortedEngine::prepare_for_input`], carried
/// through ingestion and draining.
struct Prepared<R> {
    keys: FieldList<R>,
    values: FieldList<R>,
    distinct_fields: FieldList<R>,
    distinct_handles: Vec<FieldHandle>,
}

struct IngestState<R> {
    prepared: Prepared<R>,
    table: HashAggregator,
    spill_files: Vec<SpillFile>,
}

struct DrainState<R> {
    keys: FieldList<R>,
    values: FieldList<R>,
    cursor: OutputCursor,
}

/// Where the engine is in its lifecycle, carrying exactly the state that phase needs. A run-file
/// or merge failure during ingestion or draining moves the engine straight to `Done`: the spec's
/// contract is that the engine never partially emits a bin, and the simplest way to guarantee
/// that after a failure is to guarantee there is no further output at all.
enum EngineState<R> {
    Configuring,
    Ingesting(IngestState<R>),
    Draining(DrainState<R>),
    Done,
}

impl<R> EngineState<R> {
    fn phase(&self) -> Phase {
        match self {
            EngineState::Configuring => Phase::Configuring,
            EngineState::Ingesting(_) => Phase::Ingesting,
            EngineState::Draining(_) => Phase::Draining,
            EngineState::Done => Phase::Done,
        }
    }
}

/// A streaming, unsorted-input aggregator built around an in-memory hash table that spills to
/// disk when it grows past a configured budget.
///
/// Usage moves through four phases in order: configure field lists and options, ingest records,
/// drain output. Calling a method out of phase returns [`crate::error::AggregateError::Phase`].
/// Any I/O failure while spilling or merging moves the engine to a terminal phase: every
/// subsequent call, including ones that would otherwise be in-phase, then returns
/// [`crate::error::AggregateError::Phase`] too.
pub struct UnsortedEngine<R> {
    state: EngineState<R>,
    memory_budget: usize,
    temp_manager: Option<TempManager>,
    total_distinct: Option<DistinctSet>,
    sorted_output: bool,
}

impl<R: FlowRecord + 'static> UnsortedEngine<R> {
    pub fn new() -> Self {
        Self {
            state: EngineState::Configuring,
            memory_budget: DEFAULT_MEMORY_BUDGET_BYTES,
            temp_manager: Some(TempManager::new(std::env::temp_dir())),
            total_distinct: None,
            sorted_output: false,
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

    /// Sets the directory spilled run files are written under. Required before ingestion if the
    /// table is ever expected to exceed the memory budget.
    pub fn set_temp_directory(&mut self, directory: PathBuf) -> Result<(), AggregateError> {
        if !matches!(self.state, EngineState::Configuring) {
            return Err(self.phase_error("set_temp_directory", Phase::Configuring));
        }
        self.temp_manager = Some(TempManager::new(directory));
        Ok(())
    }

    /// Overrides the default in-memory budget, in bytes, before the table spills.
    pub fn set_memory_budget(&mut self, bytes: usize) -> Result<(), AggregateError> {
        if !matches!(self.state, EngineState::Configuring) {
            return Err(self.phase_error("set_memory_budget", Phase::Configuring));
        }
        self.memory_budget = bytes;
        Ok(())
    }

    /// Controls whether output is produced in ascending key order. Ignored if any run is
    /// spilled: a spilled table can only be drained by the sorted k-way merge.
    pub fn set_sorted_output(&mut self, sorted: bool) -> Result<(), AggregateError> {
        if !matches!(self.state, EngineState::Configuring) {
            return Err(self.phase_error("set_sorted_output", Phase::Configuring));
        }
        self.sorted_output = sorted;
        Ok(())
    }

    /// Enables tracking of the total number of distinct values seen for the first distinct
    /// field, counted once globally across every bin and every spilled run rather than per bin.
    pub fn enable_total_distinct(&mut self) -> Result<(), AggregateError> {
        if !matches!(self.state, EngineState::Configuring) {
            return Err(self.phase_error("enable_total_distinct", Phase::Configuring));
        }
        self.total_distinct = Some(DistinctSet::new());
        Ok(())
    }

    /// Installs the key, value, and distinct field lists and moves to the ingesting phase.
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
        if distinct_fields.count() > 0 {
            // Distinct counts can't be merged across spilled runs unless keys are grouped, so
            // any distinct field implicitly forces sorted output regardless of what the caller set.
            self.sorted_output = true;
        }
        let table = HashAggregator::new(keys.buffer_width(), values.buffer_width(), distinct_fields.count());
        self.state = EngineState::Ingesting(IngestState {
            prepared: Prepared {
                keys,
                values,
                distinct_fields,
                distinct_handles,
            },
            table,
            spill_files: Vec::new(),
        });
        Ok(())
    }

    /// Folds one record into the table, spilling to disk first if the budget has been exceeded.
    pub fn add_record(&mut self, record: &R) -> Result<(), AggregateError> {
        let over_budget = {
            let budget = self.memory_budget;
            let total_distinct = self.total_distinct.as_mut();
            let ingest = ingest_mut(&mut self.state, "add_record")?;
            accumulate_into(ingest, total_distinct, record);
            ingest.table.memory_estimate() > budget
        };
        if over_budget {
            self.spill_current_table()?;
        }
        Ok(())
    }

    fn spill_current_table(&mut self) -> Result<(), AggregateError> {
        let temp_manager = self.temp_manager.as_ref();
        let ingest = ingest_mut(&mut self.state, "spill_current_table")?;
        let result = spill_ingest(ingest, temp_manager);
        if result.is_err() {
            self.state = EngineState::Done;
        }
        result
    }

    /// Moves to the draining phase, arming either a direct in-memory drain or, if any run was
    /// spilled, a k-way merge across every run plus the remaining in-memory table.
    pub fn prepare_for_output(&mut self) -> Result<(), AggregateError> {
        let ingest = take_ingesting(&mut self.state, "prepare_for_output")?;
        let temp_manager = self.temp_manager.as_ref();
        match build_output(ingest, self.sorted_output, temp_manager) {
            Ok((keys, values, cursor)) => {
                self.state = EngineState::Draining(DrainState { keys, values, cursor });
                Ok(())
            }
            // `take_ingesting` already parked the engine in `Done`.
            Err(e) => Err(e),
        }
    }

    /// Pulls the next aggregated record, or `None` once every bin has been produced.
    pub fn next(&mut self) -> Result<Option<OutputRecord>, AggregateError> {
        let result = {
            let drain = match &mut self.state {
                EngineState::Draining(d) => d,
                other => return Err(PhaseError { operation: "next", expected: Phase::Draining, actual: other.phase() }.into()),
            };
            match &mut drain.cursor {
                OutputCursor::InMemory(iter) => Ok(iter.next().map(|(key, bin)| OutputRecord {
                    key,
                    value: bin.value,
                    distincts: bin.distincts.into_iter().map(DistinctSet::into_sorted).collect(),
                })),
                OutputCursor::Merged(state) => state.next(&drain.keys, &drain.values),
            }
        };

        if !matches!(result, Ok(Some(_))) {
            self.state = EngineState::Done;
        }
        result
    }

    /// The number of distinct values seen for the first distinct field, counted once globally.
    /// Returns `u64::MAX` if [`UnsortedEngine::enable_total_distinct`] was never called, or if
    /// called before [`UnsortedEngine::prepare_for_output`] has run.
    pub fn total_distinct_count(&self) -> u64 {
        let Some(set) = self.total_distinct.as_ref() else {
            return u64::MAX;
        };
        match self.state.phase() {
            Phase::Configuring | Phase::Ingesting => u64::MAX,
            Phase::Draining | Phase::Done => set.len() as u64,
        }
    }
}

impl<R: FlowRecord + 'static> Default for UnsortedEngine<R> {
    fn default() -> Self {
        Self::new()
    }
}

fn ingest_mut<'a, R>(state: &'a mut EngineState<R>, operation: &'static str) -> Result<&'a mut IngestState<R>, AggregateError> {
    match state {
        EngineState::Ingesting(s) => Ok(s),
        other => Err(PhaseError {
            operation,
            expected: Phase::Ingesting,
            actual: other.phase(),
        }
        .into()),
    }
}

/// Takes ownership of the ingest state, parking the engine in `Done` as a placeholder. The
/// caller is expected to either restore a live state (on success) or leave it in `Done` (on
/// failure) before returning. A phase mismatch restores the original state untouched.
fn take_ingesting<R>(state: &mut EngineState<R>, operation: &'static str) -> Result<IngestState<R>, AggregateError> {
    match std::mem::replace(state, EngineState::Done) {
        EngineState::Ingesting(s) => Ok(s),
        other => {
            let actual = other.phase();
            *state = other;
            Err(PhaseError {
                operation,
                expected: Phase::Ingesting,
                actual,
            }
            .into())
        }
    }
}

fn accumulate_into<R: FlowRecord + 'static>(ingest: &mut IngestState<R>, mut total_distinct: Option<&mut DistinctSet>, record: &R) {
    let prepared = &ingest.prepared;
    let mut key_buf = vec![0u8; prepared.keys.buffer_width()];
    prepared.keys.extract(record, &mut key_buf);

    let mut distinct_scratch = vec![0u8; prepared.distinct_fields.buffer_width()];
    prepared.distinct_fields.extract(record, &mut distinct_scratch);

    let bin = ingest.table.upsert(&key_buf, &prepared.values);
    prepared.values.accumulate(record, bin.value.as_mut_bytes());

    let mut growth = 0usize;
    for (i, handle) in prepared.distinct_handles.iter().enumerate() {
        let mut member = vec![0u8; handle.width()];
        prepared.distinct_fields.extract_field(*handle, &distinct_scratch, &mut member);
        if bin.distincts[i].insert(&member) {
            growth += member.len();
        }
        if i == 0 {
            if let Some(total) = total_distinct.as_mut() {
                total.insert(&member);
            }
        }
    }
    ingest.table.note_growth(growth);
}

fn spill_ingest<R: FlowRecord + 'static>(ingest: &mut IngestState<R>, temp_manager: Option<&TempManager>) -> Result<(), AggregateError> {
    let prepared = &ingest.prepared;
    let temp_manager = temp_manager.ok_or_else(|| AggregateError::OutOfMemory {
        source: std::io::Error::new(
            std::io::ErrorKind::Other,
            "table exceeded its memory budget but no temp directory was configured",
        ),
    })?;

    let spill_file = temp_manager.next_run_path()?;
    let mut writer = RunWriter::create(spill_file.path())?;
    let bin_count = ingest.table.len();
    tracing::debug!(path = %spill_file.path().display(), bins = bin_count, "spilling hash table to run file");

    let empty_table = HashAggregator::new(prepared.keys.buffer_width(), prepared.values.buffer_width(), prepared.distinct_fields.count());
    let draining = std::mem::replace(&mut ingest.table, empty_table);
    let mut bytes_written = 0usize;
    for (key, bin) in draining.drain_sorted(&prepared.keys) {
        let distincts: Vec<Vec<Box<[u8]>>> = bin.distincts.into_iter().map(DistinctSet::into_sorted).collect();
        bytes_written += key.len() + bin.value.len();
        writer.write_record(key.as_bytes(), bin.value.as_bytes(), &distincts)?;
    }
    writer.finish()?;

    tracing::debug!(path = %spill_file.path().display(), bins = bin_count, bytes = bytes_written, "spill complete");
    ingest.spill_files.push(spill_file);
    Ok(())
}

#[allow(clippy::type_complexity)]
fn build_output<R: FlowRecord + 'static>(
    mut ingest: IngestState<R>,
    sorted_output: bool,
    temp_manager: Option<&TempManager>,
) -> Result<(FieldList<R>, FieldList<R>, OutputCursor), AggregateError> {
    if ingest.spill_files.is_empty() {
        let empty = HashAggregator::new(0, 0, 0);
        let table = std::mem::replace(&mut ingest.table, empty);
        let drained = if sorted_output {
            table.drain_sorted(&ingest.prepared.keys)
        } else {
            table.drain_insertion()
        };
        let cursor = OutputCursor::InMemory(drained.into_iter());
        Ok((ingest.prepared.keys, ingest.prepared.values, cursor))
    } else {
        if !ingest.table.is_empty() {
            spill_ingest(&mut ingest, temp_manager)?;
        }
        let prepared = &ingest.prepared;
        let distinct_widths: Vec<usize> = prepared.distinct_handles.iter().map(|h| h.width()).collect();
        let layout = RunLayout {
            key_width: prepared.keys.buffer_width(),
            value_width: prepared.values.buffer_width(),
            distinct_widths,
        };

        let mut fronts = Vec::with_capacity(ingest.spill_files.len());
        let mut readers = Vec::with_capacity(ingest.spill_files.len());
        for spill_file in &ingest.spill_files {
            tracing::trace!(path = %spill_file.path().display(), "opening run for merge");
            let mut reader = RunReader::open(spill_file.path(), layout.clone())?;
            let front = reader.next_record()?;
            readers.push(reader);
            fronts.push(front);
        }

        let mut heap: MergeHeap<usize> = MergeHeap::new();
        for (idx, front) in fronts.iter().enumerate() {
            if let Some(record) = front {
                heap.push(record.key.clone(), idx, |a, b| prepared.keys.compare(a, b));
            }
        }

        let cursor = OutputCursor::Merged(MergeState { readers, fronts, heap });
        Ok((ingest.prepared.keys, ingest.prepared.values, cursor))
    }
}

enum OutputCursor {
    InMemory(std::vec::IntoIter<(KeyBuffer, Bin)>),
    Merged(MergeState),
}

struct MergeState {
    readers: Vec<RunReader>,
    fronts: Vec<Option<RunRecord>>,
    heap: MergeHeap<usize>,
}

impl MergeState {
    fn refill(&mut self, idx: usize, keys: &FieldList<impl FlowRecord + 'static>) -> Result<(), AggregateError> {
        let next = self.readers[idx].next_record()?;
        if let Some(record) = &next {
            self.heap.push(record.key.clone(), idx, |a, b| keys.compare(a, b));
        } else {
            tracing::trace!(run = idx, "run exhausted during merge");
        }
        self.fronts[idx] = next;
        Ok(())
    }

    fn next(
        &mut self,
        keys: &FieldList<impl FlowRecord + 'static>,
        values: &FieldList<impl FlowRecord + 'static>,
    ) -> Result<Option<OutputRecord>, AggregateError> {
        let Some((first_key, first_idx)) = self.heap.pop(|a, b| keys.compare(a, b)) else {
            return Ok(None);
        };
        let first = self.fronts[first_idx].take().ok_or(AggregateError::Internal {
            message: "merge heap entry had no corresponding front record",
        })?;
        self.refill(first_idx, keys)?;

        let mut value = first.value;
        let mut distincts = first.distincts;

        while let Some(peeked) = self.heap.peek_key() {
            if keys.compare(peeked, first_key.as_bytes()) != std::cmp::Ordering::Equal {
                break;
            }
            let (_, idx) = self.heap.pop(|a, b| keys.compare(a, b)).ok_or(AggregateError::Internal {
                message: "merge heap pop returned nothing after a successful peek",
            })?;
            let record = self.fronts[idx].take().ok_or(AggregateError::Internal {
                message: "merge heap entry had no corresponding front record",
            })?;
            self.refill(idx, keys)?;

            values.merge(value.as_mut_bytes(), record.value.as_bytes());
            for (slot, incoming) in distincts.iter_mut().zip(record.distincts.iter()) {
                *slot = union_sorted(slot, incoming);
            }
        }

        Ok(Some(OutputRecord {
            key: first_key,
            value,
            distincts,
        }))
    }
}
