//! Crate-wide error taxonomy.
//!
//! Each module that can fail defines its own `Snafu`-derived error enum scoped to that
//! module's concerns (see [`crate::field::FieldError`], [`crate::run::RunError`]). This
//! module folds those per-module errors into one [`AggregateError`] so callers that don't
//! care which subsystem failed can propagate a single type with `?`.

use std::io;

use snafu::Snafu;

use crate::field::FieldError;
use crate::run::RunError;

/// The engine's lifecycle phase, used to report operations invoked out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuring,
    Ingesting,
    Draining,
    Done,
}

/// A public operation was invoked while the engine was in a phase that doesn't support it.
#[derive(Debug, Snafu)]
#[snafu(display("operation `{operation}` is not valid in phase {actual:?} (expected {expected:?})"))]
pub struct PhaseError {
    pub operation: &'static str,
    pub expected: Phase,
    pub actual: Phase,
}

/// Top-level error type returned by the public engine operations.
#[derive(Debug, Snafu)]
pub enum AggregateError {
    /// The engine was called out of order relative to its lifecycle.
    #[snafu(display("{source}"))]
    Phase { source: PhaseError },

    /// A field-list invariant was violated at prepare time.
    #[snafu(display("field-list error: {source}"))]
    Field { source: FieldError },

    /// A run file could not be created, written, read, or parsed.
    #[snafu(display("run I/O error: {source}"))]
    Run { source: RunError },

    /// The hash table could not grow to accommodate the next insert, and a spill-and-retry
    /// also failed.
    #[snafu(display("out of memory after spill-and-retry: {source}"))]
    OutOfMemory { source: io::Error },

    /// An internal bookkeeping invariant was violated. Kept as a recoverable error rather than
    /// a panic so a future regression surfaces as `Err` instead of aborting the process.
    #[snafu(display("internal invariant violated: {message}"))]
    Internal { message: &'static str },
}

impl From<PhaseError> for AggregateError {
    fn from(source: PhaseError) -> Self {
        AggregateError::Phase { source }
    }
}

impl From<FieldError> for AggregateError {
    fn from(source: FieldError) -> Self {
        AggregateError::Field { source }
    }
}

impl From<RunError> for AggregateError {
    fn from(source: RunError) -> Self {
        AggregateError::Run { source }
    }
}

pub type Result<T, E = AggregateError> = std::result::Result<T, E>;
