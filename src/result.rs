//! Result and error types for the scheduling passes.

use crate::ir::{BlockId, InstrId};
use thiserror::Error;

/// A scheduling error.
///
/// Per-instruction folding failures in copy propagation are handled locally
/// and never reach this type.  Only whole-block failures surface, and every
/// variant represents a bug somewhere upstream of the scheduler, so callers
/// should treat them as non-retryable compile failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    /// No instruction was schedulable and no special-register conflict was
    /// available to split.
    ///
    /// This means a true cyclic dependency slipped past the DAG builder.
    #[error("scheduling deadlock in {block} with no breakable conflict")]
    Deadlock {
        /// The block that could not be scheduled.
        block: BlockId,
    },

    /// The dependency DAG is malformed, e.g. a node was visited twice where
    /// the builder expected a pristine node set.
    #[error("malformed scheduling DAG at {instr}")]
    MalformedDag {
        /// The instruction whose node was found in an impossible state.
        instr: InstrId,
    },

    /// The emitted order violates a scheduling contract, caught by the
    /// post-scheduling checker.
    #[error("schedule constraint violated at {instr}")]
    InvalidSchedule {
        /// The first instruction at which the violation was observed.
        instr: InstrId,
    },
}

/// A convenient alias for a `Result` that uses `ScheduleError` as the error
/// type.
pub type SchedResult<T> = Result<T, ScheduleError>;
