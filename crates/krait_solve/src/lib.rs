#![deny(missing_docs)]

//! The dependency solver of krait.
//!
//! A [`Pool`] holds the package universe of one solve: repos with
//! priorities, solvables with interned dependency specs, and optionally a
//! designated `installed` repo. A [`Solver`] lowers [`SolveJob`]s onto the
//! pool and searches for a consistent target state; on success the result
//! diffs into an ordered [`Transaction`], on failure the rule-level
//! problems assemble into a [`ProblemGraph`] whose merge pass collapses
//! equivalent nodes for human-readable reporting.

mod id;
mod jobs;
mod pool;
mod problem;
mod solver;
mod transaction;

pub use id::{NameId, RepoId, SolvableId, SpecId};
pub use jobs::{ChannelPriority, SolveJob, SolverFlags};
pub use pool::{NamespaceAnswer, NamespaceCallback, Pool, Solvable};
pub use problem::{MergedNode, ProblemEdge, ProblemGraph, ProblemNode};
pub use solver::{
    render_unsolvable, SolveError, SolveProblem, Solver, SolverResult, UnsatisfiablePin,
    Unsolvable,
};
pub use transaction::{Transaction, TransactionStep};
