//! The job queue handed to the solver and the flags that shape a solve.

use krait_conda_types::MatchSpec;

/// One entry of the solver's job queue.
#[derive(Debug, Clone)]
pub enum SolveJob {
    /// Make the spec present in the prefix.
    Install(MatchSpec),
    /// Remove all installed packages matching the spec.
    Remove(MatchSpec),
    /// Bring matching installed packages to the best available version.
    Update(MatchSpec),
    /// Freeze the matching installed package at its current version.
    Lock(MatchSpec),
    /// Reinstall the matching installed packages at their exact version,
    /// build and channel.
    Reinstall(MatchSpec),
    /// Constrain the version of a package without installing it.
    Constrain(MatchSpec),
    /// Pin a package: every solution must satisfy the pin for that name.
    Pin(MatchSpec),
}

impl SolveJob {
    /// The spec carried by the job.
    pub fn spec(&self) -> &MatchSpec {
        match self {
            SolveJob::Install(spec)
            | SolveJob::Remove(spec)
            | SolveJob::Update(spec)
            | SolveJob::Lock(spec)
            | SolveJob::Reinstall(spec)
            | SolveJob::Constrain(spec)
            | SolveJob::Pin(spec) => spec,
        }
    }
}

/// How repo priorities interact with version ordering during candidate
/// selection.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum ChannelPriority {
    /// Lower-priority repos are hidden entirely for names that a
    /// higher-priority repo provides.
    #[default]
    Strict,
    /// Priorities only break ties after version and build number.
    Flexible,
    /// Priorities are ignored.
    Disabled,
}

/// Flags shaping a solve.
#[derive(Debug, Clone, Default)]
pub struct SolverFlags {
    /// Allow replacing an installed package by a lower version.
    pub allow_downgrade: bool,
    /// Allow removing installed packages to satisfy the jobs.
    pub allow_uninstall: bool,
    /// How channel priorities are applied.
    pub channel_priority: ChannelPriority,
    /// Keep only the explicitly named packages in the transaction.
    pub no_deps: bool,
    /// Keep only the dependencies of the named packages in the transaction.
    pub only_deps: bool,
    /// Reinstall explicitly named packages even when already satisfied.
    pub force_reinstall: bool,
}
