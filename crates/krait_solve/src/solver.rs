//! The solver front-end: lowers jobs onto the pool, resolves them with a
//! backtracking search, and reports either a target state or the problems
//! that make the jobs unsatisfiable.

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use krait_conda_types::{MatchSpec, RepoDataRecord};

use crate::{
    id::{NameId, SolvableId, SpecId},
    jobs::{ChannelPriority, SolveJob, SolverFlags},
    pool::Pool,
    problem::ProblemGraph,
    transaction::Transaction,
};

/// Search depth bound; hit only by pathological dependency chains.
const MAX_DEPTH: usize = 2048;

/// A rule-level problem found during an unsatisfiable solve. These feed the
/// [`ProblemGraph`].
#[derive(Debug, Clone)]
pub enum SolveProblem {
    /// A job spec that participates in the conflict.
    Job {
        /// The interned job spec.
        spec: SpecId,
    },
    /// A package requires a dependency; edges go to the dependency's
    /// candidates.
    Requires {
        /// The requiring solvable, `None` for the root jobs.
        source: Option<SolvableId>,
        /// The required spec.
        spec: SpecId,
    },
    /// Nothing provides the given dependency.
    NothingProvides {
        /// The requiring solvable, `None` for the root jobs.
        source: Option<SolvableId>,
        /// The unsatisfiable spec.
        spec: SpecId,
    },
    /// A package constrains another to a range the candidate violates.
    Constrains {
        /// The constraining solvable, `None` for a `Constrain` job.
        source: Option<SolvableId>,
        /// The constraint spec.
        spec: SpecId,
        /// The solvable violating the constraint.
        target: SolvableId,
    },
    /// Two solvables of the same name cannot be installed together.
    SameNameConflict {
        /// The already-decided solvable.
        a: SolvableId,
        /// The competing candidate.
        b: SolvableId,
    },
    /// A locked package forbids the change the jobs require.
    Locked {
        /// The locked solvable.
        solvable: SolvableId,
    },
    /// A candidate exists but a policy makes it uninstallable.
    NotInstallable {
        /// The rejected solvable.
        solvable: SolvableId,
        /// A short policy tag, e.g. `downgrade-forbidden`.
        reason: &'static str,
    },
    /// A namespace callback reported an error for a dependency.
    NamespaceError {
        /// The dependency the callback failed on.
        spec: SpecId,
        /// The callback's message.
        message: String,
    },
}

/// The error of an unsatisfiable solve: the rule-level problems, to be
/// rendered through [`ProblemGraph`].
#[derive(Debug)]
pub struct Unsolvable {
    /// The collected problems; never empty.
    pub problems: Vec<SolveProblem>,
}

/// The error of a pin no candidate can satisfy.
#[derive(Debug, thiserror::Error)]
#[error("no candidate for '{name}' satisfies the pin '{pin}'")]
pub struct UnsatisfiablePin {
    /// The pinned package name.
    pub name: String,
    /// The pin spec.
    pub pin: String,
}

/// Everything that can go wrong in [`Solver::solve`].
#[derive(Debug)]
pub enum SolveError {
    /// The jobs are unsatisfiable; contains the problem set.
    Unsolvable(Unsolvable),
    /// A pin excludes every candidate of a name that does have candidates.
    UnsatisfiablePin(UnsatisfiablePin),
}

/// The outcome of a successful solve.
#[derive(Debug)]
pub struct SolverResult {
    /// The records present after applying the jobs (the target state).
    pub desired: Vec<RepoDataRecord>,
    /// Names whose packages must be reinstalled even when unchanged.
    pub reinstall_names: std::collections::HashSet<String>,
    /// The names of the user's explicit install/remove specs.
    pub explicit_names: std::collections::HashSet<String>,
}

impl SolverResult {
    /// Diffs the target state against the installed records into an ordered
    /// [`Transaction`].
    pub fn into_transaction(
        self,
        installed: Vec<RepoDataRecord>,
        flags: &SolverFlags,
    ) -> Transaction {
        Transaction::from_current_and_desired(
            installed,
            self.desired,
            &self.reinstall_names,
            &self.explicit_names,
            flags,
        )
    }
}

/// A pending requirement during the search.
#[derive(Debug, Clone, Copy)]
struct Requirement {
    spec: SpecId,
    source: Option<SolvableId>,
}

/// The mutable search state; cloned per candidate attempt.
#[derive(Debug, Clone, Default)]
struct State {
    decisions: HashMap<NameId, SolvableId>,
    removed: HashSet<NameId>,
    /// Constraints per name: (spec, source solvable or job).
    constraints: HashMap<NameId, Vec<(SpecId, Option<SolvableId>)>>,
}

/// Immutable per-solve context derived from the jobs.
struct JobContext {
    installed: HashMap<NameId, SolvableId>,
    locked: HashMap<NameId, SolvableId>,
    lock_missing: HashSet<NameId>,
    forbidden: HashSet<SolvableId>,
    update_names: HashSet<NameId>,
    root_requirements: Vec<Requirement>,
}

/// The solver front-end over one pool.
pub struct Solver<'pool> {
    pool: &'pool mut Pool,
    flags: SolverFlags,
}

impl<'pool> Solver<'pool> {
    /// Creates a solver over the given pool.
    pub fn new(pool: &'pool mut Pool, flags: SolverFlags) -> Self {
        Self { pool, flags }
    }

    /// Runs the given jobs to a target state or a problem report.
    pub fn solve(mut self, jobs: Vec<SolveJob>) -> Result<SolverResult, SolveError> {
        let mut state = State::default();
        let mut context = JobContext {
            installed: self.pool.installed_by_name(),
            locked: HashMap::new(),
            lock_missing: HashSet::new(),
            forbidden: HashSet::new(),
            update_names: HashSet::new(),
            root_requirements: Vec::new(),
        };
        let mut reinstall_names = std::collections::HashSet::new();
        let mut explicit_names = std::collections::HashSet::new();

        for job in &jobs {
            match job {
                SolveJob::Install(spec) => {
                    if let Some(name) = &spec.name {
                        explicit_names.insert(name.clone());
                    }
                    let spec_id = self.pool.intern_parsed_spec(spec.clone());
                    context.root_requirements.push(Requirement {
                        spec: spec_id,
                        source: None,
                    });
                }
                SolveJob::Update(spec) => {
                    if let Some(name) = &spec.name {
                        explicit_names.insert(name.clone());
                        if let Some(name_id) = self.pool.lookup_name(name) {
                            context.update_names.insert(name_id);
                        }
                    }
                    let spec_id = self.pool.intern_parsed_spec(spec.clone());
                    context.root_requirements.push(Requirement {
                        spec: spec_id,
                        source: None,
                    });
                }
                SolveJob::Remove(spec) => {
                    for (name_id, record) in self.installed_matches(spec, &context.installed) {
                        explicit_names.insert(record.package_record.name.clone());
                        state.removed.insert(name_id);
                    }
                }
                SolveJob::Lock(spec) => {
                    let Some(name) = spec.name.as_deref() else {
                        continue;
                    };
                    let name_id = self.pool.intern_name(name);
                    match context.installed.get(&name_id) {
                        Some(&installed) => {
                            context.locked.insert(name_id, installed);
                        }
                        None => {
                            context.lock_missing.insert(name_id);
                        }
                    }
                }
                SolveJob::Reinstall(spec) => {
                    for (_, record) in self.installed_matches(spec, &context.installed) {
                        let package = &record.package_record;
                        explicit_names.insert(package.name.clone());
                        reinstall_names.insert(package.name.clone());
                        // Narrow to exactly the installed version, build and
                        // channel so the same package is picked again.
                        let narrowed = MatchSpec {
                            name: Some(package.name.clone()),
                            version: Some(
                                format!("=={}", package.version)
                                    .parse()
                                    .expect("an exact version spec always parses"),
                            ),
                            build: Some(krait_conda_types::StringMatcher::Exact(
                                package.build.clone(),
                            )),
                            channel: Some(record.channel.clone()),
                            ..MatchSpec::default()
                        };
                        let spec_id = self.pool.intern_parsed_spec(narrowed);
                        context.root_requirements.push(Requirement {
                            spec: spec_id,
                            source: None,
                        });
                    }
                }
                SolveJob::Constrain(spec) => {
                    let Some(name) = spec.name.as_deref() else {
                        continue;
                    };
                    let name_id = self.pool.intern_name(name);
                    let spec_id = self.pool.intern_parsed_spec(spec.clone());
                    state
                        .constraints
                        .entry(name_id)
                        .or_default()
                        .push((spec_id, None));
                }
                SolveJob::Pin(spec) => {
                    self.apply_pin(spec, &mut context)
                        .map_err(SolveError::UnsatisfiablePin)?;
                }
            }
        }

        if self.flags.force_reinstall {
            for name in &explicit_names {
                reinstall_names.insert(name.clone());
            }
        }

        let queue = context.root_requirements.clone();
        let state = self
            .resolve(&context, state, queue, 0)
            .map_err(|problems| SolveError::Unsolvable(Unsolvable { problems }))?;

        Ok(self.build_result(state, reinstall_names, explicit_names))
    }

    /// All installed records matching a spec, with their name ids.
    fn installed_matches(
        &self,
        spec: &MatchSpec,
        installed: &HashMap<NameId, SolvableId>,
    ) -> Vec<(NameId, RepoDataRecord)> {
        installed
            .iter()
            .filter_map(|(&name, &id)| {
                let record = &self.pool.resolve_solvable(id).record;
                spec.matches(record).then(|| (name, record.clone()))
            })
            .collect()
    }

    /// A pin locks out every same-name solvable the pin does not cover.
    fn apply_pin(
        &mut self,
        pin: &MatchSpec,
        context: &mut JobContext,
    ) -> Result<(), UnsatisfiablePin> {
        let Some(name) = pin.name.as_deref() else {
            return Ok(());
        };
        let Some(name_id) = self.pool.lookup_name(name) else {
            return Ok(());
        };
        let all: Vec<SolvableId> = self.pool.solvables_by_name(name_id).to_vec();
        if all.is_empty() {
            return Ok(());
        }
        let (matching, excluded): (Vec<_>, Vec<_>) = all
            .into_iter()
            .partition(|&id| pin.matches(&self.pool.resolve_solvable(id).record));
        if matching.is_empty() {
            return Err(UnsatisfiablePin {
                name: name.to_owned(),
                pin: pin.to_string(),
            });
        }
        context.forbidden.extend(excluded);
        Ok(())
    }

    /// The recursive search: satisfies the queue of requirements, cloning
    /// the state to try candidates and backtracking on conflict.
    fn resolve(
        &self,
        context: &JobContext,
        state: State,
        mut queue: Vec<Requirement>,
        depth: usize,
    ) -> Result<State, Vec<SolveProblem>> {
        if depth > MAX_DEPTH {
            return Err(vec![SolveProblem::NamespaceError {
                spec: queue.first().map_or(SpecId(0), |r| r.spec),
                message: "dependency chain exceeds the search depth bound".to_owned(),
            }]);
        }
        let Some(requirement) = queue.pop() else {
            return Ok(state);
        };

        let spec = self.pool.resolve_spec(requirement.spec);
        let Some(name) = spec.name.as_deref() else {
            return self.resolve(context, state, queue, depth + 1);
        };
        let Some(name_id) = self.pool.lookup_name(name) else {
            return Err(self.nothing_provides(&requirement));
        };

        // An already-decided name either satisfies the requirement or the
        // branch is dead.
        if let Some(&decided) = state.decisions.get(&name_id) {
            let record = &self.pool.resolve_solvable(decided).record;
            return if spec.matches(record) {
                self.resolve(context, state, queue, depth + 1)
            } else {
                let mut problems = self.requirement_problem(&requirement);
                let alternate = self
                    .pool
                    .candidates(requirement.spec)
                    .ok()
                    .and_then(|candidates| candidates.first().copied());
                match alternate {
                    Some(other) => problems.push(SolveProblem::SameNameConflict {
                        a: decided,
                        b: other,
                    }),
                    None => problems.push(SolveProblem::NothingProvides {
                        source: requirement.source,
                        spec: requirement.spec,
                    }),
                }
                Err(problems)
            };
        }
        if state.removed.contains(&name_id) || context.lock_missing.contains(&name_id) {
            let mut problems = self.requirement_problem(&requirement);
            if let Some(&installed) = context.installed.get(&name_id) {
                problems.push(SolveProblem::Locked {
                    solvable: installed,
                });
            }
            return Err(problems);
        }

        let candidates = match self.candidates_for(requirement.spec, name_id, context) {
            Ok(candidates) => candidates,
            Err(problems) => return Err(problems),
        };
        if candidates.is_empty() {
            return Err(self.nothing_provides(&requirement));
        }

        let mut failures: Vec<SolveProblem> = Vec::new();
        let mut policy_problems = Vec::new();
        for candidate in candidates {
            // Downgrading an installed package is a policy decision: allowed
            // for explicit jobs, gated by flags for dependencies.
            if let Some(problem) = self.policy_rejection(candidate, name_id, &requirement, context)
            {
                policy_problems.push(problem);
                continue;
            }

            // Constraints registered for this name must pass.
            if let Some(problem) = self.constraint_violation(&state, name_id, candidate) {
                policy_problems.push(problem);
                continue;
            }

            let mut next_state = state.clone();
            next_state.decisions.insert(name_id, candidate);

            // Register the candidate's constrains; a constraint that an
            // existing decision already violates kills this candidate.
            let solvable = self.pool.resolve_solvable(candidate);
            let mut violated = false;
            for &constraint in &solvable.constrains {
                let constraint_spec = self.pool.resolve_spec(constraint);
                let Some(constrained_name) = constraint_spec
                    .name
                    .as_deref()
                    .and_then(|n| self.pool.lookup_name(n))
                else {
                    continue;
                };
                if let Some(&decided) = next_state.decisions.get(&constrained_name) {
                    if !constraint_spec.matches(&self.pool.resolve_solvable(decided).record) {
                        policy_problems.push(SolveProblem::Constrains {
                            source: Some(candidate),
                            spec: constraint,
                            target: decided,
                        });
                        violated = true;
                        break;
                    }
                }
                next_state
                    .constraints
                    .entry(constrained_name)
                    .or_default()
                    .push((constraint, Some(candidate)));
            }
            if violated {
                continue;
            }

            let mut next_queue = queue.clone();
            for &dependency in &solvable.dependencies {
                next_queue.push(Requirement {
                    spec: dependency,
                    source: Some(candidate),
                });
            }

            match self.resolve(context, next_state, next_queue, depth + 1) {
                Ok(state) => return Ok(state),
                Err(problems) => failures.extend(problems),
            }
        }

        let mut problems = self.requirement_problem(&requirement);
        problems.extend(policy_problems);
        problems.extend(failures);
        Err(problems)
    }

    /// Candidates for a requirement, honoring locks, pins and channel
    /// priority, ordered best-first.
    fn candidates_for(
        &self,
        spec_id: SpecId,
        name_id: NameId,
        context: &JobContext,
    ) -> Result<Vec<SolvableId>, Vec<SolveProblem>> {
        // A locked name has exactly one acceptable solvable.
        if let Some(&locked) = context.locked.get(&name_id) {
            let spec = self.pool.resolve_spec(spec_id);
            return if spec.matches(&self.pool.resolve_solvable(locked).record) {
                Ok(vec![locked])
            } else {
                Err(vec![
                    SolveProblem::Requires {
                        source: None,
                        spec: spec_id,
                    },
                    SolveProblem::Locked { solvable: locked },
                ])
            };
        }

        let mut candidates = self
            .pool
            .candidates(spec_id)
            .map_err(|message| {
                vec![SolveProblem::NamespaceError {
                    spec: spec_id,
                    message,
                }]
            })?
            .into_iter()
            .filter(|candidate| !context.forbidden.contains(candidate))
            .collect::<Vec<_>>();

        // Strict channel priority: for this name, drop candidates from any
        // repo with a lower priority than the best non-installed repo.
        if self.flags.channel_priority == ChannelPriority::Strict {
            let best = candidates
                .iter()
                .filter(|&&id| !self.pool.is_installed_repo(self.pool.resolve_solvable(id).repo))
                .map(|&id| self.pool.repo_priority(self.pool.resolve_solvable(id).repo).0)
                .max();
            if let Some(best) = best {
                candidates.retain(|&id| {
                    let repo = self.pool.resolve_solvable(id).repo;
                    self.pool.is_installed_repo(repo) || self.pool.repo_priority(repo).0 == best
                });
            }
        }

        candidates.sort_by(|&a, &b| self.compare_candidates(a, b, name_id, context));
        Ok(candidates)
    }

    /// Orders two candidates best-first: the installed solvable wins unless
    /// the name is being updated, then priority/version/build per the
    /// channel-priority mode.
    fn compare_candidates(
        &self,
        a: SolvableId,
        b: SolvableId,
        name_id: NameId,
        context: &JobContext,
    ) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        let favor_installed = !context.update_names.contains(&name_id);
        let solvable_a = self.pool.resolve_solvable(a);
        let solvable_b = self.pool.resolve_solvable(b);
        let installed_a = self.pool.is_installed_repo(solvable_a.repo);
        let installed_b = self.pool.is_installed_repo(solvable_b.repo);
        if favor_installed && installed_a != installed_b {
            return if installed_a { Ordering::Less } else { Ordering::Greater };
        }

        let record_a = &solvable_a.record.package_record;
        let record_b = &solvable_b.record.package_record;
        let priority_a = self.pool.repo_priority(solvable_a.repo);
        let priority_b = self.pool.repo_priority(solvable_b.repo);

        let by_version = record_b
            .version
            .cmp(&record_a.version)
            .then_with(|| record_b.build_number.cmp(&record_a.build_number))
            .then_with(|| record_b.timestamp.cmp(&record_a.timestamp));

        match self.flags.channel_priority {
            // Strict already filtered repos; priority only breaks ties.
            ChannelPriority::Strict => by_version.then_with(|| priority_b.cmp(&priority_a)),
            ChannelPriority::Flexible => by_version.then_with(|| priority_b.cmp(&priority_a)),
            ChannelPriority::Disabled => by_version,
        }
    }

    /// Applies install policies to one candidate, returning the problem that
    /// rejects it.
    fn policy_rejection(
        &self,
        candidate: SolvableId,
        name_id: NameId,
        requirement: &Requirement,
        context: &JobContext,
    ) -> Option<SolveProblem> {
        let &installed = context.installed.get(&name_id)?;
        if installed == candidate {
            return None;
        }
        let installed_record = &self.pool.resolve_solvable(installed).record.package_record;
        let candidate_record = &self.pool.resolve_solvable(candidate).record.package_record;
        let is_downgrade = candidate_record.version < installed_record.version;
        let explicit = requirement.source.is_none();
        if is_downgrade
            && !explicit
            && !self.flags.allow_downgrade
            && !self.flags.allow_uninstall
        {
            return Some(SolveProblem::NotInstallable {
                solvable: candidate,
                reason: "downgrade-forbidden",
            });
        }
        None
    }

    /// Checks the constraints registered for a name against a candidate.
    fn constraint_violation(
        &self,
        state: &State,
        name_id: NameId,
        candidate: SolvableId,
    ) -> Option<SolveProblem> {
        let record = &self.pool.resolve_solvable(candidate).record;
        for &(spec_id, source) in state.constraints.get(&name_id)?.iter() {
            if !self.pool.resolve_spec(spec_id).matches(record) {
                return Some(SolveProblem::Constrains {
                    source,
                    spec: spec_id,
                    target: candidate,
                });
            }
        }
        None
    }

    fn requirement_problem(&self, requirement: &Requirement) -> Vec<SolveProblem> {
        match requirement.source {
            None => vec![
                SolveProblem::Job {
                    spec: requirement.spec,
                },
                SolveProblem::Requires {
                    source: None,
                    spec: requirement.spec,
                },
            ],
            Some(source) => vec![SolveProblem::Requires {
                source: Some(source),
                spec: requirement.spec,
            }],
        }
    }

    fn nothing_provides(&self, requirement: &Requirement) -> Vec<SolveProblem> {
        vec![SolveProblem::NothingProvides {
            source: requirement.source,
            spec: requirement.spec,
        }]
    }

    /// Computes the target state: installed packages, minus removals, with
    /// every decision applied on top.
    fn build_result(
        &self,
        state: State,
        reinstall_names: std::collections::HashSet<String>,
        explicit_names: std::collections::HashSet<String>,
    ) -> SolverResult {
        let mut desired: HashMap<NameId, SolvableId> = HashMap::new();
        for (&name, &solvable) in &state.decisions {
            desired.insert(name, solvable);
        }
        for (&name, &solvable) in &self.pool.installed_by_name() {
            if !state.removed.contains(&name) {
                desired.entry(name).or_insert(solvable);
            }
        }

        let mut records: Vec<RepoDataRecord> = desired
            .values()
            .map(|&id| self.pool.resolve_solvable(id).record.clone())
            .collect();
        records.sort_by(|a, b| a.package_record.name.cmp(&b.package_record.name));

        SolverResult {
            desired: records,
            reinstall_names,
            explicit_names,
        }
    }
}

/// Renders the problems of an unsatisfiable solve as a merged graph report.
pub fn render_unsolvable(pool: &Pool, unsolvable: &Unsolvable) -> String {
    ProblemGraph::from_problems(pool, &unsolvable.problems).to_report(pool)
}
