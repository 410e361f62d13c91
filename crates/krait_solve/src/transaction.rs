//! Turning a solved target state into an ordered list of transaction steps.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::str::FromStr;

use krait_conda_types::{MatchSpec, RepoDataRecord};

use crate::SolverFlags;

/// One step of a transaction.
#[derive(Debug, Clone)]
pub enum TransactionStep {
    /// Install a package that was not present before.
    Install(RepoDataRecord),
    /// Remove an installed package.
    Remove(RepoDataRecord),
    /// Replace an installed package by one with the same version but a
    /// different build or origin.
    Change {
        /// The installed record to remove.
        old: RepoDataRecord,
        /// The record to install instead.
        new: RepoDataRecord,
    },
    /// Remove and relink the exact same package.
    Reinstall(RepoDataRecord),
    /// Replace an installed package by a newer version.
    Upgraded {
        /// The installed record to remove.
        old: RepoDataRecord,
        /// The newer record to install.
        new: RepoDataRecord,
    },
    /// Replace an installed package by an older version.
    Downgraded {
        /// The installed record to remove.
        old: RepoDataRecord,
        /// The older record to install.
        new: RepoDataRecord,
    },
    /// A step that was filtered out (e.g. by `no_deps`) and must not be
    /// executed.
    Ignore(RepoDataRecord),
}

impl TransactionStep {
    /// The record that ends up installed by this step, if any.
    pub fn record_to_install(&self) -> Option<&RepoDataRecord> {
        match self {
            TransactionStep::Install(new)
            | TransactionStep::Change { new, .. }
            | TransactionStep::Upgraded { new, .. }
            | TransactionStep::Downgraded { new, .. } => Some(new),
            TransactionStep::Reinstall(record) => Some(record),
            TransactionStep::Remove(_) | TransactionStep::Ignore(_) => None,
        }
    }

    /// The installed record removed by this step, if any.
    pub fn record_to_remove(&self) -> Option<&RepoDataRecord> {
        match self {
            TransactionStep::Remove(old)
            | TransactionStep::Change { old, .. }
            | TransactionStep::Upgraded { old, .. }
            | TransactionStep::Downgraded { old, .. } => Some(old),
            TransactionStep::Reinstall(record) => Some(record),
            TransactionStep::Install(_) | TransactionStep::Ignore(_) => None,
        }
    }

    /// The package name this step concerns.
    pub fn name(&self) -> &str {
        match self {
            TransactionStep::Install(r)
            | TransactionStep::Remove(r)
            | TransactionStep::Reinstall(r)
            | TransactionStep::Ignore(r) => &r.package_record.name,
            TransactionStep::Change { new, .. }
            | TransactionStep::Upgraded { new, .. }
            | TransactionStep::Downgraded { new, .. } => &new.package_record.name,
        }
    }
}

/// An ordered, executable plan: every step's prerequisites precede it.
#[derive(Debug, Default)]
pub struct Transaction {
    /// The ordered steps.
    pub steps: Vec<TransactionStep>,
}

impl Transaction {
    /// Diffs the current against the desired state and orders the result:
    /// removals first (dependees before dependencies), then installs in
    /// dependency order, stable by name within a rank.
    ///
    /// `reinstall_names` forces a reinstall step for unchanged packages;
    /// `explicit_names` are the names of the user's own specs, used by the
    /// `no_deps`/`only_deps` filters.
    pub fn from_current_and_desired(
        current: Vec<RepoDataRecord>,
        desired: Vec<RepoDataRecord>,
        reinstall_names: &HashSet<String>,
        explicit_names: &HashSet<String>,
        flags: &SolverFlags,
    ) -> Self {
        let mut desired_by_name: BTreeMap<String, RepoDataRecord> = desired
            .into_iter()
            .map(|record| (record.package_record.name.clone(), record))
            .collect();

        let mut removals = Vec::new();
        let mut replacements = Vec::new();
        for record in current {
            let name = record.package_record.name.clone();
            match desired_by_name.remove(&name) {
                None => removals.push(TransactionStep::Remove(record)),
                Some(target) => {
                    if records_equivalent(&record, &target) {
                        if reinstall_names.contains(&name) {
                            replacements.push(TransactionStep::Reinstall(target));
                        }
                    } else {
                        let old_version = &record.package_record.version;
                        let new_version = &target.package_record.version;
                        let step = if new_version > old_version {
                            TransactionStep::Upgraded {
                                old: record,
                                new: target,
                            }
                        } else if new_version < old_version {
                            TransactionStep::Downgraded {
                                old: record,
                                new: target,
                            }
                        } else {
                            TransactionStep::Change {
                                old: record,
                                new: target,
                            }
                        };
                        replacements.push(step);
                    }
                }
            }
        }

        let installs: Vec<TransactionStep> = desired_by_name
            .into_values()
            .map(TransactionStep::Install)
            .collect();

        // Removals run first. Install-like steps are topologically sorted by
        // their dependency edges.
        removals.sort_by(|a, b| a.name().cmp(b.name()));
        let mut steps = removals;
        steps.extend(sort_by_dependencies(
            replacements.into_iter().chain(installs).collect(),
        ));

        let mut transaction = Self { steps };
        transaction.apply_filters(explicit_names, flags);
        transaction
    }

    /// Applies the `no_deps`/`only_deps` filters by downgrading filtered
    /// steps to [`TransactionStep::Ignore`].
    fn apply_filters(&mut self, explicit_names: &HashSet<String>, flags: &SolverFlags) {
        if !flags.no_deps && !flags.only_deps {
            return;
        }
        for step in &mut self.steps {
            let explicit = explicit_names.contains(step.name());
            let keep = if flags.no_deps { explicit } else { !explicit };
            if !keep {
                let record = step
                    .record_to_install()
                    .or_else(|| step.record_to_remove())
                    .expect("every step names a record")
                    .clone();
                *step = TransactionStep::Ignore(record);
            }
        }
    }

    /// True when nothing has to be done.
    pub fn is_empty(&self) -> bool {
        self.steps
            .iter()
            .all(|step| matches!(step, TransactionStep::Ignore(_)))
    }

    /// The records removed by this transaction.
    pub fn records_to_remove(&self) -> impl Iterator<Item = &RepoDataRecord> {
        self.steps.iter().filter_map(TransactionStep::record_to_remove)
    }

    /// The records installed by this transaction.
    pub fn records_to_install(&self) -> impl Iterator<Item = &RepoDataRecord> {
        self.steps.iter().filter_map(TransactionStep::record_to_install)
    }
}

/// Two records are the same package when name, version, build and origin all
/// agree.
fn records_equivalent(a: &RepoDataRecord, b: &RepoDataRecord) -> bool {
    a.package_record.name == b.package_record.name
        && a.package_record.version == b.package_record.version
        && a.package_record.build == b.package_record.build
        && (a.url == b.url || a.channel == b.channel)
}

/// Kahn's algorithm over the name-level dependency edges of the install
/// steps. Within a rank, steps are ordered by name; cycles (which conda
/// packages do produce) are broken by falling back to name order for the
/// remainder.
fn sort_by_dependencies(steps: Vec<TransactionStep>) -> Vec<TransactionStep> {
    let mut steps = steps;
    steps.sort_by(|a, b| a.name().cmp(b.name()));

    let name_to_index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(index, step)| (step.name(), index))
        .collect();

    // edge a -> b: a must be linked before b (b depends on a).
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let mut in_degree = vec![0usize; steps.len()];
    for (index, step) in steps.iter().enumerate() {
        let Some(record) = step.record_to_install() else {
            continue;
        };
        for dep in &record.package_record.depends {
            let Ok(spec) = MatchSpec::from_str(dep) else {
                continue;
            };
            let Some(dep_name) = spec.name.as_deref() else {
                continue;
            };
            if let Some(&dep_index) = name_to_index.get(dep_name) {
                if dep_index != index {
                    dependents[dep_index].push(index);
                    in_degree[index] += 1;
                }
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }
    // Anything left is part of a cycle; append in name order.
    for index in 0..steps.len() {
        if !order.contains(&index) {
            order.push(index);
        }
    }

    let mut slots: Vec<Option<TransactionStep>> = steps.into_iter().map(Some).collect();
    order
        .into_iter()
        .map(|index| slots[index].take().expect("each index appears once"))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use krait_conda_types::{PackageRecord, Version};
    use url::Url;

    use super::*;

    fn record(name: &str, version: &str, depends: &[&str]) -> RepoDataRecord {
        let mut package_record = PackageRecord::new(name, Version::from_str(version).unwrap(), "0");
        package_record.depends = depends.iter().map(|d| (*d).to_owned()).collect();
        RepoDataRecord {
            file_name: format!("{name}-{version}-0.tar.bz2"),
            url: Url::parse(&format!("https://example.com/{name}-{version}-0.tar.bz2")).unwrap(),
            channel: "test".to_owned(),
            package_record,
        }
    }

    #[test]
    fn no_change_yields_empty_transaction() {
        let transaction = Transaction::from_current_and_desired(
            vec![record("a", "1.0", &[])],
            vec![record("a", "1.0", &[])],
            &HashSet::new(),
            &HashSet::new(),
            &SolverFlags::default(),
        );
        assert!(transaction.is_empty());
    }

    #[test]
    fn upgrade_and_downgrade_are_classified() {
        let transaction = Transaction::from_current_and_desired(
            vec![record("a", "1.0", &[]), record("b", "2.0", &[])],
            vec![record("a", "2.0", &[]), record("b", "1.0", &[])],
            &HashSet::new(),
            &HashSet::new(),
            &SolverFlags::default(),
        );
        assert!(transaction
            .steps
            .iter()
            .any(|s| matches!(s, TransactionStep::Upgraded { .. })));
        assert!(transaction
            .steps
            .iter()
            .any(|s| matches!(s, TransactionStep::Downgraded { .. })));
    }

    #[test]
    fn installs_follow_dependency_order() {
        let transaction = Transaction::from_current_and_desired(
            vec![],
            vec![
                record("app", "1.0", &["lib", "runtime"]),
                record("lib", "1.0", &["runtime"]),
                record("runtime", "1.0", &[]),
            ],
            &HashSet::new(),
            &HashSet::new(),
            &SolverFlags::default(),
        );
        let names: Vec<_> = transaction.steps.iter().map(TransactionStep::name).collect();
        assert_eq!(names, ["runtime", "lib", "app"]);
    }

    #[test]
    fn removals_run_before_installs() {
        let transaction = Transaction::from_current_and_desired(
            vec![record("old", "1.0", &[])],
            vec![record("new", "1.0", &[])],
            &HashSet::new(),
            &HashSet::new(),
            &SolverFlags::default(),
        );
        assert!(matches!(transaction.steps[0], TransactionStep::Remove(_)));
        assert!(matches!(transaction.steps[1], TransactionStep::Install(_)));
    }

    #[test]
    fn reinstall_names_force_a_step() {
        let reinstall: HashSet<String> = ["a".to_owned()].into();
        let transaction = Transaction::from_current_and_desired(
            vec![record("a", "1.0", &[])],
            vec![record("a", "1.0", &[])],
            &reinstall,
            &HashSet::new(),
            &SolverFlags::default(),
        );
        assert!(matches!(
            transaction.steps[0],
            TransactionStep::Reinstall(_)
        ));
    }

    #[test]
    fn no_deps_ignores_dependency_steps() {
        let explicit: HashSet<String> = ["app".to_owned()].into();
        let flags = SolverFlags {
            no_deps: true,
            ..SolverFlags::default()
        };
        let transaction = Transaction::from_current_and_desired(
            vec![],
            vec![record("app", "1.0", &["lib"]), record("lib", "1.0", &[])],
            &HashSet::new(),
            &explicit,
            &flags,
        );
        let ignored: Vec<_> = transaction
            .steps
            .iter()
            .filter(|s| matches!(s, TransactionStep::Ignore(_)))
            .map(|s| s.name())
            .collect();
        assert_eq!(ignored, ["lib"]);
    }

    #[test]
    fn cycles_do_not_lose_steps() {
        let transaction = Transaction::from_current_and_desired(
            vec![],
            vec![record("a", "1.0", &["b"]), record("b", "1.0", &["a"])],
            &HashSet::new(),
            &HashSet::new(),
            &SolverFlags::default(),
        );
        assert_eq!(transaction.steps.len(), 2);
    }
}
