//! The package universe for one solve: repos, solvables and interned
//! names/specs.

use std::str::FromStr;

use ahash::{HashMap, HashMapExt};
use krait_conda_types::{MatchSpec, RepoDataRecord};

use crate::id::{NameId, RepoId, SolvableId, SpecId};

/// The answer of a namespace callback.
#[derive(Debug, Clone)]
pub enum NamespaceAnswer {
    /// The callback provides these candidates for the dependency.
    Candidates(Vec<SolvableId>),
    /// The callback does not know the dependency.
    NotFound,
    /// The callback failed; the solver surfaces this as an unresolvable
    /// dependency.
    Error(String),
}

/// A callback consulted for dependencies whose name is not in the pool.
pub type NamespaceCallback = Box<dyn Fn(&Pool, NameId, SpecId) -> NamespaceAnswer>;

/// One package record registered in the pool.
#[derive(Debug)]
pub struct Solvable {
    /// The record this solvable was built from.
    pub record: RepoDataRecord,
    /// The repo the solvable belongs to.
    pub repo: RepoId,
    /// The interned name.
    pub name: NameId,
    /// Interned specs of `depends`.
    pub dependencies: Vec<SpecId>,
    /// Interned specs of `constrains`.
    pub constrains: Vec<SpecId>,
}

struct Repo {
    priority: i32,
    subpriority: i32,
    installed: bool,
    internalized: bool,
    pending: Vec<SolvableId>,
}

/// The solver's package universe. Owned by one solve call; all ids are only
/// meaningful within the pool that issued them.
#[derive(Default)]
pub struct Pool {
    solvables: Vec<Solvable>,
    repos: Vec<Repo>,
    names: Vec<String>,
    names_to_ids: HashMap<String, NameId>,
    packages_by_name: Vec<Vec<SolvableId>>,
    specs: Vec<MatchSpec>,
    specs_to_ids: HashMap<String, SpecId>,
    installed_repo: Option<RepoId>,
    namespace_callback: Option<NamespaceCallback>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("solvables", &self.solvables.len())
            .field("repos", &self.repos.len())
            .field("names", &self.names.len())
            .finish()
    }
}

impl Pool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new repo with the given priority. Higher priorities are
    /// preferred; the subpriority breaks ties.
    pub fn add_repo(&mut self, priority: i32, subpriority: i32) -> RepoId {
        let id = RepoId::new(self.repos.len());
        self.repos.push(Repo {
            priority,
            subpriority,
            installed: false,
            internalized: false,
            pending: Vec::new(),
        });
        id
    }

    /// Marks a repo as the `installed` repo: its packages are treated as
    /// currently present in the prefix.
    pub fn set_installed_repo(&mut self, repo: RepoId) {
        self.repos[repo.index()].installed = true;
        self.installed_repo = Some(repo);
    }

    /// The designated installed repo, if any.
    pub fn installed_repo(&self) -> Option<RepoId> {
        self.installed_repo
    }

    /// Adds a record to a repo. The solvable only becomes visible to queries
    /// once the repo is [internalized](Pool::internalize). Records whose
    /// dependency specs cannot be parsed are skipped with a warning.
    pub fn add_record(&mut self, repo: RepoId, record: RepoDataRecord) -> Option<SolvableId> {
        let mut dependencies = Vec::with_capacity(record.package_record.depends.len());
        for dep in &record.package_record.depends {
            match self.intern_spec(dep) {
                Some(spec) => dependencies.push(spec),
                None => {
                    tracing::warn!(
                        package = %record.package_record,
                        dependency = dep,
                        "skipping record with unparseable dependency"
                    );
                    return None;
                }
            }
        }
        let mut constrains = Vec::with_capacity(record.package_record.constrains.len());
        for constraint in &record.package_record.constrains {
            match self.intern_spec(constraint) {
                Some(spec) => constrains.push(spec),
                None => {
                    tracing::warn!(
                        package = %record.package_record,
                        constraint,
                        "ignoring unparseable constraint"
                    );
                }
            }
        }

        let name = self.intern_name(&record.package_record.name);
        let id = SolvableId::new(self.solvables.len());
        self.solvables.push(Solvable {
            record,
            repo,
            name,
            dependencies,
            constrains,
        });
        self.repos[repo.index()].pending.push(id);
        Some(id)
    }

    /// Makes all records of a repo visible to queries.
    pub fn internalize(&mut self, repo: RepoId) {
        let pending = std::mem::take(&mut self.repos[repo.index()].pending);
        for id in pending {
            let name = self.solvables[id.index()].name;
            self.packages_by_name[name.index()].push(id);
        }
        self.repos[repo.index()].internalized = true;
    }

    /// Installs the namespace callback consulted for dependencies the pool
    /// does not know.
    pub fn set_namespace_callback(&mut self, callback: NamespaceCallback) {
        self.namespace_callback = Some(callback);
    }

    /// Interns a package name.
    pub fn intern_name(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.names_to_ids.get(name) {
            return id;
        }
        let id = NameId::new(self.names.len());
        self.names.push(name.to_owned());
        self.packages_by_name.push(Vec::new());
        self.names_to_ids.insert(name.to_owned(), id);
        id
    }

    /// Looks up an already-interned package name.
    pub fn lookup_name(&self, name: &str) -> Option<NameId> {
        self.names_to_ids.get(name).copied()
    }

    /// Interns a match spec, returning `None` when it cannot be parsed.
    pub fn intern_spec(&mut self, spec_str: &str) -> Option<SpecId> {
        if let Some(&id) = self.specs_to_ids.get(spec_str) {
            return Some(id);
        }
        let spec = MatchSpec::from_str(spec_str).ok()?;
        // Make sure the spec's name is interned so candidate lookups work
        // even for names no repo provides.
        if let Some(name) = &spec.name {
            self.intern_name(name);
        }
        let id = SpecId::new(self.specs.len());
        self.specs.push(spec);
        self.specs_to_ids.insert(spec_str.to_owned(), id);
        Some(id)
    }

    /// Interns an already-parsed match spec.
    pub fn intern_parsed_spec(&mut self, spec: MatchSpec) -> SpecId {
        let key = spec.to_string();
        if let Some(&id) = self.specs_to_ids.get(&key) {
            return id;
        }
        if let Some(name) = &spec.name {
            self.intern_name(name);
        }
        let id = SpecId::new(self.specs.len());
        self.specs.push(spec);
        self.specs_to_ids.insert(key, id);
        id
    }

    /// Resolves a name id to its string.
    pub fn resolve_name(&self, id: NameId) -> &str {
        &self.names[id.index()]
    }

    /// Resolves a spec id to its parsed spec.
    pub fn resolve_spec(&self, id: SpecId) -> &MatchSpec {
        &self.specs[id.index()]
    }

    /// Resolves a solvable id.
    pub fn resolve_solvable(&self, id: SolvableId) -> &Solvable {
        &self.solvables[id.index()]
    }

    /// The priority pair of a repo.
    pub fn repo_priority(&self, repo: RepoId) -> (i32, i32) {
        let repo = &self.repos[repo.index()];
        (repo.priority, repo.subpriority)
    }

    /// True when the repo is the installed repo.
    pub fn is_installed_repo(&self, repo: RepoId) -> bool {
        self.repos[repo.index()].installed
    }

    /// All internalized solvables carrying the given name, in registration
    /// order. Records of repos that were not internalized are not listed.
    pub fn solvables_by_name(&self, name: NameId) -> &[SolvableId] {
        &self.packages_by_name[name.index()]
    }

    /// All solvables of the pool's installed repo, keyed by name.
    pub fn installed_by_name(&self) -> HashMap<NameId, SolvableId> {
        let mut map = HashMap::new();
        let Some(installed) = self.installed_repo else {
            return map;
        };
        for (index, solvable) in self.solvables.iter().enumerate() {
            if solvable.repo == installed {
                map.insert(solvable.name, SolvableId::new(index));
            }
        }
        map
    }

    /// The solvables matching a spec, in registration order. When the
    /// spec's name is unknown to the pool the namespace callback (if any) is
    /// consulted.
    pub fn candidates(&self, spec_id: SpecId) -> Result<Vec<SolvableId>, String> {
        let spec = self.resolve_spec(spec_id);
        let Some(name) = spec.name.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(name_id) = self.lookup_name(name) else {
            return Ok(Vec::new());
        };

        let known = self.solvables_by_name(name_id);
        if known.is_empty() {
            if let Some(callback) = &self.namespace_callback {
                return match callback(self, name_id, spec_id) {
                    NamespaceAnswer::Candidates(candidates) => Ok(candidates),
                    NamespaceAnswer::NotFound => Ok(Vec::new()),
                    NamespaceAnswer::Error(message) => Err(message),
                };
            }
        }

        Ok(known
            .iter()
            .copied()
            .filter(|&id| spec.matches(&self.solvables[id.index()].record))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use krait_conda_types::{PackageRecord, Version};
    use url::Url;

    use super::*;

    pub(crate) fn record(name: &str, version: &str, depends: &[&str]) -> RepoDataRecord {
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
    fn records_are_invisible_until_internalized() {
        let mut pool = Pool::new();
        let repo = pool.add_repo(0, 0);
        pool.add_record(repo, record("a", "1.0", &[])).unwrap();

        let spec = pool.intern_spec("a").unwrap();
        assert!(pool.candidates(spec).unwrap().is_empty());

        pool.internalize(repo);
        assert_eq!(pool.candidates(spec).unwrap().len(), 1);
    }

    #[test]
    fn candidates_respect_the_spec() {
        let mut pool = Pool::new();
        let repo = pool.add_repo(0, 0);
        pool.add_record(repo, record("a", "1.0", &[])).unwrap();
        pool.add_record(repo, record("a", "2.0", &[])).unwrap();
        pool.internalize(repo);

        let any = pool.intern_spec("a").unwrap();
        assert_eq!(pool.candidates(any).unwrap().len(), 2);

        let exact = pool.intern_spec("a ==2.0").unwrap();
        let candidates = pool.candidates(exact).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            pool.resolve_solvable(candidates[0])
                .record
                .package_record
                .version,
            Version::from_str("2.0").unwrap()
        );
    }

    #[test]
    fn namespace_callback_is_consulted_for_unknown_names() {
        let mut pool = Pool::new();
        let repo = pool.add_repo(0, 0);
        pool.add_record(repo, record("a", "1.0", &[])).unwrap();
        pool.internalize(repo);
        pool.set_namespace_callback(Box::new(|pool, name, _spec| {
            if pool.resolve_name(name) == "virtual-thing" {
                NamespaceAnswer::Candidates(vec![])
            } else {
                NamespaceAnswer::NotFound
            }
        }));

        let spec = pool.intern_spec("virtual-thing").unwrap();
        assert!(pool.candidates(spec).unwrap().is_empty());
    }
}
