//! High-level planning: from channels and jobs to an executable transaction.
//!
//! This is the seam the CLI layers sit on: resolve the channel identifiers,
//! fetch the repodata of every subdir, assemble the solver pool (channel
//! order determines priority, the prefix contributes the installed repo),
//! run the solver, and hand back the ordered transaction together with the
//! installed records it diffs against.

use std::path::Path;

use krait_conda_types::{ChannelContext, Platform, PrefixData, RepoDataRecord};
use krait_fetch::{subdir::fetch_channel, MultiDownload, SubdirConfig};
use krait_solve::{
    render_unsolvable, Pool, SolveError, SolveJob, Solver, SolverFlags, Transaction,
};

use crate::KraitError;

/// Everything a planning run needs to know.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Channel identifiers in priority order (highest first).
    pub channels: Vec<String>,
    /// The platforms to fetch; `noarch` is always included.
    pub platforms: Vec<Platform>,
    /// Flags forwarded to the solver.
    pub flags: SolverFlags,
}

/// The outcome of planning: the transaction plus the installed records it
/// was diffed against.
#[derive(Debug)]
pub struct Plan {
    /// The ordered transaction to execute.
    pub transaction: Transaction,
    /// The records that were installed when the plan was computed.
    pub installed: Vec<RepoDataRecord>,
}

/// Resolves channels, fetches their repodata, and solves the jobs into a
/// transaction against the prefix.
pub async fn plan(
    context: &ChannelContext,
    prefix: &Path,
    jobs: Vec<SolveJob>,
    options: &PlanOptions,
    subdir_config: &SubdirConfig,
    downloader: &MultiDownload,
) -> Result<Plan, KraitError> {
    let mut pool = Pool::new();

    // Earlier channels win: priority decreases down the list.
    let channel_count = options.channels.len() as i32;
    for (index, channel_spec) in options.channels.iter().enumerate() {
        for channel in context.resolve(channel_spec)? {
            let priority = channel_count - index as i32;
            let repo = pool.add_repo(priority, 0);
            let subdirs =
                fetch_channel(&channel, &options.platforms, subdir_config, downloader).await?;
            for (platform, repo_data) in subdirs {
                for record in repo_data.into_repo_data_records(&channel, platform) {
                    pool.add_record(repo, record);
                }
            }
            pool.internalize(repo);
        }
    }

    // The prefix contributes the installed repo.
    let prefix_data = PrefixData::from_prefix(prefix).map_err(into_io)?;
    let installed: Vec<RepoDataRecord> = prefix_data
        .into_records()
        .into_iter()
        .map(|record| record.repodata_record)
        .collect();
    let installed_repo = pool.add_repo(i32::MAX, 0);
    pool.set_installed_repo(installed_repo);
    for record in &installed {
        pool.add_record(installed_repo, record.clone());
    }
    pool.internalize(installed_repo);

    let result = Solver::new(&mut pool, options.flags.clone()).solve(jobs);
    let result = match result {
        Ok(result) => result,
        Err(SolveError::Unsolvable(unsolvable)) => {
            return Err(KraitError::Unsatisfiable {
                report: render_unsolvable(&pool, &unsolvable),
            })
        }
        Err(SolveError::UnsatisfiablePin(pin)) => return Err(KraitError::UnsatisfiablePin(pin)),
    };

    Ok(Plan {
        transaction: result.into_transaction(installed.clone(), &options.flags),
        installed,
    })
}

fn into_io(error: krait_conda_types::PrefixDataError) -> KraitError {
    KraitError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, error))
}
