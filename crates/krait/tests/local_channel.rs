//! End-to-end: install a package from a local file channel into a fresh
//! prefix, then verify the prefix state and that a second solve is a no-op.

use std::path::Path;

use krait::{execute, plan, ExecuteOptions, PlanOptions};
use krait_conda_types::{ChannelContext, History, MatchSpec, Platform, PrefixData};
use krait_digest::{compute_file_digest, Sha256};
use krait_fetch::{MultiDownload, SubdirConfig};
use krait_solve::{SolveJob, SolverFlags};

fn downloader() -> MultiDownload {
    MultiDownload::with_defaults(reqwest_middleware::ClientWithMiddleware::from(
        reqwest::Client::new(),
    ))
}

/// Builds a channel directory with one noarch package.
fn build_channel(root: &Path) -> std::path::PathBuf {
    let channel = root.join("channel");
    let noarch = channel.join("noarch");
    fs_err::create_dir_all(&noarch).unwrap();

    // The package archive.
    let archive = noarch.join("demo-1.0-0.tar.bz2");
    {
        let file = fs_err::File::create(&archive).unwrap();
        let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in [
            ("bin/demo", "#!/bin/sh\necho demo\n".as_bytes()),
            (
                "info/index.json",
                br#"{"name": "demo", "version": "1.0", "build": "0", "build_number": 0, "subdir": "noarch"}"# as &[u8],
            ),
            (
                "info/paths.json",
                br#"{"paths": [{"_path": "bin/demo", "path_type": "hardlink", "size_in_bytes": 20}], "paths_version": 1}"#,
            ),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    let size = fs_err::metadata(&archive).unwrap().len();
    let sha256 = compute_file_digest::<Sha256>(&archive).unwrap();
    fs_err::write(
        noarch.join("repodata.json"),
        format!(
            r#"{{
                "info": {{ "subdir": "noarch" }},
                "packages": {{
                    "demo-1.0-0.tar.bz2": {{
                        "name": "demo",
                        "version": "1.0",
                        "build": "0",
                        "build_number": 0,
                        "subdir": "noarch",
                        "depends": [],
                        "size": {size},
                        "sha256": "{sha256:x}"
                    }}
                }},
                "packages.conda": {{}}
            }}"#
        ),
    )
    .unwrap();

    channel
}

#[tokio::test]
async fn install_from_local_channel_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let channel_dir = build_channel(root.path());
    let prefix = root.path().join("env");
    let cache_dir = root.path().join("pkgs");
    let cache = krait_cache::PackageCache::at(&cache_dir).unwrap();

    let context = ChannelContext::builder()
        .with_root_dir(root.path().to_path_buf())
        .build()
        .unwrap();
    let options = PlanOptions {
        channels: vec![channel_dir.to_string_lossy().into_owned()],
        platforms: vec![Platform::current()],
        flags: SolverFlags::default(),
    };
    let subdir_config = SubdirConfig::new(cache_dir.join("cache"));
    let downloader = downloader();

    let jobs = vec![SolveJob::Install(
        "demo".parse::<MatchSpec>().unwrap(),
    )];
    let plan_result = plan(
        &context,
        &prefix,
        jobs.clone(),
        &options,
        &subdir_config,
        &downloader,
    )
    .await
    .unwrap();

    let installs: Vec<_> = plan_result
        .transaction
        .records_to_install()
        .map(|r| r.package_record.dist_str())
        .collect();
    assert_eq!(installs, ["demo-1.0-0"]);

    execute(
        &plan_result.transaction,
        &prefix,
        Platform::current(),
        &cache,
        &downloader,
        &ExecuteOptions {
            command_line: Some("install demo".to_owned()),
            requested_specs: vec!["demo".to_owned()],
            ..ExecuteOptions::default()
        },
    )
    .await
    .unwrap();

    // Every installed step left a prefix record and its files.
    assert_eq!(
        fs_err::read_to_string(prefix.join("bin/demo")).unwrap(),
        "#!/bin/sh\necho demo\n"
    );
    let prefix_data = PrefixData::from_prefix(&prefix).unwrap();
    assert!(prefix_data.get("demo").is_some());

    // The request is in the history.
    let history = History::from_prefix(&prefix).parse().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].link_dists, vec!["demo-1.0-0"]);

    // Planning the same request again is a no-op: the installed package
    // satisfies the spec.
    let second = plan(
        &context,
        &prefix,
        jobs,
        &options,
        &subdir_config,
        &downloader,
    )
    .await
    .unwrap();
    assert!(second.transaction.is_empty());

    // Removing it empties the prefix again.
    let removal = plan(
        &context,
        &prefix,
        vec![SolveJob::Remove("demo".parse::<MatchSpec>().unwrap())],
        &options,
        &subdir_config,
        &downloader,
    )
    .await
    .unwrap();
    execute(
        &removal.transaction,
        &prefix,
        Platform::current(),
        &cache,
        &downloader,
        &ExecuteOptions::default(),
    )
    .await
    .unwrap();
    assert!(!prefix.join("bin/demo").exists());
    assert!(PrefixData::from_prefix(&prefix).unwrap().is_empty());
    assert_eq!(History::from_prefix(&prefix).parse().unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_package_reports_unsatisfiable() {
    let root = tempfile::tempdir().unwrap();
    let channel_dir = build_channel(root.path());
    let prefix = root.path().join("env");

    let context = ChannelContext::builder()
        .with_root_dir(root.path().to_path_buf())
        .build()
        .unwrap();
    let options = PlanOptions {
        channels: vec![channel_dir.to_string_lossy().into_owned()],
        platforms: vec![Platform::current()],
        flags: SolverFlags::default(),
    };
    let subdir_config = SubdirConfig::new(root.path().join("pkgs/cache"));

    let result = plan(
        &context,
        &prefix,
        vec![SolveJob::Install("missing-package".parse::<MatchSpec>().unwrap())],
        &options,
        &subdir_config,
        &downloader(),
    )
    .await;

    let err = result.err().expect("the solve must fail");
    assert_eq!(err.exit_status(), krait::ExitStatus::Unsatisfiable);
    assert!(err.to_string().contains("missing-package"));
}
