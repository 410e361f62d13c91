#![deny(missing_docs)]

//! `krait_conda_types` defines the data model shared by all krait crates:
//! versions and version ranges, match specs, channels and their resolution
//! context, repodata records, package archive metadata, and the on-disk state
//! of an installed prefix (records, environment state, history).
//!
//! The types in this crate are plain values; all I/O beyond reading and
//! writing their canonical file formats lives in the higher-level crates.

pub mod build_spec;
mod channel;
mod config;
mod history;
mod match_spec;
pub mod package;
mod platform;
mod prefix_data;
mod prefix_record;
mod repo_data;
mod string_matcher;
mod version;
mod version_spec;

pub use build_spec::{BuildNumberSpec, OrdOperator, ParseBuildNumberSpecError};
pub use channel::{
    AuthenticationDatabase, Channel, ChannelContext, ChannelContextBuilder, Credentials,
    ParseChannelError, DEFAULT_CHANNEL_ALIAS,
};
pub use config::{channels_from_env, pkgs_dirs_from_env, ConfigValue};
pub use history::{History, HistoryError, HistoryEntry, UserRequest};
pub use match_spec::{MatchSpec, ParseMatchSpecError};
pub use platform::{ParsePlatformError, Platform};
pub use prefix_data::{PrefixData, PrefixDataError, PrefixState};
pub use prefix_record::{Link, LinkType, PathsEntry as PrefixPathsEntry, PrefixRecord};
pub use repo_data::{ChannelInfo, PackageRecord, RepoData, RepoDataRecord};
pub use string_matcher::{StringMatcher, StringMatcherParseError};
pub use version::{ParseVersionError, Version};
pub use version_spec::{
    LogicalOperator, ParseVersionSpecError, RangeOperator, VersionOperator, VersionSpec,
};
