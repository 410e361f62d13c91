//! The platforms (subdirs) a channel can serve packages for.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A platform a package can be built for, corresponding to a channel subdir.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Platform {
    NoArch,
    Linux32,
    Linux64,
    LinuxAarch64,
    LinuxPpc64le,
    Osx64,
    OsxArm64,
    Win32,
    Win64,
    WinArm64,
}

impl Platform {
    /// Returns the platform this binary was built for.
    pub const fn current() -> Platform {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        return Platform::Linux64;
        #[cfg(all(target_os = "linux", target_arch = "x86"))]
        return Platform::Linux32;
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        return Platform::LinuxAarch64;
        #[cfg(all(target_os = "linux", target_arch = "powerpc64le"))]
        return Platform::LinuxPpc64le;
        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        return Platform::Osx64;
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        return Platform::OsxArm64;
        #[cfg(all(target_os = "windows", target_arch = "x86"))]
        return Platform::Win32;
        #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
        return Platform::Win64;
        #[cfg(all(target_os = "windows", target_arch = "aarch64"))]
        return Platform::WinArm64;
    }

    /// Returns the subdir name of the platform, e.g. `linux-64`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Platform::NoArch => "noarch",
            Platform::Linux32 => "linux-32",
            Platform::Linux64 => "linux-64",
            Platform::LinuxAarch64 => "linux-aarch64",
            Platform::LinuxPpc64le => "linux-ppc64le",
            Platform::Osx64 => "osx-64",
            Platform::OsxArm64 => "osx-arm64",
            Platform::Win32 => "win-32",
            Platform::Win64 => "win-64",
            Platform::WinArm64 => "win-arm64",
        }
    }

    /// Returns true for any windows platform.
    pub const fn is_windows(self) -> bool {
        matches!(self, Platform::Win32 | Platform::Win64 | Platform::WinArm64)
    }

    /// Returns the default platform set for this process: the current
    /// platform and `noarch`.
    pub const fn defaults() -> &'static [Platform] {
        const DEFAULTS: [Platform; 2] = [Platform::current(), Platform::NoArch];
        &DEFAULTS
    }
}

/// An error that occurred while parsing a [`Platform`] from a string.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("'{string}' is not a known platform")]
pub struct ParsePlatformError {
    /// The unrecognized input.
    pub string: String,
}

impl FromStr for Platform {
    type Err = ParsePlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "noarch" => Platform::NoArch,
            "linux-32" => Platform::Linux32,
            "linux-64" => Platform::Linux64,
            "linux-aarch64" => Platform::LinuxAarch64,
            "linux-ppc64le" => Platform::LinuxPpc64le,
            "osx-64" => Platform::Osx64,
            "osx-arm64" => Platform::OsxArm64,
            "win-32" => Platform::Win32,
            "win-64" => Platform::Win64,
            "win-arm64" => Platform::WinArm64,
            string => {
                return Err(ParsePlatformError {
                    string: string.to_owned(),
                })
            }
        })
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Platform::from_str(&str).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for platform in [
            Platform::NoArch,
            Platform::Linux64,
            Platform::OsxArm64,
            Platform::Win64,
        ] {
            assert_eq!(Platform::from_str(platform.as_str()), Ok(platform));
        }
        assert!(Platform::from_str("amiga-500").is_err());
    }

    #[test]
    fn defaults_include_noarch() {
        assert!(Platform::defaults().contains(&Platform::NoArch));
        assert!(Platform::defaults().contains(&Platform::current()));
    }
}
