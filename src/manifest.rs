//! Package metadata written to `info/index.json`.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::baseline::BaselineProvider;
use crate::error::{PackError, Result};
use crate::FileSet;

/// Path segment marking files installed for a Python interpreter.
pub const SITE_PACKAGES_MARKER: &str = "/site-packages/";

/// Package name of the language runtime.
pub const PYTHON_PACKAGE: &str = "python";

/// Platform and architecture a package is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub platform: String,
    pub arch: String,
}

impl Platform {
    pub fn new(platform: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            arch: arch.into(),
        }
    }

    /// Descriptor of the machine running the packer, in conda naming.
    pub fn host() -> Self {
        let platform = match std::env::consts::OS {
            "macos" => "osx",
            "windows" => "win",
            other => other,
        };
        Self::new(platform, std::env::consts::ARCH)
    }
}

/// `major.minor` of the Python a package was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

impl PythonVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse the first two dot-separated numeric components of `version`.
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = version.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = leading_digits(parts.next()?)?;
        Some(Self { major, minor })
    }

    /// Build-string marker, e.g. `py27`.
    pub fn build_marker(&self) -> String {
        format!("py{}{}", self.major, self.minor)
    }
}

/// Minor components may carry a pre-release suffix (`3.13rc1`).
fn leading_digits(s: &str) -> Option<u32> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Metadata of one package archive.
///
/// Fields are declared in key order so the serialized form is sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub arch: String,
    pub build: String,
    pub build_number: u64,
    pub name: String,
    pub platform: String,
    pub requires: Vec<String>,
    pub version: String,
}

impl PackageInfo {
    /// Assemble metadata, tagging the build when a Python version applies.
    pub fn new(
        name: &str,
        version: &str,
        build_number: u64,
        platform: &Platform,
        requires_python: Option<PythonVersion>,
    ) -> Self {
        let mut build = build_number.to_string();
        let mut requires = Vec::new();
        if let Some(py) = requires_python {
            build = format!("{}_{}", py.build_marker(), build);
            requires.push(format!("{} {}", PYTHON_PACKAGE, py));
        }

        Self {
            arch: platform.arch.clone(),
            build,
            build_number,
            name: name.to_string(),
            platform: platform.platform.clone(),
            requires,
            version: version.to_string(),
        }
    }

    /// Canonical `name-version-build` identity.
    pub fn dist_name(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.build)
    }

    /// `index.json` contents: sorted keys, two-space indentation.
    pub fn to_index_json(&self) -> Result<String> {
        // Round-trip through `Value`, whose map keeps keys ordered.
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }
}

/// Determine whether `files` pull in a Python runtime dependency.
///
/// Site-packages content requires the installed interpreter's version; not
/// being able to find it is fatal because the build could not be tagged.
pub fn python_requirement(
    files: &FileSet,
    baseline: &dyn BaselineProvider,
    prefix: &Path,
) -> Result<Option<PythonVersion>> {
    if !files.iter().any(|f| f.contains(SITE_PACKAGES_MARKER)) {
        return Ok(None);
    }

    let version = baseline
        .installed_version(prefix, PYTHON_PACKAGE)?
        .ok_or_else(|| PackError::MissingDependencyVersion {
            interpreter: PYTHON_PACKAGE.to_string(),
            prefix: prefix.to_path_buf(),
        })?;

    let parsed =
        PythonVersion::parse(&version).ok_or_else(|| PackError::InvalidInterpreterVersion {
            interpreter: PYTHON_PACKAGE.to_string(),
            version: version.clone(),
        })?;
    info!("site-packages content found, requires {} {}", PYTHON_PACKAGE, parsed);
    Ok(Some(parsed))
}
