//! Files already owned by tracked installations.
//!
//! The packer only ever asks two questions of the package-tracking store:
//! which files are accounted for, and which version of a named package is
//! installed. [`BaselineProvider`] captures those queries so the pipeline
//! does not depend on where the answers come from.
//!
//! - [`CondaMetaBaseline`] reads the `conda-meta/*.json` records of a prefix
//! - [`StaticBaseline`] answers from values held in memory

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{IoContext, PackError, Result};
use crate::FileSet;

/// Directory of install records inside a prefix.
pub const META_DIR: &str = "conda-meta";

/// Queries against the store of previously tracked installations.
pub trait BaselineProvider {
    /// All prefix-relative paths owned by tracked installations.
    fn tracked_files(&self, prefix: &Path) -> Result<FileSet>;

    /// Version of the installed package called `name`, if any.
    fn installed_version(&self, prefix: &Path, name: &str) -> Result<Option<String>>;
}

/// Baseline held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticBaseline {
    files: FileSet,
    versions: BTreeMap<String, String>,
}

impl StaticBaseline {
    pub fn new(files: FileSet) -> Self {
        Self {
            files,
            versions: BTreeMap::new(),
        }
    }

    /// Record an installed package version.
    pub fn with_version(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.versions.insert(name.into(), version.into());
        self
    }
}

impl BaselineProvider for StaticBaseline {
    fn tracked_files(&self, _prefix: &Path) -> Result<FileSet> {
        Ok(self.files.clone())
    }

    fn installed_version(&self, _prefix: &Path, name: &str) -> Result<Option<String>> {
        Ok(self.versions.get(name).cloned())
    }
}

/// Baseline read from the prefix's own install records.
///
/// Each `conda-meta/<name>-<version>-<build>.json` record lists the files
/// of one installed package.
#[derive(Debug, Clone, Copy, Default)]
pub struct CondaMetaBaseline;

#[derive(Debug, Deserialize)]
struct InstallRecord {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    files: Vec<String>,
}

/// An install record together with the identity derived for it.
#[derive(Debug, Clone)]
struct LoadedRecord {
    name: String,
    version: String,
    files: Vec<String>,
}

impl CondaMetaBaseline {
    fn load_records(&self, prefix: &Path) -> Result<Vec<LoadedRecord>> {
        let meta_dir = prefix.join(META_DIR);
        if !meta_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&meta_dir)
            .io_context(|| format!("reading install records '{}'", meta_dir.display()))?
        {
            let entry = entry
                .io_context(|| format!("iterating install records '{}'", meta_dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            records.push(load_record(&path)?);
        }
        debug!(
            "loaded {} install records from {}",
            records.len(),
            meta_dir.display()
        );
        Ok(records)
    }
}

impl BaselineProvider for CondaMetaBaseline {
    fn tracked_files(&self, prefix: &Path) -> Result<FileSet> {
        Ok(self
            .load_records(prefix)?
            .into_iter()
            .flat_map(|record| record.files)
            .collect())
    }

    fn installed_version(&self, prefix: &Path, name: &str) -> Result<Option<String>> {
        Ok(self
            .load_records(prefix)?
            .into_iter()
            .find(|record| record.name == name)
            .map(|record| record.version))
    }
}

fn load_record(path: &Path) -> Result<LoadedRecord> {
    let bytes = fs::read(path).io_context(|| format!("reading '{}'", path.display()))?;
    let parsed: InstallRecord =
        serde_json::from_slice(&bytes).map_err(|e| PackError::Baseline {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let from_name = split_dist_name(stem);

    let (name, version) = match (parsed.name, parsed.version, from_name) {
        (Some(name), Some(version), _) => (name, version),
        (name, version, Some((n, v, _))) => (
            name.unwrap_or_else(|| n.to_string()),
            version.unwrap_or_else(|| v.to_string()),
        ),
        _ => {
            return Err(PackError::Baseline {
                path: path.to_path_buf(),
                reason: "record has no name/version and its filename is not name-version-build"
                    .to_string(),
            })
        }
    };

    Ok(LoadedRecord {
        name,
        version,
        files: parsed.files,
    })
}

/// Split a canonical `name-version-build` string from the right.
///
/// Package names may themselves contain dashes; version and build may not.
pub fn split_dist_name(dist: &str) -> Option<(&str, &str, &str)> {
    let (rest, build) = dist.rsplit_once('-')?;
    let (name, version) = rest.rsplit_once('-')?;
    if name.is_empty() || version.is_empty() || build.is_empty() {
        return None;
    }
    Some((name, version, build))
}
