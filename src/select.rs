//! Selection of the files that make up a new package.
//!
//! The package is everything in the prefix that no tracked installation
//! already owns, minus bookkeeping and editor litter.

use crate::FileSet;

/// Top-level directories owned by the package-tracking system itself.
pub const BOOKKEEPING_DIRS: &[&str] = &["pkgs/", "envs/", "conda-meta/"];

/// Suffix marking editor backup files.
pub const BACKUP_SUFFIX: &str = "~";

/// License file that belongs to the distribution, not to any package.
pub const LICENSE_FILE: &str = "LICENSE.txt";

/// Suffix of compiled bytecode. Dropping the last character yields the source.
pub const COMPILED_SUFFIX: &str = ".pyc";

/// Rules deciding which untracked files are still left out of a package.
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    /// Path prefixes that are never packaged.
    pub excluded_prefixes: Vec<String>,
    pub backup_suffix: String,
    pub license_file: String,
    pub compiled_suffix: String,
}

impl Default for ExclusionRules {
    fn default() -> Self {
        Self {
            excluded_prefixes: BOOKKEEPING_DIRS.iter().map(|d| d.to_string()).collect(),
            backup_suffix: BACKUP_SUFFIX.to_string(),
            license_file: LICENSE_FILE.to_string(),
            compiled_suffix: COMPILED_SUFFIX.to_string(),
        }
    }
}

impl ExclusionRules {
    /// Add further excluded path prefixes (e.g. from configuration).
    pub fn with_extra_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_prefixes
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    /// Whether `path` is left out of the package given the tracked `baseline`.
    pub fn is_excluded(&self, path: &str, baseline: &FileSet) -> bool {
        if self
            .excluded_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return true;
        }
        if path.ends_with(self.backup_suffix.as_str()) || path == self.license_file {
            return true;
        }
        // Bytecode whose source is tracked belongs to that other package.
        if path.ends_with(self.compiled_suffix.as_str()) {
            let mut source = path.to_string();
            source.pop();
            return baseline.contains(&source);
        }
        false
    }
}

/// Compute `walked - baseline` with the exclusion rules applied.
pub fn select_new_files(walked: &FileSet, baseline: &FileSet, rules: &ExclusionRules) -> FileSet {
    walked
        .difference(baseline)
        .filter(|path| !rules.is_excluded(path, baseline))
        .cloned()
        .collect()
}
