//! Interpreter directive relocation.
//!
//! Scripts installed into `bin/` carry a `#!` line pointing at the
//! interpreter of the build prefix. Before packaging, that line is replaced
//! with one pointing below a placeholder prefix, which the installer later
//! substitutes with the real install location. The rewritten copy is staged
//! separately; the prefix itself is never modified.

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{IoContext, PackError, Result};

/// Placeholder prefix substituted at install time.
pub const PREFIX_PLACEHOLDER: &str = "/opt/anaconda1anaconda2anaconda3";

/// Directory whose files are checked for interpreter directives.
pub const EXECUTABLE_DIR: &str = "bin/";

/// Interpreter name a directive must mention to be relocated.
pub const INTERPRETER: &str = "python";

/// Interpreter path below the prefix.
pub const INTERPRETER_SUBPATH: &str = "bin/python";

const SHEBANG: &[u8; 2] = b"#!";

/// Subdirectory of the staging area holding rewritten payload files.
const PAYLOAD_STAGING_DIR: &str = "payload";

/// Rewrites `#!` lines of packaged scripts.
#[derive(Debug, Clone)]
pub struct ShebangRelocator {
    placeholder: String,
}

impl Default for ShebangRelocator {
    fn default() -> Self {
        Self::new(PREFIX_PLACEHOLDER)
    }
}

impl ShebangRelocator {
    pub fn new(placeholder: impl Into<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// The directive written in place of the original one.
    pub fn directive(&self) -> String {
        format!(
            "#!{}/{}",
            self.placeholder.trim_end_matches('/'),
            INTERPRETER_SUBPATH
        )
    }

    /// Whether `rel_path` lies in the directory that is checked for directives.
    pub fn applies_to(rel_path: &str) -> bool {
        rel_path.starts_with(EXECUTABLE_DIR)
    }

    /// Rewrite the interpreter directive of `content`.
    ///
    /// Only the first line is considered. Returns `None` when it is not a
    /// directive or does not name the tracked interpreter.
    pub fn rewrite(&self, content: &str) -> Option<String> {
        let line_end = content.find('\n').unwrap_or(content.len());
        let line = &content[..line_end];
        if line.len() <= SHEBANG.len() || !line.starts_with("#!") {
            return None;
        }
        if !line.contains(INTERPRETER) {
            return None;
        }

        let mut out = self.directive();
        out.push_str(&content[line_end..]);
        Some(out)
    }

    /// Stage a relocated copy of `prefix/rel_path` under `staging_dir`.
    ///
    /// Returns the staged path, or `None` when the file needs no relocation.
    /// A file that starts with `#!` but is not valid UTF-8 is an error:
    /// shipping it unpatched would leave a build-prefix path in the package.
    pub fn relocate(
        &self,
        staging_dir: &Path,
        prefix: &Path,
        rel_path: &str,
    ) -> Result<Option<PathBuf>> {
        if !Self::applies_to(rel_path) {
            return Ok(None);
        }

        let entry = prefix.join(rel_path);
        let meta = fs::symlink_metadata(&entry)
            .io_context(|| format!("reading metadata of '{}'", entry.display()))?;
        let source = if meta.file_type().is_symlink() {
            match link_target_in_prefix(prefix, &entry)? {
                Some(target) => target,
                None => return Ok(None),
            }
        } else if meta.is_file() {
            entry
        } else {
            return Ok(None);
        };

        if !starts_with_shebang(&source)? {
            return Ok(None);
        }

        let bytes =
            fs::read(&source).io_context(|| format!("reading '{}'", source.display()))?;
        let content = String::from_utf8(bytes).map_err(|e| PackError::UnreadableExecutable {
            path: source.clone(),
            source: e,
        })?;

        let Some(rewritten) = self.rewrite(&content) else {
            return Ok(None);
        };

        let staged = staging_dir.join(PAYLOAD_STAGING_DIR).join(rel_path);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("creating staging directory '{}'", parent.display()))?;
        }
        fs::write(&staged, rewritten)
            .io_context(|| format!("writing relocated copy '{}'", staged.display()))?;
        fs::set_permissions(&staged, fs::Permissions::from_mode(0o755))
            .io_context(|| format!("setting permissions on '{}'", staged.display()))?;

        debug!("relocated interpreter directive of {}", rel_path);
        Ok(Some(staged))
    }
}

/// Resolve a symlink to the regular file it names inside `prefix`.
///
/// Dangling links, links to directories, and links leaving the prefix
/// resolve to `None` and ship as links.
fn link_target_in_prefix(prefix: &Path, link: &Path) -> Result<Option<PathBuf>> {
    let Ok(target) = fs::canonicalize(link) else {
        return Ok(None);
    };
    let root = fs::canonicalize(prefix)
        .io_context(|| format!("resolving prefix '{}'", prefix.display()))?;
    if !target.starts_with(&root) || !target.is_file() {
        return Ok(None);
    }
    Ok(Some(target))
}

fn starts_with_shebang(path: &Path) -> Result<bool> {
    let mut file =
        fs::File::open(path).io_context(|| format!("opening '{}'", path.display()))?;
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file
            .read(&mut magic[filled..])
            .io_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(&magic == SHEBANG)
}
