//! Package the new contents of an installation prefix as a relocatable archive.
//!
//! Given a prefix that already holds tracked installations plus some freshly
//! installed files, this crate works out which files are new, rewrites
//! `#!` lines of scripts so they point below a placeholder prefix, and
//! writes a compressed tar with the files and an `info/` manifest:
//!
//! - [`walk`] - Enumerate the prefix (symlinks reported, never followed)
//! - [`baseline`] - Files and versions already owned by tracked installations
//! - [`select`] - Subtract the baseline and drop bookkeeping/backup files
//! - [`relocate`] - Stage copies of scripts with rewritten interpreter lines
//! - [`manifest`] - `PackageInfo` and the Python build tag
//! - [`archive`] - Deterministic compressed tar writer
//! - [`pack`] - The pipeline tying it all together
//! - [`config`] - Optional TOML configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use prefix_pack::{CondaMetaBaseline, PackOptions, PackageRequest, Packer, Platform};
//! use std::path::Path;
//!
//! let options = PackOptions::new(".", Platform::host());
//! let packer = Packer::new(&CondaMetaBaseline, options);
//! let packed = packer.pack(Path::new("/opt/env"), &PackageRequest::new("foo", "1.0", 0))?;
//! println!("{}", packed.archive.path.display());
//! ```

use std::collections::BTreeSet;

pub mod archive;
pub mod baseline;
pub mod config;
pub mod error;
pub mod manifest;
pub mod pack;
pub mod relocate;
pub mod select;
pub mod walk;

/// Prefix-relative paths, kept sorted.
pub type FileSet = BTreeSet<String>;

pub use archive::{ArchiveFormat, ArchiveSummary};
pub use baseline::{BaselineProvider, CondaMetaBaseline, StaticBaseline};
pub use error::{PackError, Result};
pub use manifest::{PackageInfo, Platform, PythonVersion};
pub use pack::{PackOptions, PackageRequest, PackagePlan, PackedArchive, Packer};
